//! HTTP listener task.

use anyhow::Context as _;
use async_trait::async_trait;

use crate::OgwState;
use crate::task::{BackgroundTask, ShutdownToken};

/// The full application router: API routes behind the bearer middleware.
pub fn make_app(state: OgwState) -> axum::Router {
    crate::api::make_router(state.clone())
        .layer(axum::middleware::from_fn_with_state(state, crate::middleware::auth::auth_middleware))
}

pub struct HttpListenerTask {
    pub state: OgwState,
}

#[async_trait]
impl BackgroundTask for HttpListenerTask {
    type Output = anyhow::Result<()>;

    const LABEL: &'static str = "http listener";

    async fn run(self, mut stop: ShutdownToken) -> Self::Output {
        let conf = self.state.conf_handle.get_conf();

        let listener = tokio::net::TcpListener::bind(conf.listen)
            .await
            .with_context(|| format!("failed to bind {}", conf.listen))?;

        info!(address = %conf.listen, "Listener started");

        let app = make_app(self.state.clone());

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.triggered().await })
            .await
            .context("HTTP server failure")
    }
}
