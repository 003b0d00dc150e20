//! Service lifecycle: build the core context, spawn the long-running tasks,
//! stop them cooperatively.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::runtime::{self, Runtime};

use crate::OgwState;
use crate::audit::AuditFlushTask;
use crate::cache::CacheSweeperTask;
use crate::config::ConfHandle;
use crate::delegation::DelegationModule;
use crate::listener::HttpListenerTask;
use crate::log::LoggerGuard;
use crate::modules;
use crate::task::{BackgroundTask, Shutdown, TaskHandle};

pub const SERVICE_NAME: &str = "obo-gateway";
pub const DISPLAY_NAME: &str = "OBO Gateway";

#[allow(clippy::large_enum_variant)] // `Running` is bigger than `Stopped` but we don't care
enum GatewayState {
    Stopped,
    Running { shutdown: Shutdown, runtime: Runtime },
}

pub struct GatewayService {
    conf_handle: ConfHandle,
    state: GatewayState,
    _logger_guard: LoggerGuard,
}

impl GatewayService {
    pub fn load(conf_handle: ConfHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let logger_guard = crate::log::init(&conf.log_file, conf.verbosity_profile.to_log_filter())
            .context("failed to setup logger")?;

        info!(version = env!("CARGO_PKG_VERSION"));

        if conf.environment.is_development() {
            warn!("Development environment: insecure endpoints are permitted, do not use in production");
        }

        Ok(GatewayService {
            conf_handle,
            state: GatewayState::Stopped,
            _logger_guard: logger_guard,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        let conf_handle = self.conf_handle.clone();

        // spawn_tasks binds the listener socket, so it runs inside the runtime.
        let tasks = runtime.block_on(spawn_tasks(conf_handle))?;

        trace!("Tasks created");

        let mut join_all =
            futures::future::select_all(tasks.inner.into_iter().map(|child| Box::pin(child.join())));

        runtime.spawn(async {
            loop {
                let (result, _, rest) = join_all.await;

                match result {
                    Ok(Ok(())) => trace!("A task terminated gracefully"),
                    Ok(Err(error)) => error!(error = format!("{error:#}"), "A task failed"),
                    Err(error) => error!(%error, "Something went very wrong with a task"),
                }

                if rest.is_empty() {
                    break;
                } else {
                    join_all = futures::future::select_all(rest);
                }
            }
        });

        self.state = GatewayState::Running {
            shutdown: tasks.shutdown,
            runtime,
        };

        Ok(())
    }

    /// Blocks until interrupted (SIGINT / ctrl-c).
    pub fn wait_for_shutdown_signal(&self) {
        if let GatewayState::Running { runtime, .. } = &self.state {
            runtime.block_on(async {
                let _ = tokio::signal::ctrl_c().await;
            });
        }
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, GatewayState::Stopped) {
            GatewayState::Stopped => {
                info!("Attempted to stop gateway service, but it's already stopped");
            }
            GatewayState::Running { shutdown, runtime } => {
                info!("Stopping gateway service");

                shutdown.trigger();

                runtime.block_on(async {
                    if tokio::time::timeout(Duration::from_secs(10), shutdown.drained())
                        .await
                        .is_err()
                    {
                        warn!("Some tasks didn't stop within the grace period");
                    }
                });

                runtime.shutdown_timeout(Duration::from_secs(5));

                info!("Stopped gateway service");
            }
        }
    }
}

struct Tasks {
    inner: Vec<TaskHandle<anyhow::Result<()>>>,
    shutdown: Shutdown,
}

impl Tasks {
    fn new() -> Self {
        Self {
            inner: Vec::new(),
            shutdown: Shutdown::new(),
        }
    }

    fn register<T>(&mut self, task: T)
    where
        T: BackgroundTask<Output = anyhow::Result<()>> + 'static,
    {
        self.inner.push(crate::task::spawn(task, self.shutdown.subscribe()));
    }
}

async fn spawn_tasks(conf_handle: ConfHandle) -> anyhow::Result<Tasks> {
    let state = OgwState::build(conf_handle.clone(), None).context("failed to build core state")?;

    initialize_modules(&state).await.context("module initialization")?;

    let mut tasks = Tasks::new();

    tasks.register(HttpListenerTask { state: state.clone() });
    tasks.register(CacheSweeperTask {
        cache: Arc::clone(&state.cache),
    });
    tasks.register(AuditFlushTask {
        audit: Arc::clone(&state.audit),
    });

    Ok(tasks)
}

/// Builds and initializes the delegation modules named in the configuration.
///
/// Kerberos modules need a platform ticket provider (SSPI credentials or a
/// GSSAPI keytab); embedders register those programmatically via
/// [`DelegationRegistry::register`], so the plain binary refuses them
/// instead of registering a module that can never delegate.
async fn initialize_modules(state: &OgwState) -> anyhow::Result<()> {
    let conf = state.conf_handle.get_conf();

    for module_conf in &conf.modules {
        let module: Arc<dyn DelegationModule> = match module_conf.kind.as_str() {
            "sql" => modules::sql::module(&module_conf.name),
            "http" => modules::http::module(&module_conf.name)
                .with_context(|| format!("module `{}`", module_conf.name))?,
            "kerberos" => anyhow::bail!(
                "module `{}`: kerberos modules require a platform ticket provider and must be registered programmatically",
                module_conf.name,
            ),
            other => anyhow::bail!("module `{}`: unknown module type `{other}`", module_conf.name),
        };

        module
            .initialize(&module_conf.config)
            .await
            .with_context(|| format!("failed to initialize module `{}`", module_conf.name))?;

        state.registry.register(module);
    }

    Ok(())
}
