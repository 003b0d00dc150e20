//! Cooperative shutdown and supervised background work.
//!
//! A [`Shutdown`] value owned by the service hands out [`ShutdownToken`]s
//! on demand; long-running work implements [`BackgroundTask`] and stops
//! when its token fires. The stop request is level-triggered (a token
//! subscribed after the trigger still observes it), and [`TaskHandle`]
//! aborts its task when dropped so abandoned handles cannot leak work.

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

/// Broadcasts a stop request to every subscribed token.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> ShutdownToken {
        ShutdownToken(self.tx.subscribe())
    }

    /// Requests every subscriber to stop.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Resolves once every subscribed token has been dropped.
    pub async fn drained(&self) {
        self.tx.closed().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct ShutdownToken(watch::Receiver<bool>);

impl ShutdownToken {
    /// Waits for the stop request. Resolves immediately when shutdown was
    /// already triggered before this token subscribed.
    pub async fn triggered(&mut self) {
        // An error means the Shutdown end is gone; treat that as a stop
        // request too.
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}

/// A named unit of long-running work (cache sweeper, audit flusher, HTTP
/// listener) that stops cooperatively.
#[async_trait]
pub trait BackgroundTask: Send {
    type Output: Send;

    const LABEL: &'static str;

    async fn run(self, stop: ShutdownToken) -> Self::Output;
}

/// Join handle that aborts its task when dropped.
///
/// See https://github.com/tokio-rs/tokio/issues/1830 for why detached
/// spawning is the wrong default.
#[must_use]
pub struct TaskHandle<T> {
    inner: Option<JoinHandle<T>>,
}

impl<T> TaskHandle<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Self {
            inner: Some(tokio::task::spawn(future)),
        }
    }

    pub async fn join(mut self) -> Result<T, JoinError> {
        let handle = self.inner.take().expect("join is the only taker and consumes the handle");
        handle.await
    }

    /// Gives the task up to the runtime; it keeps running without a handle.
    pub fn detach(mut self) {
        self.inner.take();
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if let Some(handle) = &self.inner {
            handle.abort();
        }
    }
}

pub fn spawn<T>(task: T, stop: ShutdownToken) -> TaskHandle<T::Output>
where
    T: BackgroundTask + 'static,
    T::Output: 'static,
{
    debug!(task = T::LABEL, "Spawning background task");
    TaskHandle::spawn(task.run(stop))
}
