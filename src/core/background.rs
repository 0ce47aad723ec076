//! Handles for long-running background tasks.

use std::future::Future;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to a spawned periodic task; stopping it waits for the task to exit
pub struct BackgroundTask {
    name: &'static str,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `body` with a fresh cancellation token
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let task = tokio::spawn(body(token.clone()));
        Self { name, token, task }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task and wait for it to finish
    pub async fn stop(self) -> Result<()> {
        self.token.cancel();
        self.task.await?;
        tracing::debug!(task = self.name, "Background task stopped");
        Ok(())
    }
}
