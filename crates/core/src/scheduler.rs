use crate::workflow::WorkflowEngine;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Wake scheduler: periodically resumes executions whose wait has elapsed
pub struct WakeScheduler {
    engine: Arc<WorkflowEngine>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WakeScheduler {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self {
            engine,
            handle: Mutex::new(None),
        }
    }

    /// Re-drive interrupted executions, then start ticking. Calling `start`
    /// on a running scheduler restarts its loop.
    pub async fn start(&self) {
        match self.engine.recover().await {
            Ok(recovered) if !recovered.is_empty() => {
                tracing::info!("Recovered {} interrupted executions", recovered.len());
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Failed to recover executions: {:#}", e),
        }

        let engine = self.engine.clone();
        let tick = engine.config().scheduler_tick();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match engine.resume_due().await {
                    Ok(resumed) if !resumed.is_empty() => {
                        tracing::debug!("Resumed {} executions", resumed.len());
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Wake scheduler tick failed: {:#}", e),
                }
            }
        });

        tracing::info!("Wake scheduler started, ticking every {:?}", tick);
        if let Some(previous) = self.replace_handle(Some(handle)) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.replace_handle(None) {
            handle.abort();
            tracing::info!("Wake scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .map(|h| h.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    fn replace_handle(&self, handle: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        match self.handle.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, handle),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), handle),
        }
    }
}

impl Drop for WakeScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
