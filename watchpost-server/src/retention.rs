use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_graceful_shutdown::SubsystemHandle;

use watchpost_core::RetentionPolicy;

use crate::error::ServiceError;
use crate::storage::{StorageManager, SweepReport};

/// Periodic retention sweep with whatever policy is current
pub struct RetentionTask {
    storage: Arc<StorageManager>,
    policy: watch::Receiver<RetentionPolicy>,
    every: Duration,
}

impl RetentionTask {
    pub fn new(
        storage: Arc<StorageManager>,
        policy: watch::Receiver<RetentionPolicy>,
        every: Duration,
    ) -> Self {
        RetentionTask {
            storage,
            policy,
            every,
        }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), ServiceError> {
        self.run_until(subsys.on_shutdown_requested()).await
    }

    pub async fn run_until<F: Future<Output = ()>>(self, shutdown: F) -> Result<(), ServiceError> {
        tokio::pin!(shutdown);
        let mut timer = interval(self.every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = timer.tick() => {
                    let policy = *self.policy.borrow();
                    sweep(self.storage.clone(), policy).await;
                }
            }
        }
        Ok(())
    }
}

/// Run a sweep off the async runtime threads
pub async fn sweep(storage: Arc<StorageManager>, policy: RetentionPolicy) -> SweepReport {
    match tokio::task::spawn_blocking(move || storage.sweep(&policy)).await {
        Ok(report) => report,
        Err(e) => {
            log::error!("Retention sweep panicked: {}", e);
            SweepReport::default()
        }
    }
}
