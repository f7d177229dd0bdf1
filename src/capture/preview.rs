use super::core::CaptureOrchestrator;
use crate::camera::CameraEventKind;
use crate::events::CaptureEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Running preview poll task
pub(super) struct PreviewHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PreviewHandle {
    /// Cancel the poll loop and wait for it to exit
    pub(super) async fn stop(self) {
        self.cancel.cancel();
        match tokio::time::timeout(Duration::from_secs(3), self.task).await {
            Ok(Ok(())) => debug!("Preview task completed"),
            Ok(Err(e)) => error!("Error waiting for preview task: {}", e),
            Err(_) => warn!("Preview task did not complete within timeout"),
        }
    }
}

pub(super) fn spawn_preview_task(
    orchestrator: Arc<CaptureOrchestrator>,
    period: Duration,
) -> PreviewHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut delivered: u64 = 0;

        info!("Preview poll loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match orchestrator.preview_tick().await {
                        Ok(true) => delivered += 1,
                        Ok(false) => {}
                        Err(e) => {
                            warn!("Preview poll discarded: {}", e);
                            orchestrator
                                .publish(CaptureEvent::CameraStateChanged {
                                    kind: CameraEventKind::PreviewError,
                                    message: e.to_string(),
                                })
                                .await;
                        }
                    }
                }
            }
        }
        info!("Preview poll loop stopped after {} frames", delivered);
    });

    PreviewHandle { cancel, task }
}
