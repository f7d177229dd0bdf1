use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Foreground capture status as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CaptureStatus {
    #[default]
    Idle,
    Busy,
}

/// Holds the busy flag for one foreground capture and clears it on drop,
/// including when the capture future is dropped mid-flight.
pub(super) struct BusyGuard<'a> {
    flag: &'a AtomicBool,
    status: &'a watch::Sender<CaptureStatus>,
}

impl<'a> BusyGuard<'a> {
    /// `None` if another capture already holds the flag
    pub(super) fn acquire(
        flag: &'a AtomicBool,
        status: &'a watch::Sender<CaptureStatus>,
    ) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        status.send_replace(CaptureStatus::Busy);
        Some(Self { flag, status })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        self.status.send_replace(CaptureStatus::Idle);
    }
}
