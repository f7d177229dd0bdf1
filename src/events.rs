use crate::camera::CameraEventKind;
use crate::error::EventBusError;
use crate::exposure::ControlState;
use crate::imaging::Image;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Why a frame was thrown away instead of being returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscardReason {
    /// Read out before the last exposure change took effect
    Settling,
    /// Superseded by the next auto-exposure attempt
    Retry,
}

/// Events published by the capture pipeline
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// A frame was taken and dropped
    FrameDiscarded {
        capture_id: Uuid,
        reason: DiscardReason,
        exposure_ms: f64,
        signal_level: Option<f64>,
    },
    /// A processed preview frame is available
    PreviewFrame { image: Arc<Image> },
    /// The camera session changed state or reported a fault
    CameraStateChanged {
        kind: CameraEventKind,
        message: String,
    },
    /// A foreground capture started (`busy`) or finished
    StatusChanged { busy: bool },
    /// The camera did not accept the requested exposure as is
    ExposureClamped { requested: f64, applied: f64 },
    /// One iteration of the auto-exposure loop
    ControlStep {
        capture_id: Uuid,
        iteration: u32,
        state: ControlState,
        exposure_ms: f64,
        gain: f64,
        level: f64,
    },
    /// A foreground capture produced its image
    CaptureCompleted {
        capture_id: Uuid,
        state: ControlState,
        iterations: u32,
    },
    /// A foreground capture was cancelled before producing an image
    CaptureCancelled { capture_id: Uuid },
}

impl CaptureEvent {
    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            CaptureEvent::FrameDiscarded {
                reason,
                exposure_ms,
                ..
            } => format!("Frame at {}ms discarded ({:?})", exposure_ms, reason),
            CaptureEvent::PreviewFrame { image } => {
                format!("Preview frame {}x{}", image.width(), image.height())
            }
            CaptureEvent::CameraStateChanged { kind, message } => {
                format!("Camera {}: {}", kind, message)
            }
            CaptureEvent::StatusChanged { busy } => {
                format!("Capture status: {}", if *busy { "busy" } else { "idle" })
            }
            CaptureEvent::ExposureClamped { requested, applied } => {
                format!("Exposure {}ms clamped to {}ms", requested, applied)
            }
            CaptureEvent::ControlStep {
                iteration,
                state,
                exposure_ms,
                gain,
                level,
                ..
            } => format!(
                "Auto-exposure step {}: level {:.3} -> {} ({}ms x{:.2})",
                iteration, level, state, exposure_ms, gain
            ),
            CaptureEvent::CaptureCompleted {
                capture_id,
                state,
                iterations,
            } => format!(
                "Capture {} completed: {} after {} frame(s)",
                capture_id, state, iterations
            ),
            CaptureEvent::CaptureCancelled { capture_id } => {
                format!("Capture {} cancelled", capture_id)
            }
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            CaptureEvent::FrameDiscarded { .. } => "frame_discarded",
            CaptureEvent::PreviewFrame { .. } => "preview_frame",
            CaptureEvent::CameraStateChanged { .. } => "camera_state_changed",
            CaptureEvent::StatusChanged { .. } => "status_changed",
            CaptureEvent::ExposureClamped { .. } => "exposure_clamped",
            CaptureEvent::ControlStep { .. } => "control_step",
            CaptureEvent::CaptureCompleted { .. } => "capture_completed",
            CaptureEvent::CaptureCancelled { .. } => "capture_cancelled",
        }
    }
}

/// Async event bus for pipeline observers using broadcast channels
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CaptureEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers. Fails when nobody is listening.
    pub async fn publish(&self, event: CaptureEvent) -> Result<usize, EventBusError> {
        match &event {
            CaptureEvent::CameraStateChanged { kind, message } if kind.is_error() => {
                error!("Camera {}: {}", kind, message);
            }
            CaptureEvent::CameraStateChanged { kind, message } => {
                info!("Camera {}: {}", kind, message);
            }
            CaptureEvent::ExposureClamped { requested, applied } => {
                warn!("Exposure {}ms clamped to {}ms", requested, applied);
            }
            CaptureEvent::CaptureCompleted { .. } | CaptureEvent::CaptureCancelled { .. } => {
                info!("{}", event.description());
            }
            CaptureEvent::PreviewFrame { .. } => {
                trace!("{}", event.description());
            }
            _ => {
                debug!("Event: {}", event.description());
            }
        }

        self.sender
            .send(event)
            .map_err(|e| EventBusError::PublishFailed {
                details: e.to_string(),
            })
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Check if there are any active subscribers
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

/// Event filter for selective event handling
#[derive(Debug, Clone)]
pub enum EventFilter {
    /// Accept all events
    All,
    /// Accept only specific event types
    EventTypes(Vec<&'static str>),
    /// Accept camera state changes of the given kinds
    CameraKinds(Vec<CameraEventKind>),
    /// Custom filter function
    Custom(fn(&CaptureEvent) -> bool),
}

impl EventFilter {
    /// Check if an event passes this filter
    pub fn matches(&self, event: &CaptureEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::EventTypes(types) => types.contains(&event.event_type()),
            EventFilter::CameraKinds(kinds) => {
                if let CaptureEvent::CameraStateChanged { kind, .. } = event {
                    kinds.contains(kind)
                } else {
                    false
                }
            }
            EventFilter::Custom(filter_fn) => filter_fn(event),
        }
    }
}

/// Event receiver with filtering
pub struct EventReceiver {
    receiver: broadcast::Receiver<CaptureEvent>,
    filter: EventFilter,
    name: String,
}

impl EventReceiver {
    /// Create a new event receiver with a filter
    pub fn new(
        receiver: broadcast::Receiver<CaptureEvent>,
        filter: EventFilter,
        name: String,
    ) -> Self {
        Self {
            receiver,
            filter,
            name,
        }
    }

    /// Receive the next filtered event
    pub async fn recv(&mut self) -> Result<CaptureEvent, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        trace!(
                            "Receiver '{}' received event: {}",
                            self.name,
                            event.description()
                        );
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                    return Err(EventBusError::PublishFailed {
                        details: format!("Receiver lagged behind by {} events", n),
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for receiver '{}'", self.name);
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<Option<CaptureEvent>, EventBusError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => {
                    return Ok(None);
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                    return Err(EventBusError::PublishFailed {
                        details: format!("Receiver lagged behind by {} events", n),
                    });
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    debug!("Event bus closed for receiver '{}'", self.name);
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }

    /// Drain everything currently queued that passes the filter
    pub fn drain(&mut self) -> Result<Vec<CaptureEvent>, EventBusError> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv()? {
            events.push(event);
        }
        Ok(events)
    }
}
