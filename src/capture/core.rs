use crate::{
    camera::{Camera, CameraEventKind},
    config::{CaptureConfig, ExpocamConfig},
    error::{CameraError, ExpocamError, Result},
    events::{CaptureEvent, DiscardReason, EventBus},
    exposure::{AutoExposureController, ControlState, ControllerParameters},
    frame::FrameBuffer,
    imaging::{Image, GAIN_KEY},
    pretreatment::Pretreatment,
};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{
    preview::{spawn_preview_task, PreviewHandle},
    status::{BusyGuard, CaptureStatus},
    transform::FrameTransform,
};

/// State touched by every frame acquisition, foreground or preview
#[derive(Debug)]
pub(super) struct AcquisitionState {
    /// Frames still to be thrown away after the last exposure change
    pub(super) frames_to_skip: u32,
    /// Software gain applied to foreground frames
    pub(super) virtual_gain: f64,
}

/// Drives a camera through settled, auto-exposed captures and preview.
///
/// At most one foreground capture runs at a time; a second request while
/// one is outstanding fails with [`ExpocamError::Busy`]. Foreground captures
/// and preview polls serialize on a single acquisition lock that also guards
/// the settling counter.
pub struct CaptureOrchestrator {
    settings: CaptureConfig,
    transform: FrameTransform,
    event_bus: Arc<EventBus>,
    camera: RwLock<Option<Arc<dyn Camera>>>,
    controller: Mutex<AutoExposureController>,
    pretreatment: RwLock<Option<Arc<dyn Pretreatment>>>,
    acquisition: AsyncMutex<AcquisitionState>,
    busy: AtomicBool,
    status_tx: watch::Sender<CaptureStatus>,
    preview: Mutex<Option<PreviewHandle>>,
}

impl CaptureOrchestrator {
    pub fn new(config: &ExpocamConfig, event_bus: Arc<EventBus>) -> Self {
        Self::with_parts(config.capture.clone(), config.controller.clone(), event_bus)
    }

    pub fn with_parts(
        settings: CaptureConfig,
        parameters: ControllerParameters,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let (status_tx, _) = watch::channel(CaptureStatus::Idle);
        let transform = FrameTransform::from_config(&settings);
        debug!("Frame transform: {:?}", transform);

        Self {
            transform,
            event_bus,
            camera: RwLock::new(None),
            controller: Mutex::new(AutoExposureController::new(parameters)),
            pretreatment: RwLock::new(None),
            acquisition: AsyncMutex::new(AcquisitionState {
                frames_to_skip: 0,
                virtual_gain: settings.virtual_gain,
            }),
            busy: AtomicBool::new(false),
            status_tx,
            preview: Mutex::new(None),
            settings,
        }
    }

    pub fn settings(&self) -> &CaptureConfig {
        &self.settings
    }

    pub fn transform(&self) -> FrameTransform {
        self.transform
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Initialize `camera` and make it the active device
    pub async fn connect(&self, camera: Arc<dyn Camera>) -> Result<()> {
        if self.is_connected() {
            return Err(ExpocamError::system("A camera is already connected"));
        }

        let model = camera.model().to_string();
        info!("Connecting to camera '{}'", model);

        let device = Arc::clone(&camera);
        let result = tokio::task::spawn_blocking(move || device.init())
            .await
            .map_err(|e| ExpocamError::system(format!("Camera init task failed: {}", e)))?;

        if let Err(e) = result {
            self.publish(CaptureEvent::CameraStateChanged {
                kind: CameraEventKind::ConnectionError,
                message: e.to_string(),
            })
            .await;
            return Err(e.into());
        }

        *self.camera.write() = Some(camera);
        info!("Camera '{}' connected", model);
        Ok(())
    }

    /// Stop preview, close the device and forget it
    pub async fn close(&self) -> Result<()> {
        self.stop_preview().await?;
        self.call_camera("close", |camera| camera.close()).await?;
        *self.camera.write() = None;
        info!("Camera closed");
        Ok(())
    }

    pub async fn start_camera(&self) -> Result<()> {
        self.call_camera("start", |camera| camera.start()).await?;
        info!("Camera started");
        Ok(())
    }

    pub async fn stop_camera(&self) -> Result<()> {
        self.call_camera("stop", |camera| camera.stop()).await?;
        info!("Camera stopped");
        Ok(())
    }

    /// Tear everything down regardless of errors and disconnect
    pub async fn reset(&self) {
        if let Err(e) = self.stop_preview().await {
            debug!("Ignoring preview stop failure during reset: {}", e);
        }
        if self.is_connected() {
            if let Err(e) = self.call_camera("stop", |camera| camera.stop()).await {
                debug!("Ignoring stop failure during reset: {}", e);
            }
            if let Err(e) = self.call_camera("close", |camera| camera.close()).await {
                debug!("Ignoring close failure during reset: {}", e);
            }
        }
        *self.camera.write() = None;
        info!("Capture orchestrator reset");
    }

    pub fn is_connected(&self) -> bool {
        self.camera.read().is_some()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Connected and free to accept a foreground capture
    pub fn is_prepared(&self) -> bool {
        self.is_connected() && !self.is_busy()
    }

    pub fn is_previewing(&self) -> bool {
        self.preview.lock().is_some()
    }

    pub fn status(&self) -> CaptureStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<CaptureStatus> {
        self.status_tx.subscribe()
    }

    /// Apply an exposure time and arm the settling counter if it changed
    pub async fn set_exposure_ms(&self, exposure_ms: f64) -> Result<f64> {
        let mut state = self.acquisition.lock().await;
        self.apply_exposure(&mut state, exposure_ms).await
    }

    pub fn exposure_ms(&self) -> Result<f64> {
        Ok(self.camera()?.exposure_ms())
    }

    /// Software gain the next foreground frame will be scaled by
    pub async fn virtual_gain(&self) -> f64 {
        self.acquisition.lock().await.virtual_gain
    }

    /// Frames still to be discarded before one is trusted
    pub async fn frames_to_skip(&self) -> u32 {
        self.acquisition.lock().await.frames_to_skip
    }

    pub fn set_pretreatment(&self, pretreatment: Option<Arc<dyn Pretreatment>>) {
        *self.pretreatment.write() = pretreatment;
    }

    pub fn controller_parameters(&self) -> ControllerParameters {
        self.controller.lock().parameters().clone()
    }

    pub fn set_controller_parameters(&self, parameters: ControllerParameters) {
        self.controller.lock().set_parameters(parameters);
    }

    /// Start a new auto-exposure session and restore the configured virtual gain
    pub async fn reset_controller(&self) {
        self.controller.lock().reset();
        self.acquisition.lock().await.virtual_gain = self.settings.virtual_gain;
    }

    /// `capture_with_auto_exposure` when auto-exposure is enabled, otherwise
    /// a single settled capture at the take gain.
    pub async fn take_image(&self, cancel: &CancellationToken) -> Result<Option<Image>> {
        if self.settings.auto_exposure {
            self.capture_with_auto_exposure(self.settings.max_auto_exposure_iterations, cancel)
                .await
        } else {
            self.run_capture("single", cancel, move |capture_id| async move {
                self.set_take_gain().await?;
                let mut state = self.acquisition.lock().await;
                let gain = state.virtual_gain;
                let image = self.capture_raw(&mut state, capture_id, gain, cancel).await?;
                Ok(image.map(|image| (image, 1)))
            })
            .await
        }
    }

    /// Repeat capture and control steps until the controller reports a
    /// terminal state or `max_iterations` frames have been taken. The last
    /// frame is returned either way; check its [`ControlState`].
    pub async fn capture_with_auto_exposure(
        &self,
        max_iterations: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<Image>> {
        let max_iterations = max_iterations.max(1);

        self.run_capture("auto-exposure", cancel, move |capture_id| async move {
            self.set_take_gain().await?;
            let mut state = self.acquisition.lock().await;
            let mut previous: Option<Image> = None;
            let mut iterations = 0u32;

            loop {
                if let Some(discarded) = previous.take() {
                    self.publish(CaptureEvent::FrameDiscarded {
                        capture_id,
                        reason: DiscardReason::Retry,
                        exposure_ms: discarded.exposure_ms(),
                        signal_level: discarded.signal_level(),
                    })
                    .await;
                }

                let gain = state.virtual_gain;
                let Some(mut image) = self.capture_raw(&mut state, capture_id, gain, cancel).await?
                else {
                    return Ok(None);
                };
                iterations += 1;

                let level = image.signal_level().unwrap_or(0.0);
                let decision = self
                    .controller
                    .lock()
                    .decide(image.exposure_ms(), image.gain(), level);
                image.set_control_state(decision.state);

                self.publish(CaptureEvent::ControlStep {
                    capture_id,
                    iteration: iterations,
                    state: decision.state,
                    exposure_ms: decision.exposure_ms,
                    gain: decision.gain,
                    level,
                })
                .await;

                match decision.state {
                    ControlState::Adjusting => {
                        self.apply_exposure(&mut state, decision.exposure_ms).await?;
                        state.virtual_gain = decision.gain;
                        if iterations >= max_iterations {
                            warn!(
                                "Auto-exposure gave up after {} frames at level {:.3}",
                                iterations, level
                            );
                            return Ok(Some((image, iterations)));
                        }
                        previous = Some(image);
                    }
                    ControlState::Overflow | ControlState::TooLow => {
                        warn!(
                            "Auto-exposure failed: {} (level {:.3} at {}ms x{:.2})",
                            decision.state,
                            level,
                            image.exposure_ms(),
                            image.gain()
                        );
                        return Ok(Some((image, iterations)));
                    }
                    ControlState::Suitable | ControlState::None => {
                        return Ok(Some((image, iterations)));
                    }
                }
            }
        })
        .await
    }

    /// One settled frame with no gain or exposure changes and no software
    /// gain, for bias and reference captures.
    pub async fn capture_raw_only(&self, cancel: &CancellationToken) -> Result<Option<Image>> {
        self.run_capture("raw", cancel, move |capture_id| async move {
            let mut state = self.acquisition.lock().await;
            let image = self.capture_raw(&mut state, capture_id, 1.0, cancel).await?;
            Ok(image.map(|image| (image, 1)))
        })
        .await
    }

    /// Busy bookkeeping and lifecycle events around one foreground capture
    async fn run_capture<F, Fut>(
        &self,
        kind: &str,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<Option<Image>>
    where
        F: FnOnce(Uuid) -> Fut,
        Fut: std::future::Future<Output = Result<Option<(Image, u32)>>>,
    {
        if !self.is_connected() {
            return Err(ExpocamError::NotConnected);
        }
        let guard =
            BusyGuard::acquire(&self.busy, &self.status_tx).ok_or(ExpocamError::Busy)?;
        // let an in-flight preview poll finish; later polls see the busy flag
        drop(self.acquisition.lock().await);

        let capture_id = Uuid::new_v4();
        info!("Starting {} capture {}", kind, capture_id);
        self.publish(CaptureEvent::StatusChanged { busy: true }).await;
        self.publish(CaptureEvent::CameraStateChanged {
            kind: CameraEventKind::SingleStart,
            message: format!("{} capture {}", kind, capture_id),
        })
        .await;

        let result = body(capture_id).await;

        let outcome = match result {
            Ok(Some((image, iterations))) => {
                self.publish(CaptureEvent::CameraStateChanged {
                    kind: CameraEventKind::SingleFinish,
                    message: format!("{} capture {}", kind, capture_id),
                })
                .await;
                self.publish(CaptureEvent::CaptureCompleted {
                    capture_id,
                    state: image.control_state(),
                    iterations,
                })
                .await;
                Ok(Some(image))
            }
            Ok(None) => {
                info!(
                    "Capture {} cancelled (token cancelled: {})",
                    capture_id,
                    cancel.is_cancelled()
                );
                self.publish(CaptureEvent::CaptureCancelled { capture_id }).await;
                Ok(None)
            }
            Err(e) => {
                error!("Capture {} failed: {}", capture_id, e);
                self.publish(CaptureEvent::CameraStateChanged {
                    kind: CameraEventKind::SingleError,
                    message: e.to_string(),
                })
                .await;
                Err(e)
            }
        };

        drop(guard);
        self.publish(CaptureEvent::StatusChanged { busy: false }).await;
        outcome
    }

    /// Take frames until one is trusted, discarding settling frames.
    ///
    /// The settling counter is decremented for every frame taken, whether
    /// the readout succeeded or not. Returns `Ok(None)` once `cancel` fires.
    pub(super) async fn capture_raw(
        &self,
        state: &mut AcquisitionState,
        capture_id: Uuid,
        virtual_gain: f64,
        cancel: &CancellationToken,
    ) -> Result<Option<Image>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let frame = self
                .call_camera("take frame", |camera| {
                    let mut frame = camera.take_frame()?;
                    frame.set_exposure_ms(camera.exposure_ms());
                    Ok(frame)
                })
                .await;

            if state.frames_to_skip > 0 {
                state.frames_to_skip -= 1;
                let frame = frame?;
                trace!(
                    "Discarding settling frame at {}ms ({} left)",
                    frame.exposure_ms(),
                    state.frames_to_skip
                );
                self.publish(CaptureEvent::FrameDiscarded {
                    capture_id,
                    reason: DiscardReason::Settling,
                    exposure_ms: frame.exposure_ms(),
                    signal_level: None,
                })
                .await;
                continue;
            }

            let mut frame = frame?;
            frame.set_timestamp(Utc::now());
            return self.develop(&frame, virtual_gain).map(Some);
        }
    }

    /// Transform, pretreat, scale and measure a raw frame
    pub(super) fn develop(&self, frame: &FrameBuffer, virtual_gain: f64) -> Result<Image> {
        let mut image = Image::from_frame(frame, self.settings.depth_extend)?;

        if !self.transform.is_identity() {
            self.transform.apply(image.plane_mut());
        }

        let pretreatment = self.pretreatment.read().clone();
        if let Some(step) = pretreatment {
            step.process(&mut image)?;
        }

        if virtual_gain != 1.0 {
            image.plane_mut().scale(virtual_gain);
        }
        image.set_annotation(GAIN_KEY, virtual_gain);

        self.controller.lock().estimator().compute_level(&mut image);
        Ok(image)
    }

    async fn set_take_gain(&self) -> Result<()> {
        let gain = self.settings.take_gain;
        self.call_camera("set gain", move |camera| camera.set_gain(gain))
            .await
    }

    pub(super) async fn apply_exposure(
        &self,
        state: &mut AcquisitionState,
        requested: f64,
    ) -> Result<f64> {
        let (previous, applied) = self
            .call_camera("set exposure", move |camera| {
                let previous = camera.exposure_ms();
                camera
                    .set_exposure_ms(requested)
                    .map(|applied| (previous, applied))
            })
            .await?;

        if applied != requested {
            self.publish(CaptureEvent::ExposureClamped { requested, applied })
                .await;
        }

        if applied != previous {
            state.frames_to_skip = self.settings.frames_to_skip_after_exposure_set;
            debug!(
                "Exposure {}ms -> {}ms, skipping {} frame(s)",
                previous, applied, state.frames_to_skip
            );
        }

        Ok(applied)
    }

    /// Switch the camera to preview and start forwarding frames as
    /// [`CaptureEvent::PreviewFrame`]. Does nothing if already previewing.
    pub async fn start_preview(self: &Arc<Self>) -> Result<()> {
        if self.is_previewing() {
            debug!("Preview already running");
            return Ok(());
        }

        self.controller.lock().reset();
        let gain = self.settings.preview_gain;
        self.call_camera("set gain", move |camera| camera.set_gain(gain))
            .await?;
        self.call_camera("start preview", |camera| camera.start_preview())
            .await?;

        let interval = Duration::from_millis(self.settings.preview_poll_interval_ms);
        let handle = spawn_preview_task(Arc::clone(self), interval);
        *self.preview.lock() = Some(handle);

        self.publish(CaptureEvent::CameraStateChanged {
            kind: CameraEventKind::PreviewStart,
            message: format!("polling every {:?}", interval),
        })
        .await;
        info!("Preview started");
        Ok(())
    }

    pub async fn stop_preview(&self) -> Result<()> {
        let handle = self.preview.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        handle.stop().await;
        self.call_camera("stop preview", |camera| camera.stop_preview())
            .await?;
        self.publish(CaptureEvent::CameraStateChanged {
            kind: CameraEventKind::PreviewFinish,
            message: "preview stopped".to_string(),
        })
        .await;
        info!("Preview stopped");
        Ok(())
    }

    /// Poll the camera once for a preview frame. Skipped while a foreground
    /// capture is pending or holds the acquisition lock.
    pub(super) async fn preview_tick(&self) -> Result<bool> {
        let Ok(mut state) = self.acquisition.try_lock() else {
            trace!("Acquisition busy, skipping preview poll");
            return Ok(false);
        };
        if self.is_busy() {
            trace!("Foreground capture pending, skipping preview poll");
            return Ok(false);
        }

        let Some(frame) = self
            .call_camera("poll preview", |camera| {
                Ok(camera.poll_preview_frame()?.map(|mut frame| {
                    frame.set_exposure_ms(camera.exposure_ms());
                    frame
                }))
            })
            .await?
        else {
            return Ok(false);
        };

        state.frames_to_skip = state.frames_to_skip.saturating_sub(1);

        // published under the lock so a starting capture waits for it
        let image = self.develop(&frame, self.settings.preview_virtual_gain)?;
        self.publish(CaptureEvent::PreviewFrame {
            image: Arc::new(image),
        })
        .await;
        drop(state);
        Ok(true)
    }

    fn camera(&self) -> Result<Arc<dyn Camera>> {
        self.camera.read().clone().ok_or(ExpocamError::NotConnected)
    }

    /// Run a blocking camera call off the async runtime. Driver failures are
    /// published as camera state changes before being returned.
    async fn call_camera<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Camera) -> std::result::Result<T, CameraError> + Send + 'static,
    {
        let camera = self.camera()?;
        let result = tokio::task::spawn_blocking(move || call(camera.as_ref()))
            .await
            .map_err(|e| ExpocamError::system(format!("Camera {} task failed: {}", operation, e)))?;

        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                error!("Camera {} failed: {}", operation, e);
                self.publish(CaptureEvent::CameraStateChanged {
                    kind: e.event_kind(),
                    message: e.to_string(),
                })
                .await;
                Err(e.into())
            }
        }
    }

    pub(super) async fn publish(&self, event: CaptureEvent) {
        if let Err(e) = self.event_bus.publish(event).await {
            trace!("Event not delivered: {}", e);
        }
    }
}
