//! Motion inputs: the frame-differencing detector and the motion pin.
//!
//! Both produce [`MotionEvent`]s into a [`TriggerSlot`], a single pending
//! trigger the recording controller takes from. Offering a new event
//! replaces one that has not been taken yet.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tokio_graceful_shutdown::SubsystemHandle;

use watchpost_core::{Frame, LumaImage, MotionAnalyzer, MotionConfig, MotionEvent, MotionSource};

use crate::config::ServiceClock;
use crate::error::ServiceError;
use crate::hub::FrameHub;

/// Width frames are scaled down to before analysis
pub const ANALYSIS_WIDTH: u32 = 160;

#[derive(Default)]
pub struct TriggerSlot {
    pending: Mutex<Option<MotionEvent>>,
    notify: Notify,
}

impl TriggerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest wins: an untaken event is replaced
    pub fn offer(&self, event: MotionEvent) {
        let replaced = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(event);
        if replaced.is_some() {
            log::trace!("Pending motion trigger superseded");
        }
        self.notify.notify_one();
    }

    pub fn take(&self) -> Option<MotionEvent> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Wait for the next event
    pub async fn wait(&self) -> MotionEvent {
        loop {
            if let Some(event) = self.take() {
                return event;
            }
            self.notify.notified().await;
        }
    }
}

/// Shared on/off state of motion triggering
pub struct MotionSwitch {
    tx: watch::Sender<bool>,
}

impl MotionSwitch {
    pub fn new(enabled: bool) -> Self {
        let (tx, _) = watch::channel(enabled);
        MotionSwitch { tx }
    }

    pub fn is_enabled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set(&self, enabled: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != enabled;
            *current = enabled;
            changed
        });
    }

    /// Flip the switch, returning the new state
    pub fn toggle(&self) -> bool {
        let mut now = false;
        self.tx.send_modify(|current| {
            *current = !*current;
            now = *current;
        });
        log::info!(
            "Motion detection {}",
            if now { "enabled" } else { "disabled" }
        );
        now
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

// =============================================================================
// Frame differencing
// =============================================================================

pub struct MotionDetector {
    hub: Arc<FrameHub>,
    analyzer: MotionAnalyzer,
    enabled: watch::Receiver<bool>,
    slot: Arc<TriggerSlot>,
    clock: ServiceClock,
}

impl MotionDetector {
    pub fn new(
        hub: Arc<FrameHub>,
        config: MotionConfig,
        switch: &MotionSwitch,
        slot: Arc<TriggerSlot>,
        clock: ServiceClock,
    ) -> Self {
        MotionDetector {
            hub,
            analyzer: MotionAnalyzer::new(config),
            enabled: switch.subscribe(),
            slot,
            clock,
        }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), ServiceError> {
        self.run_until(subsys.on_shutdown_requested()).await
    }

    /// While enabled, hold a hub subscription and analyze sampled frames.
    /// Disabling drops the subscription; enabling starts over with a fresh
    /// background.
    pub async fn run_until<F: Future<Output = ()>>(
        mut self,
        shutdown: F,
    ) -> Result<(), ServiceError> {
        tokio::pin!(shutdown);

        loop {
            if !*self.enabled.borrow_and_update() {
                tokio::select! {
                    _ = &mut shutdown => break,
                    changed = self.enabled.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            log::debug!("Motion detector subscribing to frames");
            self.analyzer.reset();
            let mut frames = self.hub.subscribe();

            loop {
                tokio::select! {
                    _ = &mut shutdown => return Ok(()),
                    changed = self.enabled.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        if !*self.enabled.borrow_and_update() {
                            log::debug!("Motion detector unsubscribed");
                            break;
                        }
                    }
                    frame = frames.recv() => match frame {
                        Some(frame) => self.analyze(frame).await,
                        None => {
                            log::debug!("Frame stream closed, motion detector stopping");
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn analyze(&mut self, frame: Frame) {
        if !self.analyzer.wants_frame() {
            return;
        }
        let seq = frame.seq;
        let decoded =
            tokio::task::spawn_blocking(move || luma_thumbnail(&frame.data, ANALYSIS_WIDTH)).await;
        let image = match decoded {
            Ok(Some(image)) => image,
            Ok(None) => {
                log::debug!("Frame {} could not be decoded for motion analysis", seq);
                return;
            }
            Err(e) => {
                log::warn!("Motion analysis task failed: {}", e);
                return;
            }
        };

        if let Some(event) = self.analyzer.process(&image, self.clock.now_ms()) {
            log::info!(
                "Motion detected in frame {} (confidence {:.2})",
                seq,
                event.confidence
            );
            self.slot.offer(event);
        } else {
            log::trace!("Frame {}: {:?}", seq, self.analyzer.last_score());
        }
    }
}

/// Decode a JPEG into grayscale no wider than `max_width`
pub fn luma_thumbnail(jpeg: &[u8], max_width: u32) -> Option<LumaImage> {
    let decoded = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg).ok()?;
    let small = if decoded.width() > max_width {
        let height = (u64::from(decoded.height()) * u64::from(max_width)
            / u64::from(decoded.width().max(1)))
        .max(1) as u32;
        decoded.thumbnail_exact(max_width, height)
    } else {
        decoded
    };
    let luma = small.to_luma8();
    let (width, height) = luma.dimensions();
    LumaImage::new(width, height, luma.into_raw())
}

// =============================================================================
// Motion pin
// =============================================================================

/// Polls a GPIO value file; a rising edge is a motion event
pub struct MotionPin {
    path: PathBuf,
    poll: Duration,
    enabled: watch::Receiver<bool>,
    slot: Arc<TriggerSlot>,
    clock: ServiceClock,
}

impl MotionPin {
    pub fn new(
        path: PathBuf,
        poll: Duration,
        switch: &MotionSwitch,
        slot: Arc<TriggerSlot>,
        clock: ServiceClock,
    ) -> Self {
        MotionPin {
            path,
            poll,
            enabled: switch.subscribe(),
            slot,
            clock,
        }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), ServiceError> {
        self.run_until(subsys.on_shutdown_requested()).await
    }

    pub async fn run_until<F: Future<Output = ()>>(self, shutdown: F) -> Result<(), ServiceError> {
        tokio::pin!(shutdown);
        let mut timer = interval(self.poll);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut asserted = false;
        let mut failing = false;
        log::info!("Polling motion pin {}", self.path.display());

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = timer.tick() => {
                    let level = match tokio::fs::read_to_string(&self.path).await {
                        Ok(value) => {
                            if failing {
                                log::info!("Motion pin {} readable again", self.path.display());
                                failing = false;
                            }
                            value.trim() == "1"
                        }
                        Err(e) => {
                            if !failing {
                                log::warn!("Cannot read motion pin {}: {}", self.path.display(), e);
                                failing = true;
                            }
                            continue;
                        }
                    };

                    if level && !asserted && *self.enabled.borrow() {
                        log::info!("Motion pin asserted");
                        self.slot
                            .offer(MotionEvent::new(self.clock.now_ms(), 1.0, MotionSource::Pin));
                    }
                    asserted = level;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{synthetic, SourceChain, SyntheticConfig};
    use crate::hub::HubConfig;
    use chrono::Utc;
    use tokio::sync::oneshot;
    use tokio::time::timeout;
    use watchpost_core::CameraSettings;

    fn solid_frame(seq: u64, shade: u8) -> Frame {
        let img = synthetic::render(64, 48, [shade, shade, shade], &[]);
        Frame::new(seq, Utc::now(), synthetic::encode_jpeg(&img, 90).unwrap())
    }

    #[test]
    fn test_slot_latest_wins() {
        let slot = TriggerSlot::new();
        assert!(slot.take().is_none());
        slot.offer(MotionEvent::new(1, 0.5, MotionSource::Camera));
        slot.offer(MotionEvent::new(2, 0.9, MotionSource::Pin));
        assert_eq!(slot.take().unwrap().at_ms, 2);
        assert!(slot.take().is_none());
    }

    #[tokio::test]
    async fn test_slot_wait_sees_earlier_offer() {
        let slot = TriggerSlot::new();
        slot.offer(MotionEvent::new(7, 1.0, MotionSource::Simulated));
        let event = timeout(Duration::from_secs(1), slot.wait()).await.unwrap();
        assert_eq!(event.source, MotionSource::Simulated);
    }

    #[test]
    fn test_switch_toggle() {
        let switch = MotionSwitch::new(true);
        let rx = switch.subscribe();
        assert!(!switch.toggle());
        assert!(!*rx.borrow());
        switch.set(true);
        assert!(switch.is_enabled());
    }

    #[test]
    fn test_luma_thumbnail_scales_down() {
        let img = synthetic::render(640, 480, [200, 200, 200], &[]);
        let jpeg = synthetic::encode_jpeg(&img, 80).unwrap();
        let luma = luma_thumbnail(&jpeg.data, 160).unwrap();
        assert_eq!((luma.width, luma.height), (160, 120));
        assert!(luma.pixels.iter().all(|p| (*p as i32 - 200).abs() < 8));
        assert!(luma_thumbnail(b"not a jpeg", 160).is_none());
    }

    async fn wait_for_subscriber(hub: &FrameHub, count: usize) {
        timeout(Duration::from_secs(5), async {
            while hub.subscriber_count() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_detector_flags_a_scene_change() {
        let (hub, _capture) = FrameHub::new(
            HubConfig::default(),
            SourceChain::new(vec![], SyntheticConfig::default()),
            CameraSettings::default(),
        );
        let switch = MotionSwitch::new(true);
        let slot = Arc::new(TriggerSlot::new());
        let config = MotionConfig {
            sample_every: 1,
            ..MotionConfig::default()
        };
        let detector =
            MotionDetector::new(hub.clone(), config, &switch, slot.clone(), ServiceClock::new());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(detector.run_until(async {
            let _ = stop_rx.await;
        }));
        wait_for_subscriber(&hub, 1).await;

        hub.publish(solid_frame(1, 20));
        hub.publish(solid_frame(2, 20));
        hub.publish(solid_frame(3, 230));

        let event = timeout(Duration::from_secs(5), slot.wait()).await.unwrap();
        assert_eq!(event.source, MotionSource::Camera);
        assert_eq!(event.confidence, 1.0);

        // Disabling drops the subscription
        switch.set(false);
        wait_for_subscriber(&hub, 0).await;

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pin_rising_edge() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("value");
        std::fs::write(&path, "0\n").unwrap();

        let switch = MotionSwitch::new(true);
        let slot = Arc::new(TriggerSlot::new());
        let pin = MotionPin::new(
            path.clone(),
            Duration::from_millis(10),
            &switch,
            slot.clone(),
            ServiceClock::new(),
        );
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(pin.run_until(async {
            let _ = stop_rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(slot.take().is_none());

        std::fs::write(&path, "1\n").unwrap();
        let event = timeout(Duration::from_secs(5), slot.wait()).await.unwrap();
        assert_eq!(event.source, MotionSource::Pin);
        assert_eq!(event.confidence, 1.0);

        // Held high: no further events
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(slot.take().is_none());

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
