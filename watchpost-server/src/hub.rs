//! Frame hub: the single capture loop and frame fan-out.
//!
//! ```text
//!                        ┌──────────────── FrameHub ────────────────┐
//!   CameraSource ──read──► CaptureLoop ──► latest slot (RwLock)     │──► latest()
//!        ▲                │     │                                   │
//!        │ reopen after K │     └────────► broadcast (bounded) ─────│──► subscribe()
//!        │ failures       │                                         │
//!   SourceChain ◄─────────┘     status (watch) ─────────────────────│──► status()
//!                        └──────────────────────────────────────────┘
//! ```
//!
//! The capture loop is the only writer of the latest-frame slot. Publishing
//! never waits on a consumer: the broadcast channel keeps at most
//! `subscriber_buffer` frames and a subscriber that falls behind loses the
//! oldest ones.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{Local, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_graceful_shutdown::SubsystemHandle;

use watchpost_core::{CameraSettings, EncodedImage, Frame, FrameInfo};

use crate::camera::{synthetic, CameraError, CameraSource, OpenedSource, SourceChain, SourceTier};
use crate::error::ServiceError;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Target capture rate
    pub fps: u32,
    /// A read taking longer than this counts as a failure
    pub read_timeout: Duration,
    /// Consecutive failures before the source is reopened
    pub failure_threshold: u32,
    /// Frames buffered per subscriber before the oldest are dropped
    pub subscriber_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            fps: 30,
            read_timeout: Duration::from_secs(2),
            failure_threshold: 5,
            subscriber_buffer: 8,
        }
    }
}

impl HubConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

/// Capture health, published by the capture loop
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStatus {
    /// Active tier, `None` until the chain has been opened
    pub tier: Option<SourceTier>,
    pub source: Option<String>,
    /// Not on the preferred tier, or reads are failing
    pub degraded: bool,
    /// The latest slot holds the signal-lost placeholder
    pub signal_lost: bool,
    pub consecutive_failures: u32,
    pub frames_captured: u64,
    pub reopen_count: u32,
    pub last_error: Option<String>,
    pub latest: Option<FrameInfo>,
}

pub enum HubCommand {
    ApplySettings {
        settings: CameraSettings,
        reply: oneshot::Sender<Result<(), CameraError>>,
    },
}

pub struct FrameHub {
    latest: RwLock<Option<Frame>>,
    frames: RwLock<Option<broadcast::Sender<Frame>>>,
    status: watch::Sender<HubStatus>,
    commands: mpsc::Sender<HubCommand>,
    config: HubConfig,
}

impl FrameHub {
    /// Create the hub and the capture loop that feeds it.
    ///
    /// `settings` are applied to whatever source the chain opens.
    pub fn new(
        config: HubConfig,
        chain: SourceChain,
        settings: CameraSettings,
    ) -> (Arc<FrameHub>, CaptureLoop) {
        let (frames, _) = broadcast::channel(config.subscriber_buffer.max(1));
        let (status, _) = watch::channel(HubStatus::default());
        let (commands, command_rx) = mpsc::channel(4);

        let hub = Arc::new(FrameHub {
            latest: RwLock::new(None),
            frames: RwLock::new(Some(frames)),
            status,
            commands,
            config,
        });
        let capture = CaptureLoop {
            hub: hub.clone(),
            chain,
            settings,
            commands: command_rx,
            source: None,
            preferred: true,
            position: 0,
            delivered: false,
            seq: 0,
        };
        (hub, capture)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Most recent frame, `None` before the first capture. Never blocks on
    /// the capture loop beyond a pointer copy.
    pub fn latest(&self) -> Option<Frame> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every frame captured from now on, in order. A subscription created
    /// after the hub closed ends immediately.
    pub fn subscribe(&self) -> FrameSubscription {
        let rx = match &*self.frames.read().unwrap_or_else(PoisonError::into_inner) {
            Some(tx) => Some(tx.subscribe()),
            None => None,
        };
        FrameSubscription { rx, dropped: 0 }
    }

    pub fn subscriber_count(&self) -> usize {
        self.frames
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |tx| tx.receiver_count())
    }

    pub fn status(&self) -> HubStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<HubStatus> {
        self.status.subscribe()
    }

    /// Ask the capture loop to apply settings to the active source
    pub async fn apply_settings(&self, settings: CameraSettings) -> Result<(), CameraError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::ApplySettings { settings, reply })
            .await
            .map_err(|_| CameraError::StreamEnded)?;
        rx.await.map_err(|_| CameraError::StreamEnded)?
    }

    pub(crate) fn publish(&self, frame: Frame) {
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(frame.clone());
        if let Some(tx) = &*self.frames.read().unwrap_or_else(PoisonError::into_inner) {
            // No receivers is fine
            let _ = tx.send(frame);
        }
    }

    fn set_latest(&self, frame: Frame) {
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    /// Drop the broadcast sender; subscribers drain what is buffered and
    /// then see the end of the stream.
    pub fn close(&self) {
        self.frames
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn update_status(&self, f: impl FnOnce(&mut HubStatus)) {
        self.status.send_modify(f);
    }
}

/// Receiving side of [`FrameHub::subscribe`]
pub struct FrameSubscription {
    rx: Option<broadcast::Receiver<Frame>>,
    dropped: u64,
}

impl FrameSubscription {
    /// Next frame in capture order, skipping frames this subscriber was too
    /// slow for. `None` once the hub has closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("Frame subscriber lagged, {} frames dropped", n);
                    self.dropped += n;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// A frame that is already buffered, without waiting
    pub fn try_recv(&mut self) -> Option<Frame> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.dropped += n,
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Frames skipped because this subscriber fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

// =============================================================================
// Capture loop
// =============================================================================

pub struct CaptureLoop {
    hub: Arc<FrameHub>,
    chain: SourceChain,
    settings: CameraSettings,
    commands: mpsc::Receiver<HubCommand>,
    source: Option<Box<dyn CameraSource>>,
    /// The active source is the first tier of the chain
    preferred: bool,
    /// Chain index of the active source
    position: usize,
    /// The active source produced a frame since it was opened
    delivered: bool,
    seq: u64,
}

impl CaptureLoop {
    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), ServiceError> {
        self.run_until(subsys.on_shutdown_requested()).await
    }

    /// Capture until `shutdown` completes, then close the source and the hub
    pub async fn run_until<F: Future<Output = ()>>(mut self, shutdown: F) -> Result<(), ServiceError> {
        tokio::pin!(shutdown);

        let opened = self.chain.open(&self.settings).await;
        self.install(opened, false);

        let mut ticker = interval(self.hub.config.frame_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    log::info!("Capture shutdown requested");
                    break;
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }
                _ = ticker.tick() => {
                    self.capture_once().await;
                }
            }
        }

        if let Some(mut source) = self.source.take() {
            source.close().await;
        }
        self.hub.close();
        log::info!("Capture stopped after {} frames", self.seq);
        Ok(())
    }

    fn install(&mut self, opened: OpenedSource, reopened: bool) {
        let tier = opened.source.tier();
        let describe = opened.source.describe();
        let last_error = opened.failures.last().map(|(t, e)| format!("{}: {}", t, e));
        self.preferred = !opened.degraded;
        self.position = opened.position;
        self.delivered = false;
        self.source = Some(opened.source);

        if opened.degraded {
            log::warn!("Camera running degraded on the {} tier", tier);
        }
        self.hub.update_status(|s| {
            s.tier = Some(tier);
            s.source = Some(describe);
            s.degraded = opened.degraded;
            s.consecutive_failures = 0;
            if reopened {
                s.reopen_count += 1;
            }
            if last_error.is_some() {
                s.last_error = last_error;
            }
        });
    }

    async fn handle_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::ApplySettings { settings, reply } => {
                let result = match self.source.as_mut() {
                    Some(source) => source.apply_settings(&settings).await,
                    None => Err(CameraError::StreamEnded),
                };
                if result.is_ok() {
                    self.settings = settings;
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn capture_once(&mut self) {
        let Some(source) = self.source.as_mut() else {
            return;
        };
        let read_timeout = self.hub.config.read_timeout;
        let result = match timeout(read_timeout, source.read()).await {
            Ok(result) => result,
            Err(_) => Err(CameraError::Timeout(read_timeout)),
        };

        match result {
            Ok(image) => self.publish(image),
            Err(e) => self.read_failed(e).await,
        }
    }

    fn publish(&mut self, image: EncodedImage) {
        self.delivered = true;
        self.seq += 1;
        let frame = Frame::new(self.seq, Utc::now(), image);
        let info = frame.info();
        self.hub.publish(frame);

        let degraded = !self.preferred;
        self.hub.update_status(|s| {
            s.frames_captured += 1;
            s.consecutive_failures = 0;
            s.degraded = degraded;
            s.signal_lost = false;
            s.latest = Some(info);
        });
    }

    async fn read_failed(&mut self, error: CameraError) {
        let threshold = self.hub.config.failure_threshold.max(1);
        let message = error.to_string();
        let mut failures = 0;
        self.hub.update_status(|s| {
            s.consecutive_failures += 1;
            s.degraded = true;
            s.last_error = Some(message.clone());
            failures = s.consecutive_failures;
        });

        if failures == 1 {
            log::warn!("Camera read failed: {}", message);
        } else {
            log::debug!("Camera read failed ({} in a row): {}", failures, message);
        }
        if failures < threshold {
            return;
        }

        log::error!(
            "{} consecutive camera read failures, reopening the source",
            failures
        );
        if self.hub.latest().is_none() {
            self.show_signal_lost();
        }
        if let Some(mut source) = self.source.take() {
            source.close().await;
        }
        // A tier that opens but never delivers is skipped on the next walk
        let start = if self.delivered {
            0
        } else {
            log::warn!("Camera source produced no frames since it was opened, trying the next tier");
            self.position + 1
        };
        let opened = self.chain.open_from(start, &self.settings).await;
        self.install(opened, true);
    }

    fn show_signal_lost(&mut self) {
        let (width, height) = self
            .hub
            .status()
            .latest
            .map_or((640, 480), |f| (f.width, f.height));
        match synthetic::signal_lost_frame(width, height, &Local::now()) {
            Ok(image) => {
                self.seq += 1;
                let frame = Frame::new(self.seq, Utc::now(), image);
                let info = frame.info();
                self.hub.set_latest(frame);
                self.hub.update_status(|s| {
                    s.signal_lost = true;
                    s.latest = Some(info);
                });
            }
            Err(e) => log::error!("Cannot render signal-lost frame: {}", e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::camera::{SourceOpener, SyntheticConfig};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Camera that replays a script of reads, then produces frames forever
    pub(crate) struct ScriptedSource {
        pub script: VecDeque<Result<(), ()>>,
        pub tier: SourceTier,
        pub applied: Arc<Mutex<Vec<CameraSettings>>>,
        pub reject_settings: bool,
    }

    fn tiny_image() -> EncodedImage {
        EncodedImage::new(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]), 4, 4)
    }

    #[async_trait]
    impl CameraSource for ScriptedSource {
        fn tier(&self) -> SourceTier {
            self.tier
        }

        fn describe(&self) -> String {
            "scripted".into()
        }

        async fn read(&mut self) -> Result<EncodedImage, CameraError> {
            match self.script.pop_front() {
                Some(Err(())) => Err(CameraError::HardwareUnavailable("scripted failure".into())),
                _ => Ok(tiny_image()),
            }
        }

        async fn apply_settings(&mut self, settings: &CameraSettings) -> Result<(), CameraError> {
            if self.reject_settings {
                return Err(CameraError::UnsupportedSetting {
                    tier: self.tier,
                    field: "zoom",
                    reason: "scripted".into(),
                });
            }
            self.applied.lock().unwrap().push(*settings);
            Ok(())
        }

        async fn close(&mut self) {}
    }

    pub(crate) struct ScriptedOpener {
        pub script: Mutex<VecDeque<Result<(), ()>>>,
        pub tier: SourceTier,
        pub opens: Arc<Mutex<u32>>,
        pub applied: Arc<Mutex<Vec<CameraSettings>>>,
        pub reject_settings: bool,
    }

    impl ScriptedOpener {
        pub fn new(script: Vec<Result<(), ()>>) -> Self {
            ScriptedOpener {
                script: Mutex::new(script.into()),
                tier: SourceTier::Hardware,
                opens: Arc::new(Mutex::new(0)),
                applied: Arc::new(Mutex::new(Vec::new())),
                reject_settings: false,
            }
        }
    }

    #[async_trait]
    impl SourceOpener for ScriptedOpener {
        fn tier(&self) -> SourceTier {
            self.tier
        }

        async fn open(&self) -> Result<Box<dyn CameraSource>, CameraError> {
            *self.opens.lock().unwrap() += 1;
            Ok(Box::new(ScriptedSource {
                script: std::mem::take(&mut *self.script.lock().unwrap()),
                tier: self.tier,
                applied: self.applied.clone(),
                reject_settings: self.reject_settings,
            }))
        }
    }

    fn chain(opener: ScriptedOpener) -> SourceChain {
        SourceChain::new(
            vec![Box::new(opener)],
            SyntheticConfig {
                width: 32,
                height: 24,
                quality: 50,
            },
        )
    }

    fn config(buffer: usize) -> HubConfig {
        HubConfig {
            fps: 100,
            read_timeout: Duration::from_millis(500),
            failure_threshold: 3,
            subscriber_buffer: buffer,
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, Utc::now(), tiny_image())
    }

    #[test]
    fn test_latest_before_first_capture_is_none() {
        let (hub, _capture) = FrameHub::new(
            config(4),
            chain(ScriptedOpener::new(vec![])),
            CameraSettings::default(),
        );
        assert!(hub.latest().is_none());
        assert_eq!(hub.status().frames_captured, 0);
        assert!(hub.status().tier.is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_stays_bounded() {
        let (hub, _capture) = FrameHub::new(
            config(4),
            chain(ScriptedOpener::new(vec![])),
            CameraSettings::default(),
        );
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        for seq in 1..=100 {
            hub.publish(frame(seq));
            assert_eq!(fast.recv().await.unwrap().seq, seq);
        }
        assert_eq!(hub.latest().unwrap().seq, 100);

        // Only the newest `subscriber_buffer` frames were kept for it
        let mut seen = Vec::new();
        hub.close();
        while let Some(f) = slow.recv().await {
            seen.push(f.seq);
        }
        assert_eq!(seen, vec![97, 98, 99, 100]);
        assert_eq!(slow.dropped(), 96);
        assert!(fast.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_after_close_ends() {
        let (hub, _capture) = FrameHub::new(
            config(4),
            chain(ScriptedOpener::new(vec![])),
            CameraSettings::default(),
        );
        hub.close();
        assert!(hub.subscribe().recv().await.is_none());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_capture_loop_delivers_in_order() {
        let (hub, capture) = FrameHub::new(
            config(64),
            chain(ScriptedOpener::new(vec![])),
            CameraSettings::default(),
        );
        let mut sub = hub.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(capture.run_until(async {
            let _ = stop_rx.await;
        }));

        let mut last = 0;
        for _ in 0..10 {
            let f = sub.recv().await.unwrap();
            assert!(f.seq > last);
            last = f.seq;
        }
        let status = hub.status();
        assert_eq!(status.tier, Some(SourceTier::Hardware));
        assert!(!status.degraded);

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        // Hub closed: the subscription drains and ends
        while sub.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_repeated_failures_reopen_the_source() {
        // One good frame, then three failures; the reopened source is healthy
        let opener = ScriptedOpener::new(vec![Ok(()), Err(()), Err(()), Err(())]);
        let opens = opener.opens.clone();
        let (hub, capture) = FrameHub::new(config(64), chain(opener), CameraSettings::default());
        let mut status = hub.watch_status();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(capture.run_until(async {
            let _ = stop_rx.await;
        }));

        status
            .wait_for(|s| s.reopen_count == 1 && s.frames_captured > 1)
            .await
            .unwrap();
        // The tier had delivered before, so it was tried again
        assert_eq!(*opens.lock().unwrap(), 2);

        let s = hub.status();
        assert_eq!(s.tier, Some(SourceTier::Hardware));
        assert!(s.last_error.unwrap().contains("scripted failure"));
        assert!(!s.signal_lost);

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    /// Camera that delivers `good` frames, then fails or hangs on every read
    struct StuckSource {
        good: u32,
        hang: bool,
    }

    #[async_trait]
    impl CameraSource for StuckSource {
        fn tier(&self) -> SourceTier {
            SourceTier::Hardware
        }

        fn describe(&self) -> String {
            "stuck".into()
        }

        async fn read(&mut self) -> Result<EncodedImage, CameraError> {
            if self.good > 0 {
                self.good -= 1;
                return Ok(tiny_image());
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            Err(CameraError::HardwareUnavailable("stream stalled".into()))
        }

        async fn apply_settings(&mut self, _: &CameraSettings) -> Result<(), CameraError> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    /// Opens fine every time; only the first source gets `good_first` frames
    struct StuckOpener {
        good_first: u32,
        hang: bool,
        opens: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl SourceOpener for StuckOpener {
        fn tier(&self) -> SourceTier {
            SourceTier::Hardware
        }

        async fn open(&self) -> Result<Box<dyn CameraSource>, CameraError> {
            let mut opens = self.opens.lock().unwrap();
            *opens += 1;
            Ok(Box::new(StuckSource {
                good: if *opens == 1 { self.good_first } else { 0 },
                hang: self.hang,
            }))
        }
    }

    fn stuck_then_fallback(good_first: u32, hang: bool) -> (SourceChain, Arc<Mutex<u32>>) {
        let opens = Arc::new(Mutex::new(0));
        let mut fallback = ScriptedOpener::new(vec![]);
        fallback.tier = SourceTier::Synthetic;
        let chain = SourceChain::new(
            vec![
                Box::new(StuckOpener {
                    good_first,
                    hang,
                    opens: opens.clone(),
                }),
                Box::new(fallback),
            ],
            SyntheticConfig {
                width: 32,
                height: 24,
                quality: 50,
            },
        );
        (chain, opens)
    }

    #[tokio::test(start_paused = true)]
    async fn test_tier_that_never_delivers_falls_back() {
        let (chain, opens) = stuck_then_fallback(0, false);
        let (hub, capture) = FrameHub::new(config(64), chain, CameraSettings::default());
        let mut sub = hub.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(capture.run_until(async {
            let _ = stop_rx.await;
        }));

        let first = sub.recv().await.unwrap();
        let s = hub.status();
        assert_eq!(s.tier, Some(SourceTier::Synthetic));
        assert_eq!(s.reopen_count, 1);
        assert!(s.degraded);
        assert!(s.frames_captured > 0);
        assert_eq!(*opens.lock().unwrap(), 1);
        // The signal-lost placeholder took the first sequence number but
        // only went to the latest slot
        assert_eq!(first.seq, 2);

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wedged_after_delivering_does_not_freeze_latest() {
        let (chain, opens) = stuck_then_fallback(2, false);
        let (hub, capture) = FrameHub::new(config(64), chain, CameraSettings::default());
        let mut status = hub.watch_status();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(capture.run_until(async {
            let _ = stop_rx.await;
        }));

        status
            .wait_for(|s| s.tier == Some(SourceTier::Synthetic) && s.frames_captured > 2)
            .await
            .unwrap();
        let s = hub.status();
        // Retried once because it had delivered, then skipped
        assert_eq!(*opens.lock().unwrap(), 2);
        assert_eq!(s.reopen_count, 2);
        assert!(!s.signal_lost);
        assert!(hub.latest().unwrap().seq > 2);

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeouts_count_as_failures() {
        let (chain, _opens) = stuck_then_fallback(0, true);
        let (hub, capture) = FrameHub::new(config(64), chain, CameraSettings::default());
        let mut status = hub.watch_status();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(capture.run_until(async {
            let _ = stop_rx.await;
        }));

        status
            .wait_for(|s| s.consecutive_failures >= 1)
            .await
            .unwrap();
        let s = hub.status();
        assert_eq!(s.tier, Some(SourceTier::Hardware));
        assert_eq!(s.reopen_count, 0);
        assert!(s.degraded);
        assert!(s.last_error.unwrap().contains("timed out"));

        // failure_threshold timeouts, then the next tier takes over
        status
            .wait_for(|s| s.reopen_count == 1 && s.frames_captured > 0)
            .await
            .unwrap();
        assert_eq!(hub.status().tier, Some(SourceTier::Synthetic));

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_settings_go_through_the_capture_loop() {
        let opener = ScriptedOpener::new(vec![]);
        let applied = opener.applied.clone();
        let (hub, capture) = FrameHub::new(config(8), chain(opener), CameraSettings::default());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(capture.run_until(async {
            let _ = stop_rx.await;
        }));

        let settings = CameraSettings {
            zoom: 2.0,
            ..CameraSettings::default()
        };
        hub.apply_settings(settings).await.unwrap();
        // Initial settings on open, then the update
        assert_eq!(applied.lock().unwrap().last(), Some(&settings));

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert!(matches!(
            hub.apply_settings(settings).await,
            Err(CameraError::StreamEnded)
        ));
    }
}
