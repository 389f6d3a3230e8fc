//! # Watchpost Server
//!
//! Camera capture, motion detection, recording and retention service.
//!
//! This crate provides the running service that:
//! - Opens a camera through a fallback chain (camera module, capture device,
//!   synthetic frames)
//! - Serves the latest frame and a bounded frame stream to any consumer
//! - Detects motion by frame differencing or an external motion pin
//! - Records motion-triggered and manual sessions to date-partitioned files
//! - Deletes recordings older than the retention policy
//!
//! ## Architecture
//!
//! Decision logic lives in [`watchpost_core`]; this crate adds the devices,
//! files and tasks around it.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        watchpost-server                          │
//! │                                                                  │
//! │  SourceChain ──► CaptureLoop ──► FrameHub ──┬──► latest()        │
//! │  (camera)        (subsystem)    (slot+bcast) ├──► MotionDetector ─┐│
//! │                                              └──► RecorderTask ◄──┤│
//! │                                     MotionPin ──► TriggerSlot ────┘│
//! │                                                      │           │
//! │  SettingsManager ──► FrameHub commands               ▼           │
//! │                               RecordingController ──► Storage    │
//! │                                                    ▲ (sweep)     │
//! │                                        RetentionTask             │
//! │                                                                  │
//! │  Surveillance: one method per command, used by the console       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`Surveillance`] - control surface over all components
//! - [`hub::FrameHub`] - latest frame and per-subscriber bounded delivery
//! - [`recording::RecordingController`] - session state machine owner
//! - [`storage::StorageManager`] - date directories, listing, retention
//!
//! ## Example: Starting the Service
//!
//! ```rust,no_run
//! use clap::Parser;
//! use std::time::Duration;
//! use tokio_graceful_shutdown::Toplevel;
//! use watchpost_server::{Cli, Surveillance};
//!
//! #[tokio::main]
//! async fn main() {
//!     let args = Cli::parse_from(["watchpost", "--camera", "synthetic"]);
//!
//!     Toplevel::new(|s| async move {
//!         let (surveillance, services) = Surveillance::new(&args).unwrap();
//!         services.start(&s);
//!         let _ = surveillance.start_recording(Some(Duration::from_secs(30))).await;
//!     })
//!     .catch_signals()
//!     .handle_shutdown_requests(Duration::from_secs(5))
//!     .await
//!     .unwrap();
//! }
//! ```
//!
//! ## Command-Line Interface
//!
//! See [`Cli`] for all available options. Key options:
//!
//! - `--camera` - where the fallback chain starts (default: auto)
//! - `--recordings-dir` - where recordings are kept
//! - `--retention`, `--retention-unit` - how long recordings are kept
//! - `--console` - accept commands on stdin
//! - `-v` - Increase verbosity (use multiple times)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};

use watchpost_core::retention::RetentionUnit;
use watchpost_core::{
    CameraSettings, Frame, MotionConfig, MotionEvent, MotionSource, RecordingPolicy,
    RetentionError, RetentionPolicy, SessionId,
};

pub mod camera;
pub mod config;
pub mod console;
pub mod error;
pub mod hub;
pub mod motion;
pub mod recording;
pub mod retention;
pub mod settings;
pub mod storage;

use camera::{CameraConfig, CameraSelection, DeviceConfig, RpicamConfig, SourceChain};
use config::ServiceClock;
use error::ServiceError;
use hub::{CaptureLoop, FrameHub, HubConfig, HubStatus};
use motion::{MotionDetector, MotionPin, MotionSwitch, TriggerSlot};
use recording::{RecorderError, RecorderTask, RecordingController, RecordingStatus, WprFrame};
use retention::RetentionTask;
use settings::{ApplySettingsError, SettingsManager};
use storage::{DiskUsage, RecordingDay, RecordingFile, StorageError, StorageManager, SweepReport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often the recorder checks session expiry
const RECORDER_TICK: Duration = Duration::from_millis(250);

#[derive(Parser, Clone, Debug)]
#[command(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Where the camera fallback chain starts
    #[arg(long, default_value_t, value_enum)]
    pub camera: CameraSelection,

    /// Capture device for the device tier
    #[arg(long, default_value = "/dev/video0")]
    pub device: PathBuf,

    /// Camera helper for the hardware tier
    #[arg(long, default_value = "rpicam-vid")]
    pub rpicam_command: String,

    /// Frame width
    #[arg(long, default_value_t = 1280)]
    pub width: u32,

    /// Frame height
    #[arg(long, default_value_t = 720)]
    pub height: u32,

    /// Target capture rate
    #[arg(long, default_value_t = 30)]
    pub fps: u32,

    /// A camera read taking longer than this counts as failed
    #[arg(long, default_value_t = 2000)]
    pub read_timeout_ms: u64,

    /// Consecutive failed reads before the camera is reopened
    #[arg(long, default_value_t = 5)]
    pub failure_threshold: u32,

    /// Frames buffered for each frame subscriber
    #[arg(long, default_value_t = 8)]
    pub subscriber_buffer: usize,

    /// Start with motion detection switched on; it is off until toggled
    /// otherwise
    #[arg(long, default_value_t = false)]
    pub motion: bool,

    /// Brightness change (0-255) that counts a pixel as changed
    #[arg(long, default_value_t = 25)]
    pub motion_pixel_threshold: u8,

    /// Fraction of the frame that must change to flag motion
    #[arg(long, default_value_t = 0.01)]
    pub motion_area: f32,

    /// Weight of each new frame in the background average
    #[arg(long, default_value_t = 0.05)]
    pub motion_decay: f32,

    /// Minimum time between two motion events
    #[arg(long, default_value_t = 2000)]
    pub motion_cooldown_ms: u64,

    /// Analyze every Nth frame
    #[arg(long, default_value_t = 3)]
    pub motion_sample_every: u32,

    /// Motion input file, e.g. /sys/class/gpio/gpio18/value
    #[arg(long)]
    pub motion_pin_file: Option<PathBuf>,

    /// How often the motion pin is read
    #[arg(long, default_value_t = 50)]
    pub motion_pin_poll_ms: u64,

    /// Length of the window each motion event opens or extends
    #[arg(long, default_value_t = 180)]
    pub motion_window_secs: u64,

    /// Cap on a motion session from its start, unlimited if absent
    #[arg(long)]
    pub max_motion_session_secs: Option<u64>,

    /// Length of a manual recording started without a duration,
    /// unlimited if absent
    #[arg(long)]
    pub manual_duration_secs: Option<u64>,

    /// Recording retention, in --retention-unit
    #[arg(long, default_value_t = 7)]
    pub retention: u32,

    /// Unit of --retention
    #[arg(long, default_value = "days")]
    pub retention_unit: RetentionUnit,

    /// Time between automatic retention sweeps
    #[arg(long, default_value_t = 3600)]
    pub sweep_interval_secs: u64,

    /// Recordings root, defaults to the user's data directory
    #[arg(long)]
    pub recordings_dir: Option<PathBuf>,

    /// Read commands from stdin
    #[arg(long, default_value_t = false)]
    pub console: bool,
}

impl Cli {
    pub fn camera_config(&self) -> CameraConfig {
        CameraConfig {
            selection: self.camera,
            width: self.width,
            height: self.height,
            fps: self.fps,
            rpicam: RpicamConfig {
                command: self.rpicam_command.clone(),
                ..RpicamConfig::default()
            },
            device: DeviceConfig {
                path: self.device.clone(),
                ..DeviceConfig::default()
            },
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            fps: self.fps,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            failure_threshold: self.failure_threshold,
            subscriber_buffer: self.subscriber_buffer,
        }
    }

    pub fn motion_config(&self) -> MotionConfig {
        MotionConfig {
            pixel_threshold: self.motion_pixel_threshold,
            area_fraction: self.motion_area,
            background_decay: self.motion_decay,
            cooldown_ms: self.motion_cooldown_ms,
            sample_every: self.motion_sample_every,
        }
    }

    pub fn recording_policy(&self) -> RecordingPolicy {
        RecordingPolicy {
            motion_window_ms: self.motion_window_secs.saturating_mul(1000),
            max_motion_session_ms: self.max_motion_session_secs.map(|s| s.saturating_mul(1000)),
            default_manual_duration_ms: self.manual_duration_secs.map(|s| s.saturating_mul(1000)),
        }
    }

    pub fn retention_policy(&self) -> Result<RetentionPolicy, RetentionError> {
        RetentionPolicy::new(self.retention, self.retention_unit)
    }

    pub fn recordings_dir(&self) -> Result<PathBuf, ServiceError> {
        match &self.recordings_dir {
            Some(dir) => Ok(dir.clone()),
            None => config::default_recordings_dir().ok_or(ServiceError::NoDataDir),
        }
    }
}

/// Everything `status()` reports
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub version: &'static str,
    pub camera: HubStatus,
    pub recording: RecordingStatus,
    pub motion_detection: bool,
    pub motion_pin: Option<PathBuf>,
    pub settings: CameraSettings,
    pub retention: RetentionPolicy,
    pub disk: DiskUsage,
}

struct SurveillanceInner {
    hub: Arc<FrameHub>,
    recorder: Arc<RecordingController>,
    storage: Arc<StorageManager>,
    settings: SettingsManager,
    motion: MotionSwitch,
    slot: Arc<TriggerSlot>,
    retention: watch::Sender<RetentionPolicy>,
    motion_pin: Option<PathBuf>,
    clock: ServiceClock,
}

/// Control surface of the service; cheap to clone.
#[derive(Clone)]
pub struct Surveillance {
    inner: Arc<SurveillanceInner>,
}

/// Long-running tasks created alongside a [`Surveillance`], started as
/// subsystems by [`Services::start`].
pub struct Services {
    capture: CaptureLoop,
    detector: MotionDetector,
    recorder: RecorderTask,
    retention: RetentionTask,
    pin: Option<MotionPin>,
}

impl Services {
    pub fn start(self, subsys: &SubsystemHandle) {
        let Services {
            capture,
            detector,
            recorder,
            retention,
            pin,
        } = self;

        subsys.start(SubsystemBuilder::new("Capture", |s| capture.run(s)));
        subsys.start(SubsystemBuilder::new("MotionDetector", |s| detector.run(s)));
        subsys.start(SubsystemBuilder::new("Recorder", |s| recorder.run(s)));
        subsys.start(SubsystemBuilder::new("Retention", |s| retention.run(s)));
        if let Some(pin) = pin {
            subsys.start(SubsystemBuilder::new("MotionPin", |s| pin.run(s)));
        }
    }
}

impl Surveillance {
    /// Build every component from the command line. Nothing runs until the
    /// returned [`Services`] are started.
    pub fn new(args: &Cli) -> Result<(Surveillance, Services), ServiceError> {
        let clock = ServiceClock::new();
        let initial_settings = CameraSettings::default();
        let retention_policy = args.retention_policy().unwrap_or_else(|e| {
            log::warn!("{}, using {}", e, RetentionPolicy::default());
            RetentionPolicy::default()
        });

        let storage = Arc::new(StorageManager::new(args.recordings_dir()?)?);
        log::info!("Recordings in {}", storage.base_dir().display());

        let chain = SourceChain::from_config(&args.camera_config());
        log::info!("Camera chain: {:?}", chain.tiers());
        let (hub, capture) = FrameHub::new(args.hub_config(), chain, initial_settings);

        let motion = MotionSwitch::new(args.motion);
        let slot = Arc::new(TriggerSlot::new());
        let detector = MotionDetector::new(
            hub.clone(),
            args.motion_config(),
            &motion,
            slot.clone(),
            clock,
        );
        let pin = args.motion_pin_file.clone().map(|path| {
            MotionPin::new(
                path,
                Duration::from_millis(args.motion_pin_poll_ms.max(1)),
                &motion,
                slot.clone(),
                clock,
            )
        });

        let recorder = Arc::new(RecordingController::new(
            args.recording_policy(),
            storage.clone(),
            hub.clone(),
            motion.subscribe(),
            clock,
        ));
        let recorder_task = RecorderTask::new(recorder.clone(), slot.clone(), RECORDER_TICK);

        let (retention, retention_rx) = watch::channel(retention_policy);
        let retention_task = RetentionTask::new(
            storage.clone(),
            retention_rx,
            Duration::from_secs(args.sweep_interval_secs.max(1)),
        );

        let surveillance = Surveillance {
            inner: Arc::new(SurveillanceInner {
                settings: SettingsManager::new(hub.clone(), initial_settings),
                hub,
                recorder,
                storage,
                motion,
                slot,
                retention,
                motion_pin: args.motion_pin_file.clone(),
                clock,
            }),
        };
        let services = Services {
            capture,
            detector,
            recorder: recorder_task,
            retention: retention_task,
            pin,
        };
        Ok((surveillance, services))
    }

    pub async fn start_recording(
        &self,
        duration: Option<Duration>,
    ) -> Result<SessionId, RecorderError> {
        self.inner.recorder.start_manual(duration).await
    }

    pub async fn stop_recording(&self) -> Result<(), RecorderError> {
        self.inner.recorder.stop().await
    }

    /// Returns whether detection is now enabled
    pub fn toggle_motion_detection(&self) -> bool {
        self.inner.motion.toggle()
    }

    pub async fn set_camera_setting(
        &self,
        field: &str,
        value: &Value,
    ) -> Result<CameraSettings, ApplySettingsError> {
        self.inner.settings.apply(field, value).await
    }

    pub fn set_retention(&self, value: u32, unit: &str) -> Result<RetentionPolicy, RetentionError> {
        let policy = RetentionPolicy::from_parts(value, unit)?;
        self.inner.retention.send_replace(policy);
        log::info!("Retention set to {}", policy);
        Ok(policy)
    }

    pub fn retention(&self) -> RetentionPolicy {
        *self.inner.retention.borrow()
    }

    /// Sweep now with the current policy
    pub async fn trigger_cleanup(&self) -> SweepReport {
        retention::sweep(self.inner.storage.clone(), self.retention()).await
    }

    pub async fn status(&self) -> SystemStatus {
        let storage = self.inner.storage.clone();
        let disk = tokio::task::spawn_blocking(move || storage.disk_usage())
            .await
            .unwrap_or_default();
        SystemStatus {
            version: VERSION,
            camera: self.inner.hub.status(),
            recording: self.inner.recorder.status().await,
            motion_detection: self.inner.motion.is_enabled(),
            motion_pin: self.inner.motion_pin.clone(),
            settings: self.inner.settings.get().await,
            retention: self.retention(),
            disk,
        }
    }

    pub async fn list_videos(&self) -> Vec<RecordingDay> {
        let storage = self.inner.storage.clone();
        tokio::task::spawn_blocking(move || storage.list())
            .await
            .unwrap_or_default()
    }

    pub fn get_video(&self, path: &str) -> Result<RecordingFile, StorageError> {
        self.inner.storage.resolve_video(path)
    }

    /// A still from a finished recording, `at_ms` after its start
    pub fn video_frame(&self, path: &str, at_ms: u64) -> Result<WprFrame, StorageError> {
        self.inner.storage.frame_at(path, at_ms)
    }

    /// Most recent frame, `None` before the first capture
    pub fn latest_frame(&self) -> Option<Frame> {
        self.inner.hub.latest()
    }

    /// Development trigger, refused when a real motion pin is configured
    pub fn simulate_motion(&self) -> Result<(), ServiceError> {
        if self.inner.motion_pin.is_some() {
            return Err(ServiceError::MotionPinConfigured);
        }
        log::info!("Simulated motion");
        self.inner.slot.offer(MotionEvent::new(
            self.inner.clock.now_ms(),
            1.0,
            MotionSource::Simulated,
        ));
        Ok(())
    }

    pub fn hub(&self) -> &Arc<FrameHub> {
        &self.inner.hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_large_durations_saturate() {
        let max = u64::MAX.to_string();
        let cli = Cli::parse_from([
            "watchpost",
            "--motion-window-secs",
            max.as_str(),
            "--max-motion-session-secs",
            max.as_str(),
            "--manual-duration-secs",
            max.as_str(),
        ]);
        let policy = cli.recording_policy();
        assert_eq!(policy.motion_window_ms, u64::MAX);
        assert_eq!(policy.max_motion_session_ms, Some(u64::MAX));
        assert_eq!(policy.default_manual_duration_ms, Some(u64::MAX));
    }

    #[test]
    fn test_default_policy_from_flags() {
        let cli = Cli::parse_from(["watchpost"]);
        let policy = cli.recording_policy();
        assert_eq!(policy.motion_window_ms, 180_000);
        assert_eq!(policy.max_motion_session_ms, None);
    }

    #[test]
    fn test_motion_detection_starts_off() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().to_str().unwrap();

        let cli = Cli::parse_from(["watchpost", "--camera", "synthetic", "--recordings-dir", dir]);
        let (surveillance, _services) = Surveillance::new(&cli).unwrap();
        assert!(!surveillance.inner.motion.is_enabled());

        let cli = Cli::parse_from([
            "watchpost",
            "--camera",
            "synthetic",
            "--recordings-dir",
            dir,
            "--motion",
        ]);
        let (surveillance, _services) = Surveillance::new(&cli).unwrap();
        assert!(surveillance.inner.motion.is_enabled());
    }
}
