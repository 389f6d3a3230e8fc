//! Hardware tier: the Raspberry Pi camera module through `rpicam-vid`.
//!
//! The helper runs with `--codec mjpeg -o -`; a blocking reader task splits
//! its stdout into JPEG images and hands them over a small channel. When the
//! channel is full the newest image is dropped, the capture loop only ever
//! wants the most recent one.
//!
//! The helper takes its image settings on the command line, so applying
//! settings restarts it. If the restart fails the previous arguments are
//! started again and the error is returned.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use watchpost_core::settings::{ExposureMode, FocusMode, WhiteBalance};
use watchpost_core::{CameraSettings, EncodedImage};

use super::jpeg::{self, JpegSplitter};
use super::{CameraError, CameraSource, SourceOpener, SourceTier};

const MAX_JPEG_LEN: usize = 8 * 1024 * 1024;
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct RpicamConfig {
    /// Helper executable
    pub command: String,
    /// Extra arguments appended after the generated ones
    pub extra_args: Vec<String>,
    /// How long to wait for the first frame after starting the helper
    pub startup_timeout: Duration,
}

impl Default for RpicamConfig {
    fn default() -> Self {
        RpicamConfig {
            command: "rpicam-vid".to_string(),
            extra_args: Vec::new(),
            startup_timeout: Duration::from_secs(5),
        }
    }
}

/// Command line for the helper. Fails for settings the camera stack has no
/// equivalent for.
pub fn build_args(
    config: &RpicamConfig,
    width: u32,
    height: u32,
    fps: u32,
    settings: &CameraSettings,
) -> Result<Vec<String>, CameraError> {
    let mut args: Vec<String> = vec![
        "-t".into(),
        "0".into(),
        "--nopreview".into(),
        "--codec".into(),
        "mjpeg".into(),
        "--width".into(),
        width.to_string(),
        "--height".into(),
        height.to_string(),
        "--framerate".into(),
        fps.to_string(),
        "--flush".into(),
    ];

    args.push("--brightness".into());
    args.push(format!("{:.2}", f64::from(settings.brightness) / 100.0));
    args.push("--contrast".into());
    args.push(format!("{:.2}", settings.contrast));

    args.push("--awb".into());
    args.push(
        match settings.white_balance {
            WhiteBalance::Auto => "auto",
            WhiteBalance::Incandescent => "incandescent",
            WhiteBalance::Fluorescent => "fluorescent",
            WhiteBalance::Daylight => "daylight",
            WhiteBalance::Cloudy => "cloudy",
        }
        .into(),
    );

    let exposure = match settings.exposure_mode {
        ExposureMode::Auto => "normal",
        ExposureMode::Night => "long",
        ExposureMode::Sport => "sport",
        ExposureMode::Manual => {
            return Err(CameraError::UnsupportedSetting {
                tier: SourceTier::Hardware,
                field: "exposure_mode",
                reason: "manual exposure needs a shutter time, which is not configurable".into(),
            })
        }
    };
    args.push("--exposure".into());
    args.push(exposure.into());

    match settings.focus {
        FocusMode::Auto => {
            args.extend(["--autofocus-mode".into(), "continuous".into()]);
        }
        FocusMode::Manual => {
            args.extend(["--autofocus-mode".into(), "manual".into()]);
        }
        FocusMode::Macro => {
            args.extend([
                "--autofocus-mode".into(),
                "manual".into(),
                "--lens-position".into(),
                "10.0".into(),
            ]);
        }
        FocusMode::Infinity => {
            args.extend([
                "--autofocus-mode".into(),
                "manual".into(),
                "--lens-position".into(),
                "0.0".into(),
            ]);
        }
    }

    if settings.zoom > 1.0 {
        let size = 1.0 / settings.zoom;
        let offset = (1.0 - size) / 2.0;
        args.push("--roi".into());
        args.push(format!("{offset:.4},{offset:.4},{size:.4},{size:.4}"));
    }

    args.extend(config.extra_args.iter().cloned());
    args.push("-o".into());
    args.push("-".into());
    Ok(args)
}

pub struct RpicamOpener {
    config: RpicamConfig,
    width: u32,
    height: u32,
    fps: u32,
}

impl RpicamOpener {
    pub fn new(config: RpicamConfig, width: u32, height: u32, fps: u32) -> Self {
        RpicamOpener {
            config,
            width,
            height,
            fps,
        }
    }
}

#[async_trait]
impl SourceOpener for RpicamOpener {
    fn tier(&self) -> SourceTier {
        SourceTier::Hardware
    }

    async fn open(&self) -> Result<Box<dyn CameraSource>, CameraError> {
        let settings = CameraSettings::default();
        let args = build_args(&self.config, self.width, self.height, self.fps, &settings)?;
        let helper = Helper::start(&self.config, &args).await?;
        Ok(Box::new(RpicamSource {
            config: self.config.clone(),
            width: self.width,
            height: self.height,
            fps: self.fps,
            args,
            helper: Some(helper),
        }))
    }
}

/// A running helper process
struct Helper {
    child: Child,
    rx: mpsc::Receiver<Bytes>,
    /// First frame, consumed while waiting for startup
    pending: Option<Bytes>,
    stderr_tail: Arc<Mutex<String>>,
}

impl Helper {
    async fn start(config: &RpicamConfig, args: &[String]) -> Result<Self, CameraError> {
        log::debug!("{} args: {:?}", config.command, args);

        let mut child = Command::new(&config.command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CameraError::from_open_error(&config.command, e))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            CameraError::HardwareUnavailable(format!("{}: no stdout", config.command))
        })?;
        let stderr_tail = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            let name = config.command.clone();
            tokio::task::spawn_blocking(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    log::trace!("{}: {}", name, line);
                    if let Ok(mut t) = tail.lock() {
                        *t = line;
                    }
                }
            });
        }

        let (tx, rx) = mpsc::channel(2);
        tokio::task::spawn_blocking(move || read_stream(stdout, tx));

        let mut helper = Helper {
            child,
            rx,
            pending: None,
            stderr_tail,
        };

        match tokio::time::timeout(config.startup_timeout, helper.rx.recv()).await {
            Ok(Some(first)) => {
                helper.pending = Some(first);
                Ok(helper)
            }
            Ok(None) => {
                let err = helper.failure(&config.command);
                helper.stop();
                Err(err)
            }
            Err(_) => {
                helper.stop();
                Err(CameraError::HardwareUnavailable(format!(
                    "{} produced no frame within {:?}",
                    config.command, config.startup_timeout
                )))
            }
        }
    }

    async fn next(&mut self) -> Option<Bytes> {
        if let Some(frame) = self.pending.take() {
            return Some(frame);
        }
        self.rx.recv().await
    }

    /// Error describing why the helper stopped producing frames
    fn failure(&mut self, command: &str) -> CameraError {
        let status = match self.child.try_wait() {
            Ok(Some(status)) => status.to_string(),
            _ => "stream closed".to_string(),
        };
        let tail = self
            .stderr_tail
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default();
        let message = format!("{} {}: {}", command, status, tail);
        if tail.to_ascii_lowercase().contains("busy") {
            CameraError::DeviceBusy(message)
        } else {
            CameraError::HardwareUnavailable(message)
        }
    }

    fn stop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for Helper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_stream<R: Read>(mut reader: R, tx: mpsc::Sender<Bytes>) {
    let mut splitter = JpegSplitter::new(MAX_JPEG_LEN);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut frames = 0u64;

    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                log::debug!("Camera helper stream ended after {} frames", frames);
                break;
            }
            Ok(n) => {
                for image in splitter.push(&buf[..n]) {
                    frames += 1;
                    match tx.try_send(image) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            log::trace!("Capture loop busy, dropping helper frame");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                }
            }
            Err(e) => {
                log::warn!("Error reading camera helper output: {}", e);
                break;
            }
        }
    }
}

pub struct RpicamSource {
    config: RpicamConfig,
    width: u32,
    height: u32,
    fps: u32,
    args: Vec<String>,
    helper: Option<Helper>,
}

#[async_trait]
impl CameraSource for RpicamSource {
    fn tier(&self) -> SourceTier {
        SourceTier::Hardware
    }

    fn describe(&self) -> String {
        format!(
            "{} {}x{} @ {}fps",
            self.config.command, self.width, self.height, self.fps
        )
    }

    async fn read(&mut self) -> Result<EncodedImage, CameraError> {
        let helper = self.helper.as_mut().ok_or(CameraError::StreamEnded)?;
        match helper.next().await {
            Some(data) => {
                let (w, h) = jpeg::dimensions(&data).unwrap_or((self.width, self.height));
                Ok(EncodedImage::new(data, w, h))
            }
            None => Err(helper.failure(&self.config.command)),
        }
    }

    async fn apply_settings(&mut self, settings: &CameraSettings) -> Result<(), CameraError> {
        let args = build_args(&self.config, self.width, self.height, self.fps, settings)?;
        if args == self.args && self.helper.is_some() {
            return Ok(());
        }

        log::info!("Restarting {} with new settings", self.config.command);
        // The camera can only be opened by one process at a time
        if let Some(mut old) = self.helper.take() {
            old.stop();
        }

        match Helper::start(&self.config, &args).await {
            Ok(helper) => {
                self.helper = Some(helper);
                self.args = args;
                Ok(())
            }
            Err(e) => {
                log::warn!("Settings restart failed ({}), restoring previous settings", e);
                match Helper::start(&self.config, &self.args).await {
                    Ok(helper) => self.helper = Some(helper),
                    Err(e2) => log::error!("Could not restore camera helper: {}", e2),
                }
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut helper) = self.helper.take() {
            helper.stop();
        }
    }
}
