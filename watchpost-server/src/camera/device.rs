//! Device tier: a V4L2 capture device delivering MJPG.
//!
//! The device and its mmap stream live on a dedicated thread, since
//! `v4l` is blocking. Frames come back over a small channel (newest dropped
//! when full); control changes go to the thread over a command channel and
//! are applied between two frames.
//!
//! Camera settings are translated to device controls by [`plan_controls`],
//! which only looks at the control descriptions the device reported. A
//! setting the device has no control for is rejected as unsupported, unless
//! it is at its neutral value.

use std::path::PathBuf;

use async_trait::async_trait;

use watchpost_core::settings::{ExposureMode, FocusMode, WhiteBalance, ZOOM_MAX, ZOOM_MIN};
use watchpost_core::{CameraSettings, EncodedImage};

use super::{CameraError, CameraSource, SourceOpener, SourceTier};

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub path: PathBuf,
    /// Number of mmap buffers
    pub buffers: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            path: PathBuf::from("/dev/video0"),
            buffers: 4,
        }
    }
}

/// What the device reported about one control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInfo {
    pub id: u32,
    pub name: String,
    pub minimum: i64,
    pub maximum: i64,
    pub default: i64,
}

impl ControlInfo {
    fn clamp(&self, value: i64) -> i64 {
        value.clamp(self.minimum, self.maximum)
    }

    /// Map `fraction` (0.0 ..= 1.0) onto the control's range
    fn lerp(&self, fraction: f64) -> i64 {
        let span = (self.maximum - self.minimum) as f64;
        self.clamp(self.minimum + (span * fraction.clamp(0.0, 1.0)).round() as i64)
    }
}

fn find<'a>(controls: &'a [ControlInfo], names: &[&str]) -> Option<&'a ControlInfo> {
    controls.iter().find(|c| {
        let name = c.name.to_ascii_lowercase();
        names.iter().any(|n| name == *n)
    })
}

fn unsupported(field: &'static str, reason: &str) -> CameraError {
    CameraError::UnsupportedSetting {
        tier: SourceTier::Device,
        field,
        reason: reason.to_string(),
    }
}

/// Translate settings into `(control id, value)` pairs for this device.
pub fn plan_controls(
    controls: &[ControlInfo],
    settings: &CameraSettings,
) -> Result<Vec<(u32, i64)>, CameraError> {
    let mut plan = Vec::new();

    match find(controls, &["brightness"]) {
        Some(c) => {
            let fraction = (f64::from(settings.brightness) + 100.0) / 200.0;
            plan.push((c.id, c.lerp(fraction)));
        }
        None if settings.brightness != 0 => {
            return Err(unsupported("brightness", "no brightness control"))
        }
        None => {}
    }

    match find(controls, &["contrast"]) {
        Some(c) => {
            // 1.0 is the device default; below scales towards minimum,
            // above towards maximum
            let value = if settings.contrast <= 1.0 {
                c.minimum as f64 + (c.default - c.minimum) as f64 * settings.contrast
            } else {
                c.default as f64 + (c.maximum - c.default) as f64 * (settings.contrast - 1.0) / 2.0
            };
            plan.push((c.id, c.clamp(value.round() as i64)));
        }
        None if settings.contrast != 1.0 => {
            return Err(unsupported("contrast", "no contrast control"))
        }
        None => {}
    }

    let awb_auto = find(
        controls,
        &["white balance temperature, auto", "white balance, automatic"],
    );
    let awb_temp = find(controls, &["white balance temperature"]);
    match settings.white_balance {
        WhiteBalance::Auto => {
            if let Some(c) = awb_auto {
                plan.push((c.id, 1));
            }
        }
        preset => {
            let kelvin = match preset {
                WhiteBalance::Incandescent => 2800,
                WhiteBalance::Fluorescent => 4000,
                WhiteBalance::Daylight => 5500,
                _ => 6500,
            };
            match (awb_auto, awb_temp) {
                (Some(auto), Some(temp)) => {
                    plan.push((auto.id, 0));
                    plan.push((temp.id, temp.clamp(kelvin)));
                }
                _ => {
                    return Err(unsupported(
                        "white_balance",
                        "no white balance temperature control",
                    ))
                }
            }
        }
    }

    let auto_exposure = find(controls, &["auto exposure", "exposure, auto"]);
    let dynamic_fps = find(
        controls,
        &["exposure, dynamic framerate", "exposure dynamic framerate"],
    );
    // UVC menu: 1 = manual, 3 = aperture priority
    match (settings.exposure_mode, auto_exposure) {
        (ExposureMode::Auto, Some(c)) => {
            plan.push((c.id, 3));
            if let Some(d) = dynamic_fps {
                plan.push((d.id, 0));
            }
        }
        (ExposureMode::Auto, None) => {}
        (ExposureMode::Manual, Some(c)) => plan.push((c.id, 1)),
        (ExposureMode::Night, Some(c)) => match dynamic_fps {
            Some(d) => {
                plan.push((c.id, 3));
                plan.push((d.id, 1));
            }
            None => {
                return Err(unsupported(
                    "exposure_mode",
                    "night mode needs a dynamic framerate control",
                ))
            }
        },
        (ExposureMode::Sport, _) => {
            return Err(unsupported("exposure_mode", "no sport exposure program"))
        }
        (_, None) => return Err(unsupported("exposure_mode", "no auto exposure control")),
    }

    let autofocus = find(
        controls,
        &["focus, automatic continuous", "focus, auto", "focus, autofocus"],
    );
    let focus_abs = find(controls, &["focus, absolute", "focus (absolute)"]);
    match (settings.focus, autofocus) {
        (FocusMode::Auto, Some(af)) => plan.push((af.id, 1)),
        (FocusMode::Auto, None) => {}
        (FocusMode::Manual, Some(af)) => plan.push((af.id, 0)),
        (FocusMode::Macro | FocusMode::Infinity, Some(af)) => {
            let Some(abs) = focus_abs else {
                return Err(unsupported("focus", "no absolute focus control"));
            };
            plan.push((af.id, 0));
            // Higher values focus closer on UVC cameras
            let value = if settings.focus == FocusMode::Macro {
                abs.maximum
            } else {
                abs.minimum
            };
            plan.push((abs.id, value));
        }
        (_, None) => return Err(unsupported("focus", "fixed focus camera")),
    }

    match find(controls, &["zoom, absolute"]) {
        Some(c) => {
            let fraction = (settings.zoom - ZOOM_MIN) / (ZOOM_MAX - ZOOM_MIN);
            plan.push((c.id, c.lerp(fraction)));
        }
        None if settings.zoom > 1.0 => return Err(unsupported("zoom", "no zoom control")),
        None => {}
    }

    Ok(plan)
}

pub struct DeviceOpener {
    config: DeviceConfig,
    width: u32,
    height: u32,
}

impl DeviceOpener {
    pub fn new(config: DeviceConfig, width: u32, height: u32) -> Self {
        DeviceOpener {
            config,
            width,
            height,
        }
    }
}

#[async_trait]
impl SourceOpener for DeviceOpener {
    fn tier(&self) -> SourceTier {
        SourceTier::Device
    }

    #[cfg(target_os = "linux")]
    async fn open(&self) -> Result<Box<dyn CameraSource>, CameraError> {
        let source = linux::DeviceSource::open(&self.config, self.width, self.height).await?;
        Ok(Box::new(source))
    }

    #[cfg(not(target_os = "linux"))]
    async fn open(&self) -> Result<Box<dyn CameraSource>, CameraError> {
        Err(CameraError::HardwareUnavailable(format!(
            "{}: V4L2 capture is only available on Linux",
            self.config.path.display()
        )))
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::sync::mpsc as std_mpsc;
    use std::thread;

    use bytes::Bytes;
    use tokio::sync::{mpsc, oneshot};
    use v4l::buffer::Type;
    use v4l::io::mmap::Stream as MmapStream;
    use v4l::io::traits::CaptureStream;
    use v4l::prelude::*;
    use v4l::video::Capture;

    use super::*;
    use crate::camera::jpeg;

    enum DeviceCommand {
        Apply(Vec<(u32, i64)>, oneshot::Sender<std::io::Result<()>>),
    }

    struct Opened {
        width: u32,
        height: u32,
        controls: Vec<ControlInfo>,
    }

    pub struct DeviceSource {
        path: PathBuf,
        width: u32,
        height: u32,
        controls: Vec<ControlInfo>,
        rx: mpsc::Receiver<Bytes>,
        commands: Option<std_mpsc::Sender<DeviceCommand>>,
    }

    impl DeviceSource {
        pub async fn open(
            config: &DeviceConfig,
            width: u32,
            height: u32,
        ) -> Result<Self, CameraError> {
            let (frame_tx, rx) = mpsc::channel(2);
            let (cmd_tx, cmd_rx) = std_mpsc::channel();
            let (ready_tx, ready_rx) = oneshot::channel();
            let thread_config = config.clone();

            thread::Builder::new()
                .name("v4l-capture".into())
                .spawn(move || capture_thread(thread_config, width, height, frame_tx, cmd_rx, ready_tx))?;

            let opened = ready_rx.await.map_err(|_| {
                CameraError::HardwareUnavailable(format!(
                    "{}: capture thread exited",
                    config.path.display()
                ))
            })??;

            Ok(DeviceSource {
                path: config.path.clone(),
                width: opened.width,
                height: opened.height,
                controls: opened.controls,
                rx,
                commands: Some(cmd_tx),
            })
        }
    }

    fn setup_stream(
        device: &Device,
        config: &DeviceConfig,
        width: u32,
        height: u32,
        path: &str,
    ) -> Result<(Opened, MmapStream<'static>), CameraError> {
        let mut format = device.format()?;
        format.width = width;
        format.height = height;
        format.fourcc = v4l::FourCC::new(b"MJPG");
        let format = device
            .set_format(&format)
            .map_err(|e| CameraError::from_open_error(path, e))?;
        if format.fourcc != v4l::FourCC::new(b"MJPG") {
            return Err(CameraError::HardwareUnavailable(format!(
                "{}: device does not offer MJPG",
                path
            )));
        }

        let controls = device
            .query_controls()
            .unwrap_or_default()
            .into_iter()
            .map(|d| ControlInfo {
                id: d.id,
                name: d.name,
                minimum: d.minimum,
                maximum: d.maximum,
                default: d.default,
            })
            .collect();

        let stream = MmapStream::with_buffers(device, Type::VideoCapture, config.buffers)
            .map_err(|e| CameraError::from_open_error(path, e))?;
        Ok((
            Opened {
                width: format.width,
                height: format.height,
                controls,
            },
            stream,
        ))
    }

    fn capture_thread(
        config: DeviceConfig,
        width: u32,
        height: u32,
        frames: mpsc::Sender<Bytes>,
        commands: std_mpsc::Receiver<DeviceCommand>,
        ready: oneshot::Sender<Result<Opened, CameraError>>,
    ) {
        let path = config.path.display().to_string();
        let device = match Device::with_path(&config.path) {
            Ok(d) => d,
            Err(e) => {
                let _ = ready.send(Err(CameraError::from_open_error(&path, e)));
                return;
            }
        };

        let setup = setup_stream(&device, &config, width, height, &path);

        let mut stream = match setup {
            Ok((opened, stream)) => {
                if ready.send(Ok(opened)).is_err() {
                    return;
                }
                stream
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };

        loop {
            loop {
                match commands.try_recv() {
                    Ok(DeviceCommand::Apply(plan, reply)) => {
                        let result = plan.into_iter().try_for_each(|(id, value)| {
                            device.set_control(v4l::Control {
                                id,
                                value: v4l::control::Value::Integer(value),
                            })
                        });
                        let _ = reply.send(result);
                    }
                    Err(std_mpsc::TryRecvError::Empty) => break,
                    Err(std_mpsc::TryRecvError::Disconnected) => {
                        log::debug!("{}: capture thread stopping", path);
                        return;
                    }
                }
            }

            match stream.next() {
                Ok((buf, _meta)) => match frames.try_send(Bytes::copy_from_slice(buf)) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                },
                Err(e) => {
                    log::warn!("{}: capture failed: {}", path, e);
                    return;
                }
            }
        }
    }

    #[async_trait]
    impl CameraSource for DeviceSource {
        fn tier(&self) -> SourceTier {
            SourceTier::Device
        }

        fn describe(&self) -> String {
            format!(
                "V4L2 {} {}x{} MJPG",
                self.path.display(),
                self.width,
                self.height
            )
        }

        async fn read(&mut self) -> Result<EncodedImage, CameraError> {
            match self.rx.recv().await {
                Some(data) => {
                    let (w, h) = jpeg::dimensions(&data).unwrap_or((self.width, self.height));
                    Ok(EncodedImage::new(data, w, h))
                }
                None => Err(CameraError::HardwareUnavailable(format!(
                    "{}: capture stopped",
                    self.path.display()
                ))),
            }
        }

        async fn apply_settings(&mut self, settings: &CameraSettings) -> Result<(), CameraError> {
            let plan = plan_controls(&self.controls, settings)?;
            let commands = self.commands.as_ref().ok_or(CameraError::StreamEnded)?;
            let (tx, rx) = oneshot::channel();
            commands
                .send(DeviceCommand::Apply(plan, tx))
                .map_err(|_| CameraError::StreamEnded)?;
            rx.await.map_err(|_| CameraError::StreamEnded)??;
            Ok(())
        }

        async fn close(&mut self) {
            // Dropping the command sender stops the thread after its
            // current frame
            self.commands.take();
            self.rx.close();
        }
    }
}
