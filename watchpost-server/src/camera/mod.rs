//! Camera sources and the fallback chain.
//!
//! ```text
//!   SourceChain::open()
//!        │
//!        ├─► Hardware  (rpicam-vid helper, MJPEG on stdout)
//!        │      │ HardwareUnavailable / DeviceBusy
//!        ├─► Device    (V4L2 /dev/videoN, MJPG)
//!        │      │ HardwareUnavailable / DeviceBusy
//!        └─► Synthetic (rendered placeholder frames, never fails)
//! ```
//!
//! All tiers implement [`CameraSource`]. The chain is walked once at startup
//! and again only when the frame hub asks for a reopen after repeated read
//! failures. The result records which tier is active and whether that is
//! a degraded choice (anything but the first tier configured).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use strum::{Display, EnumString};
use thiserror::Error;

use watchpost_core::{CameraSettings, EncodedImage};

pub mod device;
pub mod jpeg;
pub mod rpicam;
pub mod synthetic;

pub use device::{DeviceConfig, DeviceOpener};
pub use rpicam::{RpicamConfig, RpicamOpener};
pub use synthetic::{SyntheticConfig, SyntheticOpener, SyntheticSource};

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Camera hardware unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("Camera device busy: {0}")]
    DeviceBusy(String),

    #[error("The {tier} camera cannot apply {field}: {reason}")]
    UnsupportedSetting {
        tier: SourceTier,
        field: &'static str,
        reason: String,
    },

    #[error("Camera read timed out after {0:?}")]
    Timeout(Duration),

    #[error("Camera stream ended")]
    StreamEnded,

    #[error("Frame encoding failed: {0}")]
    Encode(String),

    #[error("Camera I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// Map an OS error from opening a device onto the camera taxonomy
    pub fn from_open_error(what: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                CameraError::HardwareUnavailable(format!("{}: {}", what, err))
            }
            _ if err.raw_os_error() == Some(16) => {
                // EBUSY
                CameraError::DeviceBusy(format!("{}: {}", what, err))
            }
            _ => CameraError::HardwareUnavailable(format!("{}: {}", what, err)),
        }
    }
}

/// Which implementation is producing frames
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SourceTier {
    Hardware,
    Device,
    Synthetic,
}

/// Where the fallback chain starts
#[derive(clap::ValueEnum, Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraSelection {
    /// Try the camera module, then a capture device, then synthetic frames
    #[default]
    Auto,
    Hardware,
    Device,
    Synthetic,
}

impl CameraSelection {
    pub fn chain(&self) -> &'static [SourceTier] {
        match self {
            CameraSelection::Auto | CameraSelection::Hardware => &[
                SourceTier::Hardware,
                SourceTier::Device,
                SourceTier::Synthetic,
            ],
            CameraSelection::Device => &[SourceTier::Device, SourceTier::Synthetic],
            CameraSelection::Synthetic => &[SourceTier::Synthetic],
        }
    }
}

/// Uniform frame-producing interface over all tiers
#[async_trait]
pub trait CameraSource: Send {
    fn tier(&self) -> SourceTier;

    /// Human readable description for logs and status
    fn describe(&self) -> String;

    /// Wait for the next encoded frame
    async fn read(&mut self) -> Result<EncodedImage, CameraError>;

    /// Apply a complete settings object. On error the source keeps its
    /// previous settings.
    async fn apply_settings(&mut self, settings: &CameraSettings) -> Result<(), CameraError>;

    /// Release the underlying device or process
    async fn close(&mut self);
}

/// Opens one tier of the chain
#[async_trait]
pub trait SourceOpener: Send + Sync {
    fn tier(&self) -> SourceTier;

    async fn open(&self) -> Result<Box<dyn CameraSource>, CameraError>;
}

/// Capture parameters shared by all tiers
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub selection: CameraSelection,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub rpicam: RpicamConfig,
    pub device: DeviceConfig,
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig {
            selection: CameraSelection::Auto,
            width: 1280,
            height: 720,
            fps: 30,
            rpicam: RpicamConfig::default(),
            device: DeviceConfig::default(),
        }
    }
}

impl CameraConfig {
    pub fn synthetic(&self) -> SyntheticConfig {
        SyntheticConfig {
            width: self.width,
            height: self.height,
            ..SyntheticConfig::default()
        }
    }
}

/// A source picked by the chain
pub struct OpenedSource {
    pub source: Box<dyn CameraSource>,
    /// True when an earlier tier of the chain failed
    pub degraded: bool,
    /// Why the earlier tiers were skipped
    pub failures: Vec<(SourceTier, String)>,
    /// Index of the opener in the chain; the chain length for the built-in
    /// last-resort synthetic source
    pub position: usize,
}

impl fmt::Debug for OpenedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedSource")
            .field("tier", &self.source.tier())
            .field("degraded", &self.degraded)
            .field("failures", &self.failures)
            .field("position", &self.position)
            .finish()
    }
}

/// Ordered list of tiers tried on open
pub struct SourceChain {
    openers: Vec<Box<dyn SourceOpener>>,
    last_resort: SyntheticConfig,
}

impl SourceChain {
    pub fn new(openers: Vec<Box<dyn SourceOpener>>, last_resort: SyntheticConfig) -> Self {
        SourceChain {
            openers,
            last_resort,
        }
    }

    pub fn from_config(config: &CameraConfig) -> Self {
        let openers = config
            .selection
            .chain()
            .iter()
            .map(|tier| -> Box<dyn SourceOpener> {
                match tier {
                    SourceTier::Hardware => Box::new(RpicamOpener::new(
                        config.rpicam.clone(),
                        config.width,
                        config.height,
                        config.fps,
                    )),
                    SourceTier::Device => Box::new(DeviceOpener::new(
                        config.device.clone(),
                        config.width,
                        config.height,
                    )),
                    SourceTier::Synthetic => Box::new(SyntheticOpener::new(config.synthetic())),
                }
            })
            .collect();
        Self::new(openers, config.synthetic())
    }

    pub fn tiers(&self) -> Vec<SourceTier> {
        self.openers.iter().map(|o| o.tier()).collect()
    }

    /// Walk the chain and return the first source that opens.
    ///
    /// Never fails: when every configured tier fails a synthetic source is
    /// built directly. `settings` are applied to the opened source; a
    /// source that rejects them is still used.
    pub async fn open(&self, settings: &CameraSettings) -> OpenedSource {
        self.open_from(0, settings).await
    }

    /// Like [`SourceChain::open`], skipping the tiers before `start`. A
    /// `start` past the end goes straight to the last-resort source.
    pub async fn open_from(&self, start: usize, settings: &CameraSettings) -> OpenedSource {
        let mut failures = Vec::new();

        for (i, opener) in self.openers.iter().enumerate().skip(start) {
            match opener.open().await {
                Ok(mut source) => {
                    log::info!("Camera source opened: {}", source.describe());
                    if let Err(e) = source.apply_settings(settings).await {
                        log::warn!("{}: initial settings not applied: {}", source.tier(), e);
                    }
                    return OpenedSource {
                        source,
                        degraded: i > 0,
                        failures,
                        position: i,
                    };
                }
                Err(e) => {
                    log::warn!("{} camera unavailable: {}", opener.tier(), e);
                    failures.push((opener.tier(), e.to_string()));
                }
            }
        }

        log::error!("No camera tier could be opened, using synthetic frames");
        let mut source = SyntheticSource::new(self.last_resort.clone());
        // Synthetic sources accept every settings object
        let _ = source.apply_settings(settings).await;
        OpenedSource {
            source: Box::new(source),
            degraded: true,
            failures,
            position: self.openers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unavailable(SourceTier);

    #[async_trait]
    impl SourceOpener for Unavailable {
        fn tier(&self) -> SourceTier {
            self.0
        }

        async fn open(&self) -> Result<Box<dyn CameraSource>, CameraError> {
            Err(CameraError::HardwareUnavailable("unplugged".into()))
        }
    }

    fn small() -> SyntheticConfig {
        SyntheticConfig {
            width: 64,
            height: 48,
            ..SyntheticConfig::default()
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_synthetic() {
        let chain = SourceChain::new(
            vec![
                Box::new(Unavailable(SourceTier::Hardware)),
                Box::new(Unavailable(SourceTier::Device)),
                Box::new(SyntheticOpener::new(small())),
            ],
            small(),
        );
        let opened = chain.open(&CameraSettings::default()).await;
        assert_eq!(opened.source.tier(), SourceTier::Synthetic);
        assert!(opened.degraded);
        assert_eq!(
            opened
                .failures
                .iter()
                .map(|(t, _)| *t)
                .collect::<Vec<_>>(),
            vec![SourceTier::Hardware, SourceTier::Device]
        );
    }

    #[tokio::test]
    async fn test_first_tier_is_not_degraded() {
        let chain = SourceChain::new(vec![Box::new(SyntheticOpener::new(small()))], small());
        let opened = chain.open(&CameraSettings::default()).await;
        assert!(!opened.degraded);
        assert!(opened.failures.is_empty());
    }

    #[tokio::test]
    async fn test_open_from_skips_earlier_tiers() {
        let chain = SourceChain::new(
            vec![
                Box::new(SyntheticOpener::new(small())),
                Box::new(SyntheticOpener::new(small())),
            ],
            small(),
        );
        let opened = chain.open_from(1, &CameraSettings::default()).await;
        assert_eq!(opened.position, 1);
        assert!(opened.degraded);

        let opened = chain.open_from(5, &CameraSettings::default()).await;
        assert_eq!(opened.position, 2);
        assert_eq!(opened.source.tier(), SourceTier::Synthetic);
    }

    #[tokio::test]
    async fn test_empty_chain_still_produces_frames() {
        let chain = SourceChain::new(vec![Box::new(Unavailable(SourceTier::Device))], small());
        let mut opened = chain.open(&CameraSettings::default()).await;
        assert!(opened.degraded);
        let image = opened.source.read().await.unwrap();
        assert_eq!((image.width, image.height), (64, 48));
    }

    #[test]
    fn test_selection_chains() {
        assert_eq!(
            CameraSelection::Auto.chain(),
            &[
                SourceTier::Hardware,
                SourceTier::Device,
                SourceTier::Synthetic
            ]
        );
        assert_eq!(
            CameraSelection::Synthetic.chain(),
            &[SourceTier::Synthetic]
        );
    }

    #[test]
    fn test_open_error_mapping() {
        let e = CameraError::from_open_error(
            "/dev/video9",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(matches!(e, CameraError::HardwareUnavailable(_)));
        let e = CameraError::from_open_error("/dev/video0", std::io::Error::from_raw_os_error(16));
        assert!(matches!(e, CameraError::DeviceBusy(_)));
    }
}
