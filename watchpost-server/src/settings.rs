//! Camera settings owner.
//!
//! Holds the settings the rest of the service believes are active. A change
//! is validated, merged into a complete settings object and handed to the
//! capture loop; the stored value only changes once the camera accepted it.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use watchpost_core::{CameraSettings, SettingField, SettingsError};

use crate::camera::CameraError;
use crate::hub::FrameHub;

#[derive(Error, Debug)]
pub enum ApplySettingsError {
    #[error(transparent)]
    Validation(#[from] SettingsError),

    #[error(transparent)]
    Camera(#[from] CameraError),
}

pub struct SettingsManager {
    current: Mutex<CameraSettings>,
    hub: Arc<FrameHub>,
}

impl SettingsManager {
    pub fn new(hub: Arc<FrameHub>, initial: CameraSettings) -> Self {
        SettingsManager {
            current: Mutex::new(initial),
            hub,
        }
    }

    pub async fn get(&self) -> CameraSettings {
        *self.current.lock().await
    }

    /// Set one field by name. On any error the stored settings are
    /// unchanged.
    pub async fn apply(&self, field: &str, value: &Value) -> Result<CameraSettings, ApplySettingsError> {
        // Held across the camera call so concurrent changes cannot interleave
        let mut current = self.current.lock().await;
        let proposed = current.with_named_value(field, value)?;
        if proposed == *current {
            return Ok(proposed);
        }

        match self.hub.apply_settings(proposed).await {
            Ok(()) => {
                log::info!("Camera setting {} = {}", field, value);
                *current = proposed;
                Ok(proposed)
            }
            Err(e) => {
                log::warn!("Camera rejected {} = {}: {}", field, value, e);
                Err(e.into())
            }
        }
    }

    pub async fn value(&self, field: SettingField) -> Value {
        self.current.lock().await.get(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{SourceChain, SourceTier, SyntheticConfig};
    use crate::hub::tests::ScriptedOpener;
    use crate::hub::HubConfig;
    use serde_json::json;
    use tokio::sync::oneshot;
    use watchpost_core::settings::{ExposureMode, WhiteBalance};

    async fn with_manager<F, Fut>(reject: bool, test: F)
    where
        F: FnOnce(SettingsManager) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut opener = ScriptedOpener::new(vec![]);
        opener.tier = SourceTier::Device;
        opener.reject_settings = reject;
        let chain = SourceChain::new(vec![Box::new(opener)], SyntheticConfig::default());
        let (hub, capture) = FrameHub::new(HubConfig::default(), chain, CameraSettings::default());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(capture.run_until(async {
            let _ = stop_rx.await;
        }));

        test(SettingsManager::new(hub, CameraSettings::default())).await;

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_valid_values_are_stored() {
        with_manager(false, |manager| async move {
            let cases = [
                ("brightness", json!(-100)),
                ("brightness", json!("55")),
                ("contrast", json!(2.5)),
                ("zoom", json!(8.0)),
                ("white_balance", json!("daylight")),
                ("exposure_mode", json!("night")),
                ("focus", json!("macro")),
            ];
            for (field, value) in cases {
                manager.apply(field, &value).await.unwrap();
            }
            let s = manager.get().await;
            assert_eq!(s.brightness, 55);
            assert_eq!(s.contrast, 2.5);
            assert_eq!(s.white_balance, WhiteBalance::Daylight);
            assert_eq!(s.exposure_mode, ExposureMode::Night);
            assert_eq!(manager.value(SettingField::Zoom).await, json!(8.0));
        })
        .await;
    }

    #[tokio::test]
    async fn test_invalid_values_leave_settings_unchanged() {
        with_manager(false, |manager| async move {
            let before = manager.get().await;
            let cases = [
                ("brightness", json!(101)),
                ("contrast", json!(-0.1)),
                ("zoom", json!(0.5)),
                ("white_balance", json!("neon")),
                ("focus", json!(true)),
                ("sharpness", json!(1)),
            ];
            for (field, value) in cases {
                let err = manager.apply(field, &value).await.unwrap_err();
                assert!(matches!(err, ApplySettingsError::Validation(_)), "{}", field);
            }
            assert_eq!(manager.get().await, before);
        })
        .await;
    }

    #[tokio::test]
    async fn test_camera_rejection_rolls_back() {
        with_manager(true, |manager| async move {
            let err = manager.apply("zoom", &json!(2.0)).await.unwrap_err();
            assert!(matches!(
                err,
                ApplySettingsError::Camera(CameraError::UnsupportedSetting { .. })
            ));
            assert_eq!(manager.get().await.zoom, 1.0);
        })
        .await;
    }
}
