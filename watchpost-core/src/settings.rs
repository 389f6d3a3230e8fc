//! Camera settings model and validation.
//!
//! Cameras have a small, fixed set of image settings. Every field of
//! [`CameraSettings`] always holds a value inside its valid range or enum
//! set: updates go through [`CameraSettings::with_value`], which validates a
//! single field and returns a complete new settings object, or an error and
//! no change at all.
//!
//! Values arrive as JSON (from the command layer), so numbers may also be
//! given as numeric strings and enum choices are matched case-insensitively.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString, VariantNames};

use crate::error::SettingsError;

pub const BRIGHTNESS_MIN: i32 = -100;
pub const BRIGHTNESS_MAX: i32 = 100;
pub const CONTRAST_MIN: f64 = 0.0;
pub const CONTRAST_MAX: f64 = 3.0;
pub const ZOOM_MIN: f64 = 1.0;
pub const ZOOM_MAX: f64 = 8.0;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    VariantNames,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum WhiteBalance {
    #[default]
    Auto,
    Incandescent,
    Fluorescent,
    Daylight,
    Cloudy,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    VariantNames,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ExposureMode {
    #[default]
    Auto,
    Manual,
    Night,
    Sport,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    VariantNames,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FocusMode {
    #[default]
    Auto,
    Manual,
    Macro,
    Infinity,
}

/// Names of the individual settings, as used by the command layer
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, VariantNames,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SettingField {
    Brightness,
    Contrast,
    Zoom,
    WhiteBalance,
    ExposureMode,
    Focus,
}

/// Complete camera image settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    pub brightness: i32,
    pub contrast: f64,
    pub zoom: f64,
    pub white_balance: WhiteBalance,
    pub exposure_mode: ExposureMode,
    pub focus: FocusMode,
}

impl Default for CameraSettings {
    fn default() -> Self {
        CameraSettings {
            brightness: 0,
            contrast: 1.0,
            zoom: 1.0,
            white_balance: WhiteBalance::Auto,
            exposure_mode: ExposureMode::Auto,
            focus: FocusMode::Auto,
        }
    }
}

impl CameraSettings {
    /// Validate one field and return the merged settings.
    ///
    /// `self` is never modified; on error the caller keeps its current
    /// settings.
    pub fn with_value(&self, field: SettingField, value: &Value) -> Result<Self, SettingsError> {
        let mut next = *self;
        match field {
            SettingField::Brightness => {
                let v = parse_integer("brightness", value)?;
                check_range(
                    "brightness",
                    v as f64,
                    BRIGHTNESS_MIN as f64,
                    BRIGHTNESS_MAX as f64,
                )?;
                next.brightness = v as i32;
            }
            SettingField::Contrast => {
                let v = parse_number("contrast", value)?;
                check_range("contrast", v, CONTRAST_MIN, CONTRAST_MAX)?;
                next.contrast = v;
            }
            SettingField::Zoom => {
                let v = parse_number("zoom", value)?;
                check_range("zoom", v, ZOOM_MIN, ZOOM_MAX)?;
                next.zoom = v;
            }
            SettingField::WhiteBalance => {
                next.white_balance = parse_choice("white_balance", value)?;
            }
            SettingField::ExposureMode => {
                next.exposure_mode = parse_choice("exposure_mode", value)?;
            }
            SettingField::Focus => {
                next.focus = parse_choice("focus", value)?;
            }
        }
        Ok(next)
    }

    /// Like [`with_value`](Self::with_value) but takes the field by name.
    pub fn with_named_value(&self, field: &str, value: &Value) -> Result<Self, SettingsError> {
        let field: SettingField = field
            .parse()
            .map_err(|_| SettingsError::UnknownField(field.to_string()))?;
        self.with_value(field, value)
    }

    /// Current value of a single field as JSON.
    pub fn get(&self, field: SettingField) -> Value {
        match field {
            SettingField::Brightness => Value::from(self.brightness),
            SettingField::Contrast => Value::from(self.contrast),
            SettingField::Zoom => Value::from(self.zoom),
            SettingField::WhiteBalance => Value::from(self.white_balance.to_string()),
            SettingField::ExposureMode => Value::from(self.exposure_mode.to_string()),
            SettingField::Focus => Value::from(self.focus.to_string()),
        }
    }

    /// Check every field. Settings built through `with_value` always pass;
    /// this guards values that were deserialized from elsewhere.
    pub fn validate(&self) -> Result<(), SettingsError> {
        check_range(
            "brightness",
            self.brightness as f64,
            BRIGHTNESS_MIN as f64,
            BRIGHTNESS_MAX as f64,
        )?;
        check_range("contrast", self.contrast, CONTRAST_MIN, CONTRAST_MAX)?;
        check_range("zoom", self.zoom, ZOOM_MIN, ZOOM_MAX)
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), SettingsError> {
    // NaN fails both comparisons, so it is rejected here as well
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(SettingsError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

fn parse_number(field: &'static str, value: &Value) -> Result<f64, SettingsError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| SettingsError::WrongType {
        field,
        value: value.to_string(),
        expected: "a number",
    })
}

fn parse_integer(field: &'static str, value: &Value) -> Result<i64, SettingsError> {
    let wrong_type = || SettingsError::WrongType {
        field,
        value: value.to_string(),
        expected: "an integer",
    };
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    let v = parse_number(field, value).map_err(|_| wrong_type())?;
    if v.fract() != 0.0 || !v.is_finite() {
        return Err(wrong_type());
    }
    Ok(v as i64)
}

fn parse_choice<T>(field: &'static str, value: &Value) -> Result<T, SettingsError>
where
    T: std::str::FromStr + VariantNames,
{
    let invalid = |text: String| SettingsError::InvalidChoice {
        field,
        value: text,
        allowed: T::VARIANTS.iter().map(|s| s.to_string()).collect(),
    };
    match value {
        Value::String(s) => s.trim().parse::<T>().map_err(|_| invalid(s.clone())),
        other => Err(invalid(other.to_string())),
    }
}
