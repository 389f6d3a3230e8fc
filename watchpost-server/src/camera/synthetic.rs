//! Synthetic camera tier.
//!
//! Produces JPEG frames without any hardware: a solid green field with the
//! wall-clock time and a frame counter written on it. The same renderer
//! draws the red "signal lost" placeholder the frame hub serves while a
//! real camera is failing.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

use watchpost_core::{CameraSettings, EncodedImage};

use super::{CameraError, CameraSource, SourceOpener, SourceTier};

const FIELD_COLOUR: [u8; 3] = [64, 128, 64];
const SIGNAL_LOST_COLOUR: [u8; 3] = [150, 24, 24];
const TEXT_COLOUR: [u8; 3] = [255, 255, 255];

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// JPEG quality 1..=100
    pub quality: u8,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        SyntheticConfig {
            width: 1280,
            height: 720,
            quality: 75,
        }
    }
}

pub struct SyntheticOpener {
    config: SyntheticConfig,
}

impl SyntheticOpener {
    pub fn new(config: SyntheticConfig) -> Self {
        SyntheticOpener { config }
    }
}

#[async_trait]
impl SourceOpener for SyntheticOpener {
    fn tier(&self) -> SourceTier {
        SourceTier::Synthetic
    }

    async fn open(&self) -> Result<Box<dyn CameraSource>, CameraError> {
        Ok(Box::new(SyntheticSource::new(self.config.clone())))
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_number: u64,
    /// Stored so status reports what was requested; not drawn
    settings: CameraSettings,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        SyntheticSource {
            config,
            frame_number: 0,
            settings: CameraSettings::default(),
        }
    }

    pub fn settings(&self) -> &CameraSettings {
        &self.settings
    }
}

#[async_trait]
impl CameraSource for SyntheticSource {
    fn tier(&self) -> SourceTier {
        SourceTier::Synthetic
    }

    fn describe(&self) -> String {
        format!(
            "synthetic {}x{}",
            self.config.width, self.config.height
        )
    }

    async fn read(&mut self) -> Result<EncodedImage, CameraError> {
        self.frame_number += 1;
        let config = self.config.clone();
        let lines = vec![
            "DEVELOPMENT MODE".to_string(),
            timestamp_line(&Local::now()),
            "SYNTHETIC CAMERA FEED".to_string(),
            format!("FRAME {}", self.frame_number),
        ];
        tokio::task::spawn_blocking(move || {
            encode_jpeg(
                &render(config.width, config.height, FIELD_COLOUR, &lines),
                config.quality,
            )
        })
        .await
        .map_err(|e| CameraError::Encode(e.to_string()))?
    }

    async fn apply_settings(&mut self, settings: &CameraSettings) -> Result<(), CameraError> {
        self.settings = *settings;
        Ok(())
    }

    async fn close(&mut self) {}
}

fn timestamp_line(now: &DateTime<Local>) -> String {
    now.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Red placeholder with the time the signal was lost
pub fn signal_lost_frame(
    width: u32,
    height: u32,
    since: &DateTime<Local>,
) -> Result<EncodedImage, CameraError> {
    let lines = vec!["SIGNAL LOST".to_string(), timestamp_line(since)];
    encode_jpeg(&render(width, height, SIGNAL_LOST_COLOUR, &lines), 60)
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<EncodedImage, CameraError> {
    let mut jpeg = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100));
    encoder
        .encode_image(image)
        .map_err(|e| CameraError::Encode(e.to_string()))?;
    Ok(EncodedImage::new(
        Bytes::from(jpeg),
        image.width(),
        image.height(),
    ))
}

/// Solid field with the given lines of text centred vertically
pub fn render(width: u32, height: u32, background: [u8; 3], lines: &[String]) -> RgbImage {
    let width = width.max(1);
    let height = height.max(1);
    let mut img = RgbImage::from_pixel(width, height, Rgb(background));

    let scale = (height / 120).max(1);
    let line_height = (GLYPH_HEIGHT + 3) * scale;
    let block_height = line_height * lines.len() as u32;
    let mut y = height.saturating_sub(block_height) / 2;
    let x = width / 16;

    for line in lines {
        draw_text(&mut img, x, y, scale, line);
        y += line_height;
    }
    img
}

fn draw_text(img: &mut RgbImage, x0: u32, y0: u32, scale: u32, text: &str) {
    let mut x = x0;
    for c in text.chars() {
        if let Some(rows) = glyph(c) {
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if bits & (1 << (GLYPH_WIDTH - 1 - col)) != 0 {
                        let dx = (x + col * scale) as i32;
                        let dy = (y0 + row as u32 * scale) as i32;
                        // Clipped at the image edges
                        let dot = Rect::at(dx, dy).of_size(scale, scale);
                        draw_filled_rect_mut(img, dot, Rgb(TEXT_COLOUR));
                    }
                }
            }
        }
        x += (GLYPH_WIDTH + 1) * scale;
    }
}

// =============================================================================
// 5x7 bitmap font
// =============================================================================

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;

fn glyph(c: char) -> Option<[u8; 7]> {
    let rows = match c.to_ascii_uppercase() {
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        '-' => [0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000],
        ':' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000],
        '.' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b01100],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_render_draws_text_on_field() {
        let img = render(120, 60, FIELD_COLOUR, &["1".to_string()]);
        assert_eq!(img.dimensions(), (120, 60));
        assert_eq!(img.get_pixel(0, 0), &Rgb(FIELD_COLOUR));

        // Single line, scale 1: text block starts at x = 120/16, y = (60-10)/2
        let (x0, y0) = (120 / 16, (60 - 10) / 2);
        // Top row of '1' is 00100
        assert_eq!(img.get_pixel(x0 + 2, y0), &Rgb(TEXT_COLOUR));
        assert_eq!(img.get_pixel(x0, y0), &Rgb(FIELD_COLOUR));
    }

    #[test]
    fn test_text_past_the_edge_is_clipped() {
        let long = "0123456789".repeat(4);
        let img = render(32, 16, SIGNAL_LOST_COLOUR, &[long]);
        assert_eq!(img.dimensions(), (32, 16));
        assert!(img.pixels().any(|p| *p == Rgb(TEXT_COLOUR)));
    }

    #[test]
    fn test_unknown_characters_are_blank() {
        let a = render(64, 32, FIELD_COLOUR, &["?".to_string()]);
        let b = render(64, 32, FIELD_COLOUR, &[" ".to_string()]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_signal_lost_frame_is_jpeg() {
        let since = Local.with_ymd_and_hms(2024, 5, 20, 12, 0, 0).unwrap();
        let frame = signal_lost_frame(160, 120, &since).unwrap();
        assert_eq!(&frame.data[0..2], &[0xFF, 0xD8]);
        assert_eq!((frame.width, frame.height), (160, 120));
        assert_eq!(
            super::super::jpeg::dimensions(&frame.data),
            Some((160, 120))
        );
    }

    #[tokio::test]
    async fn test_synthetic_source_counts_frames_and_stores_settings() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            width: 96,
            height: 64,
            quality: 50,
        });
        let first = source.read().await.unwrap();
        let second = source.read().await.unwrap();
        assert_eq!((first.width, first.height), (96, 64));
        assert_eq!(source.frame_number, 2);
        assert!(!second.data.is_empty());

        let settings = CameraSettings {
            brightness: 40,
            ..CameraSettings::default()
        };
        source.apply_settings(&settings).await.unwrap();
        assert_eq!(source.settings().brightness, 40);
    }
}
