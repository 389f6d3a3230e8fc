//! Frame-differencing motion analysis.
//!
//! ```text
//!   frame ──► |frame - background| > pixel_threshold ──► changed pixels
//!                                                             │
//!                      changed / area > area_fraction ? ◄─────┘
//!                         │                    │
//!                        yes                   no
//!                         │                    │
//!            emit event unless cooling down    background = lerp(background, frame, decay)
//! ```
//!
//! The background is an exponentially weighted average of past frames. It is
//! only updated while no motion is flagged, so a subject that keeps moving is
//! not absorbed into the reference. Events are debounced: after one is
//! emitted no other is emitted for `cooldown_ms`, however high the score.
//!
//! The analyzer is pure: the caller supplies grayscale pixels and a
//! millisecond clock.

use serde::{Deserialize, Serialize};

use crate::frame::LumaImage;

/// Where a motion event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionSource {
    /// Frame differencing on the camera feed
    Camera,
    /// External motion sensor input
    Pin,
    /// Development trigger
    Simulated,
}

/// A debounced motion detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionEvent {
    /// Service clock timestamp in milliseconds
    pub at_ms: u64,
    /// 0.0 ..= 1.0
    pub confidence: f32,
    pub source: MotionSource,
}

impl MotionEvent {
    pub fn new(at_ms: u64, confidence: f32, source: MotionSource) -> Self {
        MotionEvent {
            at_ms,
            confidence: confidence.clamp(0.0, 1.0),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionConfig {
    /// Per-pixel absolute difference that counts as "changed"
    pub pixel_threshold: u8,
    /// Fraction of the frame area that must change to flag motion
    pub area_fraction: f32,
    /// Weight of the newest frame in the background average
    pub background_decay: f32,
    /// Minimum time between two emitted events
    pub cooldown_ms: u64,
    /// Analyze only every Nth frame
    pub sample_every: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        MotionConfig {
            pixel_threshold: 25,
            area_fraction: 0.01,
            background_decay: 0.05,
            cooldown_ms: 2_000,
            sample_every: 3,
        }
    }
}

/// Result of analyzing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionScore {
    pub changed_pixels: usize,
    pub fraction: f32,
    pub flagged: bool,
}

#[derive(Debug, Clone)]
pub struct MotionAnalyzer {
    config: MotionConfig,
    background: Option<Background>,
    frames_seen: u64,
    last_event_ms: Option<u64>,
    last_score: MotionScore,
}

#[derive(Debug, Clone)]
struct Background {
    width: u32,
    height: u32,
    pixels: Vec<f32>,
}

impl MotionAnalyzer {
    pub fn new(config: MotionConfig) -> Self {
        MotionAnalyzer {
            config,
            background: None,
            frames_seen: 0,
            last_event_ms: None,
            last_score: MotionScore::default(),
        }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Count one incoming frame and report whether it should be analyzed.
    ///
    /// Lets the caller skip decoding frames that would not be sampled.
    pub fn wants_frame(&mut self) -> bool {
        let every = u64::from(self.config.sample_every.max(1));
        let wanted = self.frames_seen % every == 0;
        self.frames_seen = self.frames_seen.wrapping_add(1);
        wanted
    }

    /// Analyze one frame. Returns an event when motion is flagged and the
    /// cooldown since the previous event has elapsed.
    pub fn process(&mut self, image: &LumaImage, now_ms: u64) -> Option<MotionEvent> {
        let background = match &mut self.background {
            Some(bg) if bg.width == image.width && bg.height == image.height => bg,
            _ => {
                // First frame (or a resolution change) becomes the reference
                self.background = Some(Background {
                    width: image.width,
                    height: image.height,
                    pixels: image.pixels.iter().map(|p| f32::from(*p)).collect(),
                });
                self.last_score = MotionScore::default();
                return None;
            }
        };

        let threshold = f32::from(self.config.pixel_threshold);
        let changed = image
            .pixels
            .iter()
            .zip(background.pixels.iter())
            .filter(|(p, bg)| (f32::from(**p) - **bg).abs() > threshold)
            .count();
        let area = image.area().max(1);
        let fraction = changed as f32 / area as f32;
        let flagged = fraction > self.config.area_fraction;

        self.last_score = MotionScore {
            changed_pixels: changed,
            fraction,
            flagged,
        };

        if !flagged {
            let decay = self.config.background_decay.clamp(0.0, 1.0);
            for (bg, p) in background.pixels.iter_mut().zip(image.pixels.iter()) {
                *bg += (f32::from(*p) - *bg) * decay;
            }
            return None;
        }

        let cooling_down = self
            .last_event_ms
            .is_some_and(|last| now_ms.saturating_sub(last) < self.config.cooldown_ms);
        if cooling_down {
            return None;
        }

        self.last_event_ms = Some(now_ms);
        Some(MotionEvent::new(
            now_ms,
            self.confidence(fraction),
            MotionSource::Camera,
        ))
    }

    /// Forget the background and the debounce state.
    pub fn reset(&mut self) {
        self.background = None;
        self.frames_seen = 0;
        self.last_event_ms = None;
        self.last_score = MotionScore::default();
    }

    pub fn last_score(&self) -> MotionScore {
        self.last_score
    }

    pub fn has_reference(&self) -> bool {
        self.background.is_some()
    }

    // 0.5 right at the threshold, 1.0 at twice the threshold or more
    fn confidence(&self, fraction: f32) -> f32 {
        let threshold = self.config.area_fraction.max(f32::EPSILON);
        (0.5 * fraction / threshold).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 32;
    const H: u32 = 24;

    fn config() -> MotionConfig {
        MotionConfig {
            sample_every: 1,
            ..MotionConfig::default()
        }
    }

    /// Uniform background with a bright square at (x, y)
    fn scene(square_at: Option<(u32, u32)>) -> LumaImage {
        let mut img = LumaImage::filled(W, H, 40);
        if let Some((sx, sy)) = square_at {
            for y in sy..(sy + 8).min(H) {
                for x in sx..(sx + 8).min(W) {
                    img.pixels[(y * W + x) as usize] = 220;
                }
            }
        }
        img
    }

    #[test]
    fn test_first_frame_only_initializes() {
        let mut a = MotionAnalyzer::new(config());
        assert!(!a.has_reference());
        assert!(a.process(&scene(Some((4, 4))), 0).is_none());
        assert!(a.has_reference());
    }

    #[test]
    fn test_static_scene_is_quiet() {
        let mut a = MotionAnalyzer::new(config());
        for i in 0..20 {
            assert!(a.process(&scene(None), i * 33).is_none());
        }
        assert!(!a.last_score().flagged);
    }

    #[test]
    fn test_motion_is_debounced() {
        let mut a = MotionAnalyzer::new(config());
        a.process(&scene(None), 0);

        let ev = a.process(&scene(Some((2, 2))), 100).unwrap();
        assert_eq!(ev.at_ms, 100);
        assert_eq!(ev.source, MotionSource::Camera);
        assert!(ev.confidence > 0.5 && ev.confidence <= 1.0);

        // Still moving, but inside the cooldown window
        assert!(a.process(&scene(Some((6, 2))), 500).is_none());
        assert!(a.process(&scene(Some((10, 2))), 2_099).is_none());
        assert!(a.last_score().flagged);

        // Cooldown elapsed
        assert!(a.process(&scene(Some((14, 2))), 2_100).is_some());
    }

    #[test]
    fn test_moving_subject_is_not_absorbed() {
        let mut a = MotionAnalyzer::new(MotionConfig {
            background_decay: 0.5,
            cooldown_ms: 0,
            ..config()
        });
        a.process(&scene(None), 0);

        // A subject standing still in view stays flagged because the
        // background is frozen while motion is flagged.
        for t in 1..50 {
            assert!(a.process(&scene(Some((8, 8))), t).is_some());
        }
    }

    #[test]
    fn test_background_adapts_to_slow_changes() {
        let mut a = MotionAnalyzer::new(config());
        a.process(&LumaImage::filled(W, H, 40), 0);
        // Lighting drifts slowly below the per-pixel threshold each step
        for (i, level) in (41..=120).enumerate() {
            let ev = a.process(&LumaImage::filled(W, H, level), i as u64 * 33);
            assert!(ev.is_none(), "flagged at level {}", level);
        }
    }

    #[test]
    fn test_reset_and_sampling() {
        let mut a = MotionAnalyzer::new(MotionConfig {
            sample_every: 3,
            ..MotionConfig::default()
        });
        let picks: Vec<bool> = (0..6).map(|_| a.wants_frame()).collect();
        assert_eq!(picks, vec![true, false, false, true, false, false]);

        a.process(&scene(None), 0);
        a.process(&scene(Some((0, 0))), 10).unwrap();
        a.reset();
        assert!(!a.has_reference());
        // After reset the next frame only re-seeds the reference
        assert!(a.process(&scene(Some((0, 0))), 20).is_none());
    }

    #[test]
    fn test_resolution_change_reseeds() {
        let mut a = MotionAnalyzer::new(config());
        a.process(&scene(None), 0);
        assert!(a.process(&LumaImage::filled(16, 12, 250), 10).is_none());
        assert!(a.process(&LumaImage::filled(16, 12, 250), 20).is_none());
    }
}
