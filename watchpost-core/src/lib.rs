//! # Watchpost Core
//!
//! Platform-independent logic for the watchpost surveillance pipeline.
//!
//! This crate holds the decision-making parts of the system with **no I/O and
//! no async runtime**. Every function that depends on time takes the current
//! time as an argument, so all behaviour is deterministic under test.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  watchpost-core (pure, no tokio)                            │
//! │  ├── frame       (encoded frames, grayscale analysis input) │
//! │  ├── settings    (camera settings model and validation)     │
//! │  ├── motion      (background model, debounced detection)    │
//! │  ├── recording   (session state machine)                    │
//! │  └── retention   (age-based retention policy)               │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                 ┌────────────┴────────────┐
//!                 │  watchpost-server       │
//!                 │  (camera, hub, tasks)   │
//!                 └─────────────────────────┘
//! ```
//!
//! ## Example: driving the recording state machine
//!
//! ```rust
//! use watchpost_core::recording::{RecorderEvent, RecorderMachine, RecordingPolicy, Trigger};
//!
//! let mut machine = RecorderMachine::new(RecordingPolicy::default());
//! machine
//!     .handle(RecorderEvent::ManualStart { duration_ms: Some(10_000) }, 0, true)
//!     .unwrap();
//! assert_eq!(machine.state().trigger(), Some(Trigger::Manual));
//! assert_eq!(machine.state().remaining_ms(4_000), Some(6_000));
//! ```

pub mod error;
pub mod frame;
pub mod motion;
pub mod recording;
pub mod retention;
pub mod settings;

pub use error::{RecordingError, RetentionError, SettingsError};
pub use frame::{EncodedImage, Frame, FrameInfo, LumaImage};
pub use motion::{MotionAnalyzer, MotionConfig, MotionEvent, MotionSource};
pub use recording::{RecorderMachine, RecorderState, RecordingPolicy, SessionId, Trigger};
pub use retention::{RetentionPolicy, RetentionUnit};
pub use settings::{CameraSettings, SettingField};
