//! Recording sessions and their on-disk format.
//!
//! ## File Format
//!
//! A session is written as a `.wpr` file:
//!
//! ```text
//! ┌──────────────────────────┐
//! │ Header (128 bytes)       │  magic "WPR1", trigger, size, fps, start time
//! ├──────────────────────────┤
//! │ Frame 0                  │  relative timestamp + hub sequence + JPEG
//! │ Frame 1                  │
//! │ ...                      │
//! ├──────────────────────────┤
//! │ Index (for seeking)      │  array of (timestamp, file_offset)
//! ├──────────────────────────┤
//! │ Footer (32 bytes)        │  index offset, frame count, duration
//! └──────────────────────────┘
//! ```
//!
//! A file whose writer never finished has no index or footer; it can still
//! be listed and read frame by frame.

pub mod controller;
pub mod file_format;

pub use controller::{RecorderError, RecorderTask, RecordingController, RecordingStatus};
pub use file_format::{WprFooter, WprFrame, WprHeader, WprIndexEntry, WprReader, WprWriter};
