//! Captured frames.
//!
//! A [`Frame`] is an encoded image (JPEG) stamped with the hub's sequence
//! number and the wall-clock capture time. The payload is a [`Bytes`] buffer,
//! so handing a frame to another consumer is a reference-count bump and never
//! a copy of the image data.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// An encoded image as it comes out of a camera source, before the hub has
/// assigned it a place in the stream.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    /// JPEG data
    pub data: Bytes,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl EncodedImage {
    pub fn new(data: Bytes, width: u32, height: u32) -> Self {
        EncodedImage {
            data,
            width,
            height,
        }
    }
}

/// An immutable captured frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic sequence number assigned by the capture loop, starting at 1
    pub seq: u64,
    /// Wall-clock time the frame was captured
    pub captured_at: DateTime<Utc>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// JPEG data
    pub data: Bytes,
}

impl Frame {
    pub fn new(seq: u64, captured_at: DateTime<Utc>, image: EncodedImage) -> Self {
        Frame {
            seq,
            captured_at,
            width: image.width,
            height: image.height,
            data: image.data,
        }
    }

    /// Size of the encoded payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Metadata view without the payload, for status reporting.
    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            seq: self.seq,
            captured_at: self.captured_at,
            width: self.width,
            height: self.height,
            size: self.data.len(),
        }
    }
}

/// Frame metadata without the image payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameInfo {
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub size: usize,
}

/// Grayscale pixels used by the motion analyzer.
///
/// Produced by the server from decoded frames at a reduced analysis
/// resolution; one byte per pixel, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LumaImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl LumaImage {
    /// Returns `None` when `pixels` does not hold exactly `width * height` bytes.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        if pixels.len() != (width as usize) * (height as usize) {
            return None;
        }
        Some(LumaImage {
            width,
            height,
            pixels,
        })
    }

    /// A uniform image, mostly useful for tests and placeholders.
    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        LumaImage {
            width,
            height,
            pixels: vec![value; (width as usize) * (height as usize)],
        }
    }

    pub fn area(&self) -> usize {
        self.pixels.len()
    }
}
