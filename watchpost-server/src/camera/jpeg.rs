//! JPEG helpers for MJPEG byte streams.

use bytes::{Bytes, BytesMut};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Splits a concatenated MJPEG byte stream into individual JPEG images.
///
/// Bytes before a start-of-image marker are discarded. A partial image that
/// grows beyond `max_frame_len` is dropped so a corrupt stream cannot grow
/// the buffer without bound.
#[derive(Debug)]
pub struct JpegSplitter {
    buf: BytesMut,
    max_frame_len: usize,
}

impl JpegSplitter {
    pub fn new(max_frame_len: usize) -> Self {
        JpegSplitter {
            buf: BytesMut::with_capacity(256 * 1024),
            max_frame_len,
        }
    }

    /// Feed a chunk, returning every image completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            let Some(start) = find(&self.buf, &SOI, 0) else {
                // Keep a trailing 0xFF, it may be the first half of a marker
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                let drop = self.buf.len() - keep;
                let _ = self.buf.split_to(drop);
                break;
            };
            if start > 0 {
                let _ = self.buf.split_to(start);
            }

            match find(&self.buf, &EOI, SOI.len()) {
                Some(end) => {
                    out.push(self.buf.split_to(end + EOI.len()).freeze());
                }
                None => {
                    if self.buf.len() > self.max_frame_len {
                        log::warn!(
                            "Discarding {} bytes of MJPEG data without end marker",
                            self.buf.len()
                        );
                        self.buf.clear();
                    }
                    break;
                }
            }
        }

        out
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < from + 2 {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Width and height from the first start-of-frame segment
pub fn dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 4 || data[0..2] != SOI {
        return None;
    }
    let mut i = 2;
    while i + 4 <= data.len() {
        if data[i] != 0xFF {
            return None;
        }
        let marker = data[i + 1];
        if marker == 0xFF {
            // Fill byte
            i += 1;
            continue;
        }
        let len = usize::from(u16::from_be_bytes([data[i + 2], data[i + 3]]));
        let is_sof = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            if i + 9 > data.len() {
                return None;
            }
            let height = u16::from_be_bytes([data[i + 5], data[i + 6]]);
            let width = u16::from_be_bytes([data[i + 7], data[i + 8]]);
            return Some((u32::from(width), u32::from(height)));
        }
        if marker == 0xDA || len < 2 {
            // Start of scan before any frame header
            return None;
        }
        i += 2 + len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jpeg(tag: u8) -> Vec<u8> {
        vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x03, tag, 0x11, 0x22, 0xFF, 0xD9]
    }

    #[test]
    fn test_split_across_chunks() {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"noise");
        stream.extend(fake_jpeg(1));
        stream.extend(fake_jpeg(2));
        stream.extend(fake_jpeg(3));

        let mut splitter = JpegSplitter::new(1024);
        let mut frames = Vec::new();
        for chunk in stream.chunks(4) {
            frames.extend(splitter.push(chunk));
        }

        assert_eq!(frames.len(), 3);
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(f.as_ref(), fake_jpeg(i as u8 + 1).as_slice());
        }
        assert_eq!(splitter.buffered(), 0);
    }

    #[test]
    fn test_marker_split_between_chunks() {
        let jpeg = fake_jpeg(7);
        let mut splitter = JpegSplitter::new(1024);
        assert!(splitter.push(&[0x00, 0xFF]).is_empty());
        assert_eq!(splitter.buffered(), 1);
        let frames = splitter.push(&jpeg[1..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), jpeg.as_slice());
    }

    #[test]
    fn test_oversized_partial_is_dropped() {
        let mut splitter = JpegSplitter::new(16);
        let mut data = vec![0xFF, 0xD8];
        data.extend(vec![0u8; 32]);
        assert!(splitter.push(&data).is_empty());
        assert_eq!(splitter.buffered(), 0);
    }

    #[test]
    fn test_dimensions() {
        // SOI, APP0 (len 4), SOF0 with height 480, width 640
        let data = [
            0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00, 0xFF, 0xC0, 0x00, 0x11, 0x08, 0x01,
            0xE0, 0x02, 0x80, 0x03,
        ];
        assert_eq!(dimensions(&data), Some((640, 480)));
        assert_eq!(dimensions(&[0x00, 0x01, 0x02, 0x03]), None);
    }
}
