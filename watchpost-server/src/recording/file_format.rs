//! WPR (Watchpost Recording) file format implementation.
//!
//! Binary container for a sequence of JPEG frames. All integers are little
//! endian.

use std::io::{self, Read, Seek, SeekFrom, Write};

use watchpost_core::Trigger;

/// Magic bytes for WPR file header
pub const WPR_MAGIC: [u8; 4] = *b"WPR1";

/// Magic bytes for WPR file footer
pub const WPR_FOOTER_MAGIC: [u8; 4] = *b"WPRF";

/// Current format version
pub const WPR_VERSION: u16 = 1;

/// Header size in bytes (fixed)
pub const HEADER_SIZE: usize = 128;

/// Footer size in bytes (fixed)
pub const FOOTER_SIZE: usize = 32;

/// Index entry size in bytes
pub const INDEX_ENTRY_SIZE: usize = 16;

/// Fixed part of a frame record: timestamp + sequence + length
pub const FRAME_PREFIX_SIZE: usize = 8 + 8 + 4;

/// Default number of frames between two index entries
pub const DEFAULT_INDEX_INTERVAL: u32 = 30;

/// Largest frame payload accepted when reading, protects against garbage
/// lengths in damaged files
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

pub fn trigger_to_id(trigger: Trigger) -> u8 {
    match trigger {
        Trigger::Manual => 1,
        Trigger::Motion => 2,
    }
}

pub fn id_to_trigger(id: u8) -> Option<Trigger> {
    match id {
        1 => Some(Trigger::Manual),
        2 => Some(Trigger::Motion),
        _ => None,
    }
}

/// File header (128 bytes fixed size)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WprHeader {
    /// Format version (currently 1)
    pub version: u16,
    /// What started the session
    pub trigger: Trigger,
    /// Frame width in pixels at session start
    pub width: u32,
    /// Frame height in pixels at session start
    pub height: u32,
    /// Nominal capture rate
    pub fps: u32,
    /// Session start (Unix timestamp in milliseconds)
    pub start_time_ms: u64,
    /// Session id within the process that wrote the file
    pub session_id: u64,
}

impl WprHeader {
    pub fn new(trigger: Trigger, width: u32, height: u32, fps: u32, start_time_ms: u64) -> Self {
        WprHeader {
            version: WPR_VERSION,
            trigger,
            width,
            height,
            fps,
            start_time_ms,
            session_id: 0,
        }
    }

    /// Write header to writer
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0..4].copy_from_slice(&WPR_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6] = trigger_to_id(self.trigger);
        // buf[7] reserved
        buf[8..12].copy_from_slice(&self.width.to_le_bytes());
        buf[12..16].copy_from_slice(&self.height.to_le_bytes());
        buf[16..20].copy_from_slice(&self.fps.to_le_bytes());
        buf[20..28].copy_from_slice(&self.start_time_ms.to_le_bytes());
        buf[28..36].copy_from_slice(&self.session_id.to_le_bytes());
        // Remaining bytes are reserved (already zeroed)

        writer.write_all(&buf)
    }

    /// Read header from reader
    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        if buf[0..4] != WPR_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid WPR file: bad magic bytes",
            ));
        }

        let version = le_u16(&buf, 4);
        if version > WPR_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unsupported WPR version: {}", version),
            ));
        }

        let trigger = id_to_trigger(buf[6]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid WPR trigger id: {}", buf[6]),
            )
        })?;

        Ok(Self {
            version,
            trigger,
            width: le_u32(&buf, 8),
            height: le_u32(&buf, 12),
            fps: le_u32(&buf, 16),
            start_time_ms: le_u64(&buf, 20),
            session_id: le_u64(&buf, 28),
        })
    }
}

/// File footer (32 bytes fixed size)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WprFooter {
    /// Offset to seek index
    pub index_offset: u64,
    /// Number of index entries
    pub index_count: u32,
    /// Total number of frames
    pub frame_count: u32,
    /// Timestamp of the last frame relative to the start
    pub duration_ms: u64,
}

impl WprFooter {
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut buf = [0u8; FOOTER_SIZE];

        buf[0..4].copy_from_slice(&WPR_FOOTER_MAGIC);
        buf[4..12].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[12..16].copy_from_slice(&self.index_count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.frame_count.to_le_bytes());
        buf[20..28].copy_from_slice(&self.duration_ms.to_le_bytes());
        // Reserved (4 bytes, already zeroed)

        writer.write_all(&buf)
    }

    /// Read footer from reader (assumes reader is positioned at footer start)
    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; FOOTER_SIZE];
        reader.read_exact(&mut buf)?;

        if buf[0..4] != WPR_FOOTER_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid WPR footer: bad magic bytes",
            ));
        }

        Ok(Self {
            index_offset: le_u64(&buf, 4),
            index_count: le_u32(&buf, 12),
            frame_count: le_u32(&buf, 16),
            duration_ms: le_u64(&buf, 20),
        })
    }
}

/// Index entry for seeking (16 bytes)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WprIndexEntry {
    /// Timestamp in milliseconds (relative to start_time_ms)
    pub timestamp_ms: u64,
    /// File offset of the frame
    pub file_offset: u64,
}

impl WprIndexEntry {
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.timestamp_ms.to_le_bytes())?;
        writer.write_all(&self.file_offset.to_le_bytes())
    }

    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        reader.read_exact(&mut buf)?;

        Ok(Self {
            timestamp_ms: le_u64(&buf, 0),
            file_offset: le_u64(&buf, 8),
        })
    }
}

/// One recorded frame (variable size)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WprFrame {
    /// Timestamp in milliseconds (relative to start_time_ms)
    pub timestamp_ms: u64,
    /// Hub sequence number
    pub seq: u64,
    /// JPEG data
    pub data: Vec<u8>,
}

impl WprFrame {
    pub fn new(timestamp_ms: u64, seq: u64, data: Vec<u8>) -> Self {
        Self {
            timestamp_ms,
            seq,
            data,
        }
    }

    /// Write a frame record without building an owned `WprFrame` first.
    pub fn write_parts<W: Write>(
        writer: &mut W,
        timestamp_ms: u64,
        seq: u64,
        data: &[u8],
    ) -> io::Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "Frame too large for WPR")
        })?;
        writer.write_all(&timestamp_ms.to_le_bytes())?;
        writer.write_all(&seq.to_le_bytes())?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(data)
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        Self::write_parts(writer, self.timestamp_ms, self.seq, &self.data)
    }

    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        reader.read_exact(&mut prefix)?;
        let timestamp_ms = le_u64(&prefix, 0);
        let seq = le_u64(&prefix, 8);
        let len = le_u32(&prefix, 16);
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("WPR frame length {} is implausible", len),
            ));
        }

        let mut data = vec![0u8; len as usize];
        reader.read_exact(&mut data)?;

        Ok(Self {
            timestamp_ms,
            seq,
            data,
        })
    }

    /// Size of this frame record in bytes
    pub fn size(&self) -> usize {
        FRAME_PREFIX_SIZE + self.data.len()
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Writer for creating WPR files
pub struct WprWriter<W: Write + Seek> {
    writer: W,
    frame_count: u32,
    last_timestamp_ms: u64,
    bytes_written: u64,
    index: Vec<WprIndexEntry>,
    /// Create an index entry every N frames
    index_interval: u32,
    frames_since_index: u32,
}

impl<W: Write + Seek> WprWriter<W> {
    /// Write the header and return a writer positioned at the first frame
    pub fn new(mut writer: W, header: &WprHeader) -> io::Result<Self> {
        header.write(&mut writer)?;

        Ok(Self {
            writer,
            frame_count: 0,
            last_timestamp_ms: 0,
            bytes_written: HEADER_SIZE as u64,
            index: Vec::new(),
            index_interval: DEFAULT_INDEX_INTERVAL,
            frames_since_index: DEFAULT_INDEX_INTERVAL,
        })
    }

    pub fn with_index_interval(mut self, interval: u32) -> Self {
        self.index_interval = interval.max(1);
        self.frames_since_index = self.index_interval;
        self
    }

    /// Append one frame. Returns the number of bytes written.
    pub fn write_frame(&mut self, timestamp_ms: u64, seq: u64, data: &[u8]) -> io::Result<u64> {
        if self.frames_since_index >= self.index_interval {
            self.index.push(WprIndexEntry {
                timestamp_ms,
                file_offset: self.bytes_written,
            });
            self.frames_since_index = 0;
        }

        WprFrame::write_parts(&mut self.writer, timestamp_ms, seq, data)?;
        let size = (FRAME_PREFIX_SIZE + data.len()) as u64;
        self.frame_count += 1;
        self.last_timestamp_ms = timestamp_ms;
        self.bytes_written += size;
        self.frames_since_index += 1;

        Ok(size)
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn duration_ms(&self) -> u64 {
        self.last_timestamp_ms
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Write index and footer, flush, and hand back the underlying writer
    pub fn finish(mut self) -> io::Result<W> {
        let index_offset = self.bytes_written;
        for entry in &self.index {
            entry.write(&mut self.writer)?;
        }

        let footer = WprFooter {
            index_offset,
            index_count: self.index.len() as u32,
            frame_count: self.frame_count,
            duration_ms: self.last_timestamp_ms,
        };
        footer.write(&mut self.writer)?;
        self.writer.flush()?;

        Ok(self.writer)
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Frame count and duration of a file, from its footer or by scanning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WprSummary {
    pub frame_count: u32,
    pub duration_ms: u64,
    /// False when the footer was missing and the frames were counted
    pub complete: bool,
}

/// Reader for WPR files
///
/// A file without a valid footer (the writer never finished) is still
/// readable: frames are read until the data runs out.
pub struct WprReader<R: Read + Seek> {
    reader: R,
    header: WprHeader,
    footer: Option<WprFooter>,
    /// Offset one past the last frame byte
    frames_end: u64,
    position: u64,
}

impl<R: Read + Seek> WprReader<R> {
    pub fn open(mut reader: R) -> io::Result<Self> {
        reader.seek(SeekFrom::Start(0))?;
        let header = WprHeader::read(&mut reader)?;

        let file_len = reader.seek(SeekFrom::End(0))?;
        let mut footer = None;
        if file_len >= (HEADER_SIZE + FOOTER_SIZE) as u64 {
            reader.seek(SeekFrom::Start(file_len - FOOTER_SIZE as u64))?;
            if let Ok(f) = WprFooter::read(&mut reader) {
                let index_end = f.index_offset + u64::from(f.index_count) * INDEX_ENTRY_SIZE as u64;
                if f.index_offset >= HEADER_SIZE as u64 && index_end + FOOTER_SIZE as u64 == file_len
                {
                    footer = Some(f);
                }
            }
        }
        let frames_end = footer.as_ref().map_or(file_len, |f| f.index_offset);

        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;

        Ok(Self {
            reader,
            header,
            footer,
            frames_end,
            position: HEADER_SIZE as u64,
        })
    }

    pub fn header(&self) -> &WprHeader {
        &self.header
    }

    pub fn footer(&self) -> Option<&WprFooter> {
        self.footer.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.footer.is_some()
    }

    /// Read the next frame, `None` at the end of the frame data.
    ///
    /// In a file without footer a truncated trailing frame also ends the
    /// stream.
    pub fn read_frame(&mut self) -> io::Result<Option<WprFrame>> {
        if self.position + FRAME_PREFIX_SIZE as u64 > self.frames_end {
            return Ok(None);
        }
        match WprFrame::read(&mut self.reader) {
            Ok(frame) => {
                self.position += frame.size() as u64;
                if self.position > self.frames_end {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "WPR frame overlaps the index",
                    ));
                }
                Ok(Some(frame))
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && self.footer.is_none() => {
                self.position = self.frames_end;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn index(&mut self) -> io::Result<Vec<WprIndexEntry>> {
        let Some(footer) = self.footer.clone() else {
            return Ok(Vec::new());
        };
        self.reader.seek(SeekFrom::Start(footer.index_offset))?;
        let mut entries = Vec::with_capacity(footer.index_count as usize);
        for _ in 0..footer.index_count {
            entries.push(WprIndexEntry::read(&mut self.reader)?);
        }
        self.reader.seek(SeekFrom::Start(self.position))?;
        Ok(entries)
    }

    /// Frame count and duration. Uses the footer when present, otherwise
    /// counts the frames. Leaves the reader at the first frame.
    pub fn summary(&mut self) -> io::Result<WprSummary> {
        if let Some(f) = &self.footer {
            let summary = WprSummary {
                frame_count: f.frame_count,
                duration_ms: f.duration_ms,
                complete: true,
            };
            return Ok(summary);
        }

        self.rewind()?;
        let mut frame_count = 0u32;
        let mut duration_ms = 0u64;
        loop {
            match self.read_frame() {
                Ok(Some(frame)) => {
                    frame_count += 1;
                    duration_ms = frame.timestamp_ms;
                }
                Ok(None) => break,
                // Salvage whatever was readable
                Err(_) => break,
            }
        }
        self.rewind()?;

        Ok(WprSummary {
            frame_count,
            duration_ms,
            complete: false,
        })
    }

    /// Position the reader at the first frame with `timestamp_ms >= target_ms`
    pub fn seek_to_timestamp(&mut self, target_ms: u64) -> io::Result<()> {
        let start = self
            .index()?
            .into_iter()
            .take_while(|e| e.timestamp_ms <= target_ms)
            .last()
            .map_or(HEADER_SIZE as u64, |e| e.file_offset);
        self.reader.seek(SeekFrom::Start(start))?;
        self.position = start;

        loop {
            let before = self.position;
            match self.read_frame()? {
                Some(f) if f.timestamp_ms >= target_ms => {
                    self.reader.seek(SeekFrom::Start(before))?;
                    self.position = before;
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }

        Ok(())
    }

    /// Reset to the first frame
    pub fn rewind(&mut self) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        self.position = HEADER_SIZE as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header() -> WprHeader {
        WprHeader {
            session_id: 9,
            ..WprHeader::new(Trigger::Motion, 640, 480, 30, 1_700_000_000_123)
        }
    }

    fn recording(frames: u64, interval: u32) -> Vec<u8> {
        let mut writer = WprWriter::new(Cursor::new(Vec::new()), &header())
            .unwrap()
            .with_index_interval(interval);
        for i in 0..frames {
            writer
                .write_frame(i * 100, i + 1, &vec![i as u8; 10 + i as usize])
                .unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_header_layout() {
        let mut buf = Vec::new();
        header().write(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[0..4], b"WPR1");
        assert_eq!(buf[6], 2);

        let read = WprHeader::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read, header());
    }

    #[test]
    fn test_header_rejects_garbage() {
        let buf = vec![0u8; HEADER_SIZE];
        assert!(WprHeader::read(&mut Cursor::new(buf)).is_err());

        let mut buf = Vec::new();
        header().write(&mut buf).unwrap();
        buf[4] = 7;
        assert!(WprHeader::read(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_writer_reader() {
        let bytes = recording(10, 4);

        let mut reader = WprReader::open(Cursor::new(bytes)).unwrap();
        assert!(reader.is_complete());
        assert_eq!(reader.header().trigger, Trigger::Motion);
        assert_eq!(
            reader.summary().unwrap(),
            WprSummary {
                frame_count: 10,
                duration_ms: 900,
                complete: true
            }
        );

        // Index every 4 frames: frames 0, 4, 8
        let index = reader.index().unwrap();
        assert_eq!(
            index.iter().map(|e| e.timestamp_ms).collect::<Vec<_>>(),
            vec![0, 400, 800]
        );
        assert_eq!(index[0].file_offset, HEADER_SIZE as u64);

        let mut seqs = Vec::new();
        while let Some(frame) = reader.read_frame().unwrap() {
            assert_eq!(frame.data.len(), 10 + frame.timestamp_ms as usize / 100);
            seqs.push(frame.seq);
        }
        assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_seek() {
        let mut reader = WprReader::open(Cursor::new(recording(10, 4))).unwrap();

        reader.seek_to_timestamp(550).unwrap();
        assert_eq!(reader.read_frame().unwrap().unwrap().timestamp_ms, 600);

        reader.seek_to_timestamp(0).unwrap();
        assert_eq!(reader.read_frame().unwrap().unwrap().seq, 1);

        reader.seek_to_timestamp(10_000).unwrap();
        assert!(reader.read_frame().unwrap().is_none());

        reader.rewind().unwrap();
        assert_eq!(reader.read_frame().unwrap().unwrap().seq, 1);
    }

    #[test]
    fn test_unfinished_file_is_salvaged() {
        let mut writer = WprWriter::new(Cursor::new(Vec::new()), &header()).unwrap();
        for i in 0..5u64 {
            writer.write_frame(i * 40, i + 1, &[0xAB; 64]).unwrap();
        }
        assert_eq!(writer.bytes_written(), (HEADER_SIZE + 5 * (20 + 64)) as u64);
        // Simulate a crash: take the bytes without writing index/footer,
        // and chop the last frame in half.
        let mut bytes = writer.writer.into_inner();
        bytes.truncate(bytes.len() - 30);

        let mut reader = WprReader::open(Cursor::new(bytes)).unwrap();
        assert!(!reader.is_complete());
        assert_eq!(
            reader.summary().unwrap(),
            WprSummary {
                frame_count: 4,
                duration_ms: 120,
                complete: false
            }
        );
        let mut n = 0;
        while reader.read_frame().unwrap().is_some() {
            n += 1;
        }
        assert_eq!(n, 4);
        assert!(reader.index().unwrap().is_empty());
    }

    #[test]
    fn test_empty_recording() {
        let mut reader = WprReader::open(Cursor::new(recording(0, 4))).unwrap();
        assert!(reader.is_complete());
        assert_eq!(reader.summary().unwrap().frame_count, 0);
        assert!(reader.read_frame().unwrap().is_none());
    }
}
