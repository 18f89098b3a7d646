// AVI DEMUXER - Streaming RIFF/AVI chunk reader
//
// Parses the header list once, then walks the `movi` list one chunk at a
// time. Nothing is indexed up front: the reader only ever seeks to the
// cursor and reads the next 8-byte header, so slow block storage sees a
// single forward sequential scan.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// RIFF/AVI Constants
// ============================================================================

const RIFF: u32 = 0x46464952; // "RIFF" little-endian
const AVI_: u32 = 0x20495641; // "AVI " little-endian
const LIST: u32 = 0x5453494C; // "LIST" little-endian
const HDRL: u32 = 0x6C726468; // "hdrl" - header list
const AVIH: u32 = 0x68697661; // "avih" - main AVI header
const STRH: u32 = 0x68727473; // "strh" - stream header
const STRF: u32 = 0x66727473; // "strf" - stream format
const MOVI: u32 = 0x69766F6D; // "movi" - movie data

// Stream types
const VIDS: u32 = 0x73646976; // "vids" - video stream
const AUDS: u32 = 0x73647561; // "auds" - audio stream

/// Upper bound on how much of `hdrl` is read into memory.
const HEADER_BUFFER_SIZE: usize = 16 * 1024;

/// Chunk header: FourCC + little-endian u32 size.
const CHUNK_HEADER_SIZE: u64 = 8;

/// Default destination capacity for a single chunk payload.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 100 * 1024;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("Invalid container: {0}")]
    Format(String),
    #[error("Container region not found: {0}")]
    NotFound(&'static str),
    #[error("Storage read failed: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Structures
// ============================================================================

/// Audio stream format from the `strf` WAVEFORMATEX record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

/// Stream description, parsed once at open and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub width: u32,
    pub height: u32,
    /// Whole frames per second; 0 when the container declares none.
    pub fps: u32,
    /// Advisory: taken from `avih`, never used to bound the chunk walk.
    pub total_frames: u32,
    pub has_video: bool,
    pub has_audio: bool,
    pub video_codec: Option<String>,
    pub audio: Option<AudioFormat>,
}

/// Read position inside the `movi` payload region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCursor {
    /// Absolute offset of the next chunk header.
    pub position: u64,
    /// First byte after the `movi` list type.
    pub start: u64,
    /// One past the last byte of the `movi` list.
    pub end: u64,
}

impl ChunkCursor {
    fn at_end(&self) -> bool {
        self.position + CHUNK_HEADER_SIZE > self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    Video,
    Audio,
    Other,
    End,
}

impl ChunkKind {
    /// Classify a `movi` chunk by the last two bytes of its tag
    /// (`00dc`/`00db` video, `01wb` audio).
    pub fn from_tag(tag: [u8; 4]) -> Self {
        match &tag[2..4] {
            b"dc" | b"db" => ChunkKind::Video,
            b"wb" => ChunkKind::Audio,
            _ => ChunkKind::Other,
        }
    }
}

/// A chunk payload borrowed from the demuxer's read buffer.
///
/// The borrow ends at the next `next_chunk` call; anything that must outlive
/// it (ring slots, the audio queue) copies the bytes.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub kind: ChunkKind,
    pub tag: [u8; 4],
    pub data: &'a [u8],
}

impl<'a> Chunk<'a> {
    fn end() -> Self {
        Self {
            kind: ChunkKind::End,
            tag: [0; 4],
            data: &[],
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_end(&self) -> bool {
        self.kind == ChunkKind::End
    }
}

// ============================================================================
// AVI Demuxer
// ============================================================================

pub struct AviDemuxer<R: Read + Seek> {
    reader: R,
    info: ContainerInfo,
    cursor: ChunkCursor,
    buffer: Vec<u8>,
    max_chunk_bytes: usize,
    oversized_skipped: u64,
}

impl AviDemuxer<BufReader<File>> {
    /// Open a file from storage with a buffered reader.
    pub fn open_path<P: AsRef<Path>>(path: P, max_chunk_bytes: usize) -> Result<Self, DemuxError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        tracing::info!("Opening AVI: {:?}", path);
        Self::open(BufReader::new(file), max_chunk_bytes)
    }
}

impl<R: Read + Seek> AviDemuxer<R> {
    /// Validate the RIFF signature, parse `hdrl` and locate `movi`.
    pub fn open(mut reader: R, max_chunk_bytes: usize) -> Result<Self, DemuxError> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let mut header = [0u8; 12];
        reader
            .read_exact(&mut header)
            .map_err(|_| DemuxError::Format("file shorter than RIFF header".into()))?;

        let riff = read_u32_le(&header, 0);
        let riff_size = read_u32_le(&header, 4);
        let avi = read_u32_le(&header, 8);
        if riff != RIFF {
            return Err(DemuxError::Format("Not a RIFF file".into()));
        }
        if avi != AVI_ {
            return Err(DemuxError::Format(format!(
                "RIFF form type is {:?}, not AVI",
                fourcc_to_string(avi)
            )));
        }

        tracing::debug!(file_size, riff_size, "RIFF/AVI signature ok");

        let mut info = ContainerInfo::default();
        let cursor = locate_movi(&mut reader, file_size, &mut info)?;

        tracing::info!(
            "AVI parsed: {}x{} @ {} fps, {} frames, video={} audio={}, movi {}..{}",
            info.width,
            info.height,
            info.fps,
            info.total_frames,
            info.has_video,
            info.has_audio,
            cursor.start,
            cursor.end
        );

        Ok(Self {
            reader,
            info,
            cursor,
            buffer: Vec::with_capacity(max_chunk_bytes),
            max_chunk_bytes,
            oversized_skipped: 0,
        })
    }

    /// Get stream info
    pub fn info(&self) -> &ContainerInfo {
        &self.info
    }

    pub fn cursor(&self) -> ChunkCursor {
        self.cursor
    }

    /// Destination capacity; larger chunks are skipped, never returned.
    pub fn max_chunk_bytes(&self) -> usize {
        self.max_chunk_bytes
    }

    /// Chunks skipped because they exceeded `max_chunk_bytes`.
    pub fn oversized_skipped(&self) -> u64 {
        self.oversized_skipped
    }

    /// Read the next chunk from `movi`.
    ///
    /// Returns `ChunkKind::End` at the end of the region or on any storage
    /// read failure. Oversized chunks are skipped and the walk continues.
    pub fn next_chunk(&mut self) -> Chunk<'_> {
        let mut header = [0u8; CHUNK_HEADER_SIZE as usize];

        loop {
            if self.cursor.at_end() {
                return Chunk::end();
            }

            if let Err(e) = self
                .reader
                .seek(SeekFrom::Start(self.cursor.position))
                .and_then(|_| self.reader.read_exact(&mut header))
            {
                tracing::warn!(
                    "Failed to read chunk header at {}: {}",
                    self.cursor.position,
                    e
                );
                self.cursor.position = self.cursor.end;
                return Chunk::end();
            }

            let tag = [header[0], header[1], header[2], header[3]];
            let size = read_u32_le(&header, 4);

            // `LIST rec ` groups interleave chunks; descend into them.
            if read_u32_le(&header, 0) == LIST {
                self.cursor.position += CHUNK_HEADER_SIZE + 4;
                continue;
            }

            let next = self.cursor.position + CHUNK_HEADER_SIZE + padded(size);

            if size as usize > self.max_chunk_bytes {
                tracing::warn!(
                    "Chunk too large: {} bytes (max {}), skipping {}",
                    size,
                    self.max_chunk_bytes,
                    fourcc_to_string(u32::from_le_bytes(tag))
                );
                self.oversized_skipped += 1;
                self.cursor.position = next;
                continue;
            }

            self.buffer.resize(size as usize, 0);
            if let Err(e) = self.reader.read_exact(&mut self.buffer) {
                tracing::warn!(
                    "Failed to read {} byte chunk payload at {}: {}",
                    size,
                    self.cursor.position,
                    e
                );
                self.cursor.position = self.cursor.end;
                return Chunk::end();
            }

            self.cursor.position = next;
            return Chunk {
                kind: ChunkKind::from_tag(tag),
                tag,
                data: &self.buffer,
            };
        }
    }

    /// Classify the next chunk from its header alone, without consuming it.
    ///
    /// `LIST rec ` headers are stepped over as `next_chunk` would. A header
    /// read failure reports `End` and leaves the cursor for `next_chunk` to
    /// handle.
    pub fn peek_kind(&mut self) -> ChunkKind {
        let mut header = [0u8; CHUNK_HEADER_SIZE as usize];

        loop {
            if self.cursor.at_end() {
                return ChunkKind::End;
            }
            if self
                .reader
                .seek(SeekFrom::Start(self.cursor.position))
                .and_then(|_| self.reader.read_exact(&mut header))
                .is_err()
            {
                return ChunkKind::End;
            }
            if read_u32_le(&header, 0) == LIST {
                self.cursor.position += CHUNK_HEADER_SIZE + 4;
                continue;
            }
            return ChunkKind::from_tag([header[0], header[1], header[2], header[3]]);
        }
    }

    /// Reset the cursor to the start of `movi`.
    pub fn rewind(&mut self) {
        self.cursor.position = self.cursor.start;
    }

    /// Position within `movi` as a percentage, 0-100.
    pub fn progress_percent(&self) -> u8 {
        let total = self.cursor.end.saturating_sub(self.cursor.start);
        if total == 0 {
            return 0;
        }
        let done = self.cursor.position.saturating_sub(self.cursor.start).min(total);
        ((done * 100) / total) as u8
    }
}

// ============================================================================
// Header Parsing
// ============================================================================

/// Scan top-level chunks for `LIST hdrl` and `LIST movi`.
fn locate_movi<R: Read + Seek>(
    reader: &mut R,
    file_size: u64,
    info: &mut ContainerInfo,
) -> Result<ChunkCursor, DemuxError> {
    let mut offset: u64 = 12;
    let mut chunk_header = [0u8; 12];

    while offset + 12 <= file_size {
        reader.seek(SeekFrom::Start(offset))?;
        if reader.read_exact(&mut chunk_header).is_err() {
            break;
        }

        let chunk_id = read_u32_le(&chunk_header, 0);
        let chunk_size = read_u32_le(&chunk_header, 4);

        if chunk_id == LIST {
            match read_u32_le(&chunk_header, 8) {
                HDRL => {
                    let len = (chunk_size.saturating_sub(4) as usize).min(HEADER_BUFFER_SIZE);
                    let mut hdrl = vec![0u8; len];
                    match reader.read_exact(&mut hdrl) {
                        Ok(()) => parse_hdrl(&hdrl, info),
                        Err(e) => tracing::warn!("Truncated hdrl list: {}", e),
                    }
                }
                MOVI => {
                    let start = offset + 12;
                    let end = (offset + CHUNK_HEADER_SIZE + chunk_size as u64).min(file_size);
                    return Ok(ChunkCursor {
                        position: start,
                        start,
                        end,
                    });
                }
                _ => {}
            }
        }

        offset += CHUNK_HEADER_SIZE + padded(chunk_size);
    }

    Err(DemuxError::NotFound("movi list"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    None,
    Video,
    Audio,
}

/// Walk the in-memory `hdrl` list. Nested `LIST strl` records are entered by
/// stepping over their 12-byte header; everything unrecognised is skipped by size.
fn parse_hdrl(buf: &[u8], info: &mut ContainerInfo) {
    let mut current = StreamKind::None;
    let mut offset = 0usize;

    while offset + 8 <= buf.len() {
        let chunk_id = read_u32_le(buf, offset);
        let chunk_size = read_u32_le(buf, offset + 4) as usize;

        if chunk_id == LIST {
            offset += 12;
            continue;
        }

        let body_start = offset + 8;
        let body_end = body_start.saturating_add(chunk_size).min(buf.len());
        let body = &buf[body_start..body_end];

        match chunk_id {
            AVIH => parse_avih(body, info),
            STRH => current = parse_strh(body, info),
            STRF => {
                match current {
                    StreamKind::Video => parse_strf_video(body, info),
                    StreamKind::Audio => parse_strf_audio(body, info),
                    StreamKind::None => {}
                }
                current = StreamKind::None;
            }
            _ => {}
        }

        offset = body_start
            .saturating_add(chunk_size)
            .saturating_add(chunk_size & 1);
    }
}

fn parse_avih(data: &[u8], info: &mut ContainerInfo) {
    if data.len() < 40 {
        return;
    }

    let us_per_frame = read_u32_le(data, 0);
    if us_per_frame > 0 {
        info.fps = 1_000_000 / us_per_frame;
    }
    info.total_frames = read_u32_le(data, 16);
    info.width = read_u32_le(data, 32);
    info.height = read_u32_le(data, 36);
}

fn parse_strh(data: &[u8], info: &mut ContainerInfo) -> StreamKind {
    if data.len() < 48 {
        return StreamKind::None;
    }

    match read_u32_le(data, 0) {
        VIDS => {
            info.has_video = true;
            let scale = read_u32_le(data, 20);
            let rate = read_u32_le(data, 24);
            if scale > 0 {
                info.fps = rate / scale;
            }
            tracing::debug!(rate, scale, fps = info.fps, "video stream header");
            StreamKind::Video
        }
        AUDS => {
            info.has_audio = true;
            tracing::debug!("audio stream header");
            StreamKind::Audio
        }
        _ => StreamKind::None,
    }
}

/// BITMAPINFOHEADER
fn parse_strf_video(data: &[u8], info: &mut ContainerInfo) {
    if data.len() < 20 {
        return;
    }

    info.width = read_u32_le(data, 4);
    // Negative height marks a top-down bitmap.
    info.height = (read_u32_le(data, 8) as i32).unsigned_abs();

    let compression = read_u32_le(data, 16);
    if compression != 0 {
        info.video_codec = Some(fourcc_to_string(compression));
    }
}

/// WAVEFORMATEX
fn parse_strf_audio(data: &[u8], info: &mut ContainerInfo) {
    if data.len() < 16 {
        return;
    }

    info.audio = Some(AudioFormat {
        format_tag: read_u16_le(data, 0),
        channels: read_u16_le(data, 2),
        sample_rate: read_u32_le(data, 4),
        block_align: read_u16_le(data, 12),
        bits_per_sample: read_u16_le(data, 14),
    });
}

// ============================================================================
// Helper Functions
// ============================================================================

/// RIFF chunks are padded to an even size.
fn padded(size: u32) -> u64 {
    size as u64 + (size & 1) as u64
}

fn read_u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn fourcc_to_string(fourcc: u32) -> String {
    fourcc
        .to_le_bytes()
        .iter()
        .filter(|&&b| b.is_ascii_graphic() || b == b' ')
        .map(|&b| b as char)
        .collect()
}

/// Open a file and return its container info as JSON.
pub fn avi_probe<P: AsRef<Path>>(path: P) -> Result<serde_json::Value, DemuxError> {
    let demuxer = AviDemuxer::open_path(path, DEFAULT_MAX_CHUNK_BYTES)?;
    serde_json::to_value(demuxer.info()).map_err(|e| DemuxError::Format(format!("JSON error: {}", e)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::AviBuilder;
    use std::io::Cursor;

    fn scan(demuxer: &mut AviDemuxer<Cursor<Vec<u8>>>) -> Vec<(ChunkKind, usize)> {
        let mut out = Vec::new();
        loop {
            let chunk = demuxer.next_chunk();
            if chunk.is_end() {
                break;
            }
            out.push((chunk.kind, chunk.size()));
        }
        out
    }

    #[test]
    fn test_open_parses_header() {
        let avi = AviBuilder::new(320, 240, 30)
            .with_pcm_audio(22050, 1)
            .video(100)
            .audio(64)
            .build();

        let demuxer = AviDemuxer::open(Cursor::new(avi), DEFAULT_MAX_CHUNK_BYTES).unwrap();
        let info = demuxer.info();
        assert_eq!(info.width, 320);
        assert_eq!(info.height, 240);
        assert_eq!(info.fps, 30);
        assert!(info.has_video);
        assert!(info.has_audio);
        assert_eq!(info.video_codec.as_deref(), Some("MJPG"));

        let audio = info.audio.unwrap();
        assert_eq!(audio.format_tag, 1);
        assert_eq!(audio.sample_rate, 22050);
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.bits_per_sample, 16);
    }

    #[test]
    fn test_bad_signature_is_format_error() {
        let mut avi = AviBuilder::new(320, 240, 30).video(10).build();
        avi[8..12].copy_from_slice(b"WAVE");
        let err = AviDemuxer::open(Cursor::new(avi), DEFAULT_MAX_CHUNK_BYTES)
            .err()
            .unwrap();
        assert!(matches!(err, DemuxError::Format(_)));

        let err = AviDemuxer::open(Cursor::new(b"nope".to_vec()), DEFAULT_MAX_CHUNK_BYTES)
            .err()
            .unwrap();
        assert!(matches!(err, DemuxError::Format(_)));
    }

    #[test]
    fn test_missing_movi_is_not_found() {
        let avi = AviBuilder::new(320, 240, 30).without_movi().build();
        let err = AviDemuxer::open(Cursor::new(avi), DEFAULT_MAX_CHUNK_BYTES)
            .err()
            .unwrap();
        assert!(matches!(err, DemuxError::NotFound(_)));
    }

    #[test]
    fn test_chunk_sequence_and_padding() {
        let avi = AviBuilder::new(160, 120, 25)
            .with_pcm_audio(8000, 1)
            .video(33)
            .audio(10)
            .chunk(*b"JUNK", 5)
            .video(2)
            .build();

        let mut demuxer = AviDemuxer::open(Cursor::new(avi), DEFAULT_MAX_CHUNK_BYTES).unwrap();
        let chunks = scan(&mut demuxer);
        assert_eq!(
            chunks,
            vec![
                (ChunkKind::Video, 33),
                (ChunkKind::Audio, 10),
                (ChunkKind::Other, 5),
                (ChunkKind::Video, 2),
            ]
        );
        assert_eq!(demuxer.progress_percent(), 100);
        assert!(demuxer.next_chunk().is_end());
    }

    #[test]
    fn test_payload_bytes_copied() {
        let avi = AviBuilder::new(160, 120, 25)
            .chunk_with(*b"00dc", vec![1, 2, 3])
            .build();
        let mut demuxer = AviDemuxer::open(Cursor::new(avi), DEFAULT_MAX_CHUNK_BYTES).unwrap();
        let chunk = demuxer.next_chunk();
        assert_eq!(chunk.tag, *b"00dc");
        assert_eq!(chunk.data, &[1, 2, 3]);
    }

    #[test]
    fn test_rescan_is_deterministic() {
        let avi = AviBuilder::new(160, 120, 30)
            .with_pcm_audio(8000, 1)
            .video(400)
            .audio(31)
            .video(17)
            .audio(32)
            .video(1)
            .build();

        let mut demuxer = AviDemuxer::open(Cursor::new(avi), DEFAULT_MAX_CHUNK_BYTES).unwrap();
        let first = scan(&mut demuxer);
        demuxer.rewind();
        assert_eq!(demuxer.progress_percent(), 0);
        let second = scan(&mut demuxer);
        assert_eq!(first, second);
        assert_eq!(first.len(), 5);
    }

    #[test]
    fn test_oversized_chunk_is_skipped() {
        let avi = AviBuilder::new(160, 120, 30)
            .video(64)
            .video(65)
            .video(8)
            .build();

        let mut demuxer = AviDemuxer::open(Cursor::new(avi), 64).unwrap();
        let chunks = scan(&mut demuxer);
        assert_eq!(chunks, vec![(ChunkKind::Video, 64), (ChunkKind::Video, 8)]);
        assert!(chunks.iter().all(|(_, size)| *size <= demuxer.max_chunk_bytes()));
        assert_eq!(demuxer.oversized_skipped(), 1);
    }

    #[test]
    fn test_rec_list_is_entered() {
        let avi = AviBuilder::new(160, 120, 30)
            .video(4)
            .rec_list(&[(*b"00dc", 6), (*b"01wb", 3)])
            .video(5)
            .build();

        let mut demuxer = AviDemuxer::open(Cursor::new(avi), DEFAULT_MAX_CHUNK_BYTES).unwrap();
        assert_eq!(
            scan(&mut demuxer),
            vec![
                (ChunkKind::Video, 4),
                (ChunkKind::Video, 6),
                (ChunkKind::Audio, 3),
                (ChunkKind::Video, 5),
            ]
        );
    }

    #[test]
    fn test_peek_does_not_consume() {
        let avi = AviBuilder::new(160, 120, 30)
            .audio(3)
            .rec_list(&[(*b"00dc", 6)])
            .build();

        let mut demuxer = AviDemuxer::open(Cursor::new(avi), DEFAULT_MAX_CHUNK_BYTES).unwrap();
        assert_eq!(demuxer.peek_kind(), ChunkKind::Audio);
        assert_eq!(demuxer.peek_kind(), ChunkKind::Audio);
        assert_eq!(demuxer.next_chunk().kind, ChunkKind::Audio);

        assert_eq!(demuxer.peek_kind(), ChunkKind::Video);
        let chunk = demuxer.next_chunk();
        assert_eq!((chunk.kind, chunk.size()), (ChunkKind::Video, 6));
        assert_eq!(demuxer.peek_kind(), ChunkKind::End);
    }

    #[test]
    fn test_truncated_payload_ends_stream() {
        let mut avi = AviBuilder::new(160, 120, 30).video(10).video(40).build();
        avi.truncate(avi.len() - 20);

        let mut demuxer = AviDemuxer::open(Cursor::new(avi), DEFAULT_MAX_CHUNK_BYTES).unwrap();
        assert_eq!(demuxer.next_chunk().size(), 10);
        assert!(demuxer.next_chunk().is_end());
        assert!(demuxer.next_chunk().is_end());
    }

    #[test]
    fn test_strh_rate_overrides_avih() {
        let avi = AviBuilder::new(160, 120, 30).stream_rate(25, 1).video(1).build();
        let demuxer = AviDemuxer::open(Cursor::new(avi), DEFAULT_MAX_CHUNK_BYTES).unwrap();
        assert_eq!(demuxer.info().fps, 25);
    }

    #[test]
    fn test_classify_tags() {
        assert_eq!(ChunkKind::from_tag(*b"00dc"), ChunkKind::Video);
        assert_eq!(ChunkKind::from_tag(*b"00db"), ChunkKind::Video);
        assert_eq!(ChunkKind::from_tag(*b"01wb"), ChunkKind::Audio);
        assert_eq!(ChunkKind::from_tag(*b"ix00"), ChunkKind::Other);
        assert_eq!(ChunkKind::from_tag(*b"02tx"), ChunkKind::Other);
    }
}
