//! Listen queue data model and MP3 frame-header bitrate/duration scanning
//! (spec.md §4.7).
//!
//! Grounded on the teacher's `db.rs` JSON persistence pattern (serialize
//! the whole state blob on every mutation rather than incremental diffs) —
//! here applied to `listen-queue.json` instead of SQLite rows, since the
//! queue is small and always read back in full on restart.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::GoopResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    File,
    Stream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub kind: TrackKind,
    pub path: String,
    /// Seconds; streams always report 0 and are never auto-advanced.
    pub duration: f64,
    #[serde(default)]
    pub bitrate_kbps: u32,
    #[serde(default)]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenState {
    pub group_id: String,
    pub queue: Vec<QueueEntry>,
    pub queue_index: usize,
    pub paused: bool,
    pub position: f64,
    pub updated_at: u64,
    pub seek_generation: u64,
}

impl ListenState {
    pub fn new(group_id: String) -> Self {
        Self {
            group_id,
            queue: Vec::new(),
            queue_index: 0,
            paused: true,
            position: 0.0,
            updated_at: crate::peer::PresenceMessage::now_ms(),
            seek_generation: 0,
        }
    }

    pub fn save(&self, path: &Path) -> GoopResult<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| crate::error::GoopError::Validation(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> GoopResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        let state = serde_json::from_str(&raw).map_err(|e| crate::error::GoopError::Validation(e.to_string()))?;
        Ok(Some(state))
    }

    pub fn touch(&mut self) {
        self.updated_at = crate::peer::PresenceMessage::now_ms();
    }
}

/// Standard MPEG-1/2/2.5 Layer I/II/III bitrate table, kbps, indexed
/// `[version_is_v1][layer_index][bitrate_index]`. `layer_index` 0 = Layer
/// III, 1 = Layer II, 2 = Layer I (MPEG frame header layer bits are
/// reversed: `0b01` = Layer III, `0b10` = Layer II, `0b11` = Layer I).
const BITRATE_TABLE_V1: [[u32; 15]; 3] = [
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],
    [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448],
];
const BITRATE_TABLE_V2: [[u32; 15]; 3] = [
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256],
];
const SAMPLE_RATE_TABLE_V1: [u32; 3] = [44100, 48000, 32000];
const SAMPLE_RATE_TABLE_V2: [u32; 3] = [22050, 24000, 16000];
const SAMPLE_RATE_TABLE_V25: [u32; 3] = [11025, 12000, 8000];

pub struct FrameInfo {
    pub bitrate_kbps: u32,
    #[allow(dead_code)]
    pub sample_rate_hz: u32,
}

/// Skips a leading ID3v2 tag if present, then scans for the first valid
/// MPEG frame sync (`0xFFE...`) and decodes its header (spec.md §4.7).
pub fn scan_first_frame(bytes: &[u8]) -> Option<(usize, FrameInfo)> {
    let start = skip_id3v2(bytes);
    let mut offset = start;
    while offset + 4 <= bytes.len() {
        if bytes[offset] == 0xFF && (bytes[offset + 1] & 0xE0) == 0xE0 {
            if let Some(info) = parse_frame_header(&bytes[offset..offset + 4]) {
                return Some((offset, info));
            }
        }
        offset += 1;
    }
    None
}

fn skip_id3v2(bytes: &[u8]) -> usize {
    if bytes.len() >= 10 && &bytes[0..3] == b"ID3" {
        let size = ((bytes[6] as u32 & 0x7F) << 21)
            | ((bytes[7] as u32 & 0x7F) << 14)
            | ((bytes[8] as u32 & 0x7F) << 7)
            | (bytes[9] as u32 & 0x7F);
        10 + size as usize
    } else {
        0
    }
}

fn parse_frame_header(header: &[u8]) -> Option<FrameInfo> {
    let b1 = header[1];
    let b2 = header[2];
    let version_bits = (b1 >> 3) & 0b11;
    let layer_bits = (b1 >> 1) & 0b11;
    if layer_bits == 0 || version_bits == 1 {
        return None;
    }
    let bitrate_index = ((b2 >> 4) & 0x0F) as usize;
    let sample_rate_index = ((b2 >> 2) & 0x03) as usize;
    if bitrate_index == 0 || bitrate_index == 15 || sample_rate_index == 3 {
        return None;
    }
    // layer_bits: 0b11=Layer I, 0b10=Layer II, 0b01=Layer III.
    let layer_table_idx = match layer_bits {
        0b11 => 2,
        0b10 => 1,
        0b01 => 0,
        _ => return None,
    };
    let (bitrate_table, sample_table): (&[[u32; 15]; 3], &[u32; 3]) = match version_bits {
        0b11 => (&BITRATE_TABLE_V1, &SAMPLE_RATE_TABLE_V1),
        0b10 => (&BITRATE_TABLE_V2, &SAMPLE_RATE_TABLE_V2),
        0b00 => (&BITRATE_TABLE_V2, &SAMPLE_RATE_TABLE_V25),
        _ => return None,
    };
    let bitrate_kbps = bitrate_table[layer_table_idx][bitrate_index];
    let sample_rate_hz = sample_table[sample_rate_index];
    if bitrate_kbps == 0 {
        return None;
    }
    Some(FrameInfo { bitrate_kbps, sample_rate_hz })
}

/// `duration = (file_size - offset) * 8 / bitrate` (spec.md §4.7), in
/// seconds, given the frame bitrate in kbps.
pub fn estimate_duration_secs(file_size: u64, frame_offset: usize, bitrate_kbps: u32) -> f64 {
    if bitrate_kbps == 0 {
        return 0.0;
    }
    let remaining = file_size.saturating_sub(frame_offset as u64) as f64;
    (remaining * 8.0) / (bitrate_kbps as f64 * 1000.0)
}

/// Probes a local MP3 file for bitrate/duration, building a `QueueEntry`
/// of kind `File`. HTTP stream URLs bypass this and get duration 0.
pub fn probe_file(path: &str) -> GoopResult<QueueEntry> {
    let bytes = std::fs::read(path)?;
    let file_size = bytes.len() as u64;
    match scan_first_frame(&bytes) {
        Some((offset, info)) => Ok(QueueEntry {
            kind: TrackKind::File,
            path: path.to_string(),
            duration: estimate_duration_secs(file_size, offset, info.bitrate_kbps),
            bitrate_kbps: info.bitrate_kbps,
            format: "mp3".to_string(),
        }),
        None => Ok(QueueEntry {
            kind: TrackKind::File,
            path: path.to_string(),
            duration: 0.0,
            bitrate_kbps: 0,
            format: "mp3".to_string(),
        }),
    }
}

pub fn stream_entry(url: &str) -> QueueEntry {
    QueueEntry {
        kind: TrackKind::Stream,
        path: url.to_string(),
        duration: 0.0,
        bitrate_kbps: 0,
        format: "mp3".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mpeg1_layer3_128k_44k_header() -> [u8; 4] {
        // 0xFFFB9064 is a common MPEG-1 Layer III 128kbps/44.1kHz header.
        [0xFF, 0xFB, 0x90, 0x64]
    }

    #[test]
    fn parses_known_mpeg1_layer3_header() {
        let header = mpeg1_layer3_128k_44k_header();
        let info = parse_frame_header(&header).unwrap();
        assert_eq!(info.bitrate_kbps, 128);
        assert_eq!(info.sample_rate_hz, 44100);
    }

    #[test]
    fn rejects_non_sync_bytes() {
        assert!(parse_frame_header(&[0x00, 0x00, 0x00, 0x00]).is_none());
    }

    #[test]
    fn skips_id3v2_tag_before_scanning() {
        let mut bytes = vec![b'I', b'D', b'3', 3, 0, 0, 0, 0, 0, 10];
        bytes.extend(std::iter::repeat(0u8).take(10));
        bytes.extend_from_slice(&mpeg1_layer3_128k_44k_header());
        let (offset, info) = scan_first_frame(&bytes).unwrap();
        assert_eq!(offset, 20);
        assert_eq!(info.bitrate_kbps, 128);
    }

    #[test]
    fn duration_matches_spec_formula() {
        let d = estimate_duration_secs(1_280_000, 0, 128);
        assert!((d - 80.0).abs() < 0.01);
    }

    #[test]
    fn stream_entries_never_auto_advance_by_duration() {
        let entry = stream_entry("http://example.com/radio.mp3");
        assert_eq!(entry.duration, 0.0);
        assert_eq!(entry.kind, TrackKind::Stream);
    }
}
