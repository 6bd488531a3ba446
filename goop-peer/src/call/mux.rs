//! Live WebM/EBML remuxer for browser media delivery over WebSocket
//! (spec.md §4.8). No crate in the corpus does this; built by hand from
//! the spec's exact byte-level description, using `bytes::BytesMut` for
//! buffer assembly the same way `vorjdux-monocoque`'s wire codecs do.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::sync::broadcast;

const TIMECODE_SCALE_NS: u64 = 1_000_000; // 1 ms, per spec.md §4.8.
const BROADCAST_CAPACITY: usize = 64;

/// VP8 start-code bytes (`0x9D 0x01 0x2A`) identify the first keyframe,
/// with a 14-bit little-endian width/height pair following at offset 3
/// (spec.md §4.8).
const VP8_START_CODE: [u8; 3] = [0x9D, 0x01, 0x2A];

#[derive(Debug, Clone, Copy)]
pub struct FrameDims {
    pub width: u16,
    pub height: u16,
}

/// Depacketizes VP8/Opus RTP into accumulated frames, tracks dimensions,
/// and emits WebM chunks (init segment once, then per-frame clusters) onto
/// a broadcast channel that WebSocket handlers subscribe to.
pub struct WebmMux {
    video_acc: Mutex<BytesMut>,
    dims: Mutex<Option<FrameDims>>,
    init_segment: Mutex<Option<BytesMut>>,
    last_keyframe_cluster: Mutex<Option<BytesMut>>,
    video_base_ts: AtomicI64,
    audio_base_ts: AtomicI64,
    video_base_set: AtomicBool,
    audio_base_set: AtomicBool,
    audio_queue: Mutex<Vec<(i64, Vec<u8>)>>,
    chunks: broadcast::Sender<BytesMut>,
    pub pli_deadline_hit: AtomicBool,
}

impl WebmMux {
    pub fn new() -> Self {
        let (chunks, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            video_acc: Mutex::new(BytesMut::new()),
            dims: Mutex::new(None),
            init_segment: Mutex::new(None),
            last_keyframe_cluster: Mutex::new(None),
            video_base_ts: AtomicI64::new(0),
            audio_base_ts: AtomicI64::new(0),
            video_base_set: AtomicBool::new(false),
            audio_base_set: AtomicBool::new(false),
            audio_queue: Mutex::new(Vec::new()),
            chunks,
            pli_deadline_hit: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BytesMut> {
        self.chunks.subscribe()
    }

    /// True until the first VP8 keyframe has produced an init segment —
    /// used by the PLI watchdog to decide whether to keep requesting one.
    pub fn needs_keyframe(&self) -> bool {
        self.init_segment.lock().is_none()
    }

    /// Replays the cached init segment and last-keyframe cluster so a
    /// newly connecting browser starts from a clean decoder state
    /// (spec.md §4.8 "On subscribe").
    pub fn replay_cache(&self) -> Vec<BytesMut> {
        let mut out = Vec::new();
        if let Some(init) = self.init_segment.lock().clone() {
            out.push(init);
        }
        if let Some(cluster) = self.last_keyframe_cluster.lock().clone() {
            out.push(cluster);
        }
        out
    }

    /// RTP timestamp / 90 (90 kHz clock) (spec.md §4.8).
    pub fn video_ts_to_ms(rtp_ts: u32) -> i64 {
        (rtp_ts as i64) / 90
    }

    /// RTP timestamp / 48 (48 kHz clock) (spec.md §4.8).
    pub fn audio_ts_to_ms(rtp_ts: u32) -> i64 {
        (rtp_ts as i64) / 48
    }

    /// Accumulates one VP8 RTP payload; on `marker` (end of frame), tries
    /// to complete a frame. Returns `true` if a video frame was emitted
    /// this call.
    pub fn push_vp8_payload(&self, payload: &[u8], marker: bool, rtp_ts: u32) -> bool {
        self.video_acc.lock().extend_from_slice(payload);
        if !marker {
            return false;
        }
        let frame = std::mem::take(&mut *self.video_acc.lock());
        if frame.len() < 10 {
            return false;
        }
        let is_keyframe = (frame[0] & 0x01) == 0;
        if is_keyframe && self.dims.lock().is_none() {
            if let Some(dims) = detect_vp8_dims(&frame) {
                *self.dims.lock() = Some(dims);
            }
        }
        let Some(dims) = *self.dims.lock() else {
            return false;
        };

        if self.init_segment.lock().is_none() && is_keyframe {
            let init = build_init_segment(dims);
            *self.init_segment.lock() = Some(init.clone());
            let _ = self.chunks.send(init);
        }
        if self.init_segment.lock().is_none() {
            // No init segment yet (waiting for the first keyframe) — drop
            // non-keyframe data rather than emit an undecodable stream.
            return false;
        }

        let rel_ts = self.normalize_video_ts(rtp_ts);
        let audio_frames = self.drain_audio_before(rel_ts);

        // Clusters use unknown size (like the Segment) so SimpleBlocks can
        // keep streaming into the currently open one without rewriting a
        // length field — a new Cluster element is only emitted when a
        // keyframe opens one; non-keyframes append bare SimpleBlocks that
        // belong to whichever Cluster is currently open on the wire.
        let mut chunk = BytesMut::new();
        if is_keyframe {
            let cluster_start = audio_frames.first().map(|(t, _)| *t).unwrap_or(rel_ts).min(rel_ts);
            write_cluster_header(&mut chunk, cluster_start.max(0) as u64);
            for (ts, bytes) in &audio_frames {
                write_simple_block(&mut chunk, 2, (ts - cluster_start) as i16, false, bytes);
            }
            write_simple_block(&mut chunk, 1, (rel_ts - cluster_start) as i16, true, &frame);
            *self.last_keyframe_cluster.lock() = Some(chunk.clone());
        } else {
            for (ts, bytes) in &audio_frames {
                write_simple_block(&mut chunk, 2, *ts as i16, false, bytes);
            }
            write_simple_block(&mut chunk, 1, rel_ts as i16, false, &frame);
        }
        let _ = self.chunks.send(chunk);
        true
    }

    pub fn push_opus_payload(&self, payload: &[u8], rtp_ts: u32) {
        if self.init_segment.lock().is_none() {
            // Queue audio until the first video keyframe establishes the
            // init segment; otherwise a lone audio frame has nowhere to go.
        }
        let rel_ts = self.normalize_audio_ts(rtp_ts);
        self.audio_queue.lock().push((rel_ts, payload.to_vec()));
    }

    fn normalize_video_ts(&self, rtp_ts: u32) -> i64 {
        let ms = Self::video_ts_to_ms(rtp_ts);
        if !self.video_base_set.swap(true, Ordering::AcqRel) {
            self.video_base_ts.store(ms, Ordering::Release);
        }
        ms - self.video_base_ts.load(Ordering::Acquire)
    }

    fn normalize_audio_ts(&self, rtp_ts: u32) -> i64 {
        let ms = Self::audio_ts_to_ms(rtp_ts);
        if !self.audio_base_set.swap(true, Ordering::AcqRel) {
            self.audio_base_ts.store(ms, Ordering::Release);
        }
        ms - self.audio_base_ts.load(Ordering::Acquire)
    }

    /// Drains queued audio frames with timestamp <= `upto_ts`, sorted by
    /// timestamp, so they can be written into the cluster ahead of the
    /// video SimpleBlock (spec.md §4.8).
    fn drain_audio_before(&self, upto_ts: i64) -> Vec<(i64, Vec<u8>)> {
        let mut queue = self.audio_queue.lock();
        let mut drained = Vec::new();
        queue.retain(|(ts, bytes)| {
            if *ts <= upto_ts {
                drained.push((*ts, bytes.clone()));
                false
            } else {
                true
            }
        });
        drained.sort_by_key(|(ts, _)| *ts);
        drained
    }
}

impl Default for WebmMux {
    fn default() -> Self {
        Self::new()
    }
}

fn detect_vp8_dims(frame: &[u8]) -> Option<FrameDims> {
    if frame.len() < 10 {
        return None;
    }
    if frame[3..6] != VP8_START_CODE {
        return None;
    }
    let w = u16::from_le_bytes([frame[6], frame[7]]) & 0x3FFF;
    let h = u16::from_le_bytes([frame[8], frame[9]]) & 0x3FFF;
    if w == 0 || h == 0 {
        return None;
    }
    Some(FrameDims { width: w, height: h })
}

/// EBML vint encoding with the length-descriptor marker bit set, the
/// smallest width that fits `value`.
fn write_vint(buf: &mut BytesMut, value: u64) {
    let mut len = 1u8;
    while (1u64 << (7 * len)) <= value && len < 8 {
        len += 1;
    }
    let marker = 1u64 << (7 * len);
    let encoded = value | marker;
    for i in (0..len).rev() {
        buf.put_u8(((encoded >> (8 * i as u64)) & 0xFF) as u8);
    }
}

fn write_ebml_element(buf: &mut BytesMut, id: &[u8], content: &[u8]) {
    buf.put_slice(id);
    write_vint(buf, content.len() as u64);
    buf.put_slice(content);
}

fn build_init_segment(dims: FrameDims) -> BytesMut {
    let mut ebml_header = BytesMut::new();
    write_ebml_element(&mut ebml_header, &[0x42, 0x82], b"webm"); // DocType
    let mut header = BytesMut::new();
    write_ebml_element(&mut header, &[0x1A, 0x45, 0xDF, 0xA3], &ebml_header); // EBML

    let mut info = BytesMut::new();
    let mut scale_buf = BytesMut::new();
    scale_buf.put_u32(TIMECODE_SCALE_NS as u32);
    write_ebml_element(&mut info, &[0x2A, 0xD7, 0xB1], &scale_buf); // TimecodeScale
    let mut info_el = BytesMut::new();
    write_ebml_element(&mut info_el, &[0x15, 0x49, 0xA9, 0x66], &info); // Info

    let mut video_track = BytesMut::new();
    let mut pixel_w = BytesMut::new();
    pixel_w.put_u16(dims.width);
    write_ebml_element(&mut video_track, &[0xB0], &pixel_w); // PixelWidth
    let mut pixel_h = BytesMut::new();
    pixel_h.put_u16(dims.height);
    write_ebml_element(&mut video_track, &[0xBA], &pixel_h); // PixelHeight

    let mut track1 = BytesMut::new();
    write_ebml_element(&mut track1, &[0xD7], &[1]); // TrackNumber
    write_ebml_element(&mut track1, &[0x83], &[1]); // TrackType = video
    write_ebml_element(&mut track1, &[0x86], b"V_VP8"); // CodecID
    write_ebml_element(&mut track1, &[0xE0], &video_track); // Video settings
    let mut track1_el = BytesMut::new();
    write_ebml_element(&mut track1_el, &[0xAE], &track1); // TrackEntry

    let mut audio_settings = BytesMut::new();
    let mut channels = BytesMut::new();
    channels.put_u8(1);
    write_ebml_element(&mut audio_settings, &[0x9F], &channels); // Channels
    let mut sample_rate = BytesMut::new();
    sample_rate.put_f32(48000.0);
    write_ebml_element(&mut audio_settings, &[0xB5], &sample_rate); // SamplingFrequency

    let opus_head = build_opus_head();

    let mut track2 = BytesMut::new();
    write_ebml_element(&mut track2, &[0xD7], &[2]); // TrackNumber
    write_ebml_element(&mut track2, &[0x83], &[2]); // TrackType = audio
    write_ebml_element(&mut track2, &[0x86], b"A_OPUS"); // CodecID
    write_ebml_element(&mut track2, &[0x63, 0xA2], &opus_head); // CodecPrivate
    write_ebml_element(&mut track2, &[0xE1], &audio_settings); // Audio settings
    let mut track2_el = BytesMut::new();
    write_ebml_element(&mut track2_el, &[0xAE], &track2); // TrackEntry

    let mut tracks_content = BytesMut::new();
    tracks_content.put_slice(&track1_el);
    tracks_content.put_slice(&track2_el);
    let mut tracks_el = BytesMut::new();
    write_ebml_element(&mut tracks_el, &[0x16, 0x54, 0xAE, 0x6B], &tracks_content); // Tracks

    // Segment is open-ended: id + unknown-size vint (all-1s), followed by
    // Info and Tracks, with Clusters streamed afterward.
    header.put_slice(&[0x18, 0x53, 0x80, 0x67]); // Segment id
    header.put_u8(0xFF); // unknown size (1-byte all-ones vint)
    header.put_slice(&info_el);
    header.put_slice(&tracks_el);
    header
}

/// Minimal OpusHead for 1-channel 48 kHz, per spec.md §4.8.
fn build_opus_head() -> BytesMut {
    let mut head = BytesMut::new();
    head.put_slice(b"OpusHead");
    head.put_u8(1); // version
    head.put_u8(1); // channel count
    head.put_u16_le(3840); // pre-skip
    head.put_u32_le(48000); // input sample rate
    head.put_i16_le(0); // output gain
    head.put_u8(0); // channel mapping family
    head
}

/// Opens a Cluster with unknown size (same 1-byte all-ones vint the
/// Segment uses) so SimpleBlocks can be appended to the live stream
/// afterward without having to patch a length field in already-sent bytes.
fn write_cluster_header(buf: &mut BytesMut, timecode_ms: u64) {
    buf.put_slice(&[0x1F, 0x43, 0xB6, 0x75]); // Cluster id
    buf.put_u8(0xFF); // unknown size
    write_ebml_element(buf, &[0xE7], &timecode_buf_to_bytes(timecode_ms)); // Timecode
}

fn timecode_buf_to_bytes(value: u64) -> Vec<u8> {
    let bytes_needed = (64 - value.leading_zeros()).div_ceil(8).max(1);
    let mut out = Vec::with_capacity(bytes_needed as usize);
    for i in (0..bytes_needed).rev() {
        out.push(((value >> (8 * i)) & 0xFF) as u8);
    }
    out
}

/// SimpleBlock (EBML id `0xA3`): vint(track_num) + int16-BE(relative_ms) +
/// flags (0x80 keyframe else 0x00) + payload (spec.md §4.8).
fn write_simple_block(buf: &mut BytesMut, track_num: u64, relative_ms: i16, keyframe: bool, payload: &[u8]) {
    let mut content = BytesMut::new();
    write_vint(&mut content, track_num);
    content.put_i16(relative_ms);
    content.put_u8(if keyframe { 0x80 } else { 0x00 });
    content.put_slice(payload);
    write_ebml_element(buf, &[0xA3], &content);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vint_roundtrip_small_value() {
        let mut buf = BytesMut::new();
        write_vint(&mut buf, 5);
        assert_eq!(buf.as_ref(), &[0x85]);
    }

    #[test]
    fn video_clock_division_matches_spec() {
        assert_eq!(WebmMux::video_ts_to_ms(90_000), 1000);
    }

    #[test]
    fn audio_clock_division_matches_spec() {
        assert_eq!(WebmMux::audio_ts_to_ms(48_000), 1000);
    }

    #[test]
    fn detects_vp8_dims_from_start_code() {
        let mut frame = vec![0u8; 10];
        frame[3] = 0x9D;
        frame[4] = 0x01;
        frame[5] = 0x2A;
        frame[6..8].copy_from_slice(&640u16.to_le_bytes());
        frame[8..10].copy_from_slice(&480u16.to_le_bytes());
        let dims = detect_vp8_dims(&frame).unwrap();
        assert_eq!(dims.width, 640);
        assert_eq!(dims.height, 480);
    }

    #[test]
    fn rejects_frame_without_start_code() {
        let frame = vec![0u8; 10];
        assert!(detect_vp8_dims(&frame).is_none());
    }

    #[test]
    fn first_keyframe_emits_init_segment_once() {
        let mux = WebmMux::new();
        let mut rx = mux.subscribe();
        let mut frame = vec![0u8; 16];
        frame[0] = 0x00; // keyframe bit clear
        frame[3] = 0x9D;
        frame[4] = 0x01;
        frame[5] = 0x2A;
        frame[6..8].copy_from_slice(&320u16.to_le_bytes());
        frame[8..10].copy_from_slice(&240u16.to_le_bytes());
        assert!(mux.push_vp8_payload(&frame, true, 90_000));
        let init = rx.try_recv().unwrap();
        assert!(init.as_ref().starts_with(&[0x1A, 0x45, 0xDF, 0xA3]));
        let cluster = rx.try_recv().unwrap();
        assert!(!cluster.is_empty());
        assert!(mux.replay_cache().len() == 2);
    }
}
