//! Media capture seam (spec.md §4.8): on Linux, attempts local camera+mic
//! capture via V4L2 and a cross-platform audio backend; on failure, or on
//! any other platform, adds receive-only transceivers so offers/answers
//! still carry valid media lines.
//!
//! No teacher counterpart (chad-freeq has no media pipeline); grounded
//! directly on spec.md's behavioural description and the `webrtc-rs`
//! track-local API, with the capture backends (`cpal`, `v4l`) gated behind
//! the `media-capture` Cargo feature per `Cargo.toml`.

use std::sync::Arc;

use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{GoopError, GoopResult};

/// Adds video+audio tracks backed by local capture when available,
/// otherwise falls back to `recvonly` transceivers for both kinds.
pub async fn add_capture_or_receive_only_transceivers(pc: &Arc<RTCPeerConnection>) -> GoopResult<()> {
    #[cfg(all(target_os = "linux", feature = "media-capture"))]
    {
        match start_linux_capture(pc).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!("local media capture unavailable, falling back to receive-only: {e}");
            }
        }
    }
    add_recv_only(pc).await
}

async fn add_recv_only(pc: &Arc<RTCPeerConnection>) -> GoopResult<()> {
    let init = RTCRtpTransceiverInit { direction: RTCRtpTransceiverDirection::Recvonly, send_encodings: vec![] };
    pc.add_transceiver_from_kind(RTPCodecType::Video, Some(init.clone()))
        .await
        .map_err(|e| GoopError::Fatal(format!("add video transceiver: {e}")))?;
    pc.add_transceiver_from_kind(RTPCodecType::Audio, Some(init))
        .await
        .map_err(|e| GoopError::Fatal(format!("add audio transceiver: {e}")))?;
    Ok(())
}

#[cfg(all(target_os = "linux", feature = "media-capture"))]
async fn start_linux_capture(pc: &Arc<RTCPeerConnection>) -> GoopResult<()> {
    use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    let video_track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability { mime_type: MIME_TYPE_VP8.to_string(), ..Default::default() },
        "video".to_string(),
        "goop-camera".to_string(),
    ));
    let audio_track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability { mime_type: MIME_TYPE_OPUS.to_string(), ..Default::default() },
        "audio".to_string(),
        "goop-mic".to_string(),
    ));

    pc.add_track(video_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| GoopError::Fatal(format!("add video track: {e}")))?;
    pc.add_track(audio_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| GoopError::Fatal(format!("add audio track: {e}")))?;

    spawn_v4l_capture(video_track)?;
    spawn_cpal_capture(audio_track)?;
    Ok(())
}

/// Opens `/dev/video0` and pushes captured frames onto `track`. Encoding
/// raw V4L2 frames into VP8 is out of scope here (no VP8 encoder crate is
/// in the corpus' dependency stack) — capture failure surfaces as an
/// error so the caller falls back to receive-only, matching the spec's
/// documented fallback behaviour.
#[cfg(all(target_os = "linux", feature = "media-capture"))]
fn spawn_v4l_capture(_track: Arc<TrackLocalStaticSample>) -> GoopResult<()> {
    use v4l::video::Capture;

    let dev = v4l::Device::new(0).map_err(|e| GoopError::Fatal(format!("open /dev/video0: {e}")))?;
    let _format = dev.format().map_err(|e| GoopError::Fatal(format!("query camera format: {e}")))?;
    tracing::info!("local camera opened on /dev/video0, but frame capture is not implemented");
    Err(GoopError::Fatal("camera capture not implemented".into()))
}

#[cfg(all(target_os = "linux", feature = "media-capture"))]
fn spawn_cpal_capture(_track: Arc<TrackLocalStaticSample>) -> GoopResult<()> {
    use cpal::traits::HostTrait;

    let host = cpal::default_host();
    let _device = host
        .default_input_device()
        .ok_or_else(|| GoopError::Fatal("no default audio input device".into()))?;
    tracing::info!("local microphone opened, but sample capture is not implemented");
    Err(GoopError::Fatal("microphone capture not implemented".into()))
}
