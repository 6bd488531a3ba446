//! Call manager and per-channel call sessions (spec.md §4.8).
//!
//! No teacher module covers WebRTC signalling directly; this is built from
//! the `webrtc-rs` ecosystem (a Rust port of pion, matching spec.md's
//! literal pion-style API: `CreateOffer`/`SetLocalDescription`/ICE
//! candidate buffering) and structured the way the teacher structures its
//! other managers — one `Arc<Mutex<HashMap<...>>>` registry plus per-entity
//! tasks communicating over channels.

pub mod media;
pub mod mux;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rtp::codecs::vp8::Vp8Packet;
use rtp::packetizer::Depacketizer;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;

use crate::error::{GoopError, GoopResult};

const ICE_WATCHDOG_SECS: u64 = 10;
const STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const PLI_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Signalling envelope shapes, identical to browser WebRTC (spec.md §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CallSignal {
    CallRequest,
    CallAck,
    CallOffer { sdp: String },
    CallAnswer { sdp: String },
    IceCandidate { candidate: IceCandidatePayload },
    CallHangup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Carries `CallSignal`s between peers. The production binding is MQ topic
/// `call:<channel>`; tests can substitute an in-memory channel.
#[async_trait::async_trait]
pub trait Signaler: Send + Sync {
    async fn send(&self, channel: &str, remote: &str, signal: CallSignal) -> GoopResult<()>;
}

struct MqSignaler {
    mq: Arc<crate::mq::MqManager>,
}

#[async_trait::async_trait]
impl Signaler for MqSignaler {
    async fn send(&self, channel: &str, remote: &str, signal: CallSignal) -> GoopResult<()> {
        let payload = serde_json::to_value(&signal).map_err(|e| GoopError::ProtocolError(e.to_string()))?;
        self.mq.send(remote, &format!("call:{channel}"), payload).await
    }
}

pub fn mq_signaler(mq: Arc<crate::mq::MqManager>) -> Arc<dyn Signaler> {
    Arc::new(MqSignaler { mq })
}

pub struct CallSession {
    pub channel: String,
    pub remote: String,
    pc: Arc<RTCPeerConnection>,
    signaler: Arc<dyn Signaler>,
    pending_remote_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    remote_description_set: std::sync::atomic::AtomicBool,
    hangup_notify: Arc<Notify>,
    hung_up: std::sync::atomic::AtomicBool,
    offer_received: std::sync::atomic::AtomicBool,
    video_ssrc: std::sync::atomic::AtomicU32,
    pub mux: Arc<mux::WebmMux>,
}

impl CallSession {
    async fn build_peer_connection(signaler: Arc<dyn Signaler>, channel: String, remote: String) -> GoopResult<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| GoopError::Fatal(format!("webrtc codec registration failed: {e}")))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| GoopError::Fatal(format!("webrtc interceptor registration failed: {e}")))?;
        let api = APIBuilder::new().with_media_engine(media_engine).with_interceptor_registry(registry).build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer { urls: vec![STUN_SERVER.to_string()], ..Default::default() }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| GoopError::Fatal(format!("failed to create peer connection: {e}")))?,
        );

        media::add_capture_or_receive_only_transceivers(&pc).await?;

        let signaler_for_ice = signaler.clone();
        let channel_for_ice = channel.clone();
        let remote_for_ice = remote.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let signaler = signaler_for_ice.clone();
            let channel = channel_for_ice.clone();
            let remote = remote_for_ice.clone();
            Box::pin(async move {
                if let Some(c) = candidate {
                    if let Ok(init) = c.to_json() {
                        let payload = IceCandidatePayload {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        };
                        let _ = signaler.send(&channel, &remote, CallSignal::IceCandidate { candidate: payload }).await;
                    }
                }
            })
        }));

        Ok(pc)
    }

    /// Caller path (spec.md §4.8): await `call-ack` → `CreateOffer` →
    /// `SetLocalDescription` → send offer → receive answer →
    /// `SetRemoteDescription`. The await-ack step is driven externally by
    /// `CallManager::route_signal`; this method performs the offer half.
    pub async fn start_as_caller(&self, signaler: &Arc<dyn Signaler>) -> GoopResult<()> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| GoopError::ProtocolError(format!("create_offer: {e}")))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| GoopError::ProtocolError(format!("set_local_description: {e}")))?;
        signaler
            .send(&self.channel, &self.remote, CallSignal::CallOffer { sdp: offer.sdp.clone() })
            .await
    }

    /// Callee path: `SetRemoteDescription(offer)` → `CreateAnswer` →
    /// `SetLocalDescription` → send answer.
    pub async fn handle_offer(&self, signaler: &Arc<dyn Signaler>, sdp: String) -> GoopResult<()> {
        self.offer_received.store(true, std::sync::atomic::Ordering::Release);
        let desc = RTCSessionDescription::offer(sdp).map_err(|e| GoopError::ProtocolError(e.to_string()))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| GoopError::ProtocolError(format!("set_remote_description: {e}")))?;
        self.remote_description_set.store(true, std::sync::atomic::Ordering::Release);
        self.flush_pending_candidates().await;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| GoopError::ProtocolError(format!("create_answer: {e}")))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| GoopError::ProtocolError(format!("set_local_description: {e}")))?;
        signaler
            .send(&self.channel, &self.remote, CallSignal::CallAnswer { sdp: answer.sdp.clone() })
            .await
    }

    pub async fn handle_answer(&self, sdp: String) -> GoopResult<()> {
        let desc = RTCSessionDescription::answer(sdp).map_err(|e| GoopError::ProtocolError(e.to_string()))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| GoopError::ProtocolError(format!("set_remote_description: {e}")))?;
        self.remote_description_set.store(true, std::sync::atomic::Ordering::Release);
        self.flush_pending_candidates().await;
        Ok(())
    }

    /// Remote candidates arriving before `SetRemoteDescription` are
    /// buffered and flushed once the description is set (spec.md §4.8).
    pub async fn handle_remote_candidate(&self, candidate: IceCandidatePayload) {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        if self.remote_description_set.load(std::sync::atomic::Ordering::Acquire) {
            let _ = self.pc.add_ice_candidate(init).await;
        } else {
            self.pending_remote_candidates.lock().push(init);
        }
    }

    async fn flush_pending_candidates(&self) {
        let pending: Vec<_> = self.pending_remote_candidates.lock().drain(..).collect();
        for init in pending {
            let _ = self.pc.add_ice_candidate(init).await;
        }
    }

    fn spawn_connection_state_watcher(self: &Arc<Self>) {
        let session = self.clone();
        self.pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let session = session.clone();
            Box::pin(async move {
                if matches!(state, RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected) {
                    session.hangup().await;
                }
            })
        }));
    }

    /// Registers the `on_track` callback that receives the remote peer's
    /// media (spec.md §4.8): each track gets its own RTP read loop that
    /// depacketizes VP8 (Opus needs no depacketization) and feeds the
    /// result into `mux` for WebM remuxing.
    fn spawn_track_reader(self: &Arc<Self>) {
        let session = self.clone();
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let session = session.clone();
            Box::pin(async move {
                let kind = track.kind();
                if kind == RTPCodecType::Video {
                    session.video_ssrc.store(track.ssrc(), std::sync::atomic::Ordering::Release);
                }
                tokio::spawn(async move {
                    let mut depacketizer = Vp8Packet::default();
                    loop {
                        let (packet, _attrs) = match track.read_rtp().await {
                            Ok(v) => v,
                            Err(_) => break,
                        };
                        match kind {
                            RTPCodecType::Video => match depacketizer.depacketize(&packet.payload) {
                                Ok(payload) => {
                                    session.mux.push_vp8_payload(&payload, packet.header.marker, packet.header.timestamp);
                                }
                                Err(e) => tracing::debug!("vp8 depacketize failed: {e}"),
                            },
                            RTPCodecType::Audio => {
                                session.mux.push_opus_payload(&packet.payload, packet.header.timestamp);
                            }
                            _ => {}
                        }
                    }
                });
            })
        }));
    }

    /// Periodically requests a keyframe via RTCP PLI while `mux` has not
    /// yet produced an init segment (spec.md §4.8), so a late-joining
    /// browser subscriber isn't stuck waiting indefinitely for one.
    fn spawn_pli_watchdog(self: &Arc<Self>) {
        let session = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PLI_CHECK_INTERVAL);
            loop {
                interval.tick().await;
                if session.hung_up.load(std::sync::atomic::Ordering::Acquire) {
                    break;
                }
                if session.mux.needs_keyframe() {
                    session.mux.pli_deadline_hit.store(true, std::sync::atomic::Ordering::Release);
                    let ssrc = session.video_ssrc.load(std::sync::atomic::Ordering::Acquire);
                    if ssrc != 0 {
                        send_pli(&session.pc, ssrc).await;
                    }
                } else {
                    session.mux.pli_deadline_hit.store(false, std::sync::atomic::Ordering::Release);
                }
            }
        });
    }

    /// Idempotent: closes `hangup_ch`, runs cleanup, sends `call-hangup` once.
    pub async fn hangup(self: &Arc<Self>) {
        if self.hung_up.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return;
        }
        self.hangup_notify.notify_waiters();
        let _ = self.signaler.send(&self.channel, &self.remote, CallSignal::CallHangup).await;
        let _ = self.pc.close().await;
    }

    pub fn is_hung_up(&self) -> bool {
        self.hung_up.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn wait_for_hangup(&self) -> impl std::future::Future<Output = ()> + '_ {
        self.hangup_notify.notified()
    }
}

struct PendingRequest {
    created_at: std::time::Instant,
}

pub struct CallManager {
    signaler: Arc<dyn Signaler>,
    local_peer_id: String,
    sessions: Mutex<HashMap<String, Arc<CallSession>>>,
    pending_requests: Mutex<HashMap<String, PendingRequest>>,
}

impl CallManager {
    pub fn new(signaler: Arc<dyn Signaler>, local_peer_id: String) -> Arc<Self> {
        Arc::new(Self {
            signaler,
            local_peer_id,
            sessions: Mutex::new(HashMap::new()),
            pending_requests: Mutex::new(HashMap::new()),
        })
    }

    /// Deduplicates `call-request` per channel: the first arrival creates a
    /// pending record, subsequent duplicates are ignored (spec.md §4.8,
    /// §3 invariant).
    pub fn note_call_request(&self, channel: &str) -> bool {
        let mut pending = self.pending_requests.lock();
        if pending.contains_key(channel) {
            false
        } else {
            pending.insert(channel.to_string(), PendingRequest { created_at: std::time::Instant::now() });
            true
        }
    }

    pub async fn start_call(&self, channel: &str, remote: &str) -> GoopResult<Arc<CallSession>> {
        let pc = CallSession::build_peer_connection(self.signaler.clone(), channel.to_string(), remote.to_string()).await?;
        let session = Arc::new(CallSession {
            channel: channel.to_string(),
            remote: remote.to_string(),
            pc,
            signaler: self.signaler.clone(),
            pending_remote_candidates: Mutex::new(Vec::new()),
            remote_description_set: std::sync::atomic::AtomicBool::new(false),
            hangup_notify: Arc::new(Notify::new()),
            hung_up: std::sync::atomic::AtomicBool::new(false),
            offer_received: std::sync::atomic::AtomicBool::new(false),
            video_ssrc: std::sync::atomic::AtomicU32::new(0),
            mux: Arc::new(mux::WebmMux::new()),
        });
        session.spawn_connection_state_watcher();
        session.spawn_track_reader();
        session.spawn_pli_watchdog();
        self.sessions.lock().insert(channel.to_string(), session.clone());
        Ok(session)
    }

    /// `AcceptCall` → creates callee-side session and sends `call-ack`; if
    /// the send fails (channel already closed), aborts and cleans up
    /// (spec.md §4.8).
    pub async fn accept_call(&self, channel: &str, remote: &str) -> GoopResult<Arc<CallSession>> {
        let pc = CallSession::build_peer_connection(self.signaler.clone(), channel.to_string(), remote.to_string()).await?;
        let session = Arc::new(CallSession {
            channel: channel.to_string(),
            remote: remote.to_string(),
            pc,
            signaler: self.signaler.clone(),
            pending_remote_candidates: Mutex::new(Vec::new()),
            remote_description_set: std::sync::atomic::AtomicBool::new(false),
            hangup_notify: Arc::new(Notify::new()),
            hung_up: std::sync::atomic::AtomicBool::new(false),
            offer_received: std::sync::atomic::AtomicBool::new(false),
            video_ssrc: std::sync::atomic::AtomicU32::new(0),
            mux: Arc::new(mux::WebmMux::new()),
        });
        session.spawn_connection_state_watcher();
        session.spawn_track_reader();
        session.spawn_pli_watchdog();

        if let Err(e) = self.signaler.send(channel, remote, CallSignal::CallAck).await {
            let _ = session.pc.close().await;
            return Err(e);
        }
        self.sessions.lock().insert(channel.to_string(), session.clone());
        spawn_offer_watchdog(session.clone());
        Ok(session)
    }

    /// Routes `call-ack`/`call-offer`/`call-answer`/`ice-candidate` to the
    /// matching session; ignores others with an informational log.
    pub async fn route_signal(self: &Arc<Self>, channel: &str, signal: CallSignal) -> GoopResult<()> {
        let session = self.sessions.lock().get(channel).cloned();
        let Some(session) = session else {
            tracing::info!(channel, "signal for unknown call session ignored");
            return Ok(());
        };
        match signal {
            CallSignal::CallAck => {
                session.start_as_caller(&self.signaler).await?;
            }
            CallSignal::CallOffer { sdp } => {
                session.handle_offer(&self.signaler, sdp).await?;
            }
            CallSignal::CallAnswer { sdp } => {
                session.handle_answer(sdp).await?;
            }
            CallSignal::IceCandidate { candidate } => {
                session.handle_remote_candidate(candidate).await;
            }
            CallSignal::CallHangup => {
                session.hangup().await;
                self.sessions.lock().remove(channel);
            }
            CallSignal::CallRequest => {
                tracing::info!(channel, "ignoring duplicate call-request on an active session");
            }
        }
        Ok(())
    }

    /// Cancels all sessions.
    pub async fn close(&self) {
        let sessions: Vec<Arc<CallSession>> = self.sessions.lock().drain().map(|(_, v)| v).collect();
        for session in sessions {
            session.hangup().await;
        }
    }

    /// Looks up the live session for a channel, if any — used by the
    /// browser media-delivery WebSocket to find the mux to stream from.
    pub fn session(&self, channel: &str) -> Option<Arc<CallSession>> {
        self.sessions.lock().get(channel).cloned()
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }
}

/// Sends a Picture Loss Indication for `media_ssrc` asking the remote
/// encoder to produce a fresh keyframe (spec.md §4.8).
async fn send_pli(pc: &RTCPeerConnection, media_ssrc: u32) {
    let pli = PictureLossIndication { sender_ssrc: 0, media_ssrc };
    let _ = pc.write_rtcp(&[Box::new(pli)]).await;
}

pub fn offer_watchdog_duration() -> Duration {
    Duration::from_secs(ICE_WATCHDOG_SECS)
}

/// Logs a warning if `call-offer` hasn't arrived within the watchdog
/// duration of accepting a call (spec.md §4.8).
fn spawn_offer_watchdog(session: Arc<CallSession>) {
    tokio::spawn(async move {
        tokio::time::sleep(offer_watchdog_duration()).await;
        if !session.hung_up.load(std::sync::atomic::Ordering::Acquire)
            && !session.offer_received.load(std::sync::atomic::Ordering::Acquire)
        {
            tracing::warn!(channel = %session.channel, remote = %session.remote, "no call-offer received within watchdog window");
        }
    });
}
