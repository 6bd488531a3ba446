//! Mutual identify exchange run immediately after a connection accepts
//! (spec.md §4.2): each side sends its peer ID, profile summary and
//! supported protocol list, then both sides update the peer table /
//! cached-peer store's protocol column.
//!
//! Grounded on the teacher's `s2s.rs` handshake framing: a single
//! length-prefixed JSON frame written and read on the freshly opened
//! bidirectional stream before any application data flows.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{GoopError, GoopResult};
use crate::node::{IdentifyInfo, ALL_PROTOCOLS};

/// Wire frame for the identify exchange. `protocols` lists the ALPN names
/// (as UTF-8 strings) the sender supports, so the far side can avoid
/// opening a doomed stream for an unsupported protocol (spec.md §4.5
/// `UnsupportedByPeer`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyFrame {
    pub peer_id: String,
    pub content: String,
    pub protocols: BTreeSet<String>,
}

const MAX_FRAME_LEN: u32 = 64 * 1024;

impl IdentifyFrame {
    pub fn local(peer_id: String, content: String) -> Self {
        let protocols = ALL_PROTOCOLS.iter().map(|p| String::from_utf8_lossy(p).to_string()).collect();
        Self { peer_id, content, protocols }
    }
}

pub async fn write_frame<W: AsyncWriteExt + Unpin>(w: &mut W, frame: &IdentifyFrame) -> GoopResult<()> {
    let bytes = serde_json::to_vec(frame).map_err(|e| GoopError::ProtocolError(e.to_string()))?;
    if bytes.len() as u32 > MAX_FRAME_LEN {
        return Err(GoopError::ProtocolError("identify frame too large".into()));
    }
    w.write_u32(bytes.len() as u32).await?;
    w.write_all(&bytes).await?;
    Ok(())
}

pub async fn read_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> GoopResult<IdentifyFrame> {
    let len = r.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(GoopError::ProtocolError("identify frame too large".into()));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| GoopError::ProtocolError(e.to_string()))
}

impl From<IdentifyFrame> for IdentifyInfo {
    fn from(f: IdentifyFrame) -> Self {
        IdentifyInfo { peer_id: f.peer_id, protocols: f.protocols }
    }
}
