//! `LISTEN <group_id>` audio stream wire protocol over
//! `/goop/listen/1.0.0` (spec.md §4.7, §6).
//!
//! Grounded on the teacher's `s2s.rs` line-then-bytes framing, the same
//! shape as `node::site`'s `GET`/`OK`/`ERR` protocol but carrying raw audio
//! bytes instead of a whole file.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::error::{GoopError, GoopResult};
use crate::node::{P2pNode, PROTO_LISTEN};

const MAX_HEADER_LEN: usize = 512;
/// Stop conditions are checked every ~10 reads of this chunk size
/// (spec.md §4.7).
pub const READ_CHUNK: usize = 4096;
pub const STOP_CHECK_INTERVAL_READS: u32 = 10;

pub struct StreamHeader {
    pub format: String,
    pub bitrate_kbps: u32,
    pub duration_secs: f64,
}

/// Listener side: sends `LISTEN <group_id>\n`, parses the reply header,
/// and returns a reader for the raw audio bytes that follow.
pub async fn request_listen_stream(
    node: &P2pNode,
    host_peer: &str,
    group_id: &str,
) -> GoopResult<(StreamHeader, impl tokio::io::AsyncRead + Unpin)> {
    let (mut send, recv) = node.open_stream(host_peer, PROTO_LISTEN).await?;
    send.write_all(format!("LISTEN {group_id}\n").as_bytes()).await?;
    let _ = send.finish();

    let mut reader = BufReader::new(recv);
    let mut line = String::new();
    reader.take(MAX_HEADER_LEN as u64).read_line(&mut line).await?;
    let line = line.trim_end_matches(['\r', '\n']);

    if let Some(reason) = line.strip_prefix("ERR ") {
        return Err(GoopError::NotFound(format!("{host_peer}:{group_id}: {reason}")));
    }
    let rest = line
        .strip_prefix("OK ")
        .ok_or_else(|| GoopError::ProtocolError(format!("malformed listen response: {line}")))?;
    let mut parts = rest.split(' ');
    let format = parts.next().unwrap_or("mp3").to_string();
    let bitrate_kbps: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let duration_secs: f64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);

    Ok((StreamHeader { format, bitrate_kbps, duration_secs }, reader))
}

/// Host side: reads `LISTEN <group_id>\n`, returns the requested group id
/// so the caller can validate it against an active hosted group and
/// respond with `write_ok_header`/`write_err`.
pub async fn read_listen_request(
    recv: iroh::endpoint::RecvStream,
) -> GoopResult<(String, BufReader<iroh::endpoint::RecvStream>)> {
    let mut reader = BufReader::new(recv);
    let mut line = String::new();
    reader.take(MAX_HEADER_LEN as u64).read_line(&mut line).await?;
    let line = line.trim_end_matches(['\r', '\n']);
    let group_id = line
        .strip_prefix("LISTEN ")
        .ok_or_else(|| GoopError::ProtocolError("malformed listen request".into()))?
        .to_string();
    Ok((group_id, reader))
}

pub async fn write_ok_header(
    send: &mut iroh::endpoint::SendStream,
    format: &str,
    bitrate_kbps: u32,
    duration_secs: f64,
) -> GoopResult<()> {
    send.write_all(format!("OK {format} {bitrate_kbps} {duration_secs}\n").as_bytes()).await?;
    Ok(())
}

pub async fn write_err(send: &mut iroh::endpoint::SendStream, reason: &str) -> GoopResult<()> {
    send.write_all(format!("ERR {reason}\n").as_bytes()).await?;
    Ok(())
}
