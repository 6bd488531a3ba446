//! `FetchSiteFile` — read one file out of a remote peer's sandboxed site
//! root over the `/goop/site/1.0.0` protocol (spec.md §4.2, §4.9).
//!
//! Grounded on the teacher's `s2s.rs` request/response framing, adapted to
//! the line protocol spec.md §4.2 specifies exactly: `GET <path>\n` and a
//! reply of either `OK <mime> <size>\n<bytes>` or `ERR <reason>\n`.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::error::{GoopError, GoopResult};
use crate::node::{P2pNode, PROTO_SITE};

const MAX_SITE_FILE_LEN: u64 = 50 * 1024 * 1024;
const MAX_HEADER_LEN: usize = 4096;

pub struct FetchedFile {
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Sends `GET <path>\n` and parses the textual response header.
pub async fn fetch_site_file(node: &P2pNode, peer_id: &str, path: &str) -> GoopResult<FetchedFile> {
    let (mut send, recv) = node.open_stream(peer_id, PROTO_SITE).await?;
    send.write_all(format!("GET {path}\n").as_bytes()).await?;
    let _ = send.finish();

    let mut reader = BufReader::new(recv);
    let mut header = String::new();
    reader
        .take(MAX_HEADER_LEN as u64)
        .read_line(&mut header)
        .await?;
    let header = header.trim_end_matches(['\r', '\n']);

    if let Some(rest) = header.strip_prefix("ERR ") {
        return Err(GoopError::NotFound(format!("{peer_id}:{path}: {rest}")));
    }
    let rest = header
        .strip_prefix("OK ")
        .ok_or_else(|| GoopError::ProtocolError(format!("malformed site response: {header}")))?;
    let mut parts = rest.splitn(2, ' ');
    let mime = parts.next().unwrap_or("application/octet-stream").to_string();
    let size: u64 = parts
        .next()
        .ok_or_else(|| GoopError::ProtocolError("missing size in site response".into()))?
        .parse()
        .map_err(|_| GoopError::ProtocolError("invalid size in site response".into()))?;
    if size > MAX_SITE_FILE_LEN {
        return Err(GoopError::ProtocolError(format!("remote site file too large: {size} bytes")));
    }
    let mut bytes = vec![0u8; size as usize];
    reader.read_exact(&mut bytes).await?;
    Ok(FetchedFile { mime, bytes })
}

/// Server-side responder, registered as the `/goop/site/1.0.0` stream
/// handler. `resolve` maps the requested relative path to `(mime, bytes)`
/// using the same sandboxing as `content_store::read` — rejecting any path
/// that escapes the site root, touches the `lua/` subtree, or exceeds
/// 50 MiB is the resolver's responsibility so that logic has one home.
pub async fn serve_site_request<F>(
    mut send: iroh::endpoint::SendStream,
    recv: iroh::endpoint::RecvStream,
    resolve: F,
) -> GoopResult<()>
where
    F: FnOnce(&str) -> GoopResult<(String, Vec<u8>)>,
{
    let mut reader = BufReader::new(recv);
    let mut line = String::new();
    reader
        .take(MAX_HEADER_LEN as u64)
        .read_line(&mut line)
        .await?;
    let line = line.trim_end_matches(['\r', '\n']);
    let path = line
        .strip_prefix("GET ")
        .ok_or_else(|| GoopError::ProtocolError("malformed site request".into()))?;

    match resolve(path) {
        Ok((mime, bytes)) => {
            send.write_all(format!("OK {mime} {}\n", bytes.len()).as_bytes()).await?;
            send.write_all(&bytes).await?;
        }
        Err(e) => {
            send.write_all(format!("ERR {e}\n").as_bytes()).await?;
        }
    }
    let _ = send.finish();
    Ok(())
}
