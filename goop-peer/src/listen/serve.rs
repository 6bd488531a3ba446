//! Host-side responder for `/goop/listen/1.0.0` (spec.md §4.7): answers a
//! `LISTEN <group_id>` request with the currently-loaded track, then
//! streams its bytes until a stop condition fires.
//!
//! Grounded on `node::site::serve_site_request`'s request/respond shape,
//! generalized from a whole-file response to a long-lived byte stream with
//! periodic stop-condition polling.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{GoopError, GoopResult};
use crate::listen::queue::TrackKind;
use crate::listen::stream::{read_listen_request, write_err, write_ok_header, READ_CHUNK, STOP_CHECK_INTERVAL_READS};
use crate::listen::ListenManager;

/// The HTTP-proxy watchdog cancels a stalled or paused stream check every
/// 500 ms (spec.md §4.7).
const HTTP_WATCHDOG_INTERVAL: Duration = Duration::from_millis(500);

impl ListenManager {
    /// Registered as the `/goop/listen/1.0.0` stream handler.
    pub async fn serve_audio_request(
        self: &Arc<Self>,
        mut send: iroh::endpoint::SendStream,
        recv: iroh::endpoint::RecvStream,
    ) -> GoopResult<()> {
        let (group_id, _reader) = read_listen_request(recv).await?;
        let Some(entry) = self.current_entry_for(&group_id) else {
            write_err(&mut send, "not hosting requested group").await?;
            let _ = send.finish();
            return Ok(());
        };
        write_ok_header(&mut send, &entry.format, entry.bitrate_kbps, entry.duration).await?;
        let result = match entry.kind {
            TrackKind::File => self.stream_file(&mut send, &group_id, &entry.path).await,
            TrackKind::Stream => self.stream_http(&mut send, &group_id, &entry.path).await,
        };
        let _ = send.finish();
        result
    }

    /// Flow control for local files: no rate limiting — TCP back-pressure
    /// plus the browser's audio-element buffer naturally pace the writer.
    /// Stop conditions are polled every `STOP_CHECK_INTERVAL_READS` reads.
    async fn stream_file(
        self: &Arc<Self>,
        send: &mut iroh::endpoint::SendStream,
        group_id: &str,
        path: &str,
    ) -> GoopResult<()> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; READ_CHUNK];
        let mut reads: u32 = 0;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            send.write_all(&buf[..n]).await?;
            reads += 1;
            if reads % STOP_CHECK_INTERVAL_READS == 0 && !self.still_streaming(group_id) {
                break;
            }
        }
        Ok(())
    }

    /// HTTP stream URLs are proxied through a cancellable loop; a 500 ms
    /// watchdog cancels on pause/close/group-mismatch (spec.md §4.7).
    async fn stream_http(
        self: &Arc<Self>,
        send: &mut iroh::endpoint::SendStream,
        group_id: &str,
        url: &str,
    ) -> GoopResult<()> {
        use tokio_stream::StreamExt;

        let client = reqwest::Client::new();
        let resp = client
            .get(url)
            .send()
            .await
            .map_err(|e| GoopError::Unreachable(format!("stream proxy fetch {url}: {e}")))?;
        let mut body = resp.bytes_stream();
        loop {
            tokio::select! {
                chunk = body.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            send.write_all(&bytes).await?;
                        }
                        Some(Err(e)) => {
                            return Err(GoopError::Unreachable(format!("stream proxy read {url}: {e}")));
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(HTTP_WATCHDOG_INTERVAL) => {
                    if !self.still_streaming(group_id) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
