//! Decrypted byte splicing.
//!
//! Once both handshakes are up the terminator degenerates into two
//! unidirectional pumps, one task per direction. Every chunk passes through
//! the decrypted-segment filter hook; a veto drops the chunk and the pump
//! keeps going.

use refract_core::{Direction, FlowMetadata, PacketFilter};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

const PUMP_BUFFER: usize = 16 * 1024;

/// Splice decrypted bytes between the client and upstream until either side
/// closes. Returns (client→server, server→client) byte counts.
pub async fn splice<C, S>(
    client: C,
    upstream: S,
    meta: FlowMetadata,
    filter: Arc<dyn PacketFilter>,
) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (client_rd, client_wr) = tokio::io::split(client);
    let (upstream_rd, upstream_wr) = tokio::io::split(upstream);

    let up_meta = FlowMetadata {
        direction: Direction::ClientToServer,
        ..meta.clone()
    };
    let down_meta = FlowMetadata {
        direction: Direction::ServerToClient,
        ..meta
    };

    let up = tokio::spawn(pump(client_rd, upstream_wr, up_meta, filter.clone()));
    let down = tokio::spawn(pump(upstream_rd, client_wr, down_meta, filter));

    let sent = up.await.unwrap_or(0);
    let received = down.await.unwrap_or(0);
    debug!("Splice finished: {} up, {} down", sent, received);
    (sent, received)
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    meta: FlowMetadata,
    filter: Arc<dyn PacketFilter>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER];
    let mut total = 0u64;

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if !filter.accept_decrypted_segment(&buf[..n], &meta) {
                    trace!("Filter vetoed {} bytes {}", n, meta.direction);
                    continue;
                }
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    debug!("Pump write error {}: {}", meta.direction, e);
                    break;
                }
                total += n as u64;
            }
            Err(e) => {
                debug!("Pump read error {}: {}", meta.direction, e);
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    total
}
