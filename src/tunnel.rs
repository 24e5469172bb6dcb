//! Opaque byte splicing for established CONNECT tunnels.

use crate::error::ProxyError;
use crate::session::Session;
use log::trace;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Byte counts moved by a finished tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_origin: u64,
    pub origin_to_client: u64,
}

/// Copies bytes both ways until each side has closed its write half.
///
/// Bytes the sessions buffered past the last HTTP message are delivered to
/// the opposite side first, so nothing the client pipelined after the
/// CONNECT head is lost.
pub async fn splice<A, B>(downstream: &mut Session<A>, upstream: &mut Session<B>) -> Result<TunnelStats, ProxyError>
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let early_up = downstream.take_buffered();
    let early_down = upstream.take_buffered();

    if !early_up.is_empty() {
        trace!("Flushing {} early client bytes into tunnel", early_up.len());
        upstream
            .stream_mut()
            .write_all(&early_up)
            .await
            .map_err(ProxyError::transport)?;
    }
    if !early_down.is_empty() {
        downstream
            .stream_mut()
            .write_all(&early_down)
            .await
            .map_err(ProxyError::transport)?;
    }

    let (up, down) = tokio::io::copy_bidirectional(downstream.stream_mut(), upstream.stream_mut())
        .await
        .map_err(ProxyError::transport)?;

    Ok(TunnelStats {
        client_to_origin: up + early_up.len() as u64,
        origin_to_client: down + early_down.len() as u64,
    })
}
