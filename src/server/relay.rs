use std::time::Duration;

use bytes::Bytes;
use tokio::select;
use tracing::{debug, instrument, trace};

use crate::dial::{read_object, write_object, StreamDialRequest, StreamDialResponse};
use crate::error::DmsgError;
use crate::mux::MuxStream;
use crate::server::ServerInner;
use crate::session::Session;


/// Relays one dial request arriving from `src_session`, and if the destination accepts it, copies
///  data between the two sub-streams until either side closes.
///
/// Request and response pass through unmodified: they are signed by the two clients, and the
///  stream payload is encrypted end to end. Requests the server can not forward get a rejection
///  signed by the server.
#[instrument(skip_all, fields(src = %src_session.remote_pk().short()))]
pub(super) async fn proxy_stream(inner: &ServerInner, src_session: &Session, mut src_sub: MuxStream) -> anyhow::Result<()> {
    let timeout = inner.config.handshake_timeout;

    let raw_req = with_timeout(timeout, read_object(&mut src_sub)).await?;
    let req = StreamDialRequest::try_deser(&mut raw_req.as_ref())?;

    let (dst_sub, raw_resp, accepted) = match forward_request(inner, src_session, &req, &raw_req).await {
        Ok(forwarded) => forwarded,
        Err(e) => {
            debug!(dst = %req.dst.short(), "rejecting dial request: {}", e);
            let code_carrier = DmsgError::of(&e).cloned().unwrap_or(DmsgError::UnknownErrorCode(0));
            let resp = StreamDialResponse::reject(req.hash(), &code_carrier, &inner.sk);
            with_timeout(timeout, write_object(&mut src_sub, &resp.to_bytes())).await?;
            return Err(e);
        }
    };

    with_timeout(timeout, write_object(&mut src_sub, &raw_resp)).await?;
    if !accepted {
        debug!(dst = %req.dst.short(), "destination rejected dial request");
        return Ok(());
    }

    trace!(src = %req.src.short(), dst = %req.dst.short(), "relaying stream");
    copy_bidirectional(inner, src_sub, dst_sub).await;
    trace!(src = %req.src.short(), dst = %req.dst.short(), "stream closed");
    Ok(())
}

/// forwards the raw request to the destination's session, returning the destination's sub-stream
///  and its verified raw response
async fn forward_request(inner: &ServerInner, src_session: &Session, req: &StreamDialRequest, raw_req: &[u8]) -> anyhow::Result<(MuxStream, Bytes, bool)> {
    // the request's source must be the client it came from
    if req.src.pk != src_session.remote_pk() {
        return Err(DmsgError::ReqInvalidSrcPk.into());
    }
    inner.tracker.verify(req)?;

    let dst_session = inner.registry.session(&req.dst.pk)
        .ok_or(DmsgError::ReqNoSession)?;
    let mut dst_sub = dst_session.open_sub_stream()
        .map_err(|_| DmsgError::ReqNoSession)?;

    let timeout = inner.config.handshake_timeout;
    with_timeout(timeout, write_object(&mut dst_sub, raw_req)).await?;
    let raw_resp = with_timeout(timeout, read_object(&mut dst_sub)).await?;

    let resp = StreamDialResponse::try_deser(&mut raw_resp.as_ref())?;
    if let Err(e) = resp.verify(&req.dst.pk, &req.hash(), None) {
        // a valid rejection is passed on, anything else is a protocol violation by the destination
        if resp.accepted || matches!(e, DmsgError::RespInvalidSig | DmsgError::RespInvalidHash) {
            return Err(e.into());
        }
    }
    Ok((dst_sub, raw_resp, resp.accepted))
}

async fn copy_bidirectional(inner: &ServerInner, src_sub: MuxStream, dst_sub: MuxStream) {
    let (mut src_read, mut src_write) = tokio::io::split(src_sub);
    let (mut dst_read, mut dst_write) = tokio::io::split(dst_sub);

    // the first direction to end closes both sub-streams when they are dropped
    select! {
        result = tokio::io::copy(&mut src_read, &mut dst_write) => {
            if let Err(e) = result {
                debug!("error relaying from source: {}", e);
            }
        }
        result = tokio::io::copy(&mut dst_read, &mut src_write) => {
            if let Err(e) = result {
                debug!("error relaying from destination: {}", e);
            }
        }
        _ = inner.cancel.cancelled() => {}
    }
}

async fn with_timeout<T>(timeout: Duration, f: impl std::future::Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    match tokio::time::timeout(timeout, f).await {
        Ok(result) => result,
        Err(_) => Err(DmsgError::HandshakeTimeout.into()),
    }
}
