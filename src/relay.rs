//! Relay engine
//!
//! Forwards the fuzzer's buffered request bytes verbatim, however
//! malformed, to an established upstream channel, then drains the SUT's
//! response one frame at a time until a terminal frame. Every DATA frame is
//! answered with a maximal WINDOW_UPDATE so a mutated initial window can
//! never stall the exchange mid-fuzz.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::error::Result;
use crate::frame::{encode_window_update, read_frame, write_all, FrameType, RawFrame};

/// True when this frame terminates the response drain: end-stream flag on a
/// frame type that carries one, or a GOAWAY, or a RST_STREAM. Any single
/// condition suffices.
fn is_terminal(frame: &RawFrame) -> bool {
    frame.header.has_end_stream()
        || frame.header.is_type(FrameType::GoAway)
        || frame.header.is_type(FrameType::RstStream)
}

/// Send `request` upstream unmodified and collect the raw response until a
/// terminal frame. All reads are bounded by `dur`; expiry surfaces as a
/// session-level timeout error, which the caller treats like any other
/// session failure (a crash is only ever inferred by the supervisor's
/// connect path, never here).
pub async fn exchange<S>(upstream: &mut S, request: &[u8], dur: Duration) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_all(upstream, request, dur).await?;
    trace!(len = request.len(), "request bytes forwarded upstream");

    let mut response = Vec::new();
    loop {
        let frame = read_frame(upstream, dur).await?;
        response.extend_from_slice(&frame.bytes);

        if frame.header.is_type(FrameType::Data) {
            // Replenish flow-control credit immediately in case the fuzzed
            // request shrank the window.
            write_all(upstream, &encode_window_update(), dur).await?;
        }

        if is_terminal(&frame) {
            trace!(
                kind = frame.header.kind,
                flags = frame.header.flags,
                "terminal frame, ending drain"
            );
            break;
        }
    }

    debug!(
        request_len = request.len(),
        response_len = response.len(),
        "exchange complete"
    );
    Ok(response)
}
