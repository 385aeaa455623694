//! Dual-role HTTP/2 handshake orchestrator
//!
//! The same preface/SETTINGS exchange is driven from two sides: as a client
//! toward the SUT (after the TLS+ALPN step in `tls.rs`) and, optionally, as
//! a server toward the fuzzer. Message order and expectation checks differ
//! by role; the frame construction is shared via `frame.rs`.
//!
//! Generic over the channel so production TLS streams and in-memory test
//! pipes run the exact same code.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, trace};

use crate::error::{RelayError, Result};
use crate::frame::{
    encode_handshake_settings, encode_settings_ack, read_frame, write_all, FrameType,
    CONNECTION_PREFACE,
};

/// Which side of the exchange we are driving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Relay to SUT: send preface, send SETTINGS, wait for the peer's ack
    Client,
    /// Fuzzer to relay: validate preface, validate SETTINGS, never wait for
    /// the peer's ack
    Server,
}

/// Handshake progression. `Failed` is absorbing: any I/O error, timeout or
/// protocol violation lands there and the context is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    TransportConnecting,
    TransportSecured,
    PrefaceSent,
    SettingsSent,
    AwaitingPeerSettings,
    AwaitingSettingsAck,
    Established,
    Failed,
}

/// Per-attempt handshake record, discarded at `Established` or `Failed`
#[derive(Debug)]
pub struct HandshakeContext {
    pub role: Role,
    pub stage: Stage,
    /// ALPN id the transport negotiated, when TLS was involved
    pub alpn: Option<String>,
}

impl HandshakeContext {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            stage: Stage::Idle,
            alpn: None,
        }
    }

    pub fn is_established(&self) -> bool {
        self.stage == Stage::Established
    }

    fn advance(&mut self, stage: Stage) {
        trace!(role = ?self.role, from = ?self.stage, to = ?stage, "handshake stage");
        self.stage = stage;
    }

    fn fail(&mut self, err: RelayError) -> RelayError {
        self.stage = Stage::Failed;
        err
    }

    /// Client-role procedure over an already-secured channel: preface, own
    /// SETTINGS, then a filter loop that discards every frame which is not
    /// a SETTINGS ack. The filter has no escape other than the per-read
    /// timeout. Finally acks the peer's SETTINGS.
    pub async fn run_client<S>(&mut self, io: &mut S, dur: Duration) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug_assert_eq!(self.role, Role::Client);
        self.advance(Stage::TransportSecured);

        if let Err(e) = write_all(io, CONNECTION_PREFACE, dur).await {
            return Err(self.fail(e));
        }
        self.advance(Stage::PrefaceSent);

        if let Err(e) = write_all(io, &encode_handshake_settings(), dur).await {
            return Err(self.fail(e));
        }
        self.advance(Stage::SettingsSent);
        self.advance(Stage::AwaitingPeerSettings);

        // The SUT's own SETTINGS, PING probes and stray WINDOW_UPDATEs are
        // all discarded until the ack for our SETTINGS shows up.
        self.advance(Stage::AwaitingSettingsAck);
        loop {
            let raw = match read_frame(io, dur).await {
                Ok(raw) => raw,
                Err(e) => return Err(self.fail(e)),
            };
            if raw.header.is_settings_ack() {
                break;
            }
            trace!(kind = raw.header.kind, "discarding non-ack frame during handshake");
        }

        if let Err(e) = write_all(io, &encode_settings_ack(), dur).await {
            return Err(self.fail(e));
        }

        self.advance(Stage::Established);
        debug!(role = ?self.role, "handshake established");
        Ok(())
    }

    /// Server-role procedure: exact preface, a first frame that must be
    /// SETTINGS, then own SETTINGS and an ack. The peer's ack is not waited
    /// for: fuzz harnesses are not required to send one, and blocking here
    /// would stall every session. Intentional relaxation, keep it.
    pub async fn run_server<S>(&mut self, io: &mut S, dur: Duration) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug_assert_eq!(self.role, Role::Server);
        self.advance(Stage::TransportSecured);

        let mut preface = [0u8; CONNECTION_PREFACE.len()];
        match tokio::time::timeout(dur, io.read_exact(&mut preface)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(self.fail(e.into())),
            Err(_) => return Err(self.fail(RelayError::Timeout(dur))),
        }
        if preface != *CONNECTION_PREFACE {
            return Err(self.fail(RelayError::Handshake(
                "peer did not send the connection preface".to_string(),
            )));
        }
        self.advance(Stage::AwaitingPeerSettings);

        let first = match read_frame(io, dur).await {
            Ok(raw) => raw,
            Err(e) => return Err(self.fail(e)),
        };
        if !first.header.is_type(FrameType::Settings) {
            return Err(self.fail(RelayError::Handshake(format!(
                "first frame must be SETTINGS, got type 0x{:x}",
                first.header.kind
            ))));
        }

        if let Err(e) = write_all(io, &encode_handshake_settings(), dur).await {
            return Err(self.fail(e));
        }
        self.advance(Stage::SettingsSent);

        if let Err(e) = write_all(io, &encode_settings_ack(), dur).await {
            return Err(self.fail(e));
        }

        self.advance(Stage::Established);
        debug!(role = ?self.role, "handshake established");
        Ok(())
    }
}

/// Client-role handshake with a fresh context
pub async fn client_handshake<S>(io: &mut S, dur: Duration) -> Result<HandshakeContext>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ctx = HandshakeContext::new(Role::Client);
    ctx.run_client(io, dur).await?;
    Ok(ctx)
}

/// Server-role handshake with a fresh context
pub async fn server_handshake<S>(io: &mut S, dur: Duration) -> Result<HandshakeContext>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ctx = HandshakeContext::new(Role::Server);
    ctx.run_server(io, dur).await?;
    Ok(ctx)
}
