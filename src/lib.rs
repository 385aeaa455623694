//! h2relay: transparent TLS+HTTP/2 relay for fuzzing harnesses
//!
//! Sits between a protocol fuzzer and a system-under-test (SUT) speaking
//! HTTP/2 over TLS. The relay owns the TLS and HTTP/2 handshakes so the
//! fuzzer doesn't have to, forwards the fuzzer's raw octets unmodified once
//! a channel is up, and relays the SUT's raw response back. When the SUT
//! stops answering it preserves the most recent inputs in a forensic ring
//! buffer, kills and relaunches the SUT, and resumes.
//!
//! ## Architecture
//!
//! - `server`: accept loop + per-session error boundary
//! - `handshake`: dual-role (client/server) preface + SETTINGS exchange
//! - `relay`: verbatim request forwarding and frame-by-frame response drain
//! - `supervisor`: serialized upstream connects, crash detection, SUT restart
//! - `ring`: fixed-capacity forensic log dumped into `crash_<n>` artifacts
//! - `frame`: the opaque HTTP/2 frame codec surface (no HPACK, no payload
//!   interpretation)
//! - `tls`: rustls configs, a verification-free upstream client and an
//!   optional inbound server

pub mod config;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod relay;
pub mod ring;
pub mod server;
pub mod supervisor;
pub mod tls;

pub use config::Config;
pub use error::{RelayError, Result};
pub use handshake::{HandshakeContext, Role, Stage};
pub use ring::RingBuffer;
pub use supervisor::{Supervisor, TlsUpstreamConnector, UpstreamConnector};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
