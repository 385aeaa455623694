//! Connection dispatcher and per-session boundary
//!
//! One detached task per accepted fuzzer connection; accept failures are
//! logged and the loop keeps going. Session failures are fully isolated:
//! the fuzzer sees either a relayed response or a silent close, the
//! dispatcher and the other sessions never notice.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::handshake;
use crate::relay;
use crate::supervisor::{Supervisor, TlsUpstreamConnector, UpstreamConnector};
use crate::tls;

/// Bind and serve forever. Only startup failures (bad bind address, broken
/// TLS material) return; a running dispatcher never exits over a single
/// accept error.
pub async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    let connector = TlsUpstreamConnector::new(
        config.upstream_host.clone(),
        config.upstream_port,
        config.upstream_timeout,
    );
    let supervisor = Arc::new(Supervisor::new((*config).clone(), connector));

    let acceptor = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => Some(TlsAcceptor::from(tls::inbound_server_config(cert, key)?)),
        _ => None,
    };

    let listener = TcpListener::bind(config.bind_addr()).await?;
    info!(
        addr = %config.bind_addr(),
        upstream = %format!("{}:{}", config.upstream_host, config.upstream_port),
        inbound_tls = acceptor.is_some(),
        "relay listening"
    );

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let config = Arc::clone(&config);
                let supervisor = Arc::clone(&supervisor);
                let acceptor = acceptor.clone();

                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                handle_connection(tls_stream, peer, config, supervisor).await;
                            }
                            Err(e) => warn!(%peer, error = %e, "inbound TLS accept failed"),
                        },
                        None => handle_connection(stream, peer, config, supervisor).await,
                    }
                });
            }
            Err(e) => {
                // A transient accept failure must never take the relay down
                error!(error = %e, "accept failed, continuing");
            }
        }
    }
}

/// Decrements the supervisor's active counter exactly once, whatever exit
/// path the session takes after a successful acquire.
struct ActiveGuard<'a, C: UpstreamConnector>(&'a Supervisor<C>);

impl<C: UpstreamConnector> Drop for ActiveGuard<'_, C> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Top-level session boundary: runs the session, logs the outcome, records
/// the raw request in the forensic ring, and escalates only the one fatal
/// error. Channel closure is owned by the session body (client stream
/// dropped on return, upstream slot released by the guard).
pub async fn handle_connection<S, C>(
    client: S,
    peer: SocketAddr,
    config: Arc<Config>,
    supervisor: Arc<Supervisor<C>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: UpstreamConnector,
    C::Channel: AsyncRead + AsyncWrite + Unpin + Send,
{
    debug!(%peer, "session started");

    let (request, result) = run_session(client, &config, &supervisor).await;

    match &result {
        Ok(len) => debug!(%peer, response_len = len, "session complete"),
        Err(err) if err.is_fatal() => {
            // Continued operation without a reachable SUT is meaningless
            error!(%peer, error = %err, "could not reach the SUT after restarting it, aborting");
            std::process::exit(1);
        }
        Err(err) => warn!(%peer, error = %err, "session failed"),
    }

    // Logged even when the exchange failed: a request that wedged the SUT
    // badly enough to error out is exactly the one worth replaying.
    supervisor.log_request(request);
}

/// The session proper: read the fuzzer's bytes, obtain an established
/// upstream channel, exchange, and hand the response back. Returns the
/// request bytes it read alongside the outcome so the boundary can log
/// them on every path.
async fn run_session<S, C>(
    mut client: S,
    config: &Config,
    supervisor: &Supervisor<C>,
) -> (Vec<u8>, Result<usize>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: UpstreamConnector,
    C::Channel: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut request = Vec::new();
    let result = session_body(&mut client, config, supervisor, &mut request).await;
    // Close our side regardless of outcome; the fuzzer treats an unanswered
    // close as a "no response" verdict.
    let _ = client.shutdown().await;
    (request, result)
}

async fn session_body<S, C>(
    client: &mut S,
    config: &Config,
    supervisor: &Supervisor<C>,
    request: &mut Vec<u8>,
) -> Result<usize>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: UpstreamConnector,
    C::Channel: AsyncRead + AsyncWrite + Unpin + Send,
{
    if config.inbound_handshake {
        handshake::server_handshake(client, config.client_read_timeout).await?;
    }

    // A test case is whatever arrives before the client goes quiet. Reads
    // append until the per-read timeout fires, so a case split across
    // several TCP segments still reaches the SUT in full. A timeout with
    // nothing read at all is a dead client, not an empty case.
    let mut chunk = [0u8; 4096];
    loop {
        match timeout(config.client_read_timeout, client.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => request.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) if !request.is_empty() => break,
            Err(_) => return Err(RelayError::Timeout(config.client_read_timeout)),
        }
    }

    let mut upstream = supervisor.acquire().await?;
    let _slot = ActiveGuard(supervisor);

    let outcome = relay::exchange(&mut upstream, request, config.upstream_timeout).await;
    let _ = upstream.shutdown().await;
    let response = outcome?;

    crate::frame::write_all(client, &response, config.client_read_timeout).await?;
    Ok(response.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_frame, flags, write_all, FrameType};
    use crate::supervisor::UpstreamConnector;
    use std::future::Future;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    const T: Duration = Duration::from_secs(2);

    /// Connector whose channels are in-memory pipes to a scripted SUT task
    struct PipeConnector {
        response: Vec<u8>,
    }

    impl UpstreamConnector for PipeConnector {
        type Channel = DuplexStream;

        fn connect(&self) -> impl Future<Output = Result<Self::Channel>> + Send {
            let response = self.response.clone();
            async move {
                let (ours, mut theirs) = tokio::io::duplex(65536);
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    // Swallow the request, then play the scripted response
                    match theirs.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                    let _ = write_all(&mut theirs, &response, T).await;
                    // Stay open long enough for the relay to drain
                    tokio::time::sleep(Duration::from_secs(2)).await;
                });
                Ok(ours)
            }
        }
    }

    /// Connector whose scripted upstream records every byte it receives
    struct RecordingConnector {
        seen: Arc<std::sync::Mutex<Vec<u8>>>,
        response: Vec<u8>,
    }

    impl UpstreamConnector for RecordingConnector {
        type Channel = DuplexStream;

        fn connect(&self) -> impl Future<Output = Result<Self::Channel>> + Send {
            let seen = Arc::clone(&self.seen);
            let response = self.response.clone();
            async move {
                let (ours, mut theirs) = tokio::io::duplex(65536);
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match tokio::time::timeout(
                            Duration::from_millis(200),
                            theirs.read(&mut buf),
                        )
                        .await
                        {
                            Ok(Ok(0)) | Err(_) => break,
                            Ok(Ok(n)) => seen.lock().unwrap().extend_from_slice(&buf[..n]),
                            Ok(Err(_)) => break,
                        }
                    }
                    let _ = write_all(&mut theirs, &response, T).await;
                    tokio::time::sleep(Duration::from_secs(2)).await;
                });
                Ok(ours)
            }
        }
    }

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 0,
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 443,
            pid_file: dir.join("sut_pid"),
            restart_hook: dir.join("run.sh"),
            crash_dir: dir.to_path_buf(),
            ring_capacity: 8,
            client_read_timeout: Duration::from_millis(200),
            upstream_timeout: Duration::from_secs(1),
            connect_retries: 2,
            retry_delay: Duration::from_millis(5),
            settle_delay: Duration::from_millis(5),
            drain_poll_interval: Duration::from_millis(5),
            tls_cert: None,
            tls_key: None,
            inbound_handshake: false,
        }
    }

    #[tokio::test]
    async fn test_session_relays_response_and_logs_request() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(dir.path()));

        let response = encode_frame(FrameType::Data as u8, flags::END_STREAM, 1, b"pong");
        let supervisor = Arc::new(Supervisor::new(
            (*config).clone(),
            PipeConnector {
                response: response.clone(),
            },
        ));

        let (mut fuzzer, session_side) = tokio::io::duplex(65536);
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let session = tokio::spawn(handle_connection(
            session_side,
            peer,
            Arc::clone(&config),
            Arc::clone(&supervisor),
        ));

        fuzzer.write_all(b"fuzzed-frames").await.unwrap();

        let mut got = Vec::new();
        fuzzer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, response);

        session.await.unwrap();
        // Request was logged and the upstream slot released
        assert_eq!(supervisor.active_sessions(), 0);
        assert_eq!(supervisor.crash_count(), 0);
    }

    #[tokio::test]
    async fn test_multi_segment_request_forwarded_in_full() {
        // A test case split across several writes, larger than any single
        // read buffer, must reach the upstream byte-for-byte. Reads keep
        // appending until the client goes quiet for the read timeout.
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(dir.path()));

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let response = encode_frame(FrameType::GoAway as u8, 0, 0, &[0u8; 8]);
        let supervisor = Arc::new(Supervisor::new(
            (*config).clone(),
            RecordingConnector {
                seen: Arc::clone(&seen),
                response,
            },
        ));

        let (mut fuzzer, session_side) = tokio::io::duplex(65536);
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let session = tokio::spawn(handle_connection(
            session_side,
            peer,
            Arc::clone(&config),
            Arc::clone(&supervisor),
        ));

        let case = vec![0xAB; 6000];
        fuzzer.write_all(&case[..3000]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        fuzzer.write_all(&case[3000..]).await.unwrap();

        let mut got = Vec::new();
        fuzzer.read_to_end(&mut got).await.unwrap();
        assert!(!got.is_empty(), "session must still relay the response");

        session.await.unwrap();
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            case.as_slice(),
            "upstream must see the whole multi-segment request"
        );
        assert_eq!(supervisor.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_failed_session_still_releases_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(dir.path()));

        // Response with no terminal frame: the session will time out
        let response = encode_frame(FrameType::Ping as u8, 0, 0, &[0u8; 8]);
        let supervisor = Arc::new(Supervisor::new(
            (*config).clone(),
            PipeConnector { response },
        ));

        let (mut fuzzer, session_side) = tokio::io::duplex(65536);
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let session = tokio::spawn(handle_connection(
            session_side,
            peer,
            Arc::clone(&config),
            Arc::clone(&supervisor),
        ));

        fuzzer.write_all(b"bad-case").await.unwrap();

        // Connection closes with no response bytes
        let mut got = Vec::new();
        fuzzer.read_to_end(&mut got).await.unwrap();
        assert!(got.is_empty());

        session.await.unwrap();
        assert_eq!(
            supervisor.active_sessions(),
            0,
            "failed session must still release its upstream slot"
        );
    }

    #[tokio::test]
    async fn test_session_with_inbound_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.inbound_handshake = true;
        let config = Arc::new(config);

        let response = encode_frame(FrameType::GoAway as u8, 0, 0, &[0u8; 8]);
        let supervisor = Arc::new(Supervisor::new(
            (*config).clone(),
            PipeConnector {
                response: response.clone(),
            },
        ));

        let (mut fuzzer, session_side) = tokio::io::duplex(65536);
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let session = tokio::spawn(handle_connection(
            session_side,
            peer,
            Arc::clone(&config),
            Arc::clone(&supervisor),
        ));

        // Behave like the stock harness: preface + SETTINGS, swallow the
        // relay's SETTINGS and ack, then send the case WITHOUT acking.
        // The server role must not be waiting for one.
        fuzzer
            .write_all(crate::frame::CONNECTION_PREFACE)
            .await
            .unwrap();
        fuzzer
            .write_all(&encode_frame(FrameType::Settings as u8, 0, 0, &[]))
            .await
            .unwrap();
        let settings = crate::frame::read_frame(&mut fuzzer, T).await.unwrap();
        assert!(settings.header.is_type(FrameType::Settings));
        let ack = crate::frame::read_frame(&mut fuzzer, T).await.unwrap();
        assert!(ack.header.is_settings_ack());

        fuzzer.write_all(b"case-after-handshake").await.unwrap();

        let mut got = Vec::new();
        fuzzer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, response);

        session.await.unwrap();
    }
}
