//! Connect supervisor
//!
//! Serializes every upstream connect attempt behind one process-wide lock,
//! so crash recovery and ordinary reconnects can never race: while one
//! session is mid-handshake or mid-restart, everyone else queues. The
//! supervisor also owns the forensic ring buffer, the live-session counter
//! the restart path drains against, and the crash artifact numbering.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::handshake;
use crate::ring::RingBuffer;
use crate::tls;

/// One upstream connect attempt: transport + TLS + client-role handshake.
/// A trait seam so recovery tests can stand in a scripted upstream.
pub trait UpstreamConnector: Send + Sync + 'static {
    type Channel: Send + 'static;

    fn connect(&self) -> impl Future<Output = Result<Self::Channel>> + Send;
}

/// Production connector: TLS with ALPN `h2`, then the client-role
/// preface/SETTINGS exchange.
pub struct TlsUpstreamConnector {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TlsUpstreamConnector {
    pub fn new(host: String, port: u16, timeout: Duration) -> Self {
        Self {
            host,
            port,
            timeout,
        }
    }
}

impl UpstreamConnector for TlsUpstreamConnector {
    type Channel = TlsStream<TcpStream>;

    fn connect(&self) -> impl Future<Output = Result<Self::Channel>> + Send {
        async move {
            let mut stream = tls::connect_upstream(&self.host, self.port, self.timeout).await?;
            handshake::client_handshake(&mut stream, self.timeout).await?;
            Ok(stream)
        }
    }
}

/// Process-wide supervisor state, constructed once at startup and shared by
/// reference across all session tasks.
pub struct Supervisor<C: UpstreamConnector> {
    connector: C,
    config: Config,

    /// Sessions currently holding an established upstream channel
    active: AtomicUsize,
    /// Monotonic; names crash artifacts. Never reset.
    crash_count: AtomicU64,
    /// Serializes connect attempts and the whole restart sequence
    connect_lock: tokio::sync::Mutex<()>,
    /// Shared with the crash path: a dump is always a consistent snapshot
    ring: Mutex<RingBuffer>,
}

impl<C: UpstreamConnector> Supervisor<C> {
    pub fn new(config: Config, connector: C) -> Self {
        let ring = Mutex::new(RingBuffer::new(config.ring_capacity));
        Self {
            connector,
            config,
            active: AtomicUsize::new(0),
            crash_count: AtomicU64::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
            ring,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn crash_count(&self) -> u64 {
        self.crash_count.load(Ordering::SeqCst)
    }

    /// Record a raw request so it survives into the next crash artifact.
    /// Called by every session after its exchange, success or failure.
    pub fn log_request(&self, data: Vec<u8>) {
        // Lock poisoning would mean a panicked session mid-push; the data
        // is append-only bytes, safe to keep using.
        let mut ring = match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ring.push(data);
    }

    /// Obtain an established upstream channel, restarting the SUT if the
    /// first attempt fails. Returns `RetriesExhausted`, the one fatal
    /// condition, when the SUT stays unreachable after a restart.
    pub async fn acquire(&self) -> Result<C::Channel> {
        let _connect_guard = self.connect_lock.lock().await;

        match self.connector.connect().await {
            Ok(channel) => {
                self.active.fetch_add(1, Ordering::SeqCst);
                Ok(channel)
            }
            Err(err) => {
                warn!(error = %err, "upstream connect failed, entering restart");
                self.restart_and_retry().await
            }
        }
    }

    /// Give back the upstream slot. Must be called exactly once per
    /// successful `acquire`, on every session exit path; the restart
    /// drain waits for this counter to reach zero.
    pub fn release(&self) {
        let prev = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if prev.is_err() {
            warn!("session release with no active upstream slot");
        }
    }

    /// Restart sequence, executed while still holding the connect lock:
    /// drain in-flight sessions, dump forensics, kill and relaunch the SUT,
    /// then retry the handshake a bounded number of times.
    async fn restart_and_retry(&self) -> Result<C::Channel> {
        // (a) No session may be mid-exchange with the process we are about
        // to kill. They drain on their own timeouts; we only wait.
        while self.active.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(self.config.drain_poll_interval).await;
        }

        // (b) Preserve the recent inputs before anything else can touch them
        let crash_index = self.crash_count.load(Ordering::SeqCst);
        let path = self.config.crash_path(crash_index);
        {
            let ring = match self.ring.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match ring.dump(&path) {
                Ok(()) => info!(path = %path.display(), entries = ring.len(), "crash artifact written"),
                Err(e) => error!(path = %path.display(), error = %e, "failed to write crash artifact"),
            }
        }
        self.crash_count.fetch_add(1, Ordering::SeqCst);

        // (c) + (d) Kill whatever pid is on record, then run the relaunch hook
        self.kill_sut().await;
        self.run_restart_hook().await;

        // (e) Give the relaunched SUT a moment to bind
        tokio::time::sleep(self.config.settle_delay).await;

        // (f) Bounded reconnect attempts
        for attempt in 1..=self.config.connect_retries {
            match self.connector.connect().await {
                Ok(channel) => {
                    info!(attempt, "upstream reachable again after restart");
                    self.active.fetch_add(1, Ordering::SeqCst);
                    return Ok(channel);
                }
                Err(err) => {
                    debug!(attempt, error = %err, "reconnect attempt failed");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }

        Err(RelayError::RetriesExhausted {
            attempts: self.config.connect_retries,
        })
    }

    /// SIGKILL the pid on record. "Process not found" is normal here: the
    /// SUT may already be dead, which is exactly why we are restarting.
    async fn kill_sut(&self) {
        let pid_text = match tokio::fs::read_to_string(&self.config.pid_file).await {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %self.config.pid_file.display(), error = %e, "cannot read SUT pid file");
                return;
            }
        };
        let pid: i32 = match pid_text.trim().parse() {
            Ok(pid) => pid,
            Err(_) => {
                warn!(path = %self.config.pid_file.display(), "SUT pid file is not a decimal pid");
                return;
            }
        };

        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => info!(pid, "sent SIGKILL to SUT"),
            Err(nix::errno::Errno::ESRCH) => debug!(pid, "SUT already gone"),
            Err(e) => warn!(pid, error = %e, "failed to signal SUT"),
        }
    }

    /// Run the zero-argument relaunch hook. Non-zero exit is logged only;
    /// the reconnect loop is the real arbiter of whether the restart worked.
    async fn run_restart_hook(&self) {
        match tokio::process::Command::new(&self.config.restart_hook)
            .status()
            .await
        {
            Ok(status) if status.success() => {
                info!(hook = %self.config.restart_hook.display(), "restart hook completed");
            }
            Ok(status) => {
                warn!(hook = %self.config.restart_hook.display(), %status, "restart hook exited non-zero");
            }
            Err(e) => {
                warn!(hook = %self.config.restart_hook.display(), error = %e, "failed to run restart hook");
            }
        }
    }
}
