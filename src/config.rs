use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::ring;

/// Relay configuration.
///
/// Everything is loadable from the environment (with a `.env` file picked up
/// when present); the three parameters the original harness passed on the
/// command line (bind port, upstream host, upstream port) can also be
/// given positionally and then override the environment.
#[derive(Debug, Clone)]
pub struct Config {
    // Listener
    pub bind_host: String,
    pub bind_port: u16,

    // Upstream SUT
    pub upstream_host: String,
    pub upstream_port: u16,

    // Crash handling
    pub pid_file: PathBuf,
    pub restart_hook: PathBuf,
    pub crash_dir: PathBuf,
    pub ring_capacity: usize,

    // Timeouts and retry policy
    pub client_read_timeout: Duration,
    pub upstream_timeout: Duration,
    pub connect_retries: u32,
    pub retry_delay: Duration,
    pub settle_delay: Duration,
    pub drain_poll_interval: Duration,

    // Optional fuzzer-facing TLS (PEM cert/key); plaintext when unset
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,

    // Run the server-role HTTP/2 handshake on inbound connections before
    // reading the request. Off by default: the stock harness sends raw
    // octets without a preface exchange.
    pub inbound_handshake: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let bind_host = env::var("H2RELAY_BIND_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let bind_port = env::var("H2RELAY_BIND_PORT")
            .unwrap_or_else(|_| "8443".to_string())
            .parse()
            .context("Invalid H2RELAY_BIND_PORT")?;

        let upstream_host =
            env::var("H2RELAY_UPSTREAM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let upstream_port = env::var("H2RELAY_UPSTREAM_PORT")
            .unwrap_or_else(|_| "443".to_string())
            .parse()
            .context("Invalid H2RELAY_UPSTREAM_PORT")?;

        let pid_file = env::var("H2RELAY_SUT_PID_FILE")
            .unwrap_or_else(|_| "/sut_pid".to_string())
            .into();
        let restart_hook = env::var("H2RELAY_RESTART_HOOK")
            .unwrap_or_else(|_| "/run.sh".to_string())
            .into();
        let crash_dir = env::var("H2RELAY_CRASH_DIR")
            .unwrap_or_else(|_| "/".to_string())
            .into();

        let ring_capacity = env::var("H2RELAY_RING_CAPACITY")
            .unwrap_or_else(|_| ring::DEFAULT_CAPACITY.to_string())
            .parse()
            .context("Invalid H2RELAY_RING_CAPACITY")?;

        let client_read_timeout = secs_var("H2RELAY_CLIENT_TIMEOUT_SECS", 5)?;
        let upstream_timeout = secs_var("H2RELAY_UPSTREAM_TIMEOUT_SECS", 2)?;
        let retry_delay = secs_var("H2RELAY_RETRY_DELAY_SECS", 1)?;
        let settle_delay = secs_var("H2RELAY_SETTLE_DELAY_SECS", 1)?;
        let drain_poll_interval = secs_var("H2RELAY_DRAIN_POLL_SECS", 1)?;

        let connect_retries = env::var("H2RELAY_CONNECT_RETRIES")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("Invalid H2RELAY_CONNECT_RETRIES")?;

        let tls_cert = env::var("H2RELAY_TLS_CERT").ok().map(PathBuf::from);
        let tls_key = env::var("H2RELAY_TLS_KEY").ok().map(PathBuf::from);
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(anyhow::anyhow!(
                "H2RELAY_TLS_CERT and H2RELAY_TLS_KEY must be set together"
            ));
        }

        let inbound_handshake = env::var("H2RELAY_INBOUND_HANDSHAKE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            bind_host,
            bind_port,
            upstream_host,
            upstream_port,
            pid_file,
            restart_hook,
            crash_dir,
            ring_capacity,
            client_read_timeout,
            upstream_timeout,
            connect_retries,
            retry_delay,
            settle_delay,
            drain_poll_interval,
            tls_cert,
            tls_key,
            inbound_handshake,
        })
    }

    /// Apply the positional `<bind port> <upstream host> <upstream port>`
    /// arguments over whatever the environment provided.
    pub fn apply_args<I, S>(&mut self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = args.into_iter();

        if let Some(port) = args.next() {
            self.bind_port = port
                .as_ref()
                .parse()
                .context("Invalid bind port argument")?;
        }
        if let Some(host) = args.next() {
            self.upstream_host = host.as_ref().to_string();
        }
        if let Some(port) = args.next() {
            self.upstream_port = port
                .as_ref()
                .parse()
                .context("Invalid upstream port argument")?;
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }

    /// Path of the crash artifact for the given crash index
    pub fn crash_path(&self, index: u64) -> PathBuf {
        self.crash_dir.join(format!("crash_{index}"))
    }
}

fn secs_var(name: &str, default: u64) -> Result<Duration> {
    let secs: u64 = env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("Invalid {name}"))?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            bind_host: "0.0.0.0".to_string(),
            bind_port: 8443,
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 443,
            pid_file: "/sut_pid".into(),
            restart_hook: "/run.sh".into(),
            crash_dir: "/".into(),
            ring_capacity: 128,
            client_read_timeout: Duration::from_secs(5),
            upstream_timeout: Duration::from_secs(2),
            connect_retries: 10,
            retry_delay: Duration::from_secs(1),
            settle_delay: Duration::from_secs(1),
            drain_poll_interval: Duration::from_secs(1),
            tls_cert: None,
            tls_key: None,
            inbound_handshake: false,
        }
    }

    #[test]
    fn test_positional_args_override() {
        let mut config = base_config();
        config.apply_args(["9000", "sut.local", "8443"]).unwrap();

        assert_eq!(config.bind_port, 9000);
        assert_eq!(config.upstream_host, "sut.local");
        assert_eq!(config.upstream_port, 8443);
    }

    #[test]
    fn test_partial_args_leave_rest() {
        let mut config = base_config();
        config.apply_args(["9000"]).unwrap();

        assert_eq!(config.bind_port, 9000);
        assert_eq!(config.upstream_host, "127.0.0.1");
        assert_eq!(config.upstream_port, 443);
    }

    #[test]
    fn test_bad_port_argument_rejected() {
        let mut config = base_config();
        assert!(config.apply_args(["not-a-port"]).is_err());
    }

    #[test]
    fn test_crash_path_naming() {
        let mut config = base_config();
        config.crash_dir = "/artifacts".into();

        assert_eq!(config.crash_path(0), PathBuf::from("/artifacts/crash_0"));
        assert_eq!(config.crash_path(17), PathBuf::from("/artifacts/crash_17"));
    }
}
