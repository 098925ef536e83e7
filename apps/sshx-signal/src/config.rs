use std::env;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 11095;
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAILBOX_TTL: Duration = Duration::from_secs(15);
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// How long a pull waits before answering with the empty message.
    pub pull_timeout: Duration,
    /// Inactivity window after which an identity's queue is dropped.
    pub mailbox_ttl: Duration,
    pub queue_depth: usize,
    pub debug: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let secs = |key: &str, default: Duration| {
            env::var(key)
                .ok()
                .and_then(|val| val.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Self {
            port: env::var("SSHX_SIGNALING_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            pull_timeout: secs("SSHX_SIGNALING_PULL_TIMEOUT_SECS", DEFAULT_PULL_TIMEOUT),
            mailbox_ttl: secs("SSHX_SIGNALING_MAILBOX_TTL_SECS", DEFAULT_MAILBOX_TTL),
            queue_depth: env::var("SSHX_SIGNALING_QUEUE_DEPTH")
                .ok()
                .and_then(|val| val.parse().ok())
                .filter(|depth| *depth > 0)
                .unwrap_or(DEFAULT_QUEUE_DEPTH),
            debug: env::var("SSHX_DEBUG")
                .map(|value| !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false"))
                .unwrap_or(false),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
            mailbox_ttl: DEFAULT_MAILBOX_TTL,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            debug: false,
        }
    }
}
