//! Runtime configuration for a [`Manager`](crate::manager::Manager).
//!
//! Every field has a default, so `Config::default()` is enough for most
//! servers. Values can also be read from `GUST_*` environment variables with
//! [`Config::from_env`]:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `GUST_WRITE_WAIT_MS` | `write_wait` |
//! | `GUST_PONG_WAIT_MS` | `pong_wait` (`0` disables the read deadline) |
//! | `GUST_PING_PERIOD_MS` | `ping_period` |
//! | `GUST_MAX_MESSAGE_SIZE` | `max_message_size` |
//! | `GUST_MESSAGE_BUFFER_SIZE` | `message_buffer_size` |
//! | `GUST_CONCURRENT_MESSAGE_HANDLING` | `concurrent_message_handling` |
//! | `GUST_HUB_BUFFER_SIZE` | `hub_buffer_size` |

use std::time::Duration;

use config::{ConfigError, Environment};
use serde::Deserialize;
use tracing::warn;

use crate::error::Result;

/// Session and hub settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Deadline for every individual transport write, ping and close.
    pub write_wait: Duration,

    /// Read deadline. Any inbound frame, pongs included, restarts it. `None`
    /// leaves idle peers to be detected by failing pings and transport errors.
    pub pong_wait: Option<Duration>,

    /// Interval between liveness probes. Must be shorter than `pong_wait`.
    pub ping_period: Duration,

    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,

    /// Capacity of each session's outbound queue.
    pub message_buffer_size: usize,

    /// Run message handlers as spawned tasks instead of inline in the read loop.
    pub concurrent_message_handling: bool,

    /// Capacity of the hub's control channel.
    pub hub_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait: Some(Duration::from_secs(60)),
            ping_period: Duration::from_secs(54),
            max_message_size: 512,
            message_buffer_size: 256,
            concurrent_message_handling: false,
            hub_buffer_size: 1024,
        }
    }
}

impl Config {
    /// Sets the per-write deadline.
    pub fn with_write_wait(mut self, write_wait: Duration) -> Self {
        self.write_wait = write_wait;
        self
    }

    /// Sets the read deadline, `None` disables it.
    pub fn with_pong_wait(mut self, pong_wait: Option<Duration>) -> Self {
        self.pong_wait = pong_wait;
        self
    }

    /// Sets the ping interval.
    pub fn with_ping_period(mut self, ping_period: Duration) -> Self {
        self.ping_period = ping_period;
        self
    }

    /// Sets the inbound message size limit.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Sets the outbound queue capacity of each session.
    pub fn with_message_buffer_size(mut self, message_buffer_size: usize) -> Self {
        self.message_buffer_size = message_buffer_size;
        self
    }

    /// Enables or disables concurrent message handling.
    pub fn with_concurrent_message_handling(mut self, enabled: bool) -> Self {
        self.concurrent_message_handling = enabled;
        self
    }

    /// Sets the capacity of the hub's control channel.
    pub fn with_hub_buffer_size(mut self, hub_buffer_size: usize) -> Self {
        self.hub_buffer_size = hub_buffer_size;
        self
    }

    /// Checks the settings for values the hub cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`GustError::Config`](crate::error::GustError::Config) naming
    /// the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.message_buffer_size == 0 {
            return invalid("message_buffer_size must be greater than zero");
        }
        if self.hub_buffer_size == 0 {
            return invalid("hub_buffer_size must be greater than zero");
        }
        if self.max_message_size == 0 {
            return invalid("max_message_size must be greater than zero");
        }
        if self.write_wait.is_zero() {
            return invalid("write_wait must be greater than zero");
        }
        if self.ping_period.is_zero() {
            return invalid("ping_period must be greater than zero");
        }
        if let Some(pong_wait) = self.pong_wait {
            if pong_wait <= self.ping_period {
                return invalid("pong_wait must be longer than ping_period");
            }
        }
        Ok(())
    }

    /// Loads settings from `GUST_*` environment variables on top of the defaults.
    ///
    /// # Errors
    ///
    /// Fails when a variable cannot be parsed or the result does not pass
    /// [`Config::validate`].
    pub fn from_env() -> Result<Self> {
        Self::from_environment(Environment::with_prefix("GUST").try_parsing(true))
    }

    pub(crate) fn from_environment(environment: Environment) -> Result<Self> {
        let defaults = Self::default();
        let raw: RawConfig = config::Config::builder()
            .set_default("write_wait_ms", millis(defaults.write_wait))?
            .set_default("pong_wait_ms", defaults.pong_wait.map(millis).unwrap_or(0))?
            .set_default("ping_period_ms", millis(defaults.ping_period))?
            .set_default("max_message_size", defaults.max_message_size as i64)?
            .set_default("message_buffer_size", defaults.message_buffer_size as i64)?
            .set_default(
                "concurrent_message_handling",
                defaults.concurrent_message_handling,
            )?
            .set_default("hub_buffer_size", defaults.hub_buffer_size as i64)?
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        let config = Self::from(raw);
        config.validate()?;
        Ok(config)
    }

    /// Replaces values that would make channels or timers panic.
    pub(crate) fn sanitized(mut self) -> Self {
        if self.message_buffer_size == 0 {
            warn!("message_buffer_size of 0 raised to 1");
            self.message_buffer_size = 1;
        }
        if self.hub_buffer_size == 0 {
            warn!("hub_buffer_size of 0 raised to 1");
            self.hub_buffer_size = 1;
        }
        if self.ping_period.is_zero() {
            warn!("ping_period of 0 raised to 1ms");
            self.ping_period = Duration::from_millis(1);
        }
        self
    }
}

fn invalid(msg: &str) -> Result<()> {
    Err(ConfigError::Message(msg.to_string()).into())
}

fn millis(duration: Duration) -> i64 {
    duration.as_millis().min(i64::MAX as u128) as i64
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    write_wait_ms: u64,
    pong_wait_ms: u64,
    ping_period_ms: u64,
    max_message_size: usize,
    message_buffer_size: usize,
    concurrent_message_handling: bool,
    hub_buffer_size: usize,
}

impl From<RawConfig> for Config {
    fn from(raw: RawConfig) -> Self {
        Self {
            write_wait: Duration::from_millis(raw.write_wait_ms),
            pong_wait: (raw.pong_wait_ms > 0).then(|| Duration::from_millis(raw.pong_wait_ms)),
            ping_period: Duration::from_millis(raw.ping_period_ms),
            max_message_size: raw.max_message_size,
            message_buffer_size: raw.message_buffer_size,
            concurrent_message_handling: raw.concurrent_message_handling,
            hub_buffer_size: raw.hub_buffer_size,
        }
    }
}
