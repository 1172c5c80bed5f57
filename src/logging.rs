//! Tracing setup and log rate limiting.
//!
//! Console output is compact by default; `json_logs` switches to one JSON
//! object per line with the current span (and its `transfer_id`) attached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

/// Dependencies that are only interesting when something is wrong.
const QUIET_TARGETS: &[&str] = &["tokio_rusqlite", "rusqlite"];

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    /// Default level DEBUG instead of INFO.
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

impl LogConfig {
    fn level(&self) -> Level {
        if self.verbose { Level::DEBUG } else { Level::INFO }
    }

    /// Filter used when `RUST_LOG` is not set.
    pub fn default_directives(&self) -> String {
        let mut directives = vec![format!("hauler={}", self.level().as_str().to_lowercase())];
        directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
        directives.join(",")
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(config: LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directives()));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().compact().with_target(false))
            .try_init()
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))
}

/// Lets one message through per interval and counts the ones it held back.
/// Shared across tasks without locking.
pub struct LogThrottle {
    interval_ms: u64,
    /// Milliseconds since `start` of the last emitted message, offset by one
    /// so that zero means "never".
    last_emit: AtomicU64,
    suppressed: AtomicU64,
    start: Instant,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_emit: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// `Some(n)` when the caller should log, `n` being how many calls were
    /// held back since the previous message.
    pub fn check(&self) -> Option<u64> {
        let now = self.start.elapsed().as_millis() as u64 + 1;
        let last = self.last_emit.load(Ordering::Relaxed);
        let due = last == 0 || now.saturating_sub(last) >= self.interval_ms;
        if due
            && self
                .last_emit
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            return Some(self.suppressed.swap(0, Ordering::Relaxed));
        }
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_held_back_messages() {
        let throttle = LogThrottle::new(Duration::from_millis(30));
        assert_eq!(throttle.check(), Some(0));
        assert_eq!(throttle.check(), None);
        assert_eq!(throttle.check(), None);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(throttle.check(), Some(2));
    }

    #[test]
    fn zero_interval_never_throttles() {
        let throttle = LogThrottle::new(Duration::ZERO);
        assert_eq!(throttle.check(), Some(0));
        assert_eq!(throttle.check(), Some(0));
    }

    #[test]
    fn verbose_lowers_level_and_keeps_deps_quiet() {
        let app = AppConfig {
            verbose: true,
            json_logs: true,
            ..AppConfig::default()
        };
        let config = LogConfig::from(&app);
        assert!(config.json);
        assert_eq!(
            config.default_directives(),
            "hauler=debug,tokio_rusqlite=warn,rusqlite=warn"
        );
        assert!(LogConfig::default().default_directives().starts_with("hauler=info"));
    }
}
