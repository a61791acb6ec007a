//! Subscriber setup for the ingestion binaries.
use tracing_subscriber::{fmt, EnvFilter};

use crate::util::env::env_opt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Target plus file and line of every event.
    Full,
    /// One short line per event, for long unattended runs.
    Compact,
}

impl LogFormat {
    /// Reads `INGEST_LOG_FORMAT`; anything but `compact` is [`LogFormat::Full`].
    pub fn from_env() -> Self {
        Self::parse(env_opt("INGEST_LOG_FORMAT").as_deref())
    }

    fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("compact") => LogFormat::Compact,
            _ => LogFormat::Full,
        }
    }
}

/// Installs the global fmt subscriber. `default_filter` applies when
/// `RUST_LOG` is unset.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = fmt().with_env_filter(filter);
    let installed = match LogFormat::from_env() {
        LogFormat::Full => builder
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .try_init(),
        LogFormat::Compact => builder.compact().with_target(false).try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))
}
