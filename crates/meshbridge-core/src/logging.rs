//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Environment variable switching to JSON log lines.
pub const LOG_JSON_ENV: &str = "MESHBRIDGE_LOG_JSON";

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "meshbridge=info";

/// Logging options.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Emit JSON instead of the compact human format.
    pub json: bool,
    /// Raise the default filter to `debug`.
    pub verbose: bool,
}

impl LogOptions {
    /// Options from the environment (`MESHBRIDGE_LOG_JSON=true`).
    pub fn from_env() -> Self {
        let json = std::env::var(LOG_JSON_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(false);
        Self {
            json,
            verbose: false,
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if self.verbose {
                EnvFilter::new("meshbridge=debug")
            } else {
                EnvFilter::new(DEFAULT_FILTER)
            }
        })
    }
}

/// Install the global subscriber.
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_logging(options: &LogOptions) {
    let filter = options.filter();
    let result = if options.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .try_init()
    };
    if result.is_err() {
        tracing::debug!(category = "logging", "Subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging(&LogOptions::default());
        init_logging(&LogOptions {
            json: true,
            verbose: true,
        });
    }
}
