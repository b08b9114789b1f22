//! `tracing` subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::JitConfig;

/// Environment variable that overrides the configured log filter.
pub const LOG_ENV: &str = "LUMEN_LOG";

/// The filter `init` installs: `LUMEN_LOG` if set and valid, otherwise
/// `[jit.log] filter`.
pub fn env_filter(config: &JitConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&config.log.filter))
}

/// Install the global fmt subscriber. Returns `false` if a subscriber was
/// already installed, in which case nothing changes.
pub fn init(config: &JitConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = JitConfig::default();
        init(&config);
        assert!(!init(&config));
    }

    #[test]
    fn configured_filter_is_used() {
        let mut config = JitConfig::default();
        config.log.filter = "lumen_rt=debug".to_string();
        if std::env::var_os(LOG_ENV).is_none() {
            assert_eq!(env_filter(&config).to_string(), "lumen_rt=debug");
        }
    }
}
