//! Logging bootstrap for embedding binaries (§4.K ambient stack).
//!
//! This crate never initializes a global subscriber on its own — only an
//! application's `main` should do that — but it ships the same
//! `EnvFilter` + selectable-format bootstrap the sibling NeuroQuantumDB
//! binaries use, parameterized by [`crate::config::BridgeConfig`].

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{BridgeConfig, LogFormat};
use crate::error::{BridgeError, BridgeResult};

/// Install a global `tracing` subscriber built from `config.log_level`/
/// `config.log_format`. Intended to be called once, near the top of an
/// embedding application's `main`. Returns an error rather than panicking
/// if a subscriber is already installed, so a misbehaving double-init is
/// surfaced as a `BridgeError::Config` instead of aborting the process.
pub fn init_tracing(config: &BridgeConfig) -> BridgeResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|err| BridgeError::Config(format!("invalid log_level '{}': {err}", config.log_level)))?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.log_format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_span_list(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(true))
            .try_init(),
    };

    result.map_err(|err| BridgeError::Config(format!("failed to install tracing subscriber: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_log_level_is_rejected_before_touching_the_global_subscriber() {
        let mut config = BridgeConfig::default();
        config.log_level = "=".to_string();
        assert!(init_tracing(&config).is_err());
    }
}
