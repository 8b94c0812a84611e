// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging
//!
//! Installs the process-wide tracing subscriber.

use crate::configs::AmqpConfigs;
use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber filtering at `default_level`.
///
/// `RUST_LOG` takes precedence when set. Calling this more than once is a
/// no-op, so tests and binaries can both call it.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Installs the subscriber at the level configured in `configs.log_level`.
///
/// # Parameters
/// * `configs` - Settings loaded through `AmqpConfigs::load`
pub fn init_from(configs: &AmqpConfigs) {
    init(&configs.log_level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_can_run_twice() {
        init("debug");
        init("not a level ===");
        init_from(&AmqpConfigs::default());
        tracing::debug!("logging initialized");
    }
}
