// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! Streamer configuration surface.
//!
//! Validation happens once, at construction time, via
//! [`StreamerConfigBuilder::build`] rather than by panicking deep inside
//! the hot path.

use crate::error::StreamerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `-1` sentinel meaning "wait forever" for [`StreamerConfig::timeout`].
pub const UNLIMITED_TIMEOUT: i64 = -1;

/// Default number of times a failed batch may be remapped before the
/// submission fails with [`StreamerError::RemapExhausted`].
pub const DEFAULT_MAX_REMAP_COUNT: u32 = 32;

/// Streamer configuration. All fields have defaults; construct via
/// [`StreamerConfigBuilder`] to get validation, or use [`Default::default`]
/// directly when defaults are acceptable.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Hand-off threshold from a `ThreadBuffer` to the router.
    pub per_thread_buffer_size: usize,
    /// Hand-off threshold from a `PerStripeBuffer` to `submit`.
    pub per_node_buffer_size: usize,
    /// Semaphore width per `NodeBuffer`. `None` defaults to the node's
    /// declared worker-pool size times a fixed multiplier.
    pub per_node_parallel_ops: Option<usize>,
    /// Bound on every blocking wait. `None` means unlimited
    /// ([`UNLIMITED_TIMEOUT`] on the wire / in JSON); `Some(Duration::ZERO)`
    /// is rejected by the builder.
    pub timeout: Option<Duration>,
    /// Auto-flush interval. `None` or zero disables the auto-flush timer.
    pub auto_flush_period: Option<Duration>,
    /// Selects the receiver and routing fan-out: `false` uses the isolated
    /// receiver and fans each entry out to every owner (primary +
    /// backups); `true` uses the individual receiver and the primary only.
    pub allow_overwrite: bool,
    /// Forwarded to the receiver: skip the underlying store write.
    pub skip_store: bool,
    /// Forwarded to the receiver: keep values in their binary form.
    pub keep_binary: bool,
    /// Maximum number of times a batch may be remapped.
    pub max_remap_count: u32,
    /// Override for stripe count; defaults to the destination node's
    /// declared worker-pool size when `None`.
    pub stripe_count_override: Option<usize>,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            per_thread_buffer_size: 512,
            per_node_buffer_size: 512,
            per_node_parallel_ops: None,
            timeout: None,
            auto_flush_period: None,
            allow_overwrite: false,
            skip_store: false,
            keep_binary: false,
            max_remap_count: DEFAULT_MAX_REMAP_COUNT,
            stripe_count_override: None,
        }
    }
}

impl StreamerConfig {
    /// Effective parallelism width for a node whose declared worker-pool
    /// size is `pool_size`.
    #[must_use]
    pub fn parallel_ops_for(&self, pool_size: usize) -> usize {
        const DEFAULT_MULTIPLIER: usize = 2;
        self.per_node_parallel_ops
            .unwrap_or(pool_size.max(1) * DEFAULT_MULTIPLIER)
    }

    /// Effective stripe count for a node whose declared worker-pool size
    /// is `pool_size`.
    #[must_use]
    pub fn stripe_count_for(&self, pool_size: usize) -> usize {
        self.stripe_count_override.unwrap_or(pool_size.max(1))
    }
}

/// Builder that validates a [`StreamerConfig`] before it can be used to
/// construct a [`crate::streamer::Streamer`].
#[derive(Clone, Debug, Default)]
pub struct StreamerConfigBuilder {
    config: StreamerConfig,
}

impl StreamerConfigBuilder {
    /// Starts from the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-thread buffer hand-off threshold.
    #[must_use]
    pub fn per_thread_buffer_size(mut self, size: usize) -> Self {
        self.config.per_thread_buffer_size = size;
        self
    }

    /// Sets the per-node buffer hand-off threshold.
    #[must_use]
    pub fn per_node_buffer_size(mut self, size: usize) -> Self {
        self.config.per_node_buffer_size = size;
        self
    }

    /// Sets the per-node parallelism width.
    #[must_use]
    pub fn per_node_parallel_ops(mut self, ops: usize) -> Self {
        self.config.per_node_parallel_ops = Some(ops);
        self
    }

    /// Sets the blocking-wait timeout. `None` means unlimited.
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Sets the auto-flush period. `None` disables auto-flush.
    #[must_use]
    pub fn auto_flush_period(mut self, period: Option<Duration>) -> Self {
        self.config.auto_flush_period = period;
        self
    }

    /// Sets whether overwrite-only (primary) routing is used instead of
    /// full-fan-out (primary + backups).
    #[must_use]
    pub fn allow_overwrite(mut self, allow: bool) -> Self {
        self.config.allow_overwrite = allow;
        self
    }

    /// Forwarded to the receiver.
    #[must_use]
    pub fn skip_store(mut self, skip: bool) -> Self {
        self.config.skip_store = skip;
        self
    }

    /// Forwarded to the receiver.
    #[must_use]
    pub fn keep_binary(mut self, keep: bool) -> Self {
        self.config.keep_binary = keep;
        self
    }

    /// Sets the max remap count.
    #[must_use]
    pub fn max_remap_count(mut self, count: u32) -> Self {
        self.config.max_remap_count = count;
        self
    }

    /// Overrides the stripe count (default: destination node's declared
    /// worker-pool size).
    #[must_use]
    pub fn stripe_count(mut self, count: usize) -> Self {
        self.config.stripe_count_override = Some(count);
        self
    }

    /// Validates and finalizes the configuration.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] describing the first invalid field.
    pub fn build(self) -> Result<StreamerConfig, ConfigError> {
        if let Some(timeout) = self.config.timeout {
            if timeout.is_zero() {
                return Err(ConfigError::ZeroTimeout);
            }
        }
        if self.config.max_remap_count == 0 {
            return Err(ConfigError::ZeroMaxRemapCount);
        }
        if self.config.per_thread_buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize {
                field: "per_thread_buffer_size",
            });
        }
        if self.config.per_node_buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize {
                field: "per_node_buffer_size",
            });
        }
        Ok(self.config)
    }
}

/// Configuration validation failure.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum ConfigError {
    /// `timeout = Some(Duration::ZERO)` is invalid; use `None` for
    /// unlimited.
    #[error("timeout of zero is invalid; use `None` for unlimited")]
    ZeroTimeout,
    /// `max_remap_count` must be at least 1.
    #[error("max_remap_count must be at least 1")]
    ZeroMaxRemapCount,
    /// A buffer-size threshold must be at least 1.
    #[error("{field} must be at least 1")]
    ZeroBufferSize {
        /// The offending field's name.
        field: &'static str,
    },
}

impl From<ConfigError> for StreamerError {
    fn from(value: ConfigError) -> Self {
        StreamerError::Serialization {
            reason: value.to_string(),
        }
    }
}
