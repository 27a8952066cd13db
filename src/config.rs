/*
 * Copyright 2020 Joyent, Inc.
 */

use serde_derive::Deserialize;
use slog::Logger;

use crate::driver::DriverFactory;

/// What happens to a connection when its session releases it.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecyclePolicy {
    /// Tear the connection down on every release.
    DestroyAlways,
    /// Return it to the process-wide idle pool, keyed by connection
    /// identity, for any later session to reuse.
    PoolByKey,
    /// Reuse within the releasing transaction only; destroy at
    /// transaction end.
    PoolWithinTransaction,
}

impl Default for RecyclePolicy {
    fn default() -> Self {
        RecyclePolicy::PoolByKey
    }
}

/// How eagerly callers should push work to background workers. The core
/// only stores this; the handler layer above reads it when deciding
/// between synchronous use and `dispatch`.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BgMode {
    Disabled,
    OnDemand,
    Aggressive,
}

impl Default for BgMode {
    fn default() -> Self {
        BgMode::OnDemand
    }
}

/// What a link monitor asks its probe to do on each wake.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MonitorKind {
    Ping,
    TableState,
}

/// Per-link health monitoring settings.
#[derive(Clone, Debug, Deserialize)]
pub struct MonitorOptions {
    pub interval_ms: u64,
    pub kind: MonitorKind,
    /// Consecutive probe failures before the link flips to not-ok.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    3
}

/// Plain-value pool settings, loadable from the host server's own
/// configuration file.
#[derive(Clone, Debug, Deserialize)]
pub struct PoolConfig {
    /// Maximum live connections per endpoint; 0 means unbounded.
    #[serde(default)]
    pub max_connections_per_endpoint: u32,
    /// How long an `acquire` may block waiting for capacity.
    #[serde(default = "default_admission_wait_timeout_ms")]
    pub admission_wait_timeout_ms: u64,
    #[serde(default)]
    pub recycle: RecyclePolicy,
    #[serde(default)]
    pub bg_mode: BgMode,
}

fn default_admission_wait_timeout_ms() -> u64 {
    10_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connections_per_endpoint: 0,
            admission_wait_timeout_ms: default_admission_wait_timeout_ms(),
            recycle: RecyclePolicy::default(),
            bg_mode: BgMode::default(),
        }
    }
}

/// Everything a `Registry` needs at construction time.
pub struct RegistryOptions {
    pub config: PoolConfig,
    pub create_driver: DriverFactory,
    pub log: Logger,
}
