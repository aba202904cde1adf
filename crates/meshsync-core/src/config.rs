//! Mediator configuration
//!
//! Every tunable lives in [`MediatorConfig`]. Values come from `MESHSYNC_*`
//! environment variables; an unset or empty variable keeps the default.
//! Validation is eager and each failure names the offending variable.

use std::time::Duration;

use serde::Serialize;

use crate::bootstrap::{BootstrapOptions, DEFAULT_DRIFT_THRESHOLD, DEFAULT_EXPORT_CHUNK_SIZE};
use crate::error::{SyncError, SyncResult};
use crate::sync::adapter::{
    validate_frame_size_limit, AdapterOptions, DEFAULT_MAX_RECORDS_PER_WINDOW,
    DEFAULT_MAX_ROUNDS_PER_SESSION, DEFAULT_OLDER_WINDOW_DAYS, DEFAULT_RECENT_WINDOW_DAYS,
};
use crate::sync::protocol::NEGENTROPY_PROTOCOL_VERSION;
use crate::sync::transfer::{
    PushLimits, TransferBatcher, DEFAULT_MAX_BYTES_PER_PUSH, DEFAULT_MAX_IDS_PER_REQUEST,
    DEFAULT_MAX_OPS_PER_PUSH,
};
use crate::types::DEFAULT_ITERATE_LIMIT;

/// Prefix shared by every configuration variable
pub const ENV_PREFIX: &str = "MESHSYNC_";

pub const ENV_NODE_NAME: &str = "MESHSYNC_NODE_NAME";
pub const ENV_NEGENTROPY_ENABLE: &str = "MESHSYNC_NEGENTROPY_ENABLE";
pub const ENV_LEGACY_SYNC_ENABLE: &str = "MESHSYNC_LEGACY_SYNC_ENABLE";
pub const ENV_NEGENTROPY_MIN_VERSION: &str = "MESHSYNC_NEGENTROPY_MIN_VERSION";
pub const ENV_FRAME_SIZE_LIMIT: &str = "MESHSYNC_NEGENTROPY_FRAME_SIZE_LIMIT";
pub const ENV_RECENT_WINDOW_DAYS: &str = "MESHSYNC_NEGENTROPY_RECENT_WINDOW_DAYS";
pub const ENV_OLDER_WINDOW_DAYS: &str = "MESHSYNC_NEGENTROPY_OLDER_WINDOW_DAYS";
pub const ENV_MAX_RECORDS_PER_WINDOW: &str = "MESHSYNC_NEGENTROPY_MAX_RECORDS_PER_WINDOW";
pub const ENV_MAX_ROUNDS_PER_SESSION: &str = "MESHSYNC_NEGENTROPY_MAX_ROUNDS_PER_SESSION";
pub const ENV_REPAIR_INTERVAL: &str = "MESHSYNC_NEGENTROPY_REPAIR_INTERVAL";
pub const ENV_EXPORT_INTERVAL: &str = "MESHSYNC_EXPORT_INTERVAL";
pub const ENV_MAX_IDS_PER_REQUEST: &str = "MESHSYNC_MAX_IDS_PER_REQUEST";
pub const ENV_MAX_OPS_PER_PUSH: &str = "MESHSYNC_MAX_OPS_PER_PUSH";
pub const ENV_MAX_BYTES_PER_PUSH: &str = "MESHSYNC_MAX_BYTES_PER_PUSH";
pub const ENV_BOOTSTRAP_DRIFT_THRESHOLD: &str = "MESHSYNC_BOOTSTRAP_DRIFT_THRESHOLD";
pub const ENV_CONNECTION_TIMEOUT: &str = "MESHSYNC_CONNECTION_TIMEOUT";
pub const ENV_CONNECTION_CHECK_INTERVAL: &str = "MESHSYNC_CONNECTION_CHECK_INTERVAL";
pub const ENV_IMPORT_BATCH_SIZE: &str = "MESHSYNC_IMPORT_BATCH_SIZE";

const DEFAULT_NODE_NAME: &str = "anon";
const DEFAULT_REPAIR_INTERVAL_SECS: u64 = 300;
const DEFAULT_EXPORT_INTERVAL_SECS: u64 = 2;
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 180;
const DEFAULT_CONNECTION_CHECK_SECS: u64 = 60;
const DEFAULT_IMPORT_BATCH_SIZE: usize = 100;

/// All mediator tunables
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediatorConfig {
    /// Name announced to peers in `hello` and `ping`
    pub node_name: String,
    pub negentropy_enabled: bool,
    pub legacy_sync_enabled: bool,
    pub negentropy_min_version: u32,
    /// 0 = unbounded, otherwise >= 4096
    pub frame_size_limit: u64,
    pub recent_window_days: u32,
    pub older_window_days: u32,
    pub max_records_per_window: usize,
    pub max_rounds_per_session: u32,
    pub repair_interval_secs: u64,
    pub export_interval_secs: u64,
    pub max_ids_per_request: usize,
    pub max_ops_per_push: usize,
    pub max_bytes_per_push: usize,
    /// Fraction in `[0, 1]`
    pub bootstrap_drift_threshold: f64,
    pub connection_timeout_secs: u64,
    pub connection_check_secs: u64,
    pub import_batch_size: usize,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            node_name: DEFAULT_NODE_NAME.to_string(),
            negentropy_enabled: true,
            legacy_sync_enabled: true,
            negentropy_min_version: NEGENTROPY_PROTOCOL_VERSION,
            frame_size_limit: 0,
            recent_window_days: DEFAULT_RECENT_WINDOW_DAYS,
            older_window_days: DEFAULT_OLDER_WINDOW_DAYS,
            max_records_per_window: DEFAULT_MAX_RECORDS_PER_WINDOW,
            max_rounds_per_session: DEFAULT_MAX_ROUNDS_PER_SESSION,
            repair_interval_secs: DEFAULT_REPAIR_INTERVAL_SECS,
            export_interval_secs: DEFAULT_EXPORT_INTERVAL_SECS,
            max_ids_per_request: DEFAULT_MAX_IDS_PER_REQUEST,
            max_ops_per_push: DEFAULT_MAX_OPS_PER_PUSH,
            max_bytes_per_push: DEFAULT_MAX_BYTES_PER_PUSH,
            bootstrap_drift_threshold: DEFAULT_DRIFT_THRESHOLD,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            connection_check_secs: DEFAULT_CONNECTION_CHECK_SECS,
            import_batch_size: DEFAULT_IMPORT_BATCH_SIZE,
        }
    }
}

fn parse_bool(name: &str, raw: &str) -> SyncResult<bool> {
    match raw {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(SyncError::config(name, "expected true or false")),
    }
}

fn parse_positive<T>(name: &str, raw: &str) -> SyncResult<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    match raw.parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(SyncError::config(name, "expected a positive integer")),
    }
}

impl MediatorConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> SyncResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Read configuration from `(name, value)` pairs.
    ///
    /// Variables without the `MESHSYNC_` prefix are ignored, as are unknown
    /// `MESHSYNC_` names.
    pub fn from_vars<I, K, V>(vars: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (name, value) in vars {
            let name = name.as_ref();
            let raw = value.as_ref().trim();
            if !name.starts_with(ENV_PREFIX) || raw.is_empty() {
                continue;
            }
            config.apply_var(name, raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply_var(&mut self, name: &str, raw: &str) -> SyncResult<()> {
        match name {
            ENV_NODE_NAME => self.node_name = raw.to_string(),
            ENV_NEGENTROPY_ENABLE => self.negentropy_enabled = parse_bool(name, raw)?,
            ENV_LEGACY_SYNC_ENABLE => self.legacy_sync_enabled = parse_bool(name, raw)?,
            ENV_NEGENTROPY_MIN_VERSION => self.negentropy_min_version = parse_positive(name, raw)?,
            ENV_FRAME_SIZE_LIMIT => {
                let limit = raw
                    .parse::<u64>()
                    .map_err(|_| SyncError::config(name, "expected 0 or >= 4096"))?;
                validate_frame_size_limit(name, limit)?;
                self.frame_size_limit = limit;
            }
            ENV_RECENT_WINDOW_DAYS => self.recent_window_days = parse_positive(name, raw)?,
            ENV_OLDER_WINDOW_DAYS => self.older_window_days = parse_positive(name, raw)?,
            ENV_MAX_RECORDS_PER_WINDOW => self.max_records_per_window = parse_positive(name, raw)?,
            ENV_MAX_ROUNDS_PER_SESSION => self.max_rounds_per_session = parse_positive(name, raw)?,
            ENV_REPAIR_INTERVAL => self.repair_interval_secs = parse_positive(name, raw)?,
            ENV_EXPORT_INTERVAL => self.export_interval_secs = parse_positive(name, raw)?,
            ENV_MAX_IDS_PER_REQUEST => self.max_ids_per_request = parse_positive(name, raw)?,
            ENV_MAX_OPS_PER_PUSH => self.max_ops_per_push = parse_positive(name, raw)?,
            ENV_MAX_BYTES_PER_PUSH => self.max_bytes_per_push = parse_positive(name, raw)?,
            ENV_BOOTSTRAP_DRIFT_THRESHOLD => {
                self.bootstrap_drift_threshold = raw
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite() && (0.0..=1.0).contains(v))
                    .ok_or_else(|| {
                        SyncError::config(name, "expected a number between 0 and 1")
                    })?;
            }
            ENV_CONNECTION_TIMEOUT => self.connection_timeout_secs = parse_positive(name, raw)?,
            ENV_CONNECTION_CHECK_INTERVAL => {
                self.connection_check_secs = parse_positive(name, raw)?
            }
            ENV_IMPORT_BATCH_SIZE => self.import_batch_size = parse_positive(name, raw)?,
            _ => {}
        }
        Ok(())
    }

    /// Check every bound; called by every constructor that takes a config.
    pub fn validate(&self) -> SyncResult<()> {
        if !self.negentropy_enabled && !self.legacy_sync_enabled {
            return Err(SyncError::config(
                "sync configuration",
                format!("at least one of {ENV_NEGENTROPY_ENABLE} or {ENV_LEGACY_SYNC_ENABLE} must be true"),
            ));
        }

        let positive = [
            (ENV_NEGENTROPY_MIN_VERSION, self.negentropy_min_version as u64),
            (ENV_REPAIR_INTERVAL, self.repair_interval_secs),
            (ENV_EXPORT_INTERVAL, self.export_interval_secs),
            (ENV_CONNECTION_TIMEOUT, self.connection_timeout_secs),
            (ENV_CONNECTION_CHECK_INTERVAL, self.connection_check_secs),
            (ENV_IMPORT_BATCH_SIZE, self.import_batch_size as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SyncError::config(name, "expected a positive integer"));
            }
        }

        self.adapter_options().validate()?;
        self.bootstrap_options().validate()?;
        self.transfer_batcher().map(|_| ())
    }

    pub fn adapter_options(&self) -> AdapterOptions {
        AdapterOptions {
            frame_size_limit: self.frame_size_limit,
            iterate_limit: DEFAULT_ITERATE_LIMIT,
            recent_window_days: self.recent_window_days,
            older_window_days: self.older_window_days,
            max_records_per_window: self.max_records_per_window,
            max_rounds_per_session: self.max_rounds_per_session,
            defer_initial_build: true,
        }
    }

    pub fn bootstrap_options(&self) -> BootstrapOptions {
        BootstrapOptions {
            drift_threshold: self.bootstrap_drift_threshold,
            export_chunk_size: DEFAULT_EXPORT_CHUNK_SIZE,
        }
    }

    pub fn push_limits(&self) -> PushLimits {
        PushLimits {
            max_ops_per_push: self.max_ops_per_push,
            max_bytes_per_push: self.max_bytes_per_push,
        }
    }

    pub fn transfer_batcher(&self) -> SyncResult<TransferBatcher> {
        TransferBatcher::new(self.max_ids_per_request, self.push_limits())
    }

    pub fn repair_interval(&self) -> Duration {
        Duration::from_secs(self.repair_interval_secs)
    }

    pub fn export_interval(&self) -> Duration {
        Duration::from_secs(self.export_interval_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn connection_check_interval(&self) -> Duration {
        Duration::from_secs(self.connection_check_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(vars: &[(&str, &str)]) -> SyncResult<MediatorConfig> {
        MediatorConfig::from_vars(vars.iter().copied())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, MediatorConfig::default());
        assert!(config.negentropy_enabled);
        assert!(config.legacy_sync_enabled);
        assert_eq!(config.export_interval_secs, 2);
        assert_eq!(config.max_bytes_per_push, 1024 * 1024);
    }

    #[test]
    fn test_empty_values_keep_defaults() {
        let config = load(&[
            (ENV_EXPORT_INTERVAL, ""),
            (ENV_NEGENTROPY_ENABLE, ""),
            (ENV_LEGACY_SYNC_ENABLE, " "),
        ])
        .unwrap();
        assert_eq!(config.export_interval_secs, 2);
        assert!(config.negentropy_enabled);
    }

    #[test]
    fn test_both_modes_disabled_is_fatal() {
        let err = load(&[(ENV_NEGENTROPY_ENABLE, "false"), (ENV_LEGACY_SYNC_ENABLE, "false")])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid sync configuration; at least one of MESHSYNC_NEGENTROPY_ENABLE or \
             MESHSYNC_LEGACY_SYNC_ENABLE must be true"
        );
    }

    #[test]
    fn test_one_mode_is_enough() {
        let config =
            load(&[(ENV_NEGENTROPY_ENABLE, "false"), (ENV_LEGACY_SYNC_ENABLE, "true")]).unwrap();
        assert!(!config.negentropy_enabled);
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let err = load(&[(ENV_EXPORT_INTERVAL, "0")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid MESHSYNC_EXPORT_INTERVAL; expected a positive integer"
        );

        let err = load(&[(ENV_NEGENTROPY_ENABLE, "maybe")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid MESHSYNC_NEGENTROPY_ENABLE; expected true or false"
        );

        let err = load(&[(ENV_FRAME_SIZE_LIMIT, "1024")]).unwrap_err();
        assert!(err.to_string().contains("MESHSYNC_NEGENTROPY_FRAME_SIZE_LIMIT"));
        assert!(err.to_string().contains("expected 0 or >= 4096"));

        assert!(load(&[(ENV_BOOTSTRAP_DRIFT_THRESHOLD, "2")]).is_err());
        assert!(load(&[(ENV_MAX_OPS_PER_PUSH, "-3")]).is_err());
    }

    #[test]
    fn test_overrides_flow_into_options() {
        let config = load(&[
            (ENV_FRAME_SIZE_LIMIT, "8192"),
            (ENV_RECENT_WINDOW_DAYS, "3"),
            (ENV_MAX_OPS_PER_PUSH, "10"),
            (ENV_NODE_NAME, "node-a"),
            ("PATH", "/usr/bin"),
        ])
        .unwrap();
        assert_eq!(config.node_name, "node-a");
        assert_eq!(config.adapter_options().frame_size_limit, 8192);
        assert_eq!(config.adapter_options().recent_window_days, 3);
        assert_eq!(config.push_limits().max_ops_per_push, 10);
    }
}
