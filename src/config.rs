// src/config.rs
// Relay link configuration and startup validation

use crate::chain::BtpAddress;
use crate::error::{RelayError, Result};
use crate::reconciler::PollPolicy;
use crate::segment::ChainKind;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Configuration validation result
#[derive(Debug, Default)]
pub struct ConfigValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    fn new() -> Self {
        Self {
            valid: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn add_warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    fn add_error(&mut self, msg: String) {
        self.errors.push(msg);
        self.valid = false;
    }

    pub fn print_summary(&self) {
        for w in &self.warnings {
            warn!("config: {}", w);
        }
        for e in &self.errors {
            error!("config: {}", e);
        }
        if self.valid {
            info!(
                "configuration valid ({} warning(s))",
                self.warnings.len()
            );
        }
    }

    /// Turn collected errors into a single `RelayError::Config`.
    pub fn into_result(self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(RelayError::Config(self.errors.join("; ")))
        }
    }
}

fn default_db_path() -> String {
    "./data".into()
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_result_workers() -> usize {
    10
}

fn default_result_retry_count() -> u32 {
    10
}

fn default_result_retry_interval_ms() -> u64 {
    2000
}

/// One relay link: source chain to destination chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Bucket prefix and log label.
    pub link_name: String,
    pub src: BtpAddress,
    pub dst: BtpAddress,
    /// This relayer's BMR address as registered on the destination BMC.
    pub relayer_address: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Retained root limit of the accumulator; 0 keeps every root.
    #[serde(default)]
    pub limit_roots: usize,
    #[serde(default)]
    pub chain_kind: ChainKind,
    #[serde(default)]
    pub tx_size_limit: Option<usize>,
    #[serde(default = "default_interval_ms")]
    pub src_block_interval_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub dst_block_interval_ms: u64,
    #[serde(default = "default_result_workers")]
    pub result_workers: usize,
    #[serde(default = "default_result_retry_count")]
    pub result_retry_count: u32,
    #[serde(default = "default_result_retry_interval_ms")]
    pub result_retry_interval_ms: u64,
}

impl RelayConfig {
    pub fn new(link_name: &str, src: BtpAddress, dst: BtpAddress, relayer_address: &str) -> Self {
        Self {
            link_name: link_name.to_string(),
            src,
            dst,
            relayer_address: relayer_address.to_string(),
            db_path: default_db_path(),
            limit_roots: 0,
            chain_kind: ChainKind::default(),
            tx_size_limit: None,
            src_block_interval_ms: default_interval_ms(),
            dst_block_interval_ms: default_interval_ms(),
            result_workers: default_result_workers(),
            result_retry_count: default_result_retry_count(),
            result_retry_interval_ms: default_result_retry_interval_ms(),
        }
    }

    /// Load configuration from JSON file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: RelayConfig = serde_json::from_str(&content)
            .map_err(|e| RelayError::Config(format!("{}: {}", path, e)))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `BTP_RELAY_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup("BTP_RELAY_DB_PATH") {
            self.db_path = path;
        }
        if let Some(address) = lookup("BTP_RELAY_ADDRESS") {
            self.relayer_address = address;
        }
        if let Some(limit) = lookup("BTP_RELAY_LIMIT_ROOTS") {
            self.limit_roots = limit.trim().parse().map_err(|e| {
                RelayError::Config(format!("BTP_RELAY_LIMIT_ROOTS '{}': {}", limit, e))
            })?;
        }
        Ok(())
    }

    pub fn tx_size_limit(&self) -> usize {
        self.tx_size_limit
            .unwrap_or_else(|| self.chain_kind.default_tx_size_limit())
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            retries: self.result_retry_count,
            interval: Duration::from_millis(self.result_retry_interval_ms),
        }
    }

    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::new();

        if self.link_name.trim().is_empty() {
            validation.add_error("link_name must not be empty".into());
        }
        if self.src == self.dst {
            validation.add_error(format!("src and dst are the same address {}", self.src));
        }
        if self.relayer_address.trim().is_empty() {
            validation.add_error("relayer_address must not be empty".into());
        }
        if self.db_path.trim().is_empty() {
            validation.add_error("db_path must not be empty".into());
        }
        if self.result_workers == 0 {
            validation.add_error("result_workers must be at least 1".into());
        }
        if self.tx_size_limit() == 0 {
            validation.add_error("tx_size_limit must be positive".into());
        }
        if self.src_block_interval_ms == 0 || self.dst_block_interval_ms == 0 {
            validation.add_warning(
                "block interval of 0 disables the destination height estimate".into(),
            );
        }
        if self.limit_roots == 0 {
            validation.add_warning("limit_roots is 0: accumulator storage grows unbounded".into());
        } else if self.limit_roots < 4 {
            validation.add_warning(format!(
                "limit_roots {} keeps at most {} blocks provable",
                self.limit_roots,
                (1u64 << self.limit_roots) - 1
            ));
        }
        if self.result_retry_count == 0 {
            validation.add_warning("result_retry_count 0 polls each result only once".into());
        }

        validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> RelayConfig {
        RelayConfig::new(
            "icon-bsc",
            "btp://0x1.icon/cx01".parse().unwrap(),
            "btp://0x38.bsc/0x02".parse().unwrap(),
            "hx0001",
        )
    }

    #[test]
    fn defaults_from_minimal_json() {
        let json = r#"{
            "link_name": "icon-bsc",
            "src": "btp://0x1.icon/cx01",
            "dst": "btp://0x38.bsc/0x02",
            "relayer_address": "hx0001",
            "chain_kind": "evm"
        }"#;
        let c: RelayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.db_path, "./data");
        assert_eq!(c.limit_roots, 0);
        assert_eq!(c.result_workers, 10);
        assert_eq!(c.tx_size_limit(), 131_072);
        assert_eq!(c.poll_policy().interval, Duration::from_millis(2000));
    }

    #[test]
    fn bad_address_is_rejected() {
        let json = r#"{"link_name": "x", "src": "icon", "dst": "btp://0x38.bsc/0x02", "relayer_address": "hx"}"#;
        assert!(serde_json::from_str::<RelayConfig>(json).is_err());
    }

    #[test]
    fn overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("BTP_RELAY_DB_PATH", "/var/lib/relay"),
            ("BTP_RELAY_LIMIT_ROOTS", "12"),
        ]
        .into_iter()
        .collect();
        let mut c = config();
        c.apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(c.db_path, "/var/lib/relay");
        assert_eq!(c.limit_roots, 12);
        assert_eq!(c.relayer_address, "hx0001");

        let mut c = config();
        let res = c.apply_overrides(|k| (k == "BTP_RELAY_LIMIT_ROOTS").then(|| "many".to_string()));
        assert!(matches!(res, Err(RelayError::Config(_))));
    }

    #[test]
    fn validation_collects_errors_and_warnings() {
        let c = config();
        let v = c.validate();
        assert!(v.valid);
        assert_eq!(v.warnings.len(), 1);

        let mut c = config();
        c.dst = c.src.clone();
        c.result_workers = 0;
        c.relayer_address.clear();
        let v = c.validate();
        assert!(!v.valid);
        assert_eq!(v.errors.len(), 3);
        assert!(v.into_result().is_err());
    }

    #[test]
    fn load_from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        let mut c = config();
        c.limit_roots = 8;
        std::fs::write(&path, serde_json::to_string(&c).unwrap()).unwrap();
        let loaded = RelayConfig::load_from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.link_name, "icon-bsc");
        assert_eq!(loaded.src, c.src);
    }
}
