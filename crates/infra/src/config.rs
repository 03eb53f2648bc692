//! Layered configuration: built-in defaults, then an optional
//! `config/packledger.{toml}` file, then `PACKLEDGER__*` environment variables.

use std::collections::BTreeMap;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use packledger_observability::LogSettings;
use packledger_packages::BarcodeFormat;

const CONFIG_FILE: &str = "config/packledger";
const ENV_PREFIX: &str = "PACKLEDGER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration loading failed: {0}")]
    Load(#[from] config::ConfigError),

    #[error("configuration invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Bins the ledger moves packages into on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct WarehouseBins {
    /// Where new target packages are assembled.
    pub staging_bin: i32,
    /// Where target packages of a cancelled pick list are parked.
    pub cancellation_bin: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PackageSettings {
    pub barcode_prefix: String,
    pub barcode_length: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ErpSettings {
    pub write_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LedgerConfig {
    pub database: DatabaseConfig,
    pub bins: WarehouseBins,
    /// Per-warehouse overrides of `bins`.
    #[serde(default)]
    pub warehouses: BTreeMap<String, WarehouseBins>,
    pub packages: PackageSettings,
    pub erp: ErpSettings,
    #[serde(default)]
    pub logging: LogSettings,
}

impl LedgerConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(CONFIG_FILE)
    }

    pub fn load_from(file: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("database.url", "postgres://localhost/packledger")?
            .set_default("database.max_connections", 5)?
            .set_default("bins.staging_bin", 1)?
            .set_default("bins.cancellation_bin", 2)?
            .set_default("packages.barcode_prefix", "PKG")?
            .set_default("packages.barcode_length", 10)?
            .set_default("erp.write_timeout_ms", 30_000)?
            .add_source(File::with_name(file).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let ledger: LedgerConfig = config.try_deserialize()?;
        ledger.validate()?;
        Ok(ledger)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packages.barcode_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("packages.barcode_prefix is empty".into()));
        }
        if self.packages.barcode_length == 0 {
            return Err(ConfigError::Invalid("packages.barcode_length must be > 0".into()));
        }
        if self.erp.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid("erp.write_timeout_ms must be > 0".into()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid("database.max_connections must be > 0".into()));
        }
        let overrides = self.warehouses.iter().map(|(w, b)| (w.as_str(), b));
        for (warehouse, bins) in std::iter::once(("default", &self.bins)).chain(overrides) {
            if bins.staging_bin == bins.cancellation_bin {
                return Err(ConfigError::Invalid(format!(
                    "{warehouse}: cancellation bin equals staging bin ({})",
                    bins.staging_bin
                )));
            }
        }
        self.barcode_format()?;
        Ok(())
    }

    /// Bins for a warehouse, falling back to the global ones.
    pub fn bins_for(&self, warehouse: &str) -> WarehouseBins {
        self.warehouses.get(warehouse).copied().unwrap_or(self.bins)
    }

    pub fn barcode_format(&self) -> Result<BarcodeFormat, ConfigError> {
        BarcodeFormat::new(
            self.packages.barcode_prefix.as_str(),
            usize::from(self.packages.barcode_length),
        )
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn erp_write_timeout(&self) -> Duration {
        Duration::from_millis(self.erp.write_timeout_ms)
    }
}

impl Default for LedgerConfig {
    /// Development defaults, identical to the built-in layer of [`LedgerConfig::load`].
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/packledger".into(),
                max_connections: 5,
            },
            bins: WarehouseBins {
                staging_bin: 1,
                cancellation_bin: 2,
            },
            warehouses: BTreeMap::new(),
            packages: PackageSettings {
                barcode_prefix: "PKG".into(),
                barcode_length: 10,
            },
            erp: ErpSettings {
                write_timeout_ms: 30_000,
            },
            logging: LogSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_file() {
        let config = LedgerConfig::load_from("config/does-not-exist").unwrap();
        assert_eq!(config.packages.barcode_prefix, "PKG");
        assert_eq!(config.bins.cancellation_bin, 2);
        assert_eq!(config.erp_write_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn warehouse_override_wins() {
        let mut config = LedgerConfig::default();
        config.warehouses.insert(
            "W02".into(),
            WarehouseBins {
                staging_bin: 20,
                cancellation_bin: 21,
            },
        );
        assert_eq!(config.bins_for("W02").cancellation_bin, 21);
        assert_eq!(config.bins_for("W01"), config.bins);
    }

    #[test]
    fn rejects_cancellation_bin_equal_to_staging_bin() {
        let mut config = LedgerConfig::default();
        config.warehouses.insert(
            "W03".into(),
            WarehouseBins {
                staging_bin: 7,
                cancellation_bin: 7,
            },
        );
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("W03")));
    }

    #[test]
    fn rejects_empty_prefix_and_zero_timeout() {
        let mut config = LedgerConfig::default();
        config.packages.barcode_prefix = " ".into();
        assert!(config.validate().is_err());

        let mut config = LedgerConfig::default();
        config.erp.write_timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
