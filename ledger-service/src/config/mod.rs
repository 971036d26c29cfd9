//! Configuration module for the clinic ledger.

use crate::services::memory::DEFAULT_LOCK_TIMEOUT;
use crate::services::retry::RetryConfig;
use crate::services::store::{Scope, DEFAULT_PAGE_SIZE};
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub reconciliation: ReconciliationJobConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Knobs for the payment and refund units of work.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_retries: u32,
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: RetryConfig::default().max_retries,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl EngineConfig {
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::with_max_retries(self.max_retries)
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationJobConfig {
    pub page_size: i32,
    /// `None` reconciles every organization.
    pub org_id: Option<Uuid>,
}

impl Default for ReconciliationJobConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            org_id: None,
        }
    }
}

impl ReconciliationJobConfig {
    pub fn scope(&self) -> Scope {
        self.org_id.map_or(Scope::Global, Scope::Organization)
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let engine_defaults = EngineConfig::default();

        let org_id = match env::var("RECONCILIATION_ORG_ID") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().parse::<Uuid>().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!(
                    "RECONCILIATION_ORG_ID is not a valid UUID: {}",
                    e
                ))
            })?),
            _ => None,
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "clinic-ledger".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            engine: EngineConfig {
                max_retries: parse_or("LEDGER_MAX_RETRIES", engine_defaults.max_retries),
                lock_timeout: Duration::from_millis(parse_or(
                    "LEDGER_LOCK_TIMEOUT_MS",
                    engine_defaults.lock_timeout.as_millis() as u64,
                )),
            },
            reconciliation: ReconciliationJobConfig {
                page_size: parse_or("RECONCILIATION_PAGE_SIZE", DEFAULT_PAGE_SIZE),
                org_id,
            },
        })
    }
}
