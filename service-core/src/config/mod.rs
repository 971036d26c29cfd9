use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;

/// Settings shared by every binary in the workspace.
///
/// Read from an optional `configuration` file, then `APP__*` environment
/// variables (e.g. `APP__ENVIRONMENT=production`).
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_json_logs")]
    pub json_logs: bool,
}

fn default_environment() -> String {
    "local".to_string()
}

fn default_json_logs() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            json_logs: default_json_logs(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}
