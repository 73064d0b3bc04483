//! API server configuration

use anyhow::Context;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Apply embedded migrations on start-up
    pub run_migrations: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let bind_address = std::env::var("BIND_ADDRESS")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
        let run_migrations = std::env::var("RUN_MIGRATIONS")
            .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
            .unwrap_or(true);

        Ok(Self {
            database_url,
            bind_address,
            run_migrations,
        })
    }
}
