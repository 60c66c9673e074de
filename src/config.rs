// src/config.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub binance: BinanceRouter,
    pub redis: RedisConfig,
}

/// Routes between the configured venue environments.
#[derive(Clone, Debug, Deserialize)]
pub struct BinanceRouter {
    pub active_env: String,
    pub symbol: String,
    pub mainnet: EnvConfig,
    pub testnet: EnvConfig,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct EnvConfig {
    pub api_key: String,
    pub api_secret: String,
    pub rest_base_url: String,
    pub ws_depth_url: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RedisConfig {
    pub addr: String,
    pub db: i64,
}

impl Config {
    /// Loads the JSON document and applies env-var secret overrides so
    /// keys never have to live in the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config document {}", path.display()))?;

        if let Ok(v) = std::env::var("BINANCE_MAINNET_API_KEY") {
            cfg.binance.mainnet.api_key = v;
        }
        if let Ok(v) = std::env::var("BINANCE_MAINNET_API_SECRET") {
            cfg.binance.mainnet.api_secret = v;
        }
        if let Ok(v) = std::env::var("BINANCE_TESTNET_API_KEY") {
            cfg.binance.testnet.api_key = v;
        }
        if let Ok(v) = std::env::var("BINANCE_TESTNET_API_SECRET") {
            cfg.binance.testnet.api_secret = v;
        }

        Ok(cfg)
    }
}

impl BinanceRouter {
    /// Anything other than an explicit "mainnet" routes to testnet, the
    /// safe default for a fat-fingered environment name.
    pub fn active_env(&self) -> &EnvConfig {
        if self.active_env == "mainnet" {
            &self.mainnet
        } else {
            &self.testnet
        }
    }

    /// Websocket host for the private user-data stream of the active
    /// environment.
    pub fn user_ws_base(&self) -> &'static str {
        if self.active_env == "mainnet" {
            "wss://fstream.binance.com"
        } else {
            "wss://stream.binancefuture.com"
        }
    }
}
