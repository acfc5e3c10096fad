// Service configuration, read from the environment.
//
// Keys
// - SAGA_BROKERS             comma separated broker addresses (required)
// - SAGA_TRANSACTIONAL_ID    base transactional id, suffixed per producer (required)
// - SAGA_RESULTS_TOPIC       topic the orchestrator reads step outcomes from
// - SAGA_HTTP_ADDR           listen address of the HTTP inbound adapter
// - SAGA_OPERATION_TIMEOUT_MS, SAGA_CREATE_MAX_RETRIES, SAGA_COMMIT_MAX_RETRIES,
//   SAGA_BACKOFF_BASE_MS, SAGA_BACKOFF_MAX_MS

use crate::modules::outcome_publisher::adapters::outbound::producer_factory::ProducerOptions;
use crate::shared::core::backoff::BackoffPolicy;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_RESULTS_TOPIC: &str = "saga-step-results";
const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing configuration key {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub brokers: Vec<String>,
    pub transactional_id: String,
    pub results_topic: String,
    pub http_addr: SocketAddr,
    pub operation_timeout: Duration,
    pub create_max_retries: u32,
    pub commit_max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let brokers: Vec<String> = required(&lookup, "SAGA_BROKERS")?
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(String::from)
            .collect();
        if brokers.is_empty() {
            return Err(ConfigError::Missing("SAGA_BROKERS"));
        }
        Ok(Self {
            brokers,
            transactional_id: required(&lookup, "SAGA_TRANSACTIONAL_ID")?,
            results_topic: lookup("SAGA_RESULTS_TOPIC")
                .unwrap_or_else(|| DEFAULT_RESULTS_TOPIC.to_string()),
            http_addr: parsed(&lookup, "SAGA_HTTP_ADDR", DEFAULT_HTTP_ADDR)?,
            operation_timeout: millis(&lookup, "SAGA_OPERATION_TIMEOUT_MS", 10_000)?,
            create_max_retries: parsed(&lookup, "SAGA_CREATE_MAX_RETRIES", "8")?,
            commit_max_retries: parsed(&lookup, "SAGA_COMMIT_MAX_RETRIES", "5")?,
            backoff_base: millis(&lookup, "SAGA_BACKOFF_BASE_MS", 100)?,
            backoff_max: millis(&lookup, "SAGA_BACKOFF_MAX_MS", 5_000)?,
        })
    }

    pub fn producer_options(&self) -> ProducerOptions {
        ProducerOptions::new(self.brokers.clone(), self.transactional_id.clone())
            .with_operation_timeout(self.operation_timeout)
    }

    pub fn creation_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.backoff_max, self.create_max_retries)
    }

    pub fn commit_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.backoff_max, self.commit_max_retries)
    }
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: &str,
) -> Result<T, ConfigError> {
    let value = lookup(key).unwrap_or_else(|| default.to_string());
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { key, value })
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parsed(lookup, key, &default.to_string()).map(Duration::from_millis)
}
