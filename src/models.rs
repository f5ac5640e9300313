use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use num_bigint::BigInt;

use crate::chain::abi::Address;

/// A round-start announcement decoded from a `NewRound` log.
///
/// Lives for exactly one coordinator decision cycle.
#[derive(Debug, Clone)]
pub struct Round {
    pub id: u64,
    pub started_by: Address,
    pub started_at: u64,
}

/// One observation of the off-chain reference price.
#[derive(Debug, Clone)]
pub struct PriceSample {
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

/// Events forwarded from the chain poller to the coordinator.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    RoundStarted(Round),
    AnswerUpdated {
        round_id: u64,
        answer: BigInt,
        updated_at: u64,
    },
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub node_http_url: String,
    pub node_ws_url: Option<String>,
    pub contract_address: Address,
    pub oracle_address: Address,
    pub api_url: String,
    pub api_header: Option<(String, String)>,
    pub api_json_path: String,
    pub poll_interval: Duration,
    pub drumbeat_interval: Duration,
    pub backoff_base: Duration,
    pub replay_from_block: Option<u64>,
    pub http_timeout: Duration,
    pub receipt_timeout: Duration,
    pub answer_round_starts: bool,
    pub dry_run: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let node_http_url =
            std::env::var("FK_NODE_HTTP_URL").context("FK_NODE_HTTP_URL is required")?;

        let node_ws_url = std::env::var("FK_NODE_WS_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let contract_address = std::env::var("FK_CONTRACT_ADDRESS")
            .context("FK_CONTRACT_ADDRESS is required")?
            .parse::<Address>()
            .context("FK_CONTRACT_ADDRESS is not a valid address")?;

        let oracle_address = std::env::var("FK_ORACLE_ADDRESS")
            .context("FK_ORACLE_ADDRESS is required")?
            .parse::<Address>()
            .context("FK_ORACLE_ADDRESS is not a valid address")?;

        let api_url = std::env::var("FK_API_URL").context("FK_API_URL is required")?;

        let api_header = match (
            std::env::var("FK_API_HEADER_NAME").ok(),
            std::env::var("FK_API_HEADER_VALUE").ok(),
        ) {
            (Some(name), Some(value)) if !name.trim().is_empty() => Some((name, value)),
            _ => None,
        };

        let api_json_path =
            std::env::var("FK_API_JSON_PATH").context("FK_API_JSON_PATH is required")?;

        let poll_interval = env_secs("FK_POLL_INTERVAL_SECS", 30);
        let drumbeat_interval = env_secs("FK_DRUMBEAT_INTERVAL_SECS", 120);
        let backoff_base = env_secs("FK_BACKOFF_BASE_SECS", 120);
        let http_timeout = env_secs("FK_HTTP_TIMEOUT_SECS", 10);
        let receipt_timeout = env_secs("FK_RECEIPT_TIMEOUT_SECS", 90);

        let replay_from_block = std::env::var("FK_REPLAY_FROM_BLOCK")
            .ok()
            .and_then(|v| v.parse::<u64>().ok());

        let answer_round_starts = env_flag("FK_ANSWER_ROUND_STARTS", true);
        let dry_run = env_flag("FK_DRY_RUN", false);

        Ok(Self {
            node_http_url,
            node_ws_url,
            contract_address,
            oracle_address,
            api_url,
            api_header,
            api_json_path,
            poll_interval,
            drumbeat_interval,
            backoff_base,
            replay_from_block,
            http_timeout,
            receipt_timeout,
            answer_round_starts,
            dry_run,
        })
    }
}

fn env_secs(var: &str, default: u64) -> Duration {
    let secs = std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}

fn env_flag(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}
