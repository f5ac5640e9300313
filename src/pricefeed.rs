//! Off-chain reference price fetcher
//!
//! One GET against a configurable endpoint, one optional header, and a
//! dot-separated field path into the JSON body. Retry policy belongs to the
//! caller; a failed fetch is reported and the triggering cycle is abandoned.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::models::{Config, PriceSample};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("endpoint returned status {0}")]
    Status(u16),
    #[error("body is not valid json: {0}")]
    BadJson(String),
    #[error("field path `{0}` did not resolve")]
    MissingField(String),
    #[error("value at `{0}` is not a finite number")]
    NotANumber(String),
}

/// Seam for the coordinator; production uses [`PriceFetcher`], tests script
/// their own samples.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch(&self) -> Result<PriceSample, FetchError>;
}

pub struct PriceFetcher {
    http: reqwest::Client,
    url: String,
    header: Option<(String, String)>,
    path: Vec<String>,
}

impl PriceFetcher {
    pub fn from_config(cfg: &Config) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout)
            .build()?;
        Ok(Self {
            http,
            url: cfg.api_url.clone(),
            header: cfg.api_header.clone(),
            path: cfg
                .api_json_path
                .split('.')
                .map(|s| s.to_string())
                .collect(),
        })
    }
}

#[async_trait]
impl PriceSource for PriceFetcher {
    async fn fetch(&self) -> Result<PriceSample, FetchError> {
        let mut request = self.http.get(&self.url);
        if let Some((name, value)) = &self.header {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::BadJson(e.to_string()))?;

        let value = extract_number(&body, &self.path)?;
        debug!(url = %self.url, price = value, "fetched reference price");

        Ok(PriceSample {
            value,
            observed_at: Utc::now(),
        })
    }
}

/// Walk a dot path through nested JSON objects and read a finite number.
/// Numeric strings are accepted since several price APIs quote their floats.
fn extract_number(body: &Value, path: &[String]) -> Result<f64, FetchError> {
    let joined = || path.join(".");

    let mut cursor = body;
    for segment in path {
        cursor = cursor
            .get(segment)
            .ok_or_else(|| FetchError::MissingField(joined()))?;
    }

    let value = match cursor {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    };

    value
        .filter(|v| v.is_finite())
        .ok_or_else(|| FetchError::NotANumber(joined()))
}
