//! Model identifiers: namespace stripping and discovery.
//!
//! The host prefixes model ids with the pipe's own namespace
//! (`portkey_manifold_pipe.@openai/gpt-4o`); that prefix is removed before
//! anything is forwarded upstream. Discovery merges the gateway's
//! `/models` listing with the manually configured list.

use std::collections::HashSet;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::PipeError;
use crate::pipe::headers;
use crate::pipe::retry::RetryPolicy;
use crate::utils::join_endpoint;

/// One entry of the model dropdown. `name` always equals `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
}

impl ModelEntry {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
        }
    }
}

/// Strip the host namespace: everything after the first `.`, or the id
/// unchanged when it has no `.`.
pub fn clean_model_id(full_model_id: &str) -> &str {
    match full_model_id.split_once('.') {
        Some((_, rest)) => rest,
        None => full_model_id,
    }
}

/// Extract model ids from a listing payload.
///
/// Accepts `{"data": [{"id": ..}]}` or a bare array of id strings or
/// `{"id": ..}` objects. Entries without a string id are skipped.
pub fn parse_model_listing(payload: &Value) -> Vec<String> {
    if let Some(Value::Array(data)) = payload.get("data") {
        return data
            .iter()
            .filter_map(|item| item.get("id").and_then(Value::as_str))
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect();
    }

    match payload {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(obj) => obj.get("id").and_then(Value::as_str).map(String::from),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Split the manual comma-separated list, trimming and dropping empties.
pub fn parse_manual_models(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect()
}

/// Remove duplicates, keeping the first occurrence of each id.
pub fn dedup_preserving_order<I>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    ids.into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Merge discovered and manual ids into dropdown entries.
pub fn model_entries(discovered: Vec<String>, manual_csv: &str) -> Vec<ModelEntry> {
    let merged = discovered.into_iter().chain(parse_manual_models(manual_csv));
    dedup_preserving_order(merged)
        .into_iter()
        .map(ModelEntry::new)
        .collect()
}

/// Best-effort model discovery. Never fails: any error is logged and
/// treated as "no models discovered".
pub async fn discover_models(client: &Client, config: &Config, retry: &RetryPolicy) -> Vec<String> {
    if !config.auto_discover_models {
        return Vec::new();
    }
    match fetch_model_listing(client, config, retry).await {
        Ok(ids) => {
            debug!(count = ids.len(), "discovered models");
            ids
        }
        Err(e) => {
            warn!(error = %e, "model discovery failed, continuing with manual list");
            Vec::new()
        }
    }
}

/// `GET {base_url}/models`, with bearer auth when a key is configured.
pub async fn fetch_model_listing(
    client: &Client,
    config: &Config,
    retry: &RetryPolicy,
) -> Result<Vec<String>, PipeError> {
    let url = join_endpoint(&config.base_url, "models");
    let auth = headers::base_headers(config).ok();
    let timeout = Duration::from_secs(config.discovery_timeout_secs);

    let resp = retry
        .send(|| {
            let mut req = client.get(&url).timeout(timeout);
            if let Some(h) = &auth {
                req = req.headers(h.clone());
            }
            req
        })
        .await?;

    let status = resp.status();
    if status != reqwest::StatusCode::OK {
        return Err(PipeError::from_response(resp).await);
    }

    let payload: Value = resp
        .json()
        .await
        .map_err(|e| PipeError::Decode(e.to_string()))?;
    Ok(parse_model_listing(&payload))
}
