//! Pipe configuration ("valves").
//!
//! Values come from an optional YAML file, then environment overrides
//! named after the plugin valves (`PORTKEY_API_KEY`, `STREAM_FORMAT`, ...).

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::pipe::stream::StreamFormat;

/// Default gateway base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.portkey.ai/v1";

/// File picked up from the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "portkey-pipe.yaml";

/// Settings for one pipe instance. Immutable for the duration of a request.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Portkey API key, sent as a bearer token. Plain text or `$ENV_VAR`.
    pub api_key: String,
    /// Base URL of the gateway (change only for self-hosted deployments).
    pub base_url: String,
    /// Fetch `GET {base_url}/models` to fill the model list.
    pub auto_discover_models: bool,
    /// Comma-separated model ids, used alone or to augment discovery.
    pub models: String,
    /// How streamed lines are returned to the caller.
    pub stream_format: StreamFormat,
    /// Forward `X-OpenWebUI-*` identity headers.
    pub forward_user_info_headers: bool,
    /// Send `x-portkey-metadata` with user info as JSON.
    pub send_metadata_header: bool,
    /// Connect and read timeout for chat calls, in seconds.
    pub request_timeout_secs: u64,
    /// Timeout for the model listing call, in seconds.
    pub discovery_timeout_secs: u64,
    /// Retry count for non-streaming requests.
    pub retries_non_stream: u32,
    /// Exponential backoff factor in seconds (non-streaming only).
    pub retry_backoff_factor: f64,
    /// Targets exercised by the `smoke` command.
    pub smoke: Vec<SmokeTarget>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            auto_discover_models: true,
            models: "@openai-slug/gpt-4o, @anthropic-slug/claude-sonnet-latest".to_string(),
            stream_format: StreamFormat::Auto,
            forward_user_info_headers: false,
            send_metadata_header: true,
            request_timeout_secs: 600,
            discovery_timeout_secs: 30,
            retries_non_stream: 3,
            retry_backoff_factor: 0.5,
            smoke: Vec::new(),
        }
    }
}

/// One upstream provider reached through a gateway virtual key.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SmokeTarget {
    /// Display name in the report (e.g. "Anthropic").
    pub label: String,
    /// Value of the `x-portkey-provider` header.
    pub provider: String,
    /// Value of the `x-portkey-virtual-key` header. Plain text or `$ENV_VAR`.
    pub virtual_key: String,
    /// Upstream model name.
    pub model: String,
    /// Enables the reasoning cases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
    /// Enables the `cache_control` prompt caching cases.
    #[serde(default)]
    pub prompt_caching: bool,
}

/// How a target is asked to reason. Exactly one of `effort` and
/// `thinking_budget` must be set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReasoningConfig {
    /// `reasoning.effort` (`low`, `medium`, `high`), for native reasoning models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
    /// `thinking.budget_tokens`, for extended thinking models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
    /// Model used for the reasoning cases instead of the target's model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Config {
    /// Read and parse a YAML configuration file, then validate it.
    ///
    /// Environment overrides are *not* applied here; see [`Config::resolve`].
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let mut config: Config = if contents.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml_ng::from_str(&contents)
                .with_context(|| format!("failed to parse config YAML: {}", path.display()))?
        };
        config.resolve_secrets(|k| std::env::var(k).ok());
        config.validate()?;

        tracing::debug!(
            path = %path.display(),
            base_url = %config.base_url,
            smoke_targets = config.smoke.len(),
            "configuration loaded"
        );

        Ok(config)
    }

    /// Build the effective configuration for the CLI.
    ///
    /// Uses `path` when given, otherwise [`DEFAULT_CONFIG_FILE`] if it
    /// exists, otherwise defaults. Environment overrides are applied last.
    pub async fn resolve(path: Option<&Path>) -> anyhow::Result<Config> {
        let mut config = match path {
            Some(p) => Config::load(p).await?,
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if tokio::fs::try_exists(fallback).await.unwrap_or(false) {
                    Config::load(fallback).await?
                } else {
                    Config::default()
                }
            }
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with environment variables.
    pub fn from_env() -> anyhow::Result<Config> {
        let mut config = Config::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_env_from(|k| std::env::var(k).ok())
    }

    /// Overlay values from an arbitrary lookup (keeps tests free of env races).
    pub fn apply_env_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PORTKEY_API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = lookup("PORTKEY_API_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = lookup("AUTO_DISCOVER_MODELS") {
            self.auto_discover_models = parse_bool("AUTO_DISCOVER_MODELS", &v)?;
        }
        if let Some(v) = lookup("PORTKEY_MODELS") {
            self.models = v;
        }
        if let Some(v) = lookup("STREAM_FORMAT") {
            self.stream_format = v
                .parse()
                .map_err(|e| anyhow::anyhow!("STREAM_FORMAT: {e}"))?;
        }
        if let Some(v) = lookup("FORWARD_USER_INFO_HEADERS") {
            self.forward_user_info_headers = parse_bool("FORWARD_USER_INFO_HEADERS", &v)?;
        }
        if let Some(v) = lookup("SEND_METADATA_HEADER") {
            self.send_metadata_header = parse_bool("SEND_METADATA_HEADER", &v)?;
        }
        if let Some(v) = lookup("REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_num("REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("DISCOVERY_TIMEOUT_SECS") {
            self.discovery_timeout_secs = parse_num("DISCOVERY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("RETRIES_NON_STREAM") {
            self.retries_non_stream = parse_num("RETRIES_NON_STREAM", &v)?;
        }
        if let Some(v) = lookup("RETRY_BACKOFF_FACTOR") {
            self.retry_backoff_factor = parse_num("RETRY_BACKOFF_FACTOR", &v)?;
        }
        self.resolve_secrets(lookup);
        Ok(())
    }

    /// Replace `$VAR` references in secret fields with their values.
    fn resolve_secrets<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.api_key = resolve_secret_ref(&self.api_key, &lookup);
        for target in &mut self.smoke {
            target.virtual_key = resolve_secret_ref(&target.virtual_key, &lookup);
        }
    }

    /// Validate semantic constraints that serde cannot enforce.
    ///
    /// A missing API key is deliberately not checked here: it surfaces as
    /// a configuration error when request headers are built.
    pub fn validate(&self) -> anyhow::Result<()> {
        let base = self.base_url.trim();
        if base.is_empty() {
            anyhow::bail!("config: base_url must not be empty");
        }
        let url = reqwest::Url::parse(base)
            .with_context(|| format!("config: base_url is not a valid URL: {base}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("config: base_url must use http or https, got '{}'", url.scheme());
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("config: request_timeout_secs must be greater than 0");
        }
        if self.discovery_timeout_secs == 0 {
            anyhow::bail!("config: discovery_timeout_secs must be greater than 0");
        }
        if !self.retry_backoff_factor.is_finite() || self.retry_backoff_factor < 0.0 {
            anyhow::bail!(
                "config: retry_backoff_factor must be a non-negative number, got {}",
                self.retry_backoff_factor
            );
        }
        for target in &self.smoke {
            if target.provider.trim().is_empty() || target.model.trim().is_empty() {
                anyhow::bail!(
                    "config: smoke target '{}' needs both provider and model",
                    target.label
                );
            }
            if let Some(reasoning) = &target.reasoning {
                if reasoning.effort.is_some() == reasoning.thinking_budget.is_some() {
                    anyhow::bail!(
                        "config: smoke target '{}' reasoning needs exactly one of effort or thinking_budget",
                        target.label
                    );
                }
                if reasoning.thinking_budget == Some(0) {
                    anyhow::bail!(
                        "config: smoke target '{}' thinking_budget must be greater than 0",
                        target.label
                    );
                }
            }
        }
        Ok(())
    }
}

/// If the value starts with `$`, it's treated as an env-var reference.
/// Unset variables resolve to an empty string.
fn resolve_secret_ref<F>(value: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match value.strip_prefix('$') {
        Some(var) if !var.is_empty() => lookup(var).unwrap_or_default(),
        _ => value.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("{key}: expected a boolean, got '{other}'"),
    }
}

fn parse_num<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{key}: invalid number '{value}': {e}"))
}
