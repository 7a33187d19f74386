//! The manifold pipe: model listing and chat-completion dispatch.
//!
//! [`Pipe::pipes`] feeds the host's model dropdown and [`Pipe::pipe`]
//! forwards one chat turn to `POST {base_url}/chat/completions`.

pub mod headers;
pub mod retry;
pub mod stream;

use std::fmt;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::PipeError;
use crate::models::{self, ModelEntry};
use crate::utils::join_endpoint;

pub use headers::{UserField, UserInfo};
pub use retry::RetryPolicy;
pub use stream::{LineStream, StreamFormat};

/// Host plugin type.
pub const PIPE_TYPE: &str = "manifold";
/// Display name of the pipe in the host UI.
pub const PIPE_NAME: &str = "PORTKEY";

/// A chat-completion request body.
///
/// `model` and `stream` are typed; every other field is passed through
/// to the gateway unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Parse a loosely typed host body.
    pub fn from_value(body: Value) -> Result<Self, PipeError> {
        serde_json::from_value(body).map_err(|e| PipeError::InvalidRequest(e.to_string()))
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Streaming unless the body explicitly says otherwise.
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(true)
    }
}

/// Result of a dispatch: a parsed JSON body or a lazy line stream.
pub enum PipeOutput {
    Json(Value),
    Stream(LineStream),
}

impl PipeOutput {
    pub fn into_json(self) -> Option<Value> {
        match self {
            PipeOutput::Json(v) => Some(v),
            PipeOutput::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<LineStream> {
        match self {
            PipeOutput::Stream(s) => Some(s),
            PipeOutput::Json(_) => None,
        }
    }
}

impl fmt::Debug for PipeOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeOutput::Json(v) => f.debug_tuple("Json").field(v).finish(),
            PipeOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// One configured pipe instance.
///
/// Holds a single pooled HTTP client that is safe to share across
/// concurrent dispatches.
#[derive(Clone)]
pub struct Pipe {
    config: Config,
    client: Client,
    retry: RetryPolicy,
}

impl Pipe {
    pub fn new(config: Config) -> Result<Self, PipeError> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| PipeError::Config(format!("failed to build HTTP client: {e}")))?;
        let retry = RetryPolicy::from_config(&config);
        Ok(Self {
            config,
            client,
            retry,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Models offered to the user: discovered (when enabled) followed by
    /// the manual list, de-duplicated in first-seen order. Never fails.
    pub async fn pipes(&self) -> Vec<ModelEntry> {
        let discovered = models::discover_models(&self.client, &self.config, &self.retry).await;
        models::model_entries(discovered, &self.config.models)
    }

    /// Forward one chat turn.
    ///
    /// Streaming requests are sent once and return [`PipeOutput::Stream`];
    /// an HTTP error is reported before any line is produced. Non-streaming
    /// requests go through the retry policy and return the parsed body.
    pub async fn pipe(
        &self,
        request: ChatRequest,
        user: Option<&UserInfo>,
    ) -> Result<PipeOutput, PipeError> {
        if request.model.is_empty() {
            return Err(PipeError::MissingModel);
        }
        let streaming = request.is_streaming();
        let upstream_model = models::clean_model_id(&request.model).to_string();
        let payload = ChatRequest {
            model: upstream_model,
            ..request
        };

        let headers = headers::build_headers(&self.config, user)?;
        let url = join_endpoint(&self.config.base_url, "chat/completions");
        debug!(model = %payload.model, stream = streaming, "dispatching chat completion");

        let build = || {
            self.client
                .post(&url)
                .headers(headers.clone())
                .json(&payload)
        };

        let resp = if streaming {
            build().send().await.map_err(|e| PipeError::network(&e))?
        } else {
            self.retry.send(build).await?
        };

        let status = resp.status();
        if !status.is_success() {
            let err = PipeError::from_response(resp).await;
            warn!(status = status.as_u16(), stream = streaming, error = %err, "gateway returned an error");
            return Err(err);
        }

        if streaming {
            Ok(PipeOutput::Stream(stream::normalized_lines(
                resp,
                self.config.stream_format,
            )))
        } else {
            let body: Value = resp
                .json()
                .await
                .map_err(|e| PipeError::Decode(e.to_string()))?;
            Ok(PipeOutput::Json(body))
        }
    }

    /// [`Pipe::pipe`] for untyped host payloads.
    pub async fn pipe_value(
        &self,
        body: Value,
        user: Option<&Value>,
    ) -> Result<PipeOutput, PipeError> {
        let request = ChatRequest::from_value(body)?;
        let user = match user {
            Some(u) if !u.is_null() => Some(
                serde_json::from_value::<UserInfo>(u.clone())
                    .map_err(|e| PipeError::InvalidRequest(format!("user: {e}")))?,
            ),
            _ => None,
        };
        self.pipe(request, user.as_ref()).await
    }
}
