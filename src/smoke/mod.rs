//! Live smoke run of the gateway's Responses API.
//!
//! Every configured [`SmokeTarget`] is exercised with the same set of
//! [`SmokeCase`]s; all requests run concurrently and the report keeps the
//! declaration order.

pub mod checks;

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use futures_util::future::join_all;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::{Config, SmokeTarget};
use crate::error::PipeError;
use crate::pipe::headers::base_headers;
use crate::pipe::stream::{LineSplitter, DONE_SENTINEL};
use crate::utils::{join_endpoint, truncate_chars};

pub const PROVIDER_HEADER: &str = "x-portkey-provider";
pub const VIRTUAL_KEY_HEADER: &str = "x-portkey-virtual-key";

/// Characters of an error message shown per line of the report.
const REPORT_ERROR_CHARS: usize = 80;

/// Image used by the vision case.
pub const IMAGE_URL: &str =
    "https://www.google.com/images/branding/googlelogo/2x/googlelogo_color_272x92dp.png";

const PIRATE: &str = "You are a pirate. Always respond in pirate speak.";

/// One scenario sent to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmokeCase {
    QuickStart,
    Instructions,
    SystemMessage,
    Streaming,
    ToolCalling,
    Reasoning,
    ExtendedThinking,
    PromptCachingContent,
    PromptCachingTools,
    Vision,
    JsonSchema,
    JsonObject,
    MultiTurn,
    FunctionCallResults,
}

impl SmokeCase {
    /// Every case in report order.
    pub const ALL: [SmokeCase; 14] = [
        SmokeCase::QuickStart,
        SmokeCase::Instructions,
        SmokeCase::SystemMessage,
        SmokeCase::Streaming,
        SmokeCase::ToolCalling,
        SmokeCase::Reasoning,
        SmokeCase::ExtendedThinking,
        SmokeCase::PromptCachingContent,
        SmokeCase::PromptCachingTools,
        SmokeCase::Vision,
        SmokeCase::JsonSchema,
        SmokeCase::JsonObject,
        SmokeCase::MultiTurn,
        SmokeCase::FunctionCallResults,
    ];

    pub fn title(self) -> &'static str {
        match self {
            SmokeCase::QuickStart => "Quick start",
            SmokeCase::Instructions => "Instructions param",
            SmokeCase::SystemMessage => "System message in input",
            SmokeCase::Streaming => "Streaming",
            SmokeCase::ToolCalling => "Tool calling",
            SmokeCase::Reasoning => "Reasoning",
            SmokeCase::ExtendedThinking => "Extended thinking",
            SmokeCase::PromptCachingContent => "Prompt caching content",
            SmokeCase::PromptCachingTools => "Prompt caching tools",
            SmokeCase::Vision => "Vision",
            SmokeCase::JsonSchema => "JSON schema",
            SmokeCase::JsonObject => "JSON object",
            SmokeCase::MultiTurn => "Multi-turn",
            SmokeCase::FunctionCallResults => "Function call results",
        }
    }

    /// Whether the target opted into this case.
    pub fn applies_to(self, target: &SmokeTarget) -> bool {
        match self {
            SmokeCase::Reasoning => target.reasoning.is_some(),
            SmokeCase::ExtendedThinking => target
                .reasoning
                .as_ref()
                .is_some_and(|r| r.thinking_budget.is_some()),
            SmokeCase::PromptCachingContent | SmokeCase::PromptCachingTools => {
                target.prompt_caching
            }
            _ => true,
        }
    }

    /// The cases run against `target`, in report order.
    pub fn for_target(target: &SmokeTarget) -> Vec<SmokeCase> {
        Self::ALL
            .into_iter()
            .filter(|case| case.applies_to(target))
            .collect()
    }

    /// Request body for `POST /responses`.
    pub fn request_body(self, target: &SmokeTarget) -> Value {
        let model = target.model.as_str();
        match self {
            SmokeCase::QuickStart => json!({
                "model": model,
                "input": "Explain quantum computing in one sentence",
            }),
            SmokeCase::Instructions => json!({
                "model": model,
                "instructions": PIRATE,
                "input": "Say hello.",
            }),
            SmokeCase::SystemMessage => json!({
                "model": model,
                "input": [
                    { "type": "message", "role": "system", "content": PIRATE },
                    { "type": "message", "role": "user", "content": "Say hello." }
                ],
            }),
            SmokeCase::Streaming => json!({
                "model": model,
                "input": "Write a haiku about AI",
                "stream": true,
            }),
            SmokeCase::ToolCalling => json!({
                "model": model,
                "input": "What's the weather in San Francisco?",
                "tools": [weather_tool()],
            }),
            SmokeCase::Reasoning => {
                reasoning_body(target, "Solve this step by step: What is 127 * 43?")
            }
            SmokeCase::ExtendedThinking => reasoning_body(
                target,
                "Analyze the implications of quantum computing on cryptography",
            ),
            SmokeCase::PromptCachingContent => json!({
                "model": model,
                "input": [{
                    "role": "user",
                    "content": [
                        {
                            "type": "input_text",
                            "text": "This is a document about artificial intelligence. ".repeat(100),
                            "cache_control": { "type": "ephemeral" }
                        },
                        { "type": "input_text", "text": "Summarize the key points in one sentence" }
                    ]
                }],
            }),
            SmokeCase::PromptCachingTools => json!({
                "model": model,
                "input": "Search for quantum computing",
                "tools": [{
                    "type": "function",
                    "name": "search",
                    "description": "Search the knowledge base",
                    "parameters": {
                        "type": "object",
                        "properties": { "query": { "type": "string" } }
                    },
                    "cache_control": { "type": "ephemeral" }
                }],
            }),
            SmokeCase::Vision => json!({
                "model": model,
                "input": [{
                    "role": "user",
                    "content": [
                        { "type": "input_image", "image_url": IMAGE_URL },
                        { "type": "input_text", "text": "Describe this image in one sentence" }
                    ]
                }],
            }),
            SmokeCase::JsonSchema => json!({
                "model": model,
                "input": "Extract the name and age from: John is 30 years old.",
                "text": {
                    "format": {
                        "type": "json_schema",
                        "name": "person",
                        "schema": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "age": { "type": "integer" }
                            },
                            "required": ["name", "age"],
                            "additionalProperties": false
                        }
                    }
                },
            }),
            SmokeCase::JsonObject => json!({
                "model": model,
                "input": "List 3 programming languages and their main use cases. Reply ONLY with a JSON object, no markdown.",
                "text": { "format": { "type": "json_object" } },
            }),
            SmokeCase::MultiTurn => json!({
                "model": model,
                "input": [
                    { "role": "user", "content": "My name is Alice." },
                    { "role": "assistant", "content": "Hello Alice! How can I help you?" },
                    { "role": "user", "content": "What is my name?" }
                ],
            }),
            SmokeCase::FunctionCallResults => json!({
                "model": model,
                "input": [
                    { "role": "user", "content": "What's the weather in Paris?" },
                    { "type": "function_call", "name": "get_weather", "call_id": "call_123", "arguments": "{\"location\": \"Paris\"}" },
                    { "type": "function_call_output", "call_id": "call_123", "output": "{\"temp\": \"22°C\", \"condition\": \"sunny\"}" }
                ],
                "tools": [weather_tool()],
            }),
        }
    }

    /// Validate a non-streaming response body.
    fn check(self, response: &Value) -> anyhow::Result<()> {
        match self {
            SmokeCase::ToolCalling => checks::expect_function_call(response, WEATHER_TOOL),
            SmokeCase::PromptCachingTools => checks::expect_output(response),
            SmokeCase::JsonSchema => checks::expect_fields(response, &["name", "age"]),
            SmokeCase::JsonObject => checks::expect_json_text(response).map(|_| ()),
            SmokeCase::MultiTurn => checks::expect_mentions(response, "alice"),
            _ => checks::expect_text(response).map(|_| ()),
        }
    }
}

const WEATHER_TOOL: &str = "get_weather";

fn weather_tool() -> Value {
    json!({
        "type": "function",
        "name": WEATHER_TOOL,
        "description": "Get current weather for a location",
        "parameters": {
            "type": "object",
            "properties": {
                "location": { "type": "string", "description": "City name" }
            },
            "required": ["location"]
        }
    })
}

/// Body for the reasoning cases: `reasoning.effort` or `thinking`,
/// depending on how the target is configured.
fn reasoning_body(target: &SmokeTarget, input: &str) -> Value {
    let Some(reasoning) = &target.reasoning else {
        return json!({ "model": target.model, "input": input });
    };
    let model = reasoning.model.as_deref().unwrap_or(&target.model);
    let mut body = json!({ "model": model, "input": input });
    if let Some(budget) = reasoning.thinking_budget {
        body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
    } else if let Some(effort) = &reasoning.effort {
        body["reasoning"] = json!({ "effort": effort });
    }
    body
}

/// Outcome of one case against one target.
#[derive(Debug, Clone)]
pub struct CaseResult {
    pub name: String,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl CaseResult {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct SmokeReport {
    pub results: Vec<CaseResult>,
    pub elapsed: Duration,
}

impl SmokeReport {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }

    pub fn all_passed(&self) -> bool {
        self.failed() == 0
    }

    /// Human-readable summary, one line per case in declaration order.
    pub fn render(&self) -> String {
        let rule = "=".repeat(70);
        let mut out = String::new();
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "  SUMMARY");
        let _ = writeln!(out, "{rule}");
        for r in &self.results {
            match &r.error {
                None => {
                    let _ = writeln!(out, "  PASS  {}", r.name);
                }
                Some(e) => {
                    let _ = writeln!(
                        out,
                        "  FAIL  {}  -  {}",
                        r.name,
                        truncate_chars(e, REPORT_ERROR_CHARS)
                    );
                }
            }
        }
        let _ = writeln!(
            out,
            "\n  Total: {} | Passed: {} | Failed: {} | Time: {:.1}s",
            self.results.len(),
            self.passed(),
            self.failed(),
            self.elapsed.as_secs_f64()
        );
        let _ = write!(out, "{rule}");
        out
    }
}

/// Runs smoke cases against the gateway's Responses endpoint.
pub struct SmokeRunner {
    client: Client,
    endpoint: String,
    headers: HeaderMap,
}

impl SmokeRunner {
    pub fn new(config: &Config) -> Result<Self, PipeError> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| PipeError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: join_endpoint(&config.base_url, "responses"),
            headers: base_headers(config)?,
        })
    }

    /// Run every case against every target concurrently.
    pub async fn run(&self, targets: &[SmokeTarget]) -> SmokeReport {
        let started = Instant::now();
        let jobs = targets.iter().flat_map(|target| {
            SmokeCase::for_target(target)
                .into_iter()
                .map(move |case| self.run_case(target, case))
        });
        let results = join_all(jobs).await;
        SmokeReport {
            results,
            elapsed: started.elapsed(),
        }
    }

    async fn run_case(&self, target: &SmokeTarget, case: SmokeCase) -> CaseResult {
        let name = format!("{} ({})", case.title(), target.label);
        let started = Instant::now();
        let outcome = self.execute(target, case).await;
        let elapsed = started.elapsed();
        match &outcome {
            Ok(()) => info!(case = %name, elapsed_ms = elapsed.as_millis() as u64, "smoke case passed"),
            Err(e) => warn!(case = %name, error = %format!("{e:#}"), "smoke case failed"),
        }
        CaseResult {
            name,
            error: outcome.err().map(|e| format!("{e:#}")),
            elapsed,
        }
    }

    async fn execute(&self, target: &SmokeTarget, case: SmokeCase) -> anyhow::Result<()> {
        let headers = self.target_headers(target)?;
        let resp = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .json(&case.request_body(target))
            .send()
            .await
            .map_err(|e| PipeError::network(&e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PipeError::from_response(resp).await.into());
        }

        if case == SmokeCase::Streaming {
            let text = collect_stream_text(resp).await?;
            if text.is_empty() {
                bail!("stream should produce output");
            }
            return Ok(());
        }

        let body: Value = resp.json().await.context("response body is not JSON")?;
        case.check(&body)
    }

    fn target_headers(&self, target: &SmokeTarget) -> anyhow::Result<HeaderMap> {
        let mut headers = self.headers.clone();
        headers.insert(
            HeaderName::from_static(PROVIDER_HEADER),
            HeaderValue::from_str(&target.provider).context("invalid provider header")?,
        );
        if !target.virtual_key.is_empty() {
            let mut vk =
                HeaderValue::from_str(&target.virtual_key).context("invalid virtual key header")?;
            vk.set_sensitive(true);
            headers.insert(HeaderName::from_static(VIRTUAL_KEY_HEADER), vk);
        }
        Ok(headers)
    }
}

/// Concatenate the `delta` text of every SSE event until `[DONE]` or EOF.
async fn collect_stream_text(resp: reqwest::Response) -> anyhow::Result<String> {
    use tokio_stream::StreamExt as _;

    let mut bytes = resp.bytes_stream();
    let mut splitter = LineSplitter::new();
    let mut text = String::new();

    'read: while let Some(chunk) = bytes.next().await {
        let chunk = chunk.map_err(|e| PipeError::network(&e))?;
        for line in splitter.push(&chunk) {
            let Some(payload) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim_start();
            if payload == DONE_SENTINEL {
                break 'read;
            }
            if let Some(delta) = checks::event_delta(payload) {
                text.push_str(&delta);
            }
        }
    }
    Ok(text)
}

/// Run the smoke matrix described by `config`.
pub async fn run(config: &Config) -> anyhow::Result<SmokeReport> {
    if config.smoke.is_empty() {
        bail!("no smoke targets configured (add a `smoke:` list to the config file)");
    }
    let runner = SmokeRunner::new(config)?;
    info!(
        targets = config.smoke.len(),
        cases = config
            .smoke
            .iter()
            .map(|t| SmokeCase::for_target(t).len())
            .sum::<usize>(),
        "running Responses API smoke cases in parallel"
    );
    Ok(runner.run(&config.smoke).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::ReasoningConfig;

    fn plain_target() -> SmokeTarget {
        SmokeTarget {
            label: "Gemini".into(),
            provider: "google".into(),
            model: "m-1".into(),
            ..SmokeTarget::default()
        }
    }

    #[test]
    fn every_case_targets_the_model() {
        for case in SmokeCase::ALL {
            assert_eq!(case.request_body(&plain_target())["model"], "m-1");
        }
        assert_eq!(SmokeCase::Streaming.request_body(&plain_target())["stream"], true);
    }

    #[test]
    fn plain_target_skips_opt_in_cases() {
        let cases = SmokeCase::for_target(&plain_target());
        assert_eq!(cases.len(), 10);
        assert!(cases.contains(&SmokeCase::Vision));
        assert!(cases.contains(&SmokeCase::JsonSchema));
        assert!(!cases.contains(&SmokeCase::Reasoning));
        assert!(!cases.contains(&SmokeCase::ExtendedThinking));
        assert!(!cases.contains(&SmokeCase::PromptCachingContent));
    }

    #[test]
    fn thinking_target_runs_every_case() {
        let target = SmokeTarget {
            reasoning: Some(ReasoningConfig {
                thinking_budget: Some(8192),
                ..ReasoningConfig::default()
            }),
            prompt_caching: true,
            ..plain_target()
        };
        assert_eq!(SmokeCase::for_target(&target), SmokeCase::ALL.to_vec());

        let body = SmokeCase::Reasoning.request_body(&target);
        assert_eq!(body["thinking"], json!({ "type": "enabled", "budget_tokens": 8192 }));
        assert!(body.get("reasoning").is_none());
        assert_eq!(body["model"], "m-1");
    }

    #[test]
    fn effort_target_uses_reasoning_model() {
        let target = SmokeTarget {
            reasoning: Some(ReasoningConfig {
                effort: Some("high".into()),
                model: Some("o4-mini".into()),
                ..ReasoningConfig::default()
            }),
            ..plain_target()
        };
        let cases = SmokeCase::for_target(&target);
        assert!(cases.contains(&SmokeCase::Reasoning));
        assert!(!cases.contains(&SmokeCase::ExtendedThinking));

        let body = SmokeCase::Reasoning.request_body(&target);
        assert_eq!(body["model"], "o4-mini");
        assert_eq!(body["reasoning"], json!({ "effort": "high" }));
        assert_eq!(SmokeCase::QuickStart.request_body(&target)["model"], "m-1");
    }

    #[test]
    fn vision_and_schema_bodies() {
        let vision = SmokeCase::Vision.request_body(&plain_target());
        assert_eq!(vision["input"][0]["content"][0]["type"], "input_image");
        assert_eq!(vision["input"][0]["content"][0]["image_url"], IMAGE_URL);

        let schema = SmokeCase::JsonSchema.request_body(&plain_target());
        assert_eq!(schema["text"]["format"]["type"], "json_schema");
        assert_eq!(schema["text"]["format"]["schema"]["required"], json!(["name", "age"]));
    }

    #[test]
    fn tool_calling_rejects_plain_message() {
        let message = json!({
            "output": [{
                "type": "message",
                "content": [{ "type": "output_text", "text": "It is sunny." }]
            }]
        });
        assert!(SmokeCase::ToolCalling.check(&message).is_err());

        let call = json!({ "output": [{ "type": "function_call", "name": "get_weather" }] });
        assert!(SmokeCase::ToolCalling.check(&call).is_ok());
    }

    #[test]
    fn report_counts_and_renders() {
        let report = SmokeReport {
            results: vec![
                CaseResult {
                    name: "Quick start (OpenAI)".into(),
                    error: None,
                    elapsed: Duration::from_millis(10),
                },
                CaseResult {
                    name: "Streaming (OpenAI)".into(),
                    error: Some("x".repeat(200)),
                    elapsed: Duration::from_millis(10),
                },
            ],
            elapsed: Duration::from_millis(1500),
        };
        assert_eq!(report.passed(), 1);
        assert_eq!(report.failed(), 1);
        assert!(!report.all_passed());

        let text = report.render();
        assert!(text.contains("PASS  Quick start (OpenAI)"));
        assert!(text.contains("FAIL  Streaming (OpenAI)"));
        assert!(text.contains("Total: 2 | Passed: 1 | Failed: 1 | Time: 1.5s"));
        assert!(!text.contains(&"x".repeat(81)));
    }

    #[tokio::test]
    async fn run_without_targets_is_an_error() {
        let cfg = Config {
            api_key: "pk".into(),
            ..Config::default()
        };
        assert!(run(&cfg).await.is_err());
    }

    #[test]
    fn runner_requires_api_key() {
        assert!(SmokeRunner::new(&Config::default()).is_err());
    }
}
