//! CLI subcommand handlers extracted from `main.rs`.
//!
//! Keeps `main.rs` slim: clap parsing stays there, the work lives here.

use std::io::Write;

use anyhow::Context;
use tokio_stream::StreamExt as _;
use tracing::debug;

use crate::config::Config;
use crate::pipe::{ChatRequest, Pipe, PipeOutput, UserInfo};
use crate::smoke;

/// Arguments for a single chat turn.
#[derive(Debug, Clone, Default)]
pub struct ChatArgs {
    pub model: String,
    pub message: String,
    pub stream: bool,
    pub user: UserInfo,
}

impl ChatArgs {
    /// The request body the host would send for this turn.
    pub fn to_request(&self) -> ChatRequest {
        ChatRequest::new(&self.model)
            .with_stream(self.stream)
            .with_field(
                "messages",
                serde_json::json!([{ "role": "user", "content": self.message }]),
            )
    }
}

/// Print the model list the host dropdown would show.
pub async fn list_models(cfg: Config, json: bool) -> anyhow::Result<()> {
    let pipe = Pipe::new(cfg)?;
    let entries = pipe.pipes().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No models available.");
        return Ok(());
    }
    for entry in &entries {
        println!("{}", entry.id);
    }
    println!("\n{} model(s).", entries.len());
    Ok(())
}

/// Send one chat turn and print the result.
pub async fn chat(cfg: Config, args: ChatArgs) -> anyhow::Result<()> {
    let pipe = Pipe::new(cfg)?;
    let user = (!args.user.is_empty()).then_some(&args.user);
    debug!(model = %args.model, stream = args.stream, "sending chat turn");

    match pipe.pipe(args.to_request(), user).await? {
        PipeOutput::Json(body) => {
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        PipeOutput::Stream(mut lines) => {
            let mut stdout = std::io::stdout();
            while let Some(line) = lines.next().await {
                let line = line?;
                writeln!(stdout, "{line}").context("failed to write to stdout")?;
                stdout.flush().ok();
            }
        }
    }
    Ok(())
}

/// Run the Responses API smoke matrix. Fails when any case fails.
pub async fn run_smoke(cfg: Config) -> anyhow::Result<()> {
    let report = smoke::run(&cfg).await?;
    println!("{}", report.render());
    if !report.all_passed() {
        anyhow::bail!("{} smoke case(s) failed", report.failed());
    }
    Ok(())
}
