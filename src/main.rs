use portkey_pipe::cli;
use portkey_pipe::config;
use portkey_pipe::pipe::UserInfo;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(
    name = "portkey-pipe",
    version,
    about = "Forward chat completions to the Portkey AI gateway"
)]
struct Cli {
    /// Path to a YAML configuration file (defaults to ./portkey-pipe.yaml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the models the pipe offers (discovered + configured)
    Models {
        /// Print `{id, name}` entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Send a single chat turn through the pipe
    Chat {
        /// Model id, optionally prefixed with a host namespace (`pipe.@openai/gpt-4o`)
        #[arg(long)]
        model: String,
        /// User message to send
        #[arg(long)]
        message: String,
        /// Request a single JSON response instead of a stream
        #[arg(long)]
        no_stream: bool,
        #[arg(long)]
        user_name: Option<String>,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        user_email: Option<String>,
        #[arg(long)]
        user_role: Option<String>,
        #[arg(long)]
        chat_id: Option<String>,
    },
    /// Exercise the gateway's Responses API against every configured smoke target
    Smoke,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    let cli = Cli::parse();
    let cfg = config::Config::resolve(cli.config.as_deref()).await?;
    debug!(base_url = %cfg.base_url, stream_format = %cfg.stream_format, "configuration resolved");

    match cli.command {
        Command::Models { json } => cli::list_models(cfg, json).await,
        Command::Chat {
            model,
            message,
            no_stream,
            user_name,
            user_id,
            user_email,
            user_role,
            chat_id,
        } => {
            let args = cli::ChatArgs {
                model,
                message,
                stream: !no_stream,
                user: UserInfo {
                    name: user_name.map(Into::into),
                    id: user_id.map(Into::into),
                    email: user_email.map(Into::into),
                    role: user_role.map(Into::into),
                    chat_id: chat_id.map(Into::into),
                },
            };
            cli::chat(cfg, args).await
        }
        Command::Smoke => cli::run_smoke(cfg).await,
    }
}
