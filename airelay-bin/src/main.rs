use std::path::PathBuf;
use std::sync::Arc;

use airelay_core::{
    client::{CompletionRequest, HttpClient},
    config::{Config, HttpCfg, RelayCfg, UpstreamCfg},
    emitter::{ChannelEmitter, Emission},
    relay::StreamRelay,
};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(author, version, about = "airelay CLI smoke tool", long_about = None)]
struct Cli {
    /// Path to a JSON or TOML config file. Defaults to env-driven settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a completion and print the relayed frames as wire-format SSE
    Stream {
        #[arg(long, help = "Model name; falls back to the configured default")]
        model: Option<String>,
        #[arg(short, long, help = "Message from the user")]
        message: String,
    },
}

fn config_from_env() -> Config {
    Config {
        upstream: UpstreamCfg {
            base_url: std::env::var("OPENAI_BASE")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: None,
        },
        relay: RelayCfg::default(),
        http: HttpCfg::default(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => config_from_env(),
    };

    match cli.command {
        Commands::Stream { model, message } => {
            let model = model
                .or_else(|| cfg.upstream.model.clone())
                .unwrap_or_else(|| "gpt-4o".to_string());
            let api_key = cfg.upstream.api_key()?;
            let auth = format!("Bearer {}", api_key.expose_secret());

            let (emitter, mut rx) = ChannelEmitter::new();
            let relay = StreamRelay::new(Arc::new(emitter), &cfg.relay);

            // Writer side of the downstream transport: print each frame in
            // wire form until the terminal complete arrives.
            let writer = tokio::spawn(async move {
                use std::io::{self, Write};
                while let Some(emission) = rx.recv().await {
                    match emission {
                        Emission::Event(ev) => {
                            print!("{}", ev.to_wire());
                            io::stdout().flush().ok();
                        }
                        Emission::Complete => break,
                    }
                }
            });

            let client = HttpClient::from_cfg(&cfg.http)?;
            let url = format!("{}/v1/chat/completions", cfg.upstream.base_url);
            client
                .post_sse(
                    &url,
                    &CompletionRequest::user(model, message),
                    &[("Authorization", auth.as_str())],
                    &relay,
                )
                .await?;
            drop(relay);
            writer.await?;
        }
    }

    Ok(())
}
