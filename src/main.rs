//! switchboard CLI - LLM provider router with quota-aware fallback.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use switchboard::{AppState, Config, ProviderRegistry, app};
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version)]
#[command(about = "Route chat completions across LLM providers with quota-aware fallback")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// Listen address (overrides server.bind)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Validate configuration file and resolve credentials
    Validate,

    /// Probe every provider once and print its health
    Probe,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# switchboard configuration file

[server]
bind = "0.0.0.0:8080"
max_messages = 100
max_message_chars = 10000
# Per-client requests per minute (0 disables)
client_requests_per_minute = 30
# Replaces any client-supplied system messages
# system_prompt = "You are a helpful assistant."
cors = true

[health]
probe_timeout_secs = 10
# 0 disables background refresh
refresh_interval_secs = 300
# Probe results older than this are ignored (default: twice the refresh interval)
# stale_after_secs = 600

# Lower priority number = tried first
[providers.groq]
kind = "openai"
priority = 1
model = "llama-3.1-8b-instant"
base_url = "https://api.groq.com/openai/v1"
api_key_env = "GROQ_API_KEY"
timeout_secs = 30
requests_per_minute = 1000
requests_per_day = 15000

[providers.gemini]
kind = "gemini"
priority = 2
model = "gemini-1.5-flash"
# api_key = "${GEMINI_API_KEY}"
api_key_env = "GEMINI_API_KEY"
timeout_secs = 30
"#;
    println!("{example}");
}

fn load_config(path: &PathBuf) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            let registry =
                ProviderRegistry::from_config(&config).context("Failed to build providers")?;

            info!("Configuration is valid");
            info!(
                "  Providers: {} ({} usable)",
                registry.len(),
                registry.usable_count()
            );
            for entry in registry.entries() {
                let limits = &config.providers[entry.name()];
                match &entry.config_error {
                    None => info!(
                        "  {:>2}. {} ({}) rpm={} rpd={}",
                        entry.identity.priority,
                        entry.name(),
                        entry.identity.model,
                        limits
                            .requests_per_minute
                            .map_or("unlimited".to_string(), |n| n.to_string()),
                        limits
                            .requests_per_day
                            .map_or("unlimited".to_string(), |n| n.to_string()),
                    ),
                    Some(e) => warn!(
                        "  {:>2}. {} excluded: {e}",
                        entry.identity.priority,
                        entry.name()
                    ),
                }
            }
        }

        Commands::Probe => {
            let config = load_config(&cli.config)?;
            let state = AppState::from_config(config).context("Failed to build providers")?;
            let snapshot = state.health.probe_all().await;

            println!("\n=== Provider Health ===");
            for name in state.registry.names() {
                let Some(status) = snapshot.get(name) else {
                    continue;
                };
                if status.reachable {
                    println!(
                        "{name:<12} ok      {}ms",
                        status.latency_ms.unwrap_or_default()
                    );
                } else {
                    println!(
                        "{name:<12} DOWN    {}",
                        status.last_error.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }

        Commands::Serve { bind } => {
            let config = load_config(&cli.config)?;
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let refresh = config.health.refresh_interval();

            let state = AppState::from_config(config).context("Failed to build providers")?;
            info!(
                providers = state.registry.len(),
                usable = state.registry.usable_count(),
                "Providers loaded"
            );

            if let Some(interval) = refresh {
                Arc::clone(&state.health).spawn_refresh(interval);
            }

            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("Failed to bind {bind}"))?;
            info!(address = %bind, "Listening");

            axum::serve(listener, app(state))
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Shutting down");
                })
                .await
                .context("Server error")?;
        }
    }

    Ok(())
}
