use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use persona_gate_core::config::Config;
use persona_gate_core::store::{
    ConversationStore, JsonConversationStore, MemoryConversationStore,
};
use persona_gate_gateway::AppState;
use persona_gate_runner::HostedRunner;

#[derive(Parser)]
#[command(
    name = "persona-gate",
    about = "Personal-branding chat gateway — a streaming persona agent behind one binary",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the chat gateway server
    Serve {
        /// Port to listen on (default: 8787)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the resolved configuration (secrets elided)
    Show,
    /// Print the config file path in use
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;

    init_tracing(&config, cli.verbose);

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.get_or_insert_with(Default::default).port = Some(port);
            }
            tracing::info!(config = %config_path.display(), "Starting PersonaGate");
            let config = Arc::new(config);

            let ttl = Duration::from_secs(config.conversation_ttl_secs());
            let store: Arc<dyn ConversationStore> = match config.conversation_data_dir() {
                Some(dir) => Arc::new(JsonConversationStore::new(dir, ttl)),
                None => Arc::new(MemoryConversationStore::new(ttl)),
            };
            let runner = Arc::new(HostedRunner::from_config(&config));

            let state = Arc::new(AppState::new(config, store, runner));
            persona_gate_gateway::serve(state).await?;
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                elide_secrets(&mut config);
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Path => {
                println!("{}", config_path.display());
            }
        },
    }

    Ok(())
}

fn init_tracing(config: &Config, verbose: bool) {
    let default_directive = if verbose {
        "debug".to_string()
    } else {
        config
            .logging
            .as_ref()
            .and_then(|l| l.filter.clone())
            .unwrap_or_else(|| "info".to_string())
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn elide_secrets(config: &mut Config) {
    if let Some(runner) = &mut config.runner {
        if runner.api_key.is_some() {
            runner.api_key = Some("<redacted>".into());
        }
    }
    if let Some(calendar) = &mut config.calendar {
        if calendar.api_key.is_some() {
            calendar.api_key = Some("<redacted>".into());
        }
        if calendar.webhook_secret.is_some() {
            calendar.webhook_secret = Some("<redacted>".into());
        }
    }
    if let Some(auth) = &mut config.auth {
        for entry in &mut auth.tokens {
            entry.token = "<redacted>".into();
        }
    }
}
