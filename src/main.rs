//! Osiris CLI entry point.

use anyhow::Context as _;
use arc_swap::ArcSwapOption;
use clap::Parser;
use serenity::all::GatewayIntents;
use std::sync::Arc;

use osiris::agent::ConversationRegistry;
use osiris::config::Config;
use osiris::llm::{LlmManager, OpenAiClient};
use osiris::messaging::{DiscordAdapter, DiscordHandler};
use osiris::settings::SqliteSettingsStore;
use osiris::BotDeps;

#[derive(Parser)]
#[command(name = "osiris")]
#[command(about = "A chat-relay bot that answers Discord conversations through a completion API")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("failed to load config from {}", path.display()),
        None => "failed to load configuration from environment".to_string(),
    })?;

    let _log_guard = osiris::logging::init_tracing(&config.log_dir(), cli.debug);

    tracing::info!(data_dir = %config.data_dir.display(), "starting osiris");

    let store = Arc::new(
        SqliteSettingsStore::connect(&config.sqlite_path())
            .await
            .with_context(|| "failed to open settings database")?,
    );
    tracing::info!("settings database ready");

    let llm_manager = Arc::new(LlmManager::new(&config));
    let completions = Arc::new(OpenAiClient::new(llm_manager.clone()));
    let adapter = Arc::new(DiscordAdapter::new(&config.discord_token));

    let config = Arc::new(config);
    let deps = BotDeps {
        config: config.clone(),
        settings: store.clone(),
        completions,
        messaging: adapter,
        identity: Arc::new(ArcSwapOption::empty()),
    };
    let registry = Arc::new(ConversationRegistry::new(deps.clone()));
    let handler = DiscordHandler::new(deps, registry.clone(), llm_manager.clone());

    let intents =
        GatewayIntents::GUILDS | GatewayIntents::GUILD_MESSAGES | GatewayIntents::MESSAGE_CONTENT;
    let mut client = serenity::Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .await
        .with_context(|| "failed to build discord client")?;
    let shard_manager = client.shard_manager.clone();

    tracing::info!("connecting to discord");

    tokio::select! {
        result = client.start() => {
            if let Err(error) = result {
                tracing::error!(%error, "discord client stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            shard_manager.shutdown_all().await;
        }
    }

    tracing::info!("shutting down");
    registry.shutdown().await;
    llm_manager.close_session();
    store.close().await;

    tracing::info!("osiris stopped");
    Ok(())
}
