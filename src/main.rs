//! Takopi entry point.
//!
//! Exit codes: 0 success, 1 configuration error, 2 lock contention.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use takopi::bridge::{Bridge, BridgeConfig};
use takopi::cli;
use takopi::config::{default_config_path, Config};
use takopi::lockfile::{acquire_lock, token_fingerprint};
use takopi::router::Router;
use takopi::runners::{builtin_backends, RunnerRegistry};
use takopi::telegram::TelegramClient;

#[tokio::main]
async fn main() -> ExitCode {
    let engine_ids: Vec<_> = builtin_backends().into_iter().map(|b| b.id).collect();
    let args = cli::parse(&engine_ids);

    let default_filter = if args.debug { "takopi=debug" } else { "takopi=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);

    if args.onboard {
        println!("takopi reads its configuration from {}", config_path.display());
        println!();
        println!("Minimal config:");
        println!();
        println!("    default_engine = \"codex\"");
        println!();
        println!("    [telegram]");
        println!("    token = \"<bot token from @BotFather>\"");
        println!("    chat_id = <your chat id>");
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(1);
        }
    };
    let (token, chat_ids) = match config.require_telegram() {
        Ok(telegram) => telegram,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(1);
        }
    };
    let registry = match RunnerRegistry::build(&config, args.engine.clone()) {
        Ok(registry) => registry,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(1);
        }
    };

    let fingerprint = token_fingerprint(&token);
    let lock = match acquire_lock(&config_path, Some(&fingerprint)) {
        Ok(lock) => lock,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(2);
        }
    };

    info!(
        default_engine = %registry.default_engine(),
        chats = chat_ids.len(),
        "takopi.starting"
    );

    let client = Arc::new(TelegramClient::new(&token));
    let transport: Arc<dyn takopi::transport::Transport> = Arc::clone(&client) as Arc<dyn takopi::transport::Transport>;
    let updates: Arc<dyn takopi::transport::UpdateSource> = client;
    let config = Arc::new(config);
    let router = Router::new(Arc::new(registry), Arc::clone(&config));
    let bridge = Bridge::new(
        transport,
        updates,
        router,
        config,
        BridgeConfig {
            allowed_chat_ids: chat_ids,
            final_notify: args.final_notify,
        },
    );

    let outcome = bridge.run().await;
    drop(lock);
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(1)
        }
    }
}
