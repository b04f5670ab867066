//! agentdesk - operator CLI for the dashboard session.
//!
//! Drives the same session lifecycle the dashboard uses, against the same
//! persisted storage, so a login here is picked up by a running `watch` and
//! vice versa.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use agentdesk_core::{
    CleanupOutcome, HttpIdentityClient, RehydrationOutcome, SessionConfig, SessionManager,
    SharedStore, StorageMode,
};

const USAGE: &str = "Usage: agentdesk <status|login [email]|logout|watch>";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr, filtered by `RUST_LOG` (default `warn`). When
/// `log_to_file` is set, a daily-rotated file in the cache directory gets
/// the same events; keep the returned guard alive until exit.
fn init_tracing(config: &SessionConfig, log_to_file: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.cache_dir().ok().filter(|_| log_to_file) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir.join("logs"), "agentdesk.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

/// Apply environment overrides on top of the config file.
fn apply_env(config: &mut SessionConfig) -> Result<()> {
    if let Ok(url) = std::env::var("AGENTDESK_IDENTITY_URL") {
        config.identity_url = Some(url);
    }
    if let Ok(email) = std::env::var("AGENTDESK_EMAIL") {
        config.last_email = Some(email);
    }
    if let Ok(storage) = std::env::var("AGENTDESK_STORAGE") {
        config.storage = StorageMode::parse(&storage)
            .with_context(|| format!("Unknown storage mode '{}' (file, keyring, memory)", storage))?;
    }
    Ok(())
}

fn identity_client(config: &SessionConfig) -> Result<HttpIdentityClient> {
    let url = config
        .identity_url
        .as_deref()
        .context("No identity service configured. Set AGENTDESK_IDENTITY_URL.")?;
    Ok(HttpIdentityClient::new(url)?)
}

fn open_manager(config: &SessionConfig, store: &Arc<SharedStore>, client: HttpIdentityClient) -> SessionManager {
    SessionManager::builder(store, Arc::new(client))
        .config(config.clone())
        .build()
}

fn print_status(manager: &SessionManager) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&manager.status())?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let mut config = SessionConfig::load()?;
    apply_env(&mut config)?;
    let _guard = init_tracing(&config, command == "watch");

    let result = match command {
        "status" => status(&config).await,
        "login" => login(&mut config, args.get(1).cloned()).await,
        "logout" => logout(&config),
        "watch" => watch(&config).await,
        other => {
            eprintln!("Unknown command '{}'\n{}", other, USAGE);
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn status(config: &SessionConfig) -> Result<()> {
    let store = config.open_store()?;
    let manager = open_manager(config, &store, identity_client(config)?);
    let outcome = manager.rehydrate().await;
    info!(?outcome, "Rehydration finished");
    print_status(&manager)
}

async fn login(config: &mut SessionConfig, email: Option<String>) -> Result<()> {
    let client = identity_client(config)?;

    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => {
            print!("Email: ");
            io::stdout().flush()?;
            let mut line = String::new();
            io::stdin().read_line(&mut line)?;
            line.trim().to_string()
        }
    };
    if email.is_empty() {
        anyhow::bail!("Email is required");
    }
    let password = rpassword::prompt_password("Password: ")?;

    let (user, tokens) = client
        .login(&email, &password)
        .await
        .context("Sign-in failed")?;

    let store = config.open_store()?;
    let manager = open_manager(config, &store, client);
    manager.set_auth(user, tokens);

    config.last_email = Some(email);
    config.save()?;

    print_status(&manager)
}

fn logout(config: &SessionConfig) -> Result<()> {
    let store = config.open_store()?;
    let manager = open_manager(config, &store, identity_client(config)?);
    match manager.logout() {
        CleanupOutcome::Performed => println!("Signed out"),
        CleanupOutcome::AlreadyLoggedOut => println!("Not signed in"),
        CleanupOutcome::InProgress => println!("Sign-out already in progress"),
    }
    Ok(())
}

async fn watch(config: &SessionConfig) -> Result<()> {
    let store = config.open_store()?;
    let manager = open_manager(config, &store, identity_client(config)?);
    let mut changes = manager.subscribe();

    match manager.rehydrate().await {
        RehydrationOutcome::NoSession => println!("No saved session, waiting for a sign-in"),
        outcome => info!(?outcome, "Rehydration finished"),
    }
    print_status(&manager)?;

    let poller = store.spawn_external_poller(config.external_poll_interval());

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let _ = changes.borrow_and_update();
                print_status(&manager)?;
            }
            _ = tokio::signal::ctrl_c() => {
                manager.on_page_hide();
                break;
            }
        }
    }

    poller.abort();
    Ok(())
}
