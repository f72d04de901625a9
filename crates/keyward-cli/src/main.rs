//! keyward - command-line front end for a keyward session.
//!
//! Logs in against the configured backend, keeps the session on disk (or in
//! the keychain), and issues authenticated requests that survive token expiry.

use std::io::{self, Write};

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keyward_core::{ApiClient, Config, LoginCredentials, LoginOutcome, SessionEvent};

const USAGE: &str = "\
Usage: keyward <command>

Commands:
  login [username]   Authenticate and store the session
  logout             Clear the session and notify the server
  status             Show whether a session is stored
  verify             Ask the server whether the session is still valid
  get <path>         GET an API path (e.g. /tasks/) and print the response";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let mut config = Config::load()?;
    let client = ApiClient::new(config.clone())?;
    info!(backend = %config.backend_host, scheme = ?config.auth_scheme, "keyward starting");

    match command.as_str() {
        "login" => login(&client, &mut config, args.get(1).cloned()).await,
        "logout" => {
            client.session().logout().await;
            println!("Logged out.");
            Ok(())
        }
        "status" => {
            status(&client);
            Ok(())
        }
        "verify" => verify(&client).await,
        "get" => match args.get(1) {
            Some(path) => get(&client, path).await,
            None => {
                eprintln!("{}", USAGE);
                std::process::exit(2);
            }
        },
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

async fn login(client: &ApiClient, config: &mut Config, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| std::env::var("KEYWARD_USERNAME").ok()) {
        Some(username) => username,
        None => prompt_username(config.last_username.as_deref())?,
    };
    let password = match std::env::var("KEYWARD_PASSWORD") {
        Ok(password) => password,
        Err(_) => rpassword::prompt_password("Password: ")?,
    };

    eprintln!("Authenticating...");
    match client
        .session()
        .login(&LoginCredentials::new(username.clone(), password))
        .await
    {
        LoginOutcome::Success(user) => {
            config.last_username = Some(username);
            if let Err(e) = config.save() {
                warn!(error = %e, "Failed to save config");
            }
            println!("Login successful: {}", user.as_json());
            Ok(())
        }
        LoginOutcome::Failure(message) => Err(anyhow::anyhow!(message)),
    }
}

fn prompt_username(last: Option<&str>) -> Result<String> {
    match last {
        Some(last) => print!("Username [{}]: ", last),
        None => print!("Username: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    match (input.is_empty(), last) {
        (true, Some(last)) => Ok(last.to_string()),
        (true, None) => Err(anyhow::anyhow!("Username required")),
        (false, _) => Ok(input.to_string()),
    }
}

fn status(client: &ApiClient) {
    let snapshot = client.session().snapshot();
    if !snapshot.authenticated {
        println!("Not logged in.");
        return;
    }
    let since = client
        .session()
        .store()
        .current()
        .map(|d| d.minutes_since_login())
        .unwrap_or_default();
    let user = snapshot
        .user
        .as_ref()
        .and_then(|u| u.username().map(str::to_string))
        .unwrap_or_else(|| "unknown user".to_string());
    let refreshable = if client.session().coordinator().is_refreshable() {
        "refreshable"
    } else {
        "not refreshable"
    };
    println!("Logged in as {} ({} min ago, {}).", user, since, refreshable);
}

async fn verify(client: &ApiClient) -> Result<()> {
    let mut events = client.session().subscribe();
    let result = client.verify().await;
    report_expiry(&mut events);
    let user = result?;
    println!("Session valid: {}", user.as_json());
    Ok(())
}

async fn get(client: &ApiClient, path: &str) -> Result<()> {
    let mut events = client.session().subscribe();
    let result = client.get_text(path).await;
    report_expiry(&mut events);

    match result {
        Ok(body) => {
            match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
                Err(_) => println!("{}", body),
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// The CLI's stand-in for redirecting to a login screen.
fn report_expiry(events: &mut tokio::sync::broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        if event == SessionEvent::AuthExpired {
            eprintln!("Session expired. Run `keyward login` to sign in again.");
        }
    }
}
