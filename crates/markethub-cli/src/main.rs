//! markethub - command-line access to the services marketplace API.
//!
//! Sends one authenticated request and prints the JSON response. Useful for
//! poking at a backend with the same token handling the apps use.

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use markethub_core::api::{ApiError, MultipartBody, QueryParams};
use markethub_core::auth::{
    CredentialStore, FileStore, IdentityProvider, KeyValueStore, KeyringStore, MemoryStore,
    RefreshTokenIdentity, StaticIdentity, SystemClock, TokenManager,
};
use markethub_core::config::APP_NAME;
use markethub_core::{ApiClient, Config};
use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Static bearer token (skips the refresh-token exchange)
const TOKEN_ENV: &str = "MARKETHUB_TOKEN";

/// Long-lived refresh token and the secure-token endpoint to exchange it at
const REFRESH_TOKEN_ENV: &str = "MARKETHUB_REFRESH_TOKEN";
const TOKEN_URL_ENV: &str = "MARKETHUB_TOKEN_URL";

/// Keep the persistent credential copy in the OS keychain instead of a file
const USE_KEYRING_ENV: &str = "MARKETHUB_USE_KEYRING";

const USAGE: &str = "\
Usage:
  markethub get <endpoint> [key=value ...]
  markethub post|put|patch <endpoint> <json>
  markethub delete <endpoint>
  markethub upload <endpoint> <field> <file> [key=value ...]
  markethub configure <base-url>
  markethub logout";

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

fn identity_from_env(client: reqwest::Client) -> Arc<dyn IdentityProvider> {
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        debug!("Using static token from environment");
        return Arc::new(StaticIdentity::new(token));
    }
    match (std::env::var(REFRESH_TOKEN_ENV), std::env::var(TOKEN_URL_ENV)) {
        (Ok(refresh), Ok(url)) => {
            debug!(url = %url, "Using refresh-token identity");
            Arc::new(RefreshTokenIdentity::new(client, url, refresh))
        }
        _ => Arc::new(StaticIdentity::signed_out()),
    }
}

fn credential_store(config: &Config) -> Result<CredentialStore> {
    let persistent: Arc<dyn KeyValueStore> = if std::env::var(USE_KEYRING_ENV).is_ok() {
        Arc::new(KeyringStore::new(APP_NAME))
    } else {
        Arc::new(FileStore::new(config.data_dir()?))
    };
    Ok(CredentialStore::new(Arc::new(MemoryStore::new()), persistent))
}

/// Parse trailing `key=value` arguments into query parameters or form fields.
fn key_values(args: &[String]) -> Result<Vec<(String, String)>> {
    args.iter()
        .map(|arg| {
            arg.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("Expected key=value, got '{}'", arg))
        })
        .collect()
}

fn guess_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "pdf" => Some("application/pdf"),
        _ => None,
    }
}

fn parse_json(arg: Option<&String>) -> Result<Value> {
    let raw = arg.context("Missing JSON body")?;
    serde_json::from_str(raw).context("Body is not valid JSON")
}

async fn run(args: &[String]) -> Result<Option<Value>> {
    let (command, rest) = match args.split_first() {
        Some((command, rest)) => (command.as_str(), rest),
        None => bail!("{}", USAGE),
    };

    if command == "configure" {
        let url = rest.first().context("Missing base URL")?;
        let mut config = Config::load()?;
        config.base_url = Some(url.clone());
        config.save()?;
        info!(base_url = %url, "Saved configuration");
        return Ok(None);
    }

    let config = Config::load()?;
    let credentials = Arc::new(credential_store(&config)?);
    let http = reqwest::Client::new();
    let tokens = TokenManager::with_clock(
        identity_from_env(http),
        credentials,
        config.refresh_interval()?,
        Arc::new(SystemClock),
    );

    if command == "logout" {
        tokens.sign_out();
        return Ok(None);
    }

    let api = ApiClient::new(&config, tokens)?;
    let endpoint = rest.first().context("Missing endpoint")?;

    let result = match command {
        "get" => {
            let params: QueryParams = key_values(&rest[1..])?.into_iter().collect();
            api.get(endpoint, &params).await
        }
        "post" => api.post(endpoint, parse_json(rest.get(1))?).await,
        "put" => api.put(endpoint, parse_json(rest.get(1))?).await,
        "patch" => api.patch(endpoint, parse_json(rest.get(1))?).await,
        "delete" => api.delete(endpoint).await,
        "upload" => {
            let field = rest.get(1).context("Missing form field name")?;
            let path = Path::new(rest.get(2).context("Missing file path")?);
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload")
                .to_string();

            let mut body = MultipartBody::new().file(field.clone(), file_name, guess_mime(path), bytes);
            for (key, value) in key_values(&rest[3.min(rest.len())..])? {
                body = body.text(key, value);
            }
            api.upload(endpoint, body).await
        }
        other => bail!("Unknown command '{}'\n{}", other, USAGE),
    };

    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(describe(e)),
    }
}

fn describe(err: ApiError) -> anyhow::Error {
    if err.requires_sign_in() {
        anyhow::anyhow!("{} ({}). Please sign in again.", err, err.kind())
    } else if err.is_retryable() {
        anyhow::anyhow!("{} ({}). Try again later.", err, err.kind())
    } else {
        anyhow::anyhow!("{} ({})", err, err.kind())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Some(value) = run(&args).await? {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
