//! Command-line harness for the mailbox forwarding remediation client.
//!
//! Credentials come from the environment (`MS_TENANT_ID`, `MS_CLIENT_ID`,
//! `MS_CLIENT_SECRET`); the operation and its parameters from the arguments:
//!
//! ```text
//! mailguard disable <userId>
//! mailguard enable <userId> <forwardingAddress>
//! mailguard status <userId>
//! ```
//!
//! The response envelope is printed as JSON; the exit code follows the
//! envelope's `success` flag.

use std::{env, process::ExitCode, sync::Arc};

use mailguard_client::{ClientCredentialsProvider, RemediationClient};
use mailguard_core::RequestEnvelope;
use tracing::error;
use tracing_subscriber::EnvFilter;

struct CliConfig {
    tenant_id: String,
    client_id: String,
    client_secret: String,
}

impl CliConfig {
    fn from_env() -> Result<Self, String> {
        Ok(Self {
            tenant_id: require_env("MS_TENANT_ID")?,
            client_id: require_env("MS_CLIENT_ID")?,
            client_secret: require_env("MS_CLIENT_SECRET")?,
        })
    }
}

fn require_env(key: &str) -> Result<String, String> {
    env::var(key).map_err(|_| format!("{key} must be set"))
}

fn usage() -> String {
    "usage: mailguard <disable|enable|status> <userId> [forwardingAddress]".to_owned()
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(success) => {
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(message) => {
            error!(target: "mailguard.cli", "{message}");
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<bool, String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let (operation, user_id) = match (args.first(), args.get(1)) {
        (Some(operation), Some(user_id)) => (operation.as_str(), user_id.as_str()),
        _ => return Err(usage()),
    };

    let config = CliConfig::from_env()?;
    let provider = ClientCredentialsProvider::new(config.client_id, config.client_secret)
        .map_err(|err| err.to_string())?;
    let client = RemediationClient::builder()
        .token_provider(Arc::new(provider))
        .build()
        .map_err(|err| err.to_string())?;

    let mut request = RequestEnvelope::new(config.tenant_id).with_param("userId", user_id);

    let envelope = match operation {
        "disable" => client.disable_forwarding(&request).await,
        "enable" => {
            let address = args.get(2).ok_or_else(usage)?;
            request = request.with_param("forwardingAddress", address.as_str());
            client.enable_forwarding(&request).await
        }
        "status" => client.forwarding_status(&request).await,
        _ => return Err(usage()),
    };

    let rendered = serde_json::to_string_pretty(&envelope)
        .map_err(|err| format!("failed to render response: {err}"))?;
    println!("{rendered}");
    Ok(envelope.success)
}
