//! Keyward CLI - command-line client
//!
//! Usage:
//!   keyward register <email> <password>
//!   keyward login <email> <password>
//!   keyward password forgot <email>
//!   keyward raw <pattern> '<json>'

use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use keyward_core::Reply;
use keyward_server::dispatch::{
    PASSWORD_CHANGE, PASSWORD_FORGOT, PASSWORD_FORGOT_VERIFY, PASSWORD_RESEND, PASSWORD_RESET,
    ROLES_CREATE, ROLES_LIST, SERVICE_HEALTH, USER_ARCHIVE, USER_CREATE, USER_LIST, USER_LOGIN,
    USER_REFRESH_TOKEN, USER_REGISTER, USER_VERIFY,
};
use keyward_server::{CommandClient, COMMANDS};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "keyward")]
#[command(about = "Keyward identity service client")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:5011")]
    addr: String,

    /// Reply timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new account and send the verification mail
    Register {
        email: String,
        password: String,
        #[arg(long)]
        admin: bool,
    },
    /// Create an already verified account
    Create {
        email: String,
        password: String,
        #[arg(long)]
        admin: bool,
    },
    /// Log in and print the token pair
    Login { email: String, password: String },
    /// Redeem a registration verification token
    Verify { token: String },
    /// Mint a new access token from a refresh token
    Refresh { refresh_token: String },
    /// Block or unblock an account
    Archive {
        id: Uuid,
        /// Email of the account making the request
        #[arg(long)]
        requester: String,
        /// Unblock instead of block
        #[arg(long)]
        unblock: bool,
    },
    /// List accounts
    Users,
    /// Change the password of a logged-in account
    ChangePassword {
        email: String,
        #[arg(long)]
        access: String,
        #[arg(long)]
        old: String,
        #[arg(long)]
        new: String,
        #[arg(long)]
        confirm: String,
    },
    /// Password recovery
    Password {
        #[command(subcommand)]
        action: PasswordAction,
    },
    /// Role records
    Roles {
        #[command(subcommand)]
        action: RoleAction,
    },
    /// Service health and counters
    Health,
    /// Send an arbitrary command with a JSON payload
    Raw {
        pattern: String,
        #[arg(default_value = "{}")]
        data: String,
    },
    /// Print every command pattern the server answers
    Commands,
}

#[derive(Subcommand)]
enum PasswordAction {
    /// Start a reset and mail the link
    Forgot {
        email: String,
        /// Origin metadata as a JSON object
        #[arg(long)]
        origin: Option<String>,
    },
    /// Mail the reset link again
    Resend { email: String },
    /// Redeem the mailed reset link
    Verify { key: String },
    /// Set the new password
    Reset {
        key: String,
        new: String,
        confirm: String,
    },
}

#[derive(Subcommand)]
enum RoleAction {
    Create {
        name: String,
        #[arg(default_value = "")]
        permissions: String,
    },
    List,
}

fn parse_json(text: &str) -> anyhow::Result<Value> {
    serde_json::from_str(text).with_context(|| format!("invalid JSON: {text}"))
}

/// Command pattern and payload for a subcommand
fn build_request(command: Commands) -> anyhow::Result<(&'static str, Value)> {
    let request = match command {
        Commands::Register {
            email,
            password,
            admin,
        } => (
            USER_REGISTER,
            json!({"email": email, "password": password, "isAdmin": admin}),
        ),
        Commands::Create {
            email,
            password,
            admin,
        } => (
            USER_CREATE,
            json!({"email": email, "password": password, "isAdmin": admin}),
        ),
        Commands::Login { email, password } => {
            (USER_LOGIN, json!({"email": email, "password": password}))
        }
        Commands::Verify { token } => (USER_VERIFY, json!(token)),
        Commands::Refresh { refresh_token } => {
            (USER_REFRESH_TOKEN, json!({"refreshToken": refresh_token}))
        }
        Commands::Archive {
            id,
            requester,
            unblock,
        } => (
            USER_ARCHIVE,
            json!({"id": id, "requesterEmail": requester, "active": unblock}),
        ),
        Commands::Users => (USER_LIST, json!({})),
        Commands::ChangePassword {
            email,
            access,
            old,
            new,
            confirm,
        } => (
            PASSWORD_CHANGE,
            json!({
                "email": email,
                "access": access,
                "oldPassword": old,
                "newPassword": new,
                "confirmPassword": confirm
            }),
        ),
        Commands::Password { action } => match action {
            PasswordAction::Forgot { email, origin } => {
                let origin = match origin {
                    Some(text) => parse_json(&text)?,
                    None => json!({}),
                };
                (
                    PASSWORD_FORGOT,
                    json!({"email": email, "locationMetadata": origin}),
                )
            }
            PasswordAction::Resend { email } => (PASSWORD_RESEND, json!({"email": email})),
            PasswordAction::Verify { key } => {
                (PASSWORD_FORGOT_VERIFY, json!({"verificationKey": key}))
            }
            PasswordAction::Reset { key, new, confirm } => (
                PASSWORD_RESET,
                json!({
                    "verificationKey": key,
                    "newPassword": new,
                    "confirmPassword": confirm
                }),
            ),
        },
        Commands::Roles { action } => match action {
            RoleAction::Create { name, permissions } => (
                ROLES_CREATE,
                json!({"name": name, "permissions": permissions}),
            ),
            RoleAction::List => (ROLES_LIST, json!({})),
        },
        Commands::Health => (SERVICE_HEALTH, json!({})),
        Commands::Raw { .. } | Commands::Commands => {
            bail!("raw and commands are handled before building a request")
        }
    };
    Ok(request)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyward=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = CommandClient::new(cli.addr, Duration::from_millis(cli.timeout_ms));

    let (pattern, data) = match cli.command {
        Commands::Commands => {
            for pattern in COMMANDS {
                println!("{pattern}");
            }
            return Ok(());
        }
        Commands::Raw { pattern, data } => {
            let data = parse_json(&data)?;
            let reply = send(&client, &pattern, data).await?;
            return print_reply(reply);
        }
        other => build_request(other)?,
    };

    let reply = send(&client, pattern, data).await?;
    print_reply(reply)
}

async fn send(client: &CommandClient, pattern: &str, data: Value) -> anyhow::Result<Reply> {
    tracing::debug!(addr = client.addr(), pattern, "Sending command");
    client
        .call(pattern, data)
        .await
        .with_context(|| format!("{pattern} failed against {}", client.addr()))
}

fn print_reply(reply: Reply) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&reply)?);
    match reply {
        Reply::Ok { .. } => Ok(()),
        Reply::Error { kind, message } => bail!("{kind}: {message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_payload() {
        let id = Uuid::new_v4();
        let (pattern, data) = build_request(Commands::Archive {
            id,
            requester: "admin@x.com".to_string(),
            unblock: false,
        })
        .unwrap();

        assert_eq!(pattern, USER_ARCHIVE);
        assert_eq!(data["id"], id.to_string());
        assert_eq!(data["active"], false);
    }

    #[test]
    fn test_forgot_rejects_bad_origin() {
        let result = build_request(Commands::Password {
            action: PasswordAction::Forgot {
                email: "a@x.com".to_string(),
                origin: Some("{not json".to_string()),
            },
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["keyward", "password", "resend", "a@x.com"]).unwrap();
        let (pattern, data) = build_request(cli.command).unwrap();
        assert_eq!(pattern, PASSWORD_RESEND);
        assert_eq!(data, json!({"email": "a@x.com"}));
    }
}
