//! `codelingo` command line entry point.
//!
//! ```text
//! codelingo --config client.toml login <email> <password> [--remember]
//! codelingo --config client.toml whoami
//! codelingo --config client.toml get /courses
//! codelingo --config client.toml logout
//! ```

use clap::{Parser, Subcommand};
use codelingo_client::error::ClientError;
use codelingo_client::telemetry::init_tracing;
use codelingo_client::{ApiRequest, ClientConfig, CodelingoClient, QueryKey};
use codelingo_core::LoginCredentials;
use std::path::PathBuf;

/// CodeLingo API client.
#[derive(Parser, Debug)]
#[command(name = "codelingo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (falls back to CODELINGO_CONFIG).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in.
    Login {
        email: String,
        password: String,
        /// Keep the session across restarts.
        #[arg(long)]
        remember: bool,
    },
    /// Sign out and forget the stored session.
    Logout,
    /// Show the signed-in user.
    #[command(name = "whoami")]
    WhoAmI,
    /// Fetch a path through the cache and print it as JSON.
    Get { path: String },
}

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    let cli = Cli::parse();
    init_tracing()?;
    let config = ClientConfig::load(cli.config.as_deref())?;
    let client = CodelingoClient::from_config(&config)?;

    match cli.command {
        Command::Login {
            email,
            password,
            remember,
        } => {
            let user = client
                .login(LoginCredentials::new(email, password).remember(remember))
                .await?;
            println!("Signed in as {} <{}>", user.name, user.email);
        }
        Command::Logout => {
            client.logout().await?;
            println!("Signed out");
        }
        Command::WhoAmI => match client.session().user {
            Some(user) if client.is_authenticated() => {
                println!("{} <{}> ({})", user.name, user.email, user.role)
            }
            _ => println!("Not signed in"),
        },
        Command::Get { path } => {
            let key = QueryKey::new(path.trim_matches('/').split('/'));
            let read = client
                .queries()
                .query_value(&key, ApiRequest::get(path))
                .await?;
            let rendered = serde_json::to_string_pretty(read.value())
                .map_err(|e| ClientError::Usage(format!("unprintable response: {}", e)))?;
            println!("{}", rendered);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_login_parses_remember_and_global_config() {
        let cli = Cli::try_parse_from([
            "codelingo",
            "login",
            "test@example.com",
            "password123",
            "--remember",
            "--config",
            "client.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("client.toml")));
        match cli.command {
            Command::Login {
                email,
                password,
                remember,
            } => {
                assert_eq!(email, "test@example.com");
                assert_eq!(password, "password123");
                assert!(remember);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_subcommands_parse() {
        let cli = Cli::try_parse_from(["codelingo", "whoami"]).unwrap();
        assert!(matches!(cli.command, Command::WhoAmI));
        assert!(cli.config.is_none());

        let cli = Cli::try_parse_from(["codelingo", "-c", "x.toml", "get", "/courses"]).unwrap();
        assert!(matches!(cli.command, Command::Get { ref path } if path == "/courses"));
    }

    #[test]
    fn test_missing_arguments_are_rejected() {
        assert!(Cli::try_parse_from(["codelingo", "login", "only@example.com"]).is_err());
        assert!(Cli::try_parse_from(["codelingo"]).is_err());
    }
}
