//! CLI command definitions.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use howtolive_chat::{AppConfig, UserKey};

pub mod chat;
pub mod sessions;

/// howtolive - healthy-living assistant with specialist routing
#[derive(Parser)]
#[command(name = "howtolive")]
#[command(version, about = "howtolive - healthy-living assistant with specialist routing")]
#[command(long_about = r#"
Chat with a router that hands each message to a specialist
(howtoeat, howtocook, howtoexercise, howtosleep) or a general handler.
Every turn is saved under the session directory.

COMMANDS:
  chat       → Interactive chat; type `exit` to quit
  sessions   → List, show, create or delete sessions

ENVIRONMENT:
  HOWTOLIVE_SESSIONS_DIR   Session store root
  HOWTOLIVE_MODEL          Model name
  HOWTOLIVE_API_KEY        API key; without it offline handlers answer

EXIT CODES:
  0 - Success
  1 - Error
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an interactive chat
    Chat(chat::ChatArgs),

    /// Manage stored sessions
    Sessions(sessions::SessionsArgs),
}

/// Identity and configuration shared by every command.
#[derive(Args, Debug, Clone)]
pub struct UserArgs {
    /// Account id
    #[arg(long, env = "HOWTOLIVE_USER_ID")]
    pub user_id: String,

    /// Display name
    #[arg(long, env = "HOWTOLIVE_USERNAME")]
    pub username: String,

    /// YAML configuration file
    #[arg(long, env = "HOWTOLIVE_CONFIG")]
    pub config: Option<PathBuf>,
}

impl UserArgs {
    pub fn user_key(&self) -> Result<UserKey> {
        UserKey::new(&self.user_id, &self.username).context("Invalid user identity")
    }

    pub fn load_config(&self) -> Result<AppConfig> {
        AppConfig::load(self.config.as_deref()).context("Failed to load configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_chat_and_sessions() {
        let cli = Cli::parse_from([
            "howtolive", "chat", "--user-id", "42", "--username", "alice", "--session", "abc",
        ]);
        match cli.command {
            Commands::Chat(args) => assert_eq!(args.session.as_deref(), Some("abc")),
            _ => panic!("expected chat"),
        }

        let cli = Cli::parse_from([
            "howtolive", "sessions", "--user-id", "42", "--username", "alice", "delete", "abc",
        ]);
        assert!(matches!(cli.command, Commands::Sessions(_)));
    }
}
