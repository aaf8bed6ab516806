//! Sessions command - Inspect and manage stored sessions.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use howtolive_chat::{EventType, SessionKey, SessionStore, SnapshotPolicy};

use super::UserArgs;

#[derive(Args)]
pub struct SessionsArgs {
    #[command(flatten)]
    pub user: UserArgs,

    #[command(subcommand)]
    pub action: SessionAction,
}

#[derive(Subcommand)]
pub enum SessionAction {
    /// List sessions, newest first
    List,

    /// Print the timeline of a session
    Show {
        /// Session id
        session: String,

        /// Print raw JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Create an empty session
    New {
        /// Session title
        #[arg(long)]
        title: Option<String>,
    },

    /// Delete a session and all of its files
    Delete {
        /// Session id
        session: String,
    },
}

pub async fn execute(args: SessionsArgs) -> Result<()> {
    let user = args.user.user_key()?;
    let config = args.user.load_config()?;
    let store = SessionStore::with_policy(&config.sessions.root, SnapshotPolicy::from(&config.sessions));

    match args.action {
        SessionAction::List => {
            let sessions = store.list_sessions(&user)?;
            if sessions.is_empty() {
                println!("No sessions for {}", user);
                return Ok(());
            }
            for s in sessions {
                println!(
                    "{}  {:<32}  {:>4} events  updated {}",
                    s.session_id,
                    s.title,
                    s.message_count,
                    s.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }

        SessionAction::Show { session, json } => {
            let key = SessionKey::new(user, session).context("Invalid session id")?;
            let detail = store.session_detail(&key)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&detail)?);
                return Ok(());
            }

            println!("{} - {}", detail.meta.session_id, detail.meta.title);
            for event in &detail.timeline {
                let seq = event.seq.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
                match event.event_type {
                    EventType::Route => {
                        let label = event
                            .structured
                            .as_ref()
                            .and_then(|v| v.get("your_choice"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("?");
                        println!("[{}] {} routed to {}", seq, event.agent, label);
                    }
                    EventType::Message | EventType::Error => {
                        let marker = if event.event_type == EventType::Error { " (error)" } else { "" };
                        println!(
                            "[{}] {}{}: {}",
                            seq,
                            event.agent,
                            marker,
                            event.text.as_deref().unwrap_or("")
                        );
                    }
                }
            }
        }

        SessionAction::New { title } => {
            let meta = store.create_session(&user, title)?;
            println!("{}  {}", meta.session_id, meta.title);
        }

        SessionAction::Delete { session } => {
            let key = SessionKey::new(user, session).context("Invalid session id")?;
            if store.delete_session(&key)? {
                println!("Deleted session {}", key.session_id);
            } else {
                anyhow::bail!("Session not found: {}", key.session_id);
            }
        }
    }

    Ok(())
}
