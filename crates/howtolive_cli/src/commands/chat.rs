//! Chat command - Interactive chat session.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;
use howtolive_chat::{AppContext, DefaultHandlerFactory, SessionKey, StreamOutcome};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use super::UserArgs;

#[derive(Args)]
pub struct ChatArgs {
    #[command(flatten)]
    pub user: UserArgs,

    /// Continue an existing session instead of starting a new one
    #[arg(short, long)]
    pub session: Option<String>,

    /// Title for a new session
    #[arg(long)]
    pub title: Option<String>,
}

pub async fn execute(args: ChatArgs) -> Result<()> {
    let user = args.user.user_key()?;
    let config = args.user.load_config()?;
    let ctx = AppContext::start(config, DefaultHandlerFactory).await;

    let key = match &args.session {
        Some(id) => {
            let key = SessionKey::new(user, id.as_str()).context("Invalid session id")?;
            if ctx.store().load_meta(&key)?.is_none() && ctx.store().load_timeline(&key)?.is_empty() {
                println!("Starting new session {}", key.session_id);
            } else {
                println!("Resuming session {}", key.session_id);
            }
            key
        }
        None => {
            let meta = ctx.store().create_session(&user, args.title.clone())?;
            println!("New session {} ({})", meta.session_id, meta.title);
            SessionKey::new(user, meta.session_id)?
        }
    };

    if ctx.shared().llm.is_none() {
        println!("No API key configured; offline handlers will answer.");
    }
    println!("Type your message, or `exit` to quit.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text.eq_ignore_ascii_case("exit") || text.eq_ignore_ascii_case("quit") {
            break;
        }

        let mut turn = ctx.stream_message(&key, text).await?;
        print!("{}> ", turn.handler_name());
        while let Some(delta) = turn.next().await {
            print!("{}", delta.delta);
            std::io::stdout().flush()?;
        }
        println!("\n");

        if let Some(report) = turn.report() {
            match &report.outcome {
                StreamOutcome::Completed(_) => {}
                StreamOutcome::Failed(reason) => eprintln!("(turn failed: {})", reason),
                StreamOutcome::TimedOut => eprintln!("(response timed out)"),
            }
            if !report.persisted {
                eprintln!("(warning: this turn was not saved)");
            }
        }
    }

    let report = ctx.shutdown().await;
    info!(session = %key, closed = report.closed.len(), "Chat ended");
    Ok(())
}
