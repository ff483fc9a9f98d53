//! Console Bot Example
//!
//! Runs a full Chorus host over the in-memory chat client. Every line typed
//! on stdin arrives as a direct message from `--from`, and everything the
//! host sends is printed back.
//!
//! # Usage
//!
//! ```bash
//! cargo run --package console-bot -- --from 2348011111111
//! > .balance
//! > .send @2348022222222 50
//! > .help
//! ```
//!
//! Without `--plugins`, the economy and admin plugins are enabled inline.
//! `--plugins demos/console_bot/plugins` reads the sample plugin files instead.
//! Ctrl+D or Ctrl+C stops the host.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chorus::core::RawMessage;
use chorus::framework::{InlineSource, PluginFile};
use chorus::prelude::*;
use chorus::runtime::config::load_config_from_file;
use chorus_plugin_economy::ECONOMY;
use clap::Parser;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file; defaults to the usual `chorus.toml` lookup.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number the console messages come from.
    #[arg(long, default_value = "2348011111111")]
    from: String,

    /// Number the host is logged in as.
    #[arg(long, default_value = "2348000000000")]
    identity: String,

    /// Load plugin files from this directory instead of the inline set.
    #[arg(long)]
    plugins: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config_from_file(path)?,
        None => load_config()?,
    };
    // The console user operates the host unless the config names an owner.
    if config.host.owner_number.is_none() {
        config.host.owner_number = Some(args.from.clone());
    }
    if let Some(dir) = &args.plugins {
        config.host.plugin_dir = dir.clone();
    }
    let _guard = init_logging(&config.logging);

    let from = Jid::parse(&args.from).context("invalid --from number")?;
    let client = Arc::new(MemoryChatClient::new(
        Jid::parse(&args.identity).context("invalid --identity number")?,
    ));
    let mut outbound = client
        .take_outbound()
        .context("outbound feed already taken")?;

    let mut builder = Host::builder(config, client.clone()).plugin(&ECONOMY);
    if args.plugins.is_none() {
        builder = builder.source(Arc::new(InlineSource::new(vec![
            PluginFile::new("economy.toml", "economy"),
            PluginFile::new("admin.toml", "admin"),
        ])));
    }
    let host = builder.start().await?;

    tokio::spawn(async move {
        while let Some(record) = outbound.recv().await {
            println!("[{}] {}", record.chat, record.text());
        }
    });

    let console = async {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut counter = 0u64;
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(text)) if text.trim().is_empty() => {}
                    Ok(Some(text)) => {
                        counter += 1;
                        if let Err(e) = client.inject(console_message(&from, counter, &text)).await {
                            warn!(error = %e, "Dropped console line");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Failed to read stdin");
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        info!("Console closed");
    };

    host.run_until(console).await?;
    Ok(())
}

fn console_message(from: &Jid, counter: u64, text: &str) -> RawMessage {
    serde_json::from_value(json!({
        "key": { "remoteJid": from.to_string(), "id": format!("CONSOLE{counter:08}"), "fromMe": false },
        "message": { "conversation": text },
    }))
    .unwrap_or_default()
}
