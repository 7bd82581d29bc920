//! Courier CLI: drive a Telegram bot channel from the terminal.

mod cli;
mod config;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use config::LogConfig;
use courier_channels::telegram::api::TelegramApi;
use courier_channels::telegram::delivery::Delivery;
use courier_channels::{OutboundMedia, SendOptions, TelegramChannel};
use courier_types::config::ChannelConfig;
use courier_types::event::{ChannelEvent, EventKind};
use courier_types::message::CanonicalMessage;
use futures::StreamExt;
use std::sync::Arc;
use tracing::info;

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;
    init_tracing(&config.log);
    config.log_source();
    let channel_config = config.channel_config(|name| std::env::var(name).ok())?;

    match cli.command {
        Commands::Listen { json } => cmd_listen(channel_config, json).await,
        Commands::Whoami => cmd_whoami(&channel_config).await,
        Commands::Send {
            chat,
            plain,
            reply_to,
            thread,
            text,
        } => {
            let options = send_options(plain, reply_to, thread);
            let id = delivery(&channel_config)
                .send_text(&chat, &text, &options)
                .await?;
            println!("sent message {id}");
            Ok(())
        }
        Commands::SendMedia {
            chat,
            kind,
            file,
            remote,
            caption,
            plain,
        } => {
            let mut media = match (file, remote) {
                (Some(path), _) => {
                    let data = tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?;
                    let file_name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "upload.bin".to_string());
                    OutboundMedia::bytes(kind, data, file_name)
                }
                (None, Some(reference)) => OutboundMedia::remote(kind, reference),
                (None, None) => anyhow::bail!("one of --file or --remote is required"),
            };
            if let Some(caption) = caption {
                media = media.with_caption(caption);
            }
            let options = send_options(plain, None, None);
            let id = delivery(&channel_config)
                .send_media(&chat, media, &options)
                .await?;
            println!("sent message {id}");
            Ok(())
        }
        Commands::Download { file_id, out } => {
            let api = TelegramApi::new(&channel_config);
            let data = api
                .download_attachment(&file_id, Some(channel_config.max_attachment_bytes))
                .await?;
            tokio::fs::write(&out, &data)
                .await
                .with_context(|| format!("writing {}", out.display()))?;
            println!("wrote {} bytes to {}", data.len(), out.display());
            Ok(())
        }
    }
}

fn send_options(plain: bool, reply_to: Option<i64>, thread: Option<i64>) -> SendOptions {
    let mut options = if plain {
        SendOptions::plain()
    } else {
        SendOptions::default()
    };
    options.reply_to_message_id = reply_to;
    options.message_thread_id = thread;
    options
}

/// One-shot sends go straight through the transport; connecting would start
/// a poller and consume updates meant for a running listener.
fn delivery(config: &ChannelConfig) -> Delivery {
    Delivery::new(Arc::new(TelegramApi::new(config)))
}

async fn cmd_whoami(config: &ChannelConfig) -> anyhow::Result<()> {
    let identity = TelegramApi::new(config).get_me().await?;
    println!("@{} ({}) id={}", identity.username, identity.display_name, identity.id);
    Ok(())
}

async fn cmd_listen(config: ChannelConfig, json: bool) -> anyhow::Result<()> {
    let channel = TelegramChannel::new();
    let (err_tx, mut err_rx) = tokio::sync::mpsc::unbounded_channel();
    channel.on(EventKind::Error, move |event| {
        if let ChannelEvent::Error(err) = event {
            let _ = err_tx.send(err.clone());
        }
        Ok(())
    });
    let mut messages = channel.message_stream();

    let identity = channel.connect(config).await?;
    eprintln!("Listening as @{}. Press Ctrl+C to stop.", identity.username);

    let result = loop {
        tokio::select! {
            Some(msg) = messages.next() => print_message(&msg, json)?,
            Some(err) = err_rx.recv() => break Err(anyhow::Error::new(err).context("ingestion stopped")),
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, disconnecting");
                break Ok(());
            }
        }
    };

    channel
        .disconnect(Some("listener stopped".to_string()))
        .await?;
    result
}

fn print_message(msg: &CanonicalMessage, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(msg)?);
        return Ok(());
    }
    let time = msg
        .received_at()
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_default();
    let body = if msg.content.is_empty() {
        format!("[{}]", msg.message_type)
    } else {
        msg.content.clone()
    };
    println!("{time} {} ({}): {body}", msg.sender_name, msg.channel_id);
    Ok(())
}
