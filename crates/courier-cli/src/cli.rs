//! Clap CLI definitions for Courier.

use clap::{Parser, Subcommand};
use courier_types::message::MessageType;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  courier whoami                              Check the configured bot token
  courier listen                              Print inbound messages until Ctrl+C
  courier listen --json                       Same, one JSON object per line
  courier send --chat 123456 '**hi** there'   Send formatted text
  courier send-media --chat 123456 --kind photo --file cat.jpg --caption 'a cat'
  courier download --file-id AgAD... --out ./file.bin

\x1b[1;36mConfig:\x1b[0m
  ~/.courier/config.toml (override with --config). The token is read from
  $TELEGRAM_BOT_TOKEN unless [telegram] sets credential or credential_env.";

/// Courier: a Telegram bot channel for agent runtimes.
#[derive(Parser)]
#[command(name = "courier", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect and print inbound messages until Ctrl+C.
    Listen {
        /// Output one JSON object per message.
        #[arg(long)]
        json: bool,
    },
    /// Print the bot account behind the configured token.
    Whoami,
    /// Send a text message (markdown by default).
    Send {
        /// Target chat id, or @channelusername.
        #[arg(long, allow_hyphen_values = true)]
        chat: String,
        /// Send the text verbatim with no formatting.
        #[arg(long)]
        plain: bool,
        /// Reply to this message id.
        #[arg(long)]
        reply_to: Option<i64>,
        /// Forum topic (message thread) id.
        #[arg(long)]
        thread: Option<i64>,
        /// Message text.
        text: String,
    },
    /// Send a media item from a local file or a remote file id / URL.
    SendMedia {
        /// Target chat id, or @channelusername.
        #[arg(long, allow_hyphen_values = true)]
        chat: String,
        /// Media kind: photo, document, audio, video, voice, animation, video_note.
        #[arg(long)]
        kind: MessageType,
        /// Local file to upload.
        #[arg(long, conflicts_with = "remote", required_unless_present = "remote")]
        file: Option<PathBuf>,
        /// Existing file id or public URL.
        #[arg(long)]
        remote: Option<String>,
        /// Caption (markdown unless --plain).
        #[arg(long)]
        caption: Option<String>,
        /// Send the caption verbatim with no formatting.
        #[arg(long)]
        plain: bool,
    },
    /// Download an inbound attachment by file id.
    Download {
        /// File id from a received message.
        #[arg(long)]
        file_id: String,
        /// Destination path.
        #[arg(long)]
        out: PathBuf,
    },
}
