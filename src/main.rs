use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use rallysync::config::SessionConfig;
use rallysync::runtime::{self, Mode};
use rallysync::session::RoomCommand;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Room server base URL
    #[arg(short, long, default_value = "ws://localhost:8787")]
    server: String,

    /// Room identifier shared by everyone in the rally
    #[arg(short, long)]
    room: String,

    /// JSON config file (defaults are used for anything missing)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Disable audio countdown cues
    #[arg(long)]
    no_audio: bool,

    /// Disable spoken calls
    #[arg(long)]
    no_voice: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the room and call out rally/march starts (default)
    Watch,
    /// Add a participant with their march time in seconds
    AddPlayer {
        name: String,
        march_secs: f64,
    },
    /// Remove a participant by id
    RemovePlayer { id: String },
    /// Start a rally led by the given participant
    Start {
        starter_id: String,
        #[arg(long)]
        minutes: Option<u32>,
        #[arg(long)]
        pre_delay: Option<u32>,
    },
    /// End the current rally
    End,
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if args.no_audio {
        config.audio.enabled = false;
    }
    if args.no_voice {
        config.announce.voice_enabled = false;
    }

    let mode = match args.command.unwrap_or(Command::Watch) {
        Command::Watch => Mode::Watch,
        Command::AddPlayer { name, march_secs } => Mode::Once(RoomCommand::AddPlayer { name, march_secs }),
        Command::RemovePlayer { id } => Mode::Once(RoomCommand::RemovePlayer { id }),
        Command::Start { starter_id, minutes, pre_delay } => Mode::Once(RoomCommand::StartRally {
            starter_id,
            rally_minutes: minutes.unwrap_or(config.rally.default_rally_minutes),
            pre_delay_secs: pre_delay.unwrap_or(config.rally.default_pre_delay_secs),
        }),
        Command::End => Mode::Once(RoomCommand::EndRally),
    };

    info!("rallysync v{} room {} via {}", env!("CARGO_PKG_VERSION"), args.room, args.server);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    rt.block_on(runtime::run(&args.server, &args.room, config, mode))
}
