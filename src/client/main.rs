//! PinShare Client - Main Entry Point
//!
//! `pinshare send <FILE>` publishes an offer and prints a PIN;
//! `pinshare receive <PIN>` joins that room and saves the file.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use pinshare::negotiation::{Joiner, Offerer};
use pinshare::transfer::{
    FileBlob, ReceiverSession, SenderHandle, SenderSession, TransferEvent, TransferOutcome,
};
use pinshare::{ClientConfig, SignalingClient};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "pinshare")]
#[command(about = "PinShare - send a file directly to a peer using a one-time PIN")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/client.toml")]
    config: PathBuf,

    /// Signaling server host
    #[arg(long)]
    host: Option<String>,

    /// Signaling server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (defaults to the config file's)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Offer a file and print the PIN to share
    Send {
        file: PathBuf,
    },
    /// Receive a file using the PIN from the sender
    Receive {
        pin: String,

        /// Directory to save the file in
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Unpack a received bundle next to the archive
        #[arg(short, long)]
        extract: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let (config, from_file) = if args.config.exists() {
        (ClientConfig::from_file(&args.config.to_string_lossy())?, true)
    } else {
        (ClientConfig::default(), false)
    };

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or(config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level)).init();

    if !from_file {
        info!("Config file not found, using defaults");
    }

    let host = args.host.unwrap_or(config.server_host.clone());
    let port = args.port.unwrap_or(config.signaling_port);

    match args.command {
        Command::Send { file } => send(&config, &host, port, file).await,
        Command::Receive { pin, output, extract } => {
            let output_dir = output.unwrap_or(config.output_dir.clone());
            receive(&config, &host, port, &pin, output_dir, extract).await
        }
    }
}

async fn send(config: &ClientConfig, host: &str, port: u16, path: PathBuf) -> Result<()> {
    let file = FileBlob::open(&path).await?;
    println!("📄 {} ({} bytes)", file.name(), file.size());

    let (offerer, offer) =
        Offerer::prepare(config.advertise_host.as_deref(), config.gather_timeout()).await?;

    let mut signaling = SignalingClient::connect(host, port, config).await?;
    let pin = signaling.create_room(offer).await?;
    println!();
    println!("🔑 PIN: {}", pin);
    println!("Waiting for the receiver to join...");

    let answer = signaling.wait_answer_ready(&pin).await?;
    let (channel, channel_events) = offerer.accept(&answer).await?;
    drop(signaling);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(events_rx));

    let (handle, commands) = SenderHandle::new();
    let input_task = tokio::spawn(handle_user_input(handle.clone()));

    let mut session = SenderSession::new(channel.clone(), config.transfer.clone()).with_events(events_tx);
    session.start(Some(file))?;

    println!("Commands: p = pause, r = resume, c = cancel");
    let outcome = tokio::select! {
        outcome = session.run(channel_events, commands) => outcome,
        _ = tokio::signal::ctrl_c() => {
            // Dropping the run future stops the loop; announce the cancel ourselves
            session.cancel();
            Ok(TransferOutcome::Cancelled)
        }
    };

    input_task.abort();
    channel.shutdown().await;
    drop(session);
    let _ = printer.await;

    match outcome? {
        TransferOutcome::Sent => println!("✅ Sent {}", path.display()),
        TransferOutcome::Cancelled => println!("❌ Transfer cancelled"),
        other => warn!("Transfer ended: {:?}", other),
    }
    Ok(())
}

async fn receive(
    config: &ClientConfig,
    host: &str,
    port: u16,
    pin: &str,
    output_dir: PathBuf,
    extract: bool,
) -> Result<()> {
    let mut signaling = SignalingClient::connect(host, port, config).await?;
    let offer = signaling.join_room(pin).await?;
    let (joiner, answer) = Joiner::answer(&offer)?;
    signaling.send_answer(pin, answer).await?;
    drop(signaling);

    let (channel, mut channel_events) = joiner.connect().await?;
    println!("🔗 Connected to sender (ctrl-c to cancel)");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(events_rx));
    let mut session = ReceiverSession::new(config.transfer.clone()).with_events(events_tx);

    let outcome = tokio::select! {
        outcome = session.run(&mut channel_events) => outcome,
        _ = tokio::signal::ctrl_c() => {
            session.cancel(channel.as_ref());
            TransferOutcome::Cancelled
        }
    };

    channel.shutdown().await;
    drop(session);
    let _ = printer.await;

    match outcome {
        TransferOutcome::Received(file) => {
            let path = file.write_to(&output_dir).await?;
            println!("✅ Saved {} ({} bytes)", path.display(), file.len());
            if file.is_bundle() {
                if extract {
                    for member in file.extract_to(&output_dir).await? {
                        println!("📄 {}", member.display());
                    }
                } else {
                    println!("📦 {} is a bundle; pass --extract to unpack it", file.name());
                }
            }
        }
        TransferOutcome::Cancelled => println!("❌ Transfer cancelled"),
        TransferOutcome::Stalled => {
            println!("⚠️  Connection lost before the transfer finished");
        }
        TransferOutcome::Sent => {}
    }
    Ok(())
}

async fn handle_user_input(handle: SenderHandle) -> Result<()> {
    let stdin = tokio::io::stdin();
    let reader = BufReader::new(stdin);
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let delivered = match line.trim().to_lowercase().as_str() {
            "p" | "pause" => handle.pause(),
            "r" | "resume" => handle.resume(),
            "c" | "cancel" => handle.cancel(),
            "" => true,
            other => {
                println!("Unknown command: {}", other);
                true
            }
        };
        if !delivered {
            break;
        }
    }
    Ok(())
}

async fn print_events(mut events: mpsc::UnboundedReceiver<TransferEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Progress(progress) => {
                print!(
                    "\r{:>3}%  {} / {} bytes  {:.2} MB/s",
                    progress.percent, progress.transferred, progress.total, progress.throughput
                );
                let _ = io::stdout().flush();
            }
            TransferEvent::Started(metadata) => {
                println!("Transferring {} ({} bytes)", metadata.name, metadata.size)
            }
            TransferEvent::Paused => println!("\n⏸  Paused"),
            TransferEvent::Resumed => println!("▶  Resumed"),
            TransferEvent::Sent { .. } | TransferEvent::Received(_) => println!(),
            TransferEvent::Cancelled { by_peer: true } => println!("\nPeer cancelled the transfer"),
            TransferEvent::Cancelled { by_peer: false } => println!(),
            TransferEvent::Failed { reason } => println!("\nTransfer failed: {}", reason),
        }
    }
}
