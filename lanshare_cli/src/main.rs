use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use lanshare_core::{AppConfig, AppEvent, Direction, Subsystem, TransferOutcome};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lanshare")]
#[command(about = "Find devices on the local network and send them files", long_about = None)]
struct Cli {
    /// Name announced to other devices
    #[arg(long, global = true)]
    name: Option<String>,

    /// Directory received files are saved to
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Announce this device and receive files until Ctrl-C
    Listen,

    /// Send one file to a device
    Send {
        file: PathBuf,
        peer_ip: IpAddr,

        /// Transfer port on the receiving device
        #[arg(long)]
        port: Option<u16>,
    },

    /// List the devices announcing themselves on the network
    Peers {
        /// Seconds to listen before printing
        #[arg(long, default_value_t = 6)]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load();
    if let Some(name) = cli.name {
        config.display_name = name;
    }
    if let Some(dir) = cli.download_dir {
        config.download_dir = dir;
    }
    tracing::debug!(
        "Config: name {:?}, discovery port {}, transfer port {}",
        config.display_name,
        config.discovery_port,
        config.transfer_port
    );

    let result = match cli.command {
        Command::Listen => listen(config).await,
        Command::Send {
            file,
            peer_ip,
            port,
        } => send(config, file, peer_ip, port).await,
        Command::Peers { wait } => peers(config, Duration::from_secs(wait)).await,
    };
    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }
    result
}

async fn listen(config: AppConfig) -> Result<()> {
    let (tx_event, rx_event) = mpsc::channel::<AppEvent>(1000);
    let printer = spawn_printer(rx_event);

    println!(
        "{} is saving files to {}",
        config.display_name,
        config.download_dir.display()
    );
    let mut subsystem = Subsystem::new(config, tx_event);
    subsystem.start().await.context("Failed to start")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;

    tracing::info!("Ctrl-C received, shutting down");
    subsystem.stop().await;
    // Handlers that outlived the shutdown grace may still hold a sender
    printer.abort();
    Ok(())
}

async fn send(config: AppConfig, file: PathBuf, peer_ip: IpAddr, port: Option<u16>) -> Result<()> {
    let (tx_event, rx_event) = mpsc::channel::<AppEvent>(1000);
    let printer = spawn_printer(rx_event);

    let port = port.unwrap_or(config.transfer_port);
    tracing::info!("Sending {} to {}:{}", file.display(), peer_ip, port);
    let subsystem = Subsystem::new(config, tx_event);
    let handle = subsystem.send_file_to(file, (peer_ip, port).into());
    let outcome = handle.wait().await;

    drop(subsystem);
    let _ = printer.await;

    match outcome {
        TransferOutcome::Completed { .. } => Ok(()),
        TransferOutcome::Cancelled => bail!("Transfer cancelled"),
        TransferOutcome::Failed { message, .. } => bail!(message),
    }
}

async fn peers(config: AppConfig, wait: Duration) -> Result<()> {
    // Nothing is printed while collecting; the table comes at the end
    let (tx_event, mut rx_event) = mpsc::channel::<AppEvent>(1000);
    let drain = tokio::spawn(async move { while rx_event.recv().await.is_some() {} });

    let mut subsystem = Subsystem::new(config, tx_event);
    subsystem.start().await.context("Failed to start")?;
    tokio::time::sleep(wait).await;
    let peers = subsystem.peers().await;
    tracing::debug!("{} peer(s) after {:?}", peers.len(), wait);
    subsystem.stop().await;
    drain.abort();

    if peers.is_empty() {
        println!("No devices found");
        return Ok(());
    }
    for peer in peers {
        println!(
            "{:<40} {:<16} seen {}s ago",
            peer.display_name,
            peer.address,
            peer.age().as_secs()
        );
    }
    Ok(())
}

/// Print events until every sender is gone.
fn spawn_printer(mut rx_event: mpsc::Receiver<AppEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx_event.recv().await {
            print_event(&event);
        }
    })
}

fn print_event(event: &AppEvent) {
    match event {
        AppEvent::Status(msg) => println!("{}", msg),
        AppEvent::PeerFound { ip, display_name } => {
            println!("Found {} at {}", display_name, ip)
        }
        AppEvent::TransferStarted {
            direction,
            file_name,
            peer,
            total_bytes,
            ..
        } => {
            let verb = match direction {
                Direction::Sending => "Sending",
                Direction::Receiving => "Receiving",
            };
            println!("{} {} ({} bytes) [{}]", verb, file_name, total_bytes, peer);
        }
        AppEvent::TransferProgress {
            file_name,
            bytes_transferred,
            total_bytes,
            speed,
            ..
        } => {
            let percent = if *total_bytes == 0 {
                100.0
            } else {
                *bytes_transferred as f64 * 100.0 / *total_bytes as f64
            };
            println!("  {} {:5.1}% {}", file_name, percent, speed);
        }
        AppEvent::TransferFinished { peer, outcome, .. } => match outcome {
            TransferOutcome::Completed { file_name } => println!("Done: {} [{}]", file_name, peer),
            TransferOutcome::Failed { message, .. } => eprintln!("Failed: {}", message),
            TransferOutcome::Cancelled => println!("Cancelled [{}]", peer),
        },
        AppEvent::Error(msg) => eprintln!("Error: {}", msg),
    }
}
