use std::io::{self, BufRead};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};

use eeg_link::ble::BleTransport;
use eeg_link::config::{DriverConfig, StepTimeouts};
use eeg_link::driver::Driver;
use eeg_link::transport::ScanFilter;
use eeg_link::types::{ConnectionState, DeviceInfoKind, DriverEvent, StreamOptions};

#[derive(Parser, Debug, Clone)]
#[command(name = "eeg-link", about = "Stream EEG packets from a BLE headset")]
struct Cli {
    /// Only connect to headsets whose name starts with this (e.g. "alpha_10")
    #[arg(long)]
    name: Option<String>,
    /// Only connect to this transport address
    #[arg(long)]
    address: Option<String>,
    /// Seconds to scan before giving up
    #[arg(long, default_value_t = 15)]
    scan_timeout: u64,
    /// Ask the headset for the per-sample trigger bitmask
    #[arg(long, default_value_t = false)]
    trigger: bool,
    /// Skip the audio sub-link during bonding
    #[arg(long, default_value_t = false)]
    no_audio: bool,
    /// Print each packet as one JSON line instead of a summary
    #[arg(long, default_value_t = false)]
    json: bool,
}

impl Cli {
    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            scan_filter: ScanFilter {
                name_prefix: self.name.clone(),
                address: self.address.clone(),
                services: Vec::new(),
            },
            timeouts: StepTimeouts {
                scan: Duration::from_secs(self.scan_timeout),
                ..StepTimeouts::default()
            },
            connect_audio: !self.no_audio,
            ..DriverConfig::default()
        }
    }

    fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            trigger: self.trigger,
            quality: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=eeg_link=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // ── Connect ───────────────────────────────────────────────────────────────
    let transport = BleTransport::new().await?;
    let (driver, mut events) = Driver::new(transport, cli.driver_config());

    info!("Connecting to headset …");
    driver.connect().await?;

    // ── Start streaming ───────────────────────────────────────────────────────
    driver.start_stream(cli.stream_options()).await?;
    info!("Streaming started. Type 'q' + Enter to quit.\n");
    info!("Commands (type + Enter):");
    info!("  q  – quit");
    info!("  s  – stop streaming");
    info!("  r  – restart streaming");
    info!("  b  – read battery level");
    info!("  i  – read device info");
    info!("  x  – interrupt\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread (StdinLock is not Send) and
    // relayed to an async task.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let commands = driver.clone();
    let options = cli.stream_options();
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            let outcome = match line.as_str() {
                "" => continue,
                "q" => {
                    info!("Quit requested.");
                    commands.disconnect().await
                }
                "s" => commands.stop_stream().await,
                "r" => commands.start_stream(options.clone()).await,
                "b" => commands.read_info(DeviceInfoKind::BatteryLevel).await,
                "i" => {
                    let mut result = Ok(());
                    for kind in DeviceInfoKind::CONNECT_SEQUENCE {
                        result = commands.read_info(kind).await;
                        if result.is_err() {
                            break;
                        }
                    }
                    result
                }
                "x" => commands.interrupt().await,
                other => {
                    warn!("Unknown command '{other}'");
                    continue;
                }
            };
            if let Err(e) = outcome {
                error!("'{line}' failed: {e}");
            }
        }
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    while let Some(event) = events.recv().await {
        match event {
            DriverEvent::StateChanged(state) => {
                info!("state → {state}");
                if matches!(state, ConnectionState::Idle | ConnectionState::Interrupted) {
                    break;
                }
            }
            DriverEvent::DeviceSelected(device) => {
                info!("✅  {} ({:?}, rssi {:?})", device.name, device.family, device.rssi);
            }
            DriverEvent::DeviceInfo(info) => println!("[DEVICE INFO] {info:?}"),

            // ── Packets ──────────────────────────────────────────────────────
            DriverEvent::Packet(packet) if cli.json => match serde_json::to_string(&packet) {
                Ok(line) => println!("{line}"),
                Err(e) => error!("JSON encoding failed: {e}"),
            },
            DriverEvent::Packet(packet) => {
                let first: Vec<String> = packet
                    .channels
                    .iter()
                    .map(|ch| format!("{:+8.2}", ch.first().copied().unwrap_or(f64::NAN)))
                    .collect();
                println!(
                    "[EEG] #{:5}  {} ch × {}  t0=[{}] µV",
                    packet.sequence,
                    packet.channel_count(),
                    packet.sample_rate,
                    first.join(" ")
                );
            }

            DriverEvent::StreamError(e) => warn!("[STREAM] {e:?}"),
            DriverEvent::Streaming(on) => info!("streaming {}", if on { "on" } else { "off" }),
            DriverEvent::StreamStats(stats) => match serde_json::to_string(&stats) {
                Ok(line) => println!("[STATS] {line}"),
                Err(e) => error!("JSON encoding failed: {e}"),
            },
            DriverEvent::Mailbox(response) => println!("[MAILBOX] {response:?}"),
            DriverEvent::CommandResponse { command, response } => {
                println!("[COMMAND] {command:?} → {response:?}")
            }
        }
    }

    info!("Event loop finished – exiting.");
    Ok(())
}
