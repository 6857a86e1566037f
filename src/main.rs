//! ArduinoBuddy
//!
//! Talk to Arduino-class boards over USB serial from the command line.
//!
//! ```bash
//! # Boards the external tool knows about
//! arduino-buddy boards
//!
//! # Attached USB serial devices
//! arduino-buddy devices
//!
//! # Interactive terminal on the first supported device
//! arduino-buddy terminal --baud 9600 --eol lf
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use arduino_buddy_lib::commands;
use arduino_buddy_lib::config::AppSettings;
use arduino_buddy_lib::connection_log::format_entry;
use arduino_buddy_lib::device::{create_port_monitor, ConnectOutcome};
use arduino_buddy_lib::AppState;

#[derive(Parser)]
#[command(name = "arduino-buddy")]
#[command(version)]
#[command(about = "Serial terminal and board browser for Arduino-class devices")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (JSON)
    #[arg(short, long, global = true, default_value = "arduino-buddy.json")]
    config: PathBuf,

    /// Private data directory for the board tool
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List boards supported by the board tool
    Boards,

    /// List attached USB serial devices
    Devices,

    /// Open a serial session and forward stdin lines to it
    Terminal {
        /// Serial port path (e.g., /dev/ttyACM0); defaults to the first supported device
        #[arg(short, long)]
        port: Option<String>,

        /// Baud rate
        #[arg(short, long)]
        baud: Option<String>,

        /// Line ending appended to each sent line
        #[arg(long, value_enum, default_value_t = LineEnding::Lf)]
        eol: LineEnding,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LineEnding {
    None,
    Lf,
    Crlf,
}

impl LineEnding {
    fn as_str(self) -> &'static str {
        match self {
            LineEnding::None => "",
            LineEnding::Lf => "\n",
            LineEnding::Crlf => "\r\n",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = AppSettings::load(&cli.config)
        .with_context(|| format!("Loading settings from {}", cli.config.display()))?;
    if let Some(data_dir) = cli.data_dir {
        settings.data_dir = data_dir;
    }

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        settings.log_filter()
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let state = AppState::new(settings);
    state.init().await.context("Initializing board tool")?;

    match cli.command {
        Commands::Boards => {
            let text = commands::list_boards(&state).await.map_err(anyhow::Error::msg)?;
            print!("{}", text);
        }
        Commands::Devices => list_devices(&state).await?,
        Commands::Terminal { port, baud, eol } => {
            let baud = baud.unwrap_or_else(|| state.settings.line.baud_rate.to_string());
            run_terminal(&state, port.as_deref(), &baud, eol).await?;
        }
    }

    Ok(())
}

async fn list_devices(state: &AppState) -> Result<()> {
    let devices = commands::discover_devices(state).await.map_err(anyhow::Error::msg)?;
    if devices.is_empty() {
        println!("No USB serial devices found");
        return Ok(());
    }

    for device in devices {
        let driver = device
            .driver
            .map(|d| format!("{:?}", d))
            .unwrap_or_else(|| "unsupported".to_string());
        println!(
            "{:<20} {:04x}:{:04x}  {:<10} {}",
            device.port_name(),
            device.info.vid,
            device.info.pid,
            driver,
            device.info.product.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn run_terminal(state: &AppState, port: Option<&str>, baud: &str, eol: LineEnding) -> Result<()> {
    let mut monitor = create_port_monitor(state.settings.port_poll_interval());
    let port_rx = match monitor.start().await {
        Ok(()) => monitor.get_receiver(),
        Err(e) => {
            log::warn!("Port monitor unavailable, detach will not be noticed: {}", e);
            None
        }
    };
    let pump = state.manager.spawn_event_pump(port_rx);

    let mut entries = state.manager.log().subscribe();
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        loop {
            match entries.recv().await {
                Ok(entry) => {
                    let _ = write!(stdout, "{}", format_entry(&entry));
                    let _ = stdout.flush();
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Terminal fell behind, {} log entries skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let outcome = match port {
        Some(port) => commands::connect(state, port, baud).await,
        None => commands::connect_first(state, baud).await,
    }
    .map_err(anyhow::Error::msg)?;
    if outcome == ConnectOutcome::PermissionRequested {
        log::info!("Waiting for access to the device");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let payload = format!("{}{}", line, eol.as_str());
        if let Err(e) = commands::send(state, &payload) {
            log::warn!("{}", e);
        }
    }

    commands::disconnect(state).await.map_err(anyhow::Error::msg)?;
    if let Err(e) = monitor.stop().await {
        log::warn!("Port monitor did not stop cleanly: {}", e);
    }
    state.manager.stop_event_pump();
    if let Err(e) = pump.await {
        log::warn!("Event pump ended abnormally: {}", e);
    }
    printer.abort();
    Ok(())
}
