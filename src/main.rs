//! CLI entry point for flight-logger.
//!
//! # Usage
//!
//! Log stdin to the card mounted at `/mnt/sd`:
//! ```bash
//! flight-logger run --root /mnt/sd
//! ```
//!
//! Run the FAT filesystem directly on the raw card device:
//! ```bash
//! flight-logger run --image /dev/mmcblk0
//! ```
//!
//! Log a serial console (requires the `serial` feature):
//! ```bash
//! flight-logger run --source serial --device /dev/ttyS1 --baud 115200
//! ```
//!
//! Format helpers:
//! ```bash
//! flight-logger filename 7 42        # 742.csv
//! flight-logger record 100 float 3.5 # 100,3.500000
//! flight-logger make-image card.img  # blank FAT16 card image
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use flight_logger::config::{LoggerConfig, SourceKind, DEFAULT_CONFIG_PATH};
use flight_logger::indicator::TracingIndicator;
use flight_logger::logging::{self, LoggingConfig};
use flight_logger::pipeline::{LoggerSession, RunSummary};
use flight_logger::source::open_source;
use flight_logger::storage::{
    create_fat16_image, DirectoryDriver, FatDriver, MockCard, StorageDriver,
};
use flight_logger::telemetry::{
    create_filename, format_log_entry, DataKind, TelemetryData, TelemetryPacket, TelemetrySource,
};

#[derive(Parser)]
#[command(name = "flight-logger")]
#[command(about = "Always-on console logger with SD card fault recovery", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drain a byte source into the log file; runs until killed
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Card mount point (overrides storage.root)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Raw card device or FAT image to drive directly (overrides storage.image)
        #[arg(long, conflicts_with = "root")]
        image: Option<PathBuf>,

        /// Log file relative to the mount point (overrides storage.log_path)
        #[arg(long)]
        log_path: Option<String>,

        /// Byte source (overrides source.kind)
        #[arg(long, value_enum)]
        source: Option<SourceArg>,

        /// File or serial device (overrides source.path)
        #[arg(long)]
        device: Option<PathBuf>,

        /// Serial baud rate (overrides source.baud_rate)
        #[arg(long)]
        baud: Option<u32>,

        /// Log to an in-memory card instead of a real one
        #[arg(long)]
        simulate: bool,
    },

    /// Print the per-source CSV filename
    Filename { source_id: u8, address: u32 },

    /// Print one formatted log line
    Record {
        timestamp: u16,
        /// `int`, `float` or a numeric kind tag
        kind: String,
        value: String,
    },

    /// Write a blank FAT16 card image for host runs
    MakeImage { path: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceArg {
    Stdin,
    File,
    Serial,
}

impl From<SourceArg> for SourceKind {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Stdin => SourceKind::Stdin,
            SourceArg::File => SourceKind::File,
            SourceArg::Serial => SourceKind::Serial,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            root,
            image,
            log_path,
            source,
            device,
            baud,
            simulate,
        } => {
            let mut config = LoggerConfig::load_from(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            if let Some(root) = root {
                config.storage.root = root;
            }
            if image.is_some() {
                config.storage.image = image;
            }
            if let Some(log_path) = log_path {
                config.storage.log_path = log_path;
            }
            if let Some(source) = source {
                config.source.kind = source.into();
            }
            if let Some(device) = device {
                config.source.path = Some(device);
            }
            if let Some(baud) = baud {
                config.source.baud_rate = baud;
            }
            config.validate()?;
            logging::init_from_config(&config)?;

            run(&config, simulate).await
        }
        Commands::Filename { source_id, address } => {
            logging::init(LoggingConfig::default())?;
            let name = create_filename(source_id, address);
            if name.is_empty() {
                bail!("filename for source {source_id} address {address} does not fit");
            }
            println!("{name}");
            Ok(())
        }
        Commands::Record {
            timestamp,
            kind,
            value,
        } => {
            logging::init(LoggingConfig::default())?;
            let packet = parse_record(timestamp, &kind, &value)?;
            print!("{}", format_log_entry(&packet));
            Ok(())
        }
        Commands::MakeImage { path } => {
            logging::init(LoggingConfig::default())?;
            create_fat16_image(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "Blank card image written");
            Ok(())
        }
    }
}

async fn run(config: &LoggerConfig, simulate: bool) -> Result<()> {
    tracing::info!(
        name = %config.application.name,
        root = %config.storage.root.display(),
        image = ?config.storage.image,
        log_path = %config.storage.log_path,
        source = %config.source.kind,
        simulate,
        "Starting flight logger"
    );

    let summary = if simulate {
        let card = MockCard::new();
        let summary = drive(card.clone(), config).await?;
        let logged = card.contents(&config.storage.log_path).map_or(0, |c| c.len());
        tracing::info!(bytes = logged, "Simulated card contents");
        summary
    } else if let Some(image) = &config.storage.image {
        drive(FatDriver::image(image), config).await?
    } else {
        drive(DirectoryDriver::new(&config.storage.root), config).await?
    };

    tracing::info!(
        chunks_written = summary.stats.chunks_written,
        bytes_written = summary.stats.bytes_written,
        chunks_dropped = summary.stats.chunks_dropped,
        syncs = summary.stats.syncs,
        read_errors = summary.stats.read_errors,
        faults = summary.recovery.faults,
        recoveries = summary.recovery.recoveries,
        state = %summary.state,
        "Flight logger stopped"
    );
    Ok(())
}

async fn drive<D: StorageDriver>(driver: D, config: &LoggerConfig) -> Result<RunSummary> {
    let mut source = open_source(&config.source)
        .await
        .context("Failed to open byte source")?;
    let mut session = LoggerSession::start(driver, config.session_options(), TracingIndicator);
    session.run(&mut source).await;
    Ok(session.close())
}

fn parse_record(timestamp: u16, kind: &str, value: &str) -> Result<TelemetryPacket> {
    let kind = match kind.to_ascii_lowercase().as_str() {
        "int" => DataKind::Int,
        "float" => DataKind::Float,
        tag => DataKind::from(
            tag.parse::<u8>()
                .with_context(|| format!("unknown data kind '{tag}'"))?,
        ),
    };
    let data = match kind {
        DataKind::Int => TelemetryData::from_int(value.parse().context("invalid integer value")?),
        DataKind::Float => TelemetryData::from_float(value.parse().context("invalid float value")?),
        DataKind::Unrecognized(_) => {
            TelemetryData::from_bits(value.parse().context("invalid raw value")?)
        }
    };
    Ok(TelemetryPacket {
        source: TelemetrySource {
            source_id: 0,
            data_type: kind,
        },
        data,
        timestamp,
        csp_address: 0,
    })
}
