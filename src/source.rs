//! Byte sources feeding the logger.
//!
//! End-of-stream is not the end of a source. The session keeps polling, so a
//! file that grows or a FIFO that gets a new writer is read again from where
//! it stopped.

use tokio::io::AsyncRead;

use crate::config::{SourceConfig, SourceKind};
use crate::error::{AppResult, ConfigError, LoggerError};

/// Any byte source the session can drain.
pub type DynSource = Box<dyn AsyncRead + Unpin + Send>;

/// Open the configured byte source.
pub async fn open_source(config: &SourceConfig) -> AppResult<DynSource> {
    match config.kind {
        SourceKind::Stdin => {
            tracing::info!("Reading console bytes from stdin");
            Ok(Box::new(tokio::io::stdin()))
        }
        SourceKind::File => {
            let path = config.path.as_ref().ok_or_else(|| missing_path(config.kind))?;
            let file = tokio::fs::File::open(path).await?;
            tracing::info!(path = %path.display(), "Reading console bytes from file");
            Ok(Box::new(file))
        }
        SourceKind::Serial => open_serial(config),
    }
}

fn missing_path(kind: SourceKind) -> LoggerError {
    ConfigError(format!("source.path is required for a {kind} source")).into()
}

#[cfg(feature = "serial")]
fn open_serial(config: &SourceConfig) -> AppResult<DynSource> {
    let path = config.path.as_ref().ok_or_else(|| missing_path(config.kind))?;
    let port = tokio_serial::new(path.to_string_lossy(), config.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(std::io::Error::from)?;
    tracing::info!(
        device = %path.display(),
        baud = config.baud_rate,
        "Reading console bytes from serial port"
    );
    Ok(Box::new(port))
}

#[cfg(not(feature = "serial"))]
fn open_serial(_config: &SourceConfig) -> AppResult<DynSource> {
    Err(LoggerError::FeatureNotEnabled("serial".to_string()))
}
