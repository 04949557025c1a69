//! Filename and CSV record formatting into fixed-capacity buffers.
//!
//! Overflow is never fatal. The infallible entry points ([`create_filename`],
//! [`format_log_entry`]) leave the buffer empty and emit a warning; the
//! `try_` variants hand the [`FormatOverflowError`] back instead.

use std::fmt::{self, Write};

use heapless::String as HeaplessString;

use super::{DataKind, TelemetryPacket};
use crate::error::FormatOverflowError;

/// Filename capacity; matches the FAT long-filename limit.
pub const FILE_NAME_BUFFER_SIZE: usize = 255;
/// Capacity of a single formatted record.
pub const DATA_BUFFER_SIZE: usize = 128;

/// Per-source CSV filename. Empty when formatting failed.
pub type FileName = HeaplessString<FILE_NAME_BUFFER_SIZE>;
/// One `timestamp,value\r\n` record. Empty when formatting failed or the
/// packet's data kind is unrecognized.
pub type LogEntry = HeaplessString<DATA_BUFFER_SIZE>;

/// Counts rendered bytes without storing them.
struct LenCounter(usize);

impl Write for LenCounter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0 += s.len();
        Ok(())
    }
}

/// Render `args` into `buf`, requiring room for a terminator as well.
fn render<const N: usize>(
    buf: &mut HeaplessString<N>,
    what: &'static str,
    args: fmt::Arguments<'_>,
) -> Result<(), FormatOverflowError> {
    buf.clear();

    let mut counter = LenCounter(0);
    // LenCounter never fails
    let _ = counter.write_fmt(args);
    let needed = counter.0;

    if needed >= N {
        return Err(FormatOverflowError {
            what,
            capacity: N,
            needed,
        });
    }

    buf.write_fmt(args).map_err(|_| {
        buf.clear();
        FormatOverflowError {
            what,
            capacity: N,
            needed,
        }
    })
}

/// Write `"<source_id><address>.csv"` into `buf`.
///
/// On overflow `buf` is left empty.
pub fn try_create_filename<const N: usize>(
    buf: &mut HeaplessString<N>,
    source_id: u8,
    address: u32,
) -> Result<(), FormatOverflowError> {
    render(buf, "Filename", format_args!("{}{}.csv", source_id, address))
}

/// Filename for the telemetry `source_id` and the CSP source `address`.
///
/// Returns an empty string if the name does not fit; callers treat that as a
/// failure signal.
pub fn create_filename(source_id: u8, address: u32) -> FileName {
    let mut buf = FileName::new();
    if let Err(err) = try_create_filename(&mut buf, source_id, address) {
        tracing::warn!(source_id, address, %err, "Filename formatting failed");
    }
    buf
}

/// Write the CSV record for `packet` into `buf`.
///
/// Integers render in decimal, floats with six decimals. An unrecognized data
/// kind leaves `buf` empty and is not an error.
pub fn try_format_log_entry<const N: usize>(
    buf: &mut HeaplessString<N>,
    packet: &TelemetryPacket,
) -> Result<(), FormatOverflowError> {
    match packet.source.data_type {
        DataKind::Int => render(
            buf,
            "Data (int packet)",
            format_args!("{},{}\r\n", packet.timestamp, packet.data.as_int()),
        ),
        DataKind::Float => render(
            buf,
            "Data (float packet)",
            format_args!(
                "{},{:.6}\r\n",
                packet.timestamp,
                f64::from(packet.data.as_float())
            ),
        ),
        DataKind::Unrecognized(tag) => {
            buf.clear();
            tracing::debug!(
                source_id = packet.source.source_id,
                tag,
                "Unrecognized telemetry data kind, no record produced"
            );
            Ok(())
        }
    }
}

/// CSV record `"<timestamp>,<value>\r\n"` for `packet`.
pub fn format_log_entry(packet: &TelemetryPacket) -> LogEntry {
    let mut buf = LogEntry::new();
    if let Err(err) = try_format_log_entry(&mut buf, packet) {
        tracing::warn!(
            source_id = packet.source.source_id,
            %err,
            "Log entry formatting failed"
        );
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{TelemetryData, TelemetrySource};
    use tracing_test::traced_test;

    #[test]
    fn filename_joins_source_and_address() {
        assert_eq!(create_filename(7, 42).as_str(), "742.csv");
        assert_eq!(create_filename(0, 0).as_str(), "00.csv");
        assert_eq!(
            create_filename(u8::MAX, u32::MAX).as_str(),
            "2554294967295.csv"
        );
    }

    #[test]
    fn filename_overflow_yields_empty() {
        // "742.csv" is 7 bytes; an 8-byte buffer fits it with the terminator
        let mut fits: HeaplessString<8> = HeaplessString::new();
        assert!(try_create_filename(&mut fits, 7, 42).is_ok());
        assert_eq!(fits.as_str(), "742.csv");

        let mut exact: HeaplessString<7> = HeaplessString::new();
        let err = try_create_filename(&mut exact, 7, 42).unwrap_err();
        assert_eq!(err.capacity, 7);
        assert_eq!(err.needed, 7);
        assert!(exact.is_empty());
    }

    #[test]
    fn overflow_clears_previous_contents() {
        let mut buf: HeaplessString<8> = HeaplessString::new();
        try_create_filename(&mut buf, 1, 2).unwrap();
        assert_eq!(buf.as_str(), "12.csv");

        assert!(try_create_filename(&mut buf, 100, 20).is_err());
        assert_eq!(buf.as_str(), "");
    }

    #[test]
    fn int_entry() {
        let packet = TelemetryPacket::int(3, 100, 5);
        assert_eq!(format_log_entry(&packet).as_str(), "100,5\r\n");

        let packet = TelemetryPacket::int(3, u16::MAX, i32::MIN);
        assert_eq!(format_log_entry(&packet).as_str(), "65535,-2147483648\r\n");
    }

    #[test]
    fn float_entry_uses_six_decimals() {
        let packet = TelemetryPacket::float(3, 100, 3.5);
        assert_eq!(format_log_entry(&packet).as_str(), "100,3.500000\r\n");

        let packet = TelemetryPacket::float(3, 0, -0.25);
        assert_eq!(format_log_entry(&packet).as_str(), "0,-0.250000\r\n");
    }

    #[traced_test]
    #[test]
    fn unrecognized_kind_is_silent_no_output() {
        let packet = TelemetryPacket {
            source: TelemetrySource {
                source_id: 4,
                data_type: DataKind::Unrecognized(7),
            },
            data: TelemetryData::from_int(5),
            timestamp: 100,
            csp_address: 0,
        };
        let mut buf: LogEntry = LogEntry::new();
        assert!(try_format_log_entry(&mut buf, &packet).is_ok());
        assert!(buf.is_empty());
        assert!(format_log_entry(&packet).is_empty());
        assert!(logs_contain("Unrecognized telemetry data kind"));
        assert!(!logs_contain("formatting failed"));
    }

    #[traced_test]
    #[test]
    fn float_overflow_is_reported_not_propagated() {
        // f32::MAX renders as 39 integer digits plus six decimals
        let packet = TelemetryPacket::float(1, 1, f32::MAX);
        let mut small: HeaplessString<32> = HeaplessString::new();
        let err = try_format_log_entry(&mut small, &packet).unwrap_err();
        assert_eq!(err.what, "Data (float packet)");
        assert!(err.needed >= 32);
        assert!(small.is_empty());

        // the default buffer is large enough for any f32
        let entry = format_log_entry(&packet);
        assert!(entry.starts_with("1,340282346638528859811704183484516925440.000000"));
        assert!(!logs_contain("Log entry formatting failed"));
    }
}
