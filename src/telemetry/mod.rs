//! Telemetry packet shape and log-text formatting.
//!
//! Only the data shape of a telemetry packet matters to the logger: a
//! timestamp, a source identifier, a data kind tag and a 32-bit value whose
//! interpretation depends on that tag. The formatting helpers in [`format`]
//! turn packets into per-source filenames and CSV lines using fixed-capacity
//! buffers.

pub mod format;

pub use format::{
    create_filename, format_log_entry, try_create_filename, try_format_log_entry, FileName,
    LogEntry, DATA_BUFFER_SIZE, FILE_NAME_BUFFER_SIZE,
};

/// Declared kind of a packet's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// Signed 32-bit integer.
    Int,
    /// 32-bit float.
    Float,
    /// Tag value this logger does not know how to render.
    Unrecognized(u8),
}

impl DataKind {
    /// Wire tag for this kind.
    pub fn raw(self) -> u8 {
        match self {
            DataKind::Int => 0,
            DataKind::Float => 1,
            DataKind::Unrecognized(tag) => tag,
        }
    }
}

impl From<u8> for DataKind {
    fn from(tag: u8) -> Self {
        match tag {
            0 => DataKind::Int,
            1 => DataKind::Float,
            other => DataKind::Unrecognized(other),
        }
    }
}

/// Raw 32-bit packet payload.
///
/// The same bits are read as an integer or a float depending on the
/// packet's [`DataKind`].
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetryData(u32);

impl TelemetryData {
    /// Payload from raw bits.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Payload carrying a two's-complement integer.
    pub fn from_int(value: i32) -> Self {
        Self(value as u32)
    }

    /// Payload carrying an IEEE-754 single.
    pub fn from_float(value: f32) -> Self {
        Self(value.to_bits())
    }

    /// The raw bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// The bits read as an integer.
    pub fn as_int(self) -> i32 {
        self.0 as i32
    }

    /// The bits read as a float.
    pub fn as_float(self) -> f32 {
        f32::from_bits(self.0)
    }
}

impl std::fmt::Debug for TelemetryData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TelemetryData({:#010x})", self.0)
    }
}

/// Producer of a telemetry value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySource {
    /// Producer identifier.
    pub source_id: u8,
    /// How the payload is encoded.
    pub data_type: DataKind,
}

/// A timestamped measurement record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryPacket {
    /// Who produced the value.
    pub source: TelemetrySource,
    /// The value.
    pub data: TelemetryData,
    /// Producer's timestamp.
    pub timestamp: u16,
    /// Source address of the CSP packet that carried this record.
    pub csp_address: u32,
}

impl TelemetryPacket {
    /// Integer packet with no CSP address.
    pub fn int(source_id: u8, timestamp: u16, value: i32) -> Self {
        Self {
            source: TelemetrySource {
                source_id,
                data_type: DataKind::Int,
            },
            data: TelemetryData::from_int(value),
            timestamp,
            csp_address: 0,
        }
    }

    /// Float packet with no CSP address.
    pub fn float(source_id: u8, timestamp: u16, value: f32) -> Self {
        Self {
            source: TelemetrySource {
                source_id,
                data_type: DataKind::Float,
            },
            data: TelemetryData::from_float(value),
            timestamp,
            csp_address: 0,
        }
    }

    /// Same packet, carried from `address`.
    pub fn with_csp_address(mut self, address: u32) -> Self {
        self.csp_address = address;
        self
    }

    /// Per-source CSV filename for this packet.
    pub fn filename(&self) -> FileName {
        create_filename(self.source.source_id, self.csp_address)
    }

    pub fn log_entry(&self) -> LogEntry {
        format_log_entry(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_kind_tags() {
        assert_eq!(DataKind::from(0), DataKind::Int);
        assert_eq!(DataKind::from(1), DataKind::Float);
        assert_eq!(DataKind::from(9), DataKind::Unrecognized(9));
        assert_eq!(DataKind::Unrecognized(9).raw(), 9);
        assert_eq!(DataKind::Float.raw(), 1);
    }

    #[test]
    fn payload_reinterprets_bits() {
        let data = TelemetryData::from_int(-1);
        assert_eq!(data.bits(), u32::MAX);
        assert_eq!(data.as_int(), -1);

        let data = TelemetryData::from_float(3.5);
        assert_eq!(data.as_float(), 3.5);
        assert_eq!(data.bits(), 3.5f32.to_bits());
    }

    #[test]
    fn packet_filename_uses_csp_address() {
        let packet = TelemetryPacket::int(7, 100, 5).with_csp_address(42);
        assert_eq!(packet.filename().as_str(), "742.csv");
        assert_eq!(packet.log_entry().as_str(), "100,5\r\n");
    }
}
