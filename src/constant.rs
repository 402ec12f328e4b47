//! Wire constants for the CQL binary protocol.

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Self::Error,
            0x01 => Self::Startup,
            0x02 => Self::Ready,
            0x03 => Self::Authenticate,
            0x05 => Self::Options,
            0x06 => Self::Supported,
            0x07 => Self::Query,
            0x08 => Self::Result,
            0x09 => Self::Prepare,
            0x0A => Self::Execute,
            0x0B => Self::Register,
            0x0C => Self::Event,
            0x0D => Self::Batch,
            0x0E => Self::AuthChallenge,
            0x0F => Self::AuthResponse,
            0x10 => Self::AuthSuccess,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    /// Frame header flags. `use_beta` is v5+ only; `custom_payload`
    /// and `warning` are v4+ only but decoded unconditionally - the decoder
    /// trusts the server not to set flags a negotiated version can't produce.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        const COMPRESSION    = 0x01;
        const TRACING        = 0x02;
        const CUSTOM_PAYLOAD = 0x04;
        const WARNING        = 0x08;
        const USE_BETA       = 0x10;
    }
}

/// Protocol version, including the direction bit carried in the header's
/// high bit (request = 0, response = 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion(pub u8);

impl ProtocolVersion {
    pub const V1: Self = Self(1);
    pub const V2: Self = Self(2);
    pub const V3: Self = Self(3);
    pub const V4: Self = Self(4);
    pub const V5: Self = Self(5);

    /// Header size in bytes for this version.
    pub fn header_len(self) -> usize {
        if self.0 <= 2 { 8 } else { 9 }
    }

    /// Width in bytes of the stream id field.
    pub fn stream_id_len(self) -> usize {
        if self.0 <= 2 { 1 } else { 2 }
    }

    /// Largest stream id a Connection on this version may allocate.
    pub fn max_stream_ids(self) -> u16 {
        if self.0 <= 2 { 128 } else { 32768 }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Void = 1,
    Rows = 2,
    SetKeyspace = 3,
    Prepared = 4,
    SchemaChange = 5,
}

impl ResultKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::Void,
            2 => Self::Rows,
            3 => Self::SetKeyspace,
            4 => Self::Prepared,
            5 => Self::SchemaChange,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    /// Rows-result metadata flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RowsFlags: u32 {
        const GLOBAL_TABLES_SPEC   = 0x0001;
        const HAS_MORE_PAGES       = 0x0002;
        const NO_METADATA          = 0x0004;
        const METADATA_CHANGED     = 0x0008;
        const CONTINUOUS_PAGING    = 0x4000_0000;
        const LAST_CONTINUOUS_PAGE = 0x8000_0000;
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ServerError = 0x0000,
    ProtocolError = 0x000A,
    BadCredentials = 0x0100,
    Unavailable = 0x1000,
    Overloaded = 0x1001,
    IsBootstrapping = 0x1002,
    TruncateError = 0x1003,
    WriteTimeout = 0x1100,
    ReadTimeout = 0x1200,
    ReadFailure = 0x1300,
    FunctionFailure = 0x1400,
    WriteFailure = 0x1500,
    SyntaxError = 0x2000,
    Unauthorized = 0x2100,
    Invalid = 0x2200,
    ConfigError = 0x2300,
    AlreadyExists = 0x2400,
    Unprepared = 0x2500,
}

impl ErrorCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x0000 => Self::ServerError,
            0x000A => Self::ProtocolError,
            0x0100 => Self::BadCredentials,
            0x1000 => Self::Unavailable,
            0x1001 => Self::Overloaded,
            0x1002 => Self::IsBootstrapping,
            0x1003 => Self::TruncateError,
            0x1100 => Self::WriteTimeout,
            0x1200 => Self::ReadTimeout,
            0x1300 => Self::ReadFailure,
            0x1400 => Self::FunctionFailure,
            0x1500 => Self::WriteFailure,
            0x2000 => Self::SyntaxError,
            0x2100 => Self::Unauthorized,
            0x2200 => Self::Invalid,
            0x2300 => Self::ConfigError,
            0x2400 => Self::AlreadyExists,
            0x2500 => Self::Unprepared,
            _ => return None,
        })
    }

    /// Fixed human-readable template per code, filled in with the
    /// server-supplied detail fields. Deliberately not a bit-exact
    /// reproduction of any particular server's error strings.
    pub fn template(self) -> &'static str {
        match self {
            Self::ServerError => "unexpected error on the server",
            Self::ProtocolError => "a client message triggered a protocol violation",
            Self::BadCredentials => "authentication failed",
            Self::Unavailable => "not enough replicas are alive to achieve the requested consistency level",
            Self::Overloaded => "the request was rejected because the coordinator is overloaded",
            Self::IsBootstrapping => "the coordinator node is bootstrapping",
            Self::TruncateError => "truncation failed",
            Self::WriteTimeout => "timeout waiting for a write to achieve the requested consistency level",
            Self::ReadTimeout => "timeout waiting for a read to achieve the requested consistency level",
            Self::ReadFailure => "a non-timeout error occurred while waiting for a read",
            Self::FunctionFailure => "a user-defined function failed during execution",
            Self::WriteFailure => "a non-timeout error occurred while waiting for a write",
            Self::SyntaxError => "the query has a syntax error",
            Self::Unauthorized => "the request lacks permission for the operation",
            Self::Invalid => "the query is syntactically valid but semantically incorrect",
            Self::ConfigError => "the query is invalid due to a configuration issue",
            Self::AlreadyExists => "the schema object already exists",
            Self::Unprepared => "the execute referenced a statement the coordinator doesn't know",
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Consistency {
    Any = 0x0000,
    #[default]
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    Serial = 0x0008,
    LocalSerial = 0x0009,
    LocalOne = 0x000A,
}

impl Consistency {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x0000 => Self::Any,
            0x0001 => Self::One,
            0x0002 => Self::Two,
            0x0003 => Self::Three,
            0x0004 => Self::Quorum,
            0x0005 => Self::All,
            0x0006 => Self::LocalQuorum,
            0x0007 => Self::EachQuorum,
            0x0008 => Self::Serial,
            0x0009 => Self::LocalSerial,
            0x000A => Self::LocalOne,
            _ => return None,
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteType {
    Simple,
    Batch,
    UnloggedBatch,
    Counter,
    BatchLog,
    Cas,
    View,
    Cdc,
    Other(String),
}

impl WriteType {
    pub fn parse(s: &str) -> Self {
        match s {
            "SIMPLE" => Self::Simple,
            "BATCH" => Self::Batch,
            "UNLOGGED_BATCH" => Self::UnloggedBatch,
            "COUNTER" => Self::Counter,
            "BATCH_LOG" => Self::BatchLog,
            "CAS" => Self::Cas,
            "VIEW" => Self::View,
            "CDC" => Self::Cdc,
            other => Self::Other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_version_header_widths_match_spec() {
        assert_eq!(ProtocolVersion::V1.header_len(), 8);
        assert_eq!(ProtocolVersion::V2.header_len(), 8);
        assert_eq!(ProtocolVersion::V3.header_len(), 9);
        assert_eq!(ProtocolVersion::V4.header_len(), 9);
        assert_eq!(ProtocolVersion::V5.header_len(), 9);

        assert_eq!(ProtocolVersion::V2.stream_id_len(), 1);
        assert_eq!(ProtocolVersion::V4.stream_id_len(), 2);

        assert_eq!(ProtocolVersion::V2.max_stream_ids(), 128);
        assert_eq!(ProtocolVersion::V4.max_stream_ids(), 32768);
    }

    #[test]
    fn opcode_round_trips_every_known_byte() {
        let known = [
            Opcode::Error,
            Opcode::Startup,
            Opcode::Ready,
            Opcode::Authenticate,
            Opcode::Options,
            Opcode::Supported,
            Opcode::Query,
            Opcode::Result,
            Opcode::Prepare,
            Opcode::Execute,
            Opcode::Register,
            Opcode::Event,
            Opcode::Batch,
            Opcode::AuthChallenge,
            Opcode::AuthResponse,
            Opcode::AuthSuccess,
        ];
        for op in known {
            assert_eq!(Opcode::from_u8(op as u8), Some(op));
        }
        assert_eq!(Opcode::from_u8(0x04), None); // reserved, never allocated
    }

    #[test]
    fn write_type_parse_falls_back_to_other_for_unknown_strings() {
        assert_eq!(WriteType::parse("BATCH"), WriteType::Batch);
        assert_eq!(WriteType::parse("CDC"), WriteType::Cdc);
        assert_eq!(WriteType::parse("VECTOR"), WriteType::Other("VECTOR".to_owned()));
    }

    #[test]
    fn consistency_round_trips_every_known_code() {
        let known = [
            Consistency::Any,
            Consistency::One,
            Consistency::Two,
            Consistency::Three,
            Consistency::Quorum,
            Consistency::All,
            Consistency::LocalQuorum,
            Consistency::EachQuorum,
            Consistency::Serial,
            Consistency::LocalSerial,
            Consistency::LocalOne,
        ];
        for cl in known {
            assert_eq!(Consistency::from_u16(cl.as_u16()), Some(cl));
        }
    }
}
