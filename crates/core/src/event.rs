//! Change event model
//!
//! A write-set payload is a sequence of change events. Each event has a
//! fixed common header followed by a type specific body. The wire layout
//! lives in [`crate::codec`]; this module only defines the decoded shapes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the common event header
pub const COMMON_HEADER_LEN: usize = 19;

/// Offset of the u32 event length inside the common header
pub const EVENT_LEN_OFFSET: usize = 9;

/// Offset of the u8 type code inside the common header
pub const EVENT_TYPE_OFFSET: usize = 4;

/// Header flag: changes carried by this event must not be replicated further
pub const EVENT_FLAG_SKIP_REPLICATION: u16 = 0x8000;

/// Binlog format version understood by the codec
pub const BINLOG_VERSION: u16 = 4;

/// Size of the trailing CRC-32 when checksums are enabled
pub const CHECKSUM_LEN: usize = 4;

/// Event type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventType {
    /// Schema change (create / drop table)
    Query = 2,
    /// Format description
    FormatDescription = 15,
    /// Commit marker
    Xid = 16,
    /// Row inserts
    WriteRows = 30,
    /// Row updates
    UpdateRows = 31,
    /// Row deletes
    DeleteRows = 32,
    /// Global transaction id
    Gtid = 33,
}

impl EventType {
    /// Map a raw type code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            2 => Some(EventType::Query),
            15 => Some(EventType::FormatDescription),
            16 => Some(EventType::Xid),
            30 => Some(EventType::WriteRows),
            31 => Some(EventType::UpdateRows),
            32 => Some(EventType::DeleteRows),
            33 => Some(EventType::Gtid),
            _ => None,
        }
    }

    /// Raw type code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Name used in logs and apply error messages
    pub fn name(self) -> &'static str {
        match self {
            EventType::Query => "Query",
            EventType::FormatDescription => "Format_desc",
            EventType::Xid => "Xid",
            EventType::WriteRows => "Write_rows",
            EventType::UpdateRows => "Update_rows",
            EventType::DeleteRows => "Delete_rows",
            EventType::Gtid => "Gtid",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Checksum algorithm announced by a format description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlg {
    /// No trailing checksum
    #[default]
    Off,
    /// Trailing CRC-32 over the event bytes
    Crc32,
}

impl ChecksumAlg {
    /// Raw code
    pub fn code(self) -> u8 {
        match self {
            ChecksumAlg::Off => 0,
            ChecksumAlg::Crc32 => 1,
        }
    }

    /// Map a raw code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ChecksumAlg::Off),
            1 => Some(ChecksumAlg::Crc32),
            _ => None,
        }
    }
}

/// Format description: how to parse the events that follow it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescription {
    /// Binlog version, always 4
    pub binlog_version: u16,
    /// Version string of the writer
    pub server_version: String,
    /// Creation timestamp (seconds)
    pub created: u32,
    /// Header length of subsequent events (>= 19)
    pub header_len: u8,
    /// Checksum algorithm of subsequent events
    pub checksum: ChecksumAlg,
}

impl FormatDescription {
    /// The default v4 format used before any format description is seen
    pub fn v4() -> Self {
        Self {
            binlog_version: BINLOG_VERSION,
            server_version: concat!("replicore-", env!("CARGO_PKG_VERSION")).to_string(),
            created: 0,
            header_len: COMMON_HEADER_LEN as u8,
            checksum: ChecksumAlg::Off,
        }
    }

    /// Same format with CRC-32 checksums
    pub fn with_checksum(mut self, checksum: ChecksumAlg) -> Self {
        self.checksum = checksum;
        self
    }

    /// Bytes of checksum trailing every event
    pub fn checksum_len(&self) -> usize {
        match self.checksum {
            ChecksumAlg::Off => 0,
            ChecksumAlg::Crc32 => CHECKSUM_LEN,
        }
    }
}

impl Default for FormatDescription {
    fn default() -> Self {
        Self::v4()
    }
}

/// Column value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Signed integer
    Int(i64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "'{}'", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// A table row; the first column is the primary key
pub type Row = Vec<Value>;

/// Schema change carried by a Query event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    /// Create a table
    CreateTable {
        /// Table name
        table: String,
        /// Succeed silently if the table exists
        if_not_exists: bool,
    },
    /// Drop a table
    DropTable {
        /// Table name
        table: String,
        /// Succeed silently if the table is missing
        if_exists: bool,
    },
}

/// Common event header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventHeader {
    /// Seconds since the epoch, 0 when the writer had no clock
    pub timestamp: u32,
    /// Raw type code
    pub type_code: u8,
    /// Originating server
    pub server_id: u32,
    /// Total event length including header and checksum
    pub event_len: u32,
    /// Position after this event in the writer's log
    pub log_pos: u32,
    /// Header flags
    pub flags: u16,
}

impl EventHeader {
    /// True if the skip-replication flag is set
    pub fn skip_replication(&self) -> bool {
        self.flags & EVENT_FLAG_SKIP_REPLICATION != 0
    }
}

/// Decoded event body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBody {
    /// New parse format for subsequent events
    FormatDescription(FormatDescription),
    /// Global transaction id; `gno == 0` means empty
    Gtid {
        /// Source id
        sid: [u8; 16],
        /// Group number
        gno: u64,
    },
    /// Commit marker
    Xid {
        /// Transaction id in the writer's log
        xid: u64,
    },
    /// Schema change
    Query(SchemaChange),
    /// Inserted rows
    WriteRows {
        /// Target table
        table: String,
        /// Rows to insert
        rows: Vec<Row>,
    },
    /// Updated rows as (before, after) images
    UpdateRows {
        /// Target table
        table: String,
        /// Row images
        rows: Vec<(Row, Row)>,
    },
    /// Deleted rows
    DeleteRows {
        /// Target table
        table: String,
        /// Rows to delete
        rows: Vec<Row>,
    },
}

impl EventBody {
    /// Event type of this body
    pub fn event_type(&self) -> EventType {
        match self {
            EventBody::FormatDescription(_) => EventType::FormatDescription,
            EventBody::Gtid { .. } => EventType::Gtid,
            EventBody::Xid { .. } => EventType::Xid,
            EventBody::Query(_) => EventType::Query,
            EventBody::WriteRows { .. } => EventType::WriteRows,
            EventBody::UpdateRows { .. } => EventType::UpdateRows,
            EventBody::DeleteRows { .. } => EventType::DeleteRows,
        }
    }
}

/// A decoded change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Common header
    pub header: EventHeader,
    /// Body
    pub body: EventBody,
}

impl Event {
    /// Event type
    pub fn event_type(&self) -> EventType {
        self.body.event_type()
    }
}
