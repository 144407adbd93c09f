//! Event wire codec
//!
//! # Format
//!
//! ```text
//! Event Layout (little endian):
//! ┌───────────────┬──────────┬────────────────┬────────────────┬──────────────┬────────────┐
//! │ timestamp u32 │ type u8  │ server_id u32  │ event_len u32  │ log_pos u32  │ flags u16  │
//! └───────────────┴──────────┴────────────────┴────────────────┴──────────────┴────────────┘
//! │ extra header bytes (header_len - 19) │ body │ CRC-32 u32 (if enabled) │
//! ```
//!
//! `event_len` covers the whole event including header and checksum. The
//! decoder consumes exactly `event_len` bytes per call. A format description
//! event always uses the 19 byte common header; its checksum algorithm byte
//! sits at a fixed body offset so the decoder knows whether the format
//! description itself carries a CRC.
//!
//! Body layouts:
//!
//! ```text
//! FormatDescription: version u16 | checksum u8 | header_len u8 | created u32 | server_version (u8 len + bytes)
//! Gtid:              sid [16] | gno u64
//! Xid:               xid u64
//! Query:             op u8 (1 create, 2 drop) | if_[not_]exists u8 | table (u16 len + bytes)
//! Write/DeleteRows:  table (u16 len + bytes) | count u32 | rows
//! UpdateRows:        table (u16 len + bytes) | count u32 | (before row, after row) pairs
//! Row:               columns u16 | values
//! Value:             tag u8 (0 null, 1 i64, 2 text, 3 bytes) | payload (u32 len for text/bytes)
//! ```

use crate::error::{ReplicationError, Result};
use crate::event::{
    ChecksumAlg, Event, EventBody, EventHeader, EventType, FormatDescription, Row, SchemaChange,
    Value, CHECKSUM_LEN, COMMON_HEADER_LEN, EVENT_FLAG_SKIP_REPLICATION, EVENT_LEN_OFFSET,
    EVENT_TYPE_OFFSET,
};
use byteorder::{ByteOrder, LittleEndian};

const VALUE_NULL: u8 = 0;
const VALUE_INT: u8 = 1;
const VALUE_TEXT: u8 = 2;
const VALUE_BYTES: u8 = 3;

const QUERY_CREATE_TABLE: u8 = 1;
const QUERY_DROP_TABLE: u8 = 2;

/// Offset of the checksum byte inside a format description body
const FDE_CHECKSUM_OFFSET: usize = 2;

// ============================================================================
// Decoding
// ============================================================================

/// Decode the next event from `buf` using the active format
///
/// Returns the event and the number of bytes consumed, which always equals
/// the length declared in the event header.
pub fn decode_next(buf: &[u8], format: &FormatDescription) -> Result<(Event, usize)> {
    let data_len = buf.len();
    if data_len < COMMON_HEADER_LEN {
        return Err(ReplicationError::malformed(
            "truncated event header",
            data_len,
            buf.get(EVENT_TYPE_OFFSET).copied(),
        ));
    }

    let type_code = buf[EVENT_TYPE_OFFSET];
    let header = EventHeader {
        timestamp: LittleEndian::read_u32(&buf[0..4]),
        type_code,
        server_id: LittleEndian::read_u32(&buf[5..9]),
        event_len: LittleEndian::read_u32(&buf[EVENT_LEN_OFFSET..EVENT_LEN_OFFSET + 4]),
        log_pos: LittleEndian::read_u32(&buf[13..17]),
        flags: LittleEndian::read_u16(&buf[17..19]),
    };
    let event_len = header.event_len as usize;
    // past the common header errors carry the declared length
    let malformed = |reason: &str| ReplicationError::malformed(reason, event_len, Some(type_code));

    let event_type =
        EventType::from_code(type_code).ok_or_else(|| malformed("unknown event type"))?;

    if event_len > data_len {
        return Err(malformed("declared length exceeds buffer"));
    }

    let (header_len, checksum) = if event_type == EventType::FormatDescription {
        let alg_pos = COMMON_HEADER_LEN + FDE_CHECKSUM_OFFSET;
        if event_len <= alg_pos {
            return Err(malformed("truncated body"));
        }
        let alg = ChecksumAlg::from_code(buf[alg_pos])
            .ok_or_else(|| malformed("unknown checksum algorithm"))?;
        (COMMON_HEADER_LEN, alg)
    } else {
        (format.header_len as usize, format.checksum)
    };
    let checksum_len = match checksum {
        ChecksumAlg::Off => 0,
        ChecksumAlg::Crc32 => CHECKSUM_LEN,
    };

    if event_len < header_len + checksum_len {
        return Err(malformed("declared length shorter than header"));
    }

    let event = &buf[..event_len];
    if checksum == ChecksumAlg::Crc32 {
        let split = event_len - CHECKSUM_LEN;
        let stored = LittleEndian::read_u32(&event[split..]);
        let computed = crc32fast::hash(&event[..split]);
        if stored != computed {
            return Err(malformed("checksum mismatch"));
        }
    }

    let mut reader = BodyReader {
        bytes: &event[header_len..event_len - checksum_len],
        pos: 0,
        data_len: event_len,
        type_code,
    };
    let body = match event_type {
        EventType::FormatDescription => reader.format_description()?,
        EventType::Gtid => {
            let mut sid = [0u8; 16];
            sid.copy_from_slice(reader.take(16)?);
            let gno = reader.u64()?;
            EventBody::Gtid { sid, gno }
        }
        EventType::Xid => EventBody::Xid { xid: reader.u64()? },
        EventType::Query => reader.query()?,
        EventType::WriteRows => {
            let table = reader.table()?;
            let rows = reader.rows()?;
            EventBody::WriteRows { table, rows }
        }
        EventType::DeleteRows => {
            let table = reader.table()?;
            let rows = reader.rows()?;
            EventBody::DeleteRows { table, rows }
        }
        EventType::UpdateRows => {
            let table = reader.table()?;
            let count = reader.u32()? as usize;
            let mut rows = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let before = reader.row()?;
                let after = reader.row()?;
                rows.push((before, after));
            }
            EventBody::UpdateRows { table, rows }
        }
    };
    reader.finish()?;

    Ok((Event { header, body }, event_len))
}

/// Cursor over one event body
struct BodyReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    data_len: usize,
    type_code: u8,
}

impl<'a> BodyReader<'a> {
    fn error(&self, reason: &str) -> ReplicationError {
        ReplicationError::malformed(reason, self.data_len, Some(self.type_code))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() - self.pos < n {
            return Err(self.error("truncated body"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn utf8(&mut self, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| self.error("invalid utf-8"))
    }

    fn table(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        self.utf8(len)
    }

    fn value(&mut self) -> Result<Value> {
        match self.u8()? {
            VALUE_NULL => Ok(Value::Null),
            VALUE_INT => Ok(Value::Int(LittleEndian::read_i64(self.take(8)?))),
            VALUE_TEXT => {
                let len = self.u32()? as usize;
                Ok(Value::Text(self.utf8(len)?))
            }
            VALUE_BYTES => {
                let len = self.u32()? as usize;
                Ok(Value::Bytes(self.take(len)?.to_vec()))
            }
            _ => Err(self.error("unknown value tag")),
        }
    }

    fn row(&mut self) -> Result<Row> {
        let columns = self.u16()? as usize;
        let mut row = Vec::with_capacity(columns);
        for _ in 0..columns {
            row.push(self.value()?);
        }
        Ok(row)
    }

    fn rows(&mut self) -> Result<Vec<Row>> {
        let count = self.u32()? as usize;
        let mut rows = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            rows.push(self.row()?);
        }
        Ok(rows)
    }

    fn query(&mut self) -> Result<EventBody> {
        let op = self.u8()?;
        let conditional = self.u8()? != 0;
        let table = self.table()?;
        let change = match op {
            QUERY_CREATE_TABLE => SchemaChange::CreateTable {
                table,
                if_not_exists: conditional,
            },
            QUERY_DROP_TABLE => SchemaChange::DropTable {
                table,
                if_exists: conditional,
            },
            _ => return Err(self.error("unknown schema change")),
        };
        Ok(EventBody::Query(change))
    }

    fn format_description(&mut self) -> Result<EventBody> {
        let binlog_version = self.u16()?;
        let checksum = ChecksumAlg::from_code(self.u8()?)
            .ok_or_else(|| self.error("unknown checksum algorithm"))?;
        let header_len = self.u8()?;
        let created = self.u32()?;
        let len = self.u8()? as usize;
        let server_version = self.utf8(len)?;

        if binlog_version != crate::event::BINLOG_VERSION {
            return Err(self.error("unsupported binlog version"));
        }
        if (header_len as usize) < COMMON_HEADER_LEN {
            return Err(self.error("header length below common header"));
        }

        Ok(EventBody::FormatDescription(FormatDescription {
            binlog_version,
            server_version,
            created,
            header_len,
            checksum,
        }))
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.bytes.len() {
            return Err(self.error("trailing bytes in body"));
        }
        Ok(())
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Serialize one event with the given format
///
/// `header.event_len` and `header.type_code` are computed; the other header
/// fields are taken as given. A format description's `server_version` is
/// written with a one byte length, so anything past 255 bytes is cut off.
pub fn encode_event(header: &EventHeader, body: &EventBody, format: &FormatDescription) -> Vec<u8> {
    let (header_len, checksum) = match body {
        EventBody::FormatDescription(fd) => (COMMON_HEADER_LEN, fd.checksum),
        _ => (format.header_len as usize, format.checksum),
    };

    let mut payload = Vec::new();
    write_body(&mut payload, body);

    let checksum_len = match checksum {
        ChecksumAlg::Off => 0,
        ChecksumAlg::Crc32 => CHECKSUM_LEN,
    };
    let event_len = header_len + payload.len() + checksum_len;

    let mut bytes = Vec::with_capacity(event_len);
    bytes.extend_from_slice(&header.timestamp.to_le_bytes());
    bytes.push(body.event_type().code());
    bytes.extend_from_slice(&header.server_id.to_le_bytes());
    bytes.extend_from_slice(&(event_len as u32).to_le_bytes());
    bytes.extend_from_slice(&header.log_pos.to_le_bytes());
    bytes.extend_from_slice(&header.flags.to_le_bytes());
    bytes.resize(header_len, 0);
    bytes.extend_from_slice(&payload);

    if checksum == ChecksumAlg::Crc32 {
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
    }
    bytes
}

fn write_body(bytes: &mut Vec<u8>, body: &EventBody) {
    match body {
        EventBody::FormatDescription(fd) => {
            bytes.extend_from_slice(&fd.binlog_version.to_le_bytes());
            bytes.push(fd.checksum.code());
            bytes.push(fd.header_len);
            bytes.extend_from_slice(&fd.created.to_le_bytes());
            let version = fd.server_version.as_bytes();
            let len = version.len().min(u8::MAX as usize);
            bytes.push(len as u8);
            bytes.extend_from_slice(&version[..len]);
        }
        EventBody::Gtid { sid, gno } => {
            bytes.extend_from_slice(sid);
            bytes.extend_from_slice(&gno.to_le_bytes());
        }
        EventBody::Xid { xid } => bytes.extend_from_slice(&xid.to_le_bytes()),
        EventBody::Query(change) => match change {
            SchemaChange::CreateTable {
                table,
                if_not_exists,
            } => {
                bytes.push(QUERY_CREATE_TABLE);
                bytes.push(*if_not_exists as u8);
                write_table(bytes, table);
            }
            SchemaChange::DropTable { table, if_exists } => {
                bytes.push(QUERY_DROP_TABLE);
                bytes.push(*if_exists as u8);
                write_table(bytes, table);
            }
        },
        EventBody::WriteRows { table, rows } | EventBody::DeleteRows { table, rows } => {
            write_table(bytes, table);
            bytes.extend_from_slice(&(rows.len() as u32).to_le_bytes());
            for row in rows {
                write_row(bytes, row);
            }
        }
        EventBody::UpdateRows { table, rows } => {
            write_table(bytes, table);
            bytes.extend_from_slice(&(rows.len() as u32).to_le_bytes());
            for (before, after) in rows {
                write_row(bytes, before);
                write_row(bytes, after);
            }
        }
    }
}

fn write_table(bytes: &mut Vec<u8>, table: &str) {
    bytes.extend_from_slice(&(table.len() as u16).to_le_bytes());
    bytes.extend_from_slice(table.as_bytes());
}

fn write_row(bytes: &mut Vec<u8>, row: &Row) {
    bytes.extend_from_slice(&(row.len() as u16).to_le_bytes());
    for value in row {
        match value {
            Value::Null => bytes.push(VALUE_NULL),
            Value::Int(v) => {
                bytes.push(VALUE_INT);
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            Value::Text(s) => {
                bytes.push(VALUE_TEXT);
                bytes.extend_from_slice(&(s.len() as u32).to_le_bytes());
                bytes.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                bytes.push(VALUE_BYTES);
                bytes.extend_from_slice(&(b.len() as u32).to_le_bytes());
                bytes.extend_from_slice(b);
            }
        }
    }
}

/// Builds write-set payloads event by event
///
/// A format description pushed through the writer switches the format used
/// for the events after it, matching what the decoder does.
#[derive(Debug, Clone)]
pub struct EventWriter {
    format: FormatDescription,
    server_id: u32,
    timestamp: u32,
    flags: u16,
    bytes: Vec<u8>,
}

impl EventWriter {
    /// Writer for events originating on `server_id`, stamped with the current time
    pub fn new(server_id: u32) -> Self {
        Self {
            format: FormatDescription::v4(),
            server_id,
            timestamp: chrono::Utc::now().timestamp().max(0) as u32,
            flags: 0,
            bytes: Vec::new(),
        }
    }

    /// Override the event timestamp (0 = no timestamp)
    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Toggle the skip-replication flag for subsequent events
    pub fn skip_replication(&mut self, skip: bool) -> &mut Self {
        if skip {
            self.flags |= EVENT_FLAG_SKIP_REPLICATION;
        } else {
            self.flags &= !EVENT_FLAG_SKIP_REPLICATION;
        }
        self
    }

    /// Append any event body
    pub fn push(&mut self, body: EventBody) -> &mut Self {
        let mut header = EventHeader {
            timestamp: self.timestamp,
            server_id: self.server_id,
            flags: self.flags,
            ..EventHeader::default()
        };
        let probe = encode_event(&header, &body, &self.format);
        header.log_pos = (self.bytes.len() + probe.len()) as u32;
        let encoded = encode_event(&header, &body, &self.format);
        self.bytes.extend_from_slice(&encoded);

        if let EventBody::FormatDescription(fd) = body {
            self.format = fd;
        }
        self
    }

    /// Append a format description and switch to it
    pub fn format_description(&mut self, fd: FormatDescription) -> &mut Self {
        self.push(EventBody::FormatDescription(fd))
    }

    /// Append a GTID event
    pub fn gtid(&mut self, sid: [u8; 16], gno: u64) -> &mut Self {
        self.push(EventBody::Gtid { sid, gno })
    }

    /// Append a commit marker
    pub fn xid(&mut self, xid: u64) -> &mut Self {
        self.push(EventBody::Xid { xid })
    }

    /// Append a create table
    pub fn create_table(&mut self, table: &str) -> &mut Self {
        self.push(EventBody::Query(SchemaChange::CreateTable {
            table: table.to_string(),
            if_not_exists: false,
        }))
    }

    /// Append a drop table
    pub fn drop_table(&mut self, table: &str) -> &mut Self {
        self.push(EventBody::Query(SchemaChange::DropTable {
            table: table.to_string(),
            if_exists: false,
        }))
    }

    /// Append inserted rows
    pub fn write_rows(&mut self, table: &str, rows: Vec<Row>) -> &mut Self {
        self.push(EventBody::WriteRows {
            table: table.to_string(),
            rows,
        })
    }

    /// Append updated rows
    pub fn update_rows(&mut self, table: &str, rows: Vec<(Row, Row)>) -> &mut Self {
        self.push(EventBody::UpdateRows {
            table: table.to_string(),
            rows,
        })
    }

    /// Append deleted rows
    pub fn delete_rows(&mut self, table: &str, rows: Vec<Row>) -> &mut Self {
        self.push(EventBody::DeleteRows {
            table: table.to_string(),
            rows,
        })
    }

    /// Bytes written so far
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// True if nothing was written
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Finish and return the payload
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}
