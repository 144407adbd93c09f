//! Shared helpers for the replication suite

#![allow(dead_code)]

use replicore::{EventWriter, FormatDescription, Row, ServerContext, ReplicationConfig, Value, WsFlags};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

/// Route `replicore::*` events to the test harness output once per binary
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// Server on an empty engine with table `t`
pub fn server(config: ReplicationConfig) -> Arc<ServerContext> {
    init_tracing();
    let server = ServerContext::in_memory(config).unwrap();
    server.engine().create_table("t", false).unwrap();
    server
}

pub fn row(id: i64, v: &str) -> Row {
    vec![Value::Int(id), Value::Text(v.to_string())]
}

/// Format description followed by one insert per row
pub fn inserts(rows: &[(i64, &str)]) -> Vec<u8> {
    let mut writer = EventWriter::new(7);
    writer.format_description(FormatDescription::v4());
    for (id, v) in rows {
        writer.write_rows("t", vec![row(*id, v)]);
    }
    writer.finish()
}

pub fn single() -> WsFlags {
    WsFlags::START_TRANSACTION | WsFlags::COMMIT
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
