//! Property tests for the event decoder
//!
//! 1. **Exact consumption** - decoding a well formed payload event by event
//!    consumes every byte and nothing more
//! 2. **Stop on first bad event** - a corrupted event ends decoding; the
//!    bytes behind it are never looked at
//! 3. **No panics** - arbitrary input yields `Ok` or `MalformedEvent`

use proptest::prelude::*;
use replicore_core::{
    decode_next, ChecksumAlg, EventBody, EventWriter, FormatDescription, ReplicationError, Value,
};

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Int),
        "[a-z]{0,12}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
    ]
}

fn row_strategy() -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec(value_strategy(), 1..5)
}

fn payload_strategy() -> impl Strategy<Value = (bool, Vec<Vec<Vec<Value>>>)> {
    (
        any::<bool>(),
        prop::collection::vec(prop::collection::vec(row_strategy(), 0..4), 1..6),
    )
}

fn build(checksum: bool, batches: &[Vec<Vec<Value>>]) -> Vec<u8> {
    let mut fd = FormatDescription::v4();
    if checksum {
        fd = fd.with_checksum(ChecksumAlg::Crc32);
    }
    let mut writer = EventWriter::new(1).with_timestamp(42);
    writer.format_description(fd);
    for rows in batches {
        writer.write_rows("t", rows.clone());
    }
    writer.xid(1);
    writer.finish()
}

/// Decode until exhausted, returning (events decoded, bytes consumed)
fn drain(buf: &[u8]) -> Result<(usize, usize), (ReplicationError, usize)> {
    let mut format = FormatDescription::v4();
    let mut offset = 0;
    let mut count = 0;
    while offset < buf.len() {
        match decode_next(&buf[offset..], &format) {
            Ok((event, consumed)) => {
                if let EventBody::FormatDescription(fd) = event.body {
                    format = fd;
                }
                offset += consumed;
                count += 1;
            }
            Err(e) => return Err((e, offset)),
        }
    }
    Ok((count, offset))
}

proptest! {
    #[test]
    fn full_decode_consumes_exactly_the_buffer((checksum, batches) in payload_strategy()) {
        let buf = build(checksum, &batches);
        let (count, consumed) = drain(&buf).unwrap();
        prop_assert_eq!(consumed, buf.len());
        prop_assert_eq!(count, batches.len() + 2);
    }

    #[test]
    fn bad_event_stops_decoding(
        (checksum, batches) in payload_strategy(),
        trailing in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut writer = EventWriter::new(1);
        writer.format_description(FormatDescription::v4());
        let prefix_len = writer.as_bytes().len();

        let mut buf = writer.finish();
        // unknown type code right after the format description
        let mut bad = vec![0u8; 19];
        bad[4] = 0xEE;
        bad[9..13].copy_from_slice(&19u32.to_le_bytes());
        buf.extend_from_slice(&bad);
        buf.extend_from_slice(&build(checksum, &batches));
        buf.extend_from_slice(&trailing);

        let (err, offset) = drain(&buf).unwrap_err();
        prop_assert_eq!(offset, prefix_len);
        let is_malformed = matches!(err, ReplicationError::MalformedEvent { type_code: Some(0xEE), .. });
        prop_assert!(is_malformed);
    }

    #[test]
    fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        match decode_next(&bytes, &FormatDescription::v4()) {
            Ok((event, consumed)) => {
                prop_assert_eq!(consumed, event.header.event_len as usize);
                prop_assert!(consumed <= bytes.len());
            }
            Err(e) => {
                let is_malformed = matches!(e, ReplicationError::MalformedEvent { .. });
                prop_assert!(is_malformed);
            }
        }
    }
}
