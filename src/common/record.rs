//! Versioned value records and their total order.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::common::Id;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A replicated value: opaque bytes stamped with the publish time and the
/// publisher's id.
///
/// The pair `(ts, publisher)` gives records a total order, which is the
/// conflict resolver between replicas: last write wins, ties broken by the
/// larger publisher id.
pub struct Record {
    /// The stored bytes, base64 in the wire encoding.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Publish time in milliseconds since the Unix epoch.
    pub ts: u64,
    /// The id of the node that authored this record, hex on the wire.
    #[serde(rename = "pub", with = "hex_id")]
    pub publisher: Id,
}

impl Record {
    pub fn new(data: Vec<u8>, ts: u64, publisher: Id) -> Record {
        Record {
            data,
            ts,
            publisher,
        }
    }

    /// Strictly-newer comparison; equal records are not newer than each
    /// other.
    pub fn is_newer_than(&self, other: &Record) -> bool {
        (self.ts, &self.publisher) > (other.ts, &other.publisher)
    }
}

/// Wall-clock milliseconds since the Unix epoch, used to stamp records.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;

        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod hex_id {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::common::Id;

    pub fn serialize<S: Serializer>(id: &Id, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Id, D::Error> {
        let encoded = String::deserialize(deserializer)?;

        encoded.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(ts: u64, publisher: Id) -> Record {
        Record::new(b"value".to_vec(), ts, publisher)
    }

    #[test]
    fn newer_by_timestamp() {
        let publisher = Id::random();

        assert!(record(200, publisher).is_newer_than(&record(100, publisher)));
        assert!(!record(100, publisher).is_newer_than(&record(200, publisher)));
    }

    #[test]
    fn timestamp_tie_broken_by_publisher() {
        let a = record(100, Id([0xaa; 32]));
        let b = record(100, Id([0xbb; 32]));

        assert!(b.is_newer_than(&a));
        assert!(!a.is_newer_than(&b));
    }

    #[test]
    fn order_is_total() {
        let a = record(100, Id([0xaa; 32]));
        let b = record(100, Id([0xbb; 32]));
        let c = record(101, Id([0x01; 32]));

        for (x, y) in [(&a, &b), (&a, &c), (&b, &c)] {
            assert_ne!(x.is_newer_than(y), y.is_newer_than(x));
        }
    }

    #[test]
    fn equal_records_are_not_newer() {
        let a = record(100, Id([0xaa; 32]));

        assert!(!a.is_newer_than(&a.clone()));
    }

    #[test]
    fn json_roundtrip() {
        let record = Record::new(vec![0, 1, 2, 255], 1234, Id([0xab; 32]));

        let encoded = serde_json::to_vec(&record).unwrap();
        let decoded: Record = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(record, decoded);
    }

    #[test]
    fn json_fields_are_text_encoded() {
        let record = Record::new(b"world".to_vec(), 7, Id([0xab; 32]));

        let json: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&record).unwrap()).unwrap();

        assert_eq!(json["data"], "d29ybGQ=");
        assert_eq!(json["ts"], 7);
        assert_eq!(json["pub"], "ab".repeat(32));
    }
}
