//! 🧬 Record Encoder - turns an [`InstalledAppRecord`] into the bytes the store keeps.
//!
//! The wire format is the `UserApps` protobuf message, proto2 flavour:
//!
//! ```text
//! message UserApps {
//!     repeated uint32 apps = 1;   // unpacked, one tag per app
//!     optional double lat = 2;
//!     optional double lon = 3;
//! }
//! ```
//!
//! 🌍 Missing coordinates are simply not written, so a reader sees "no lat"
//! rather than a fake 0.0 that puts the phone in the Gulf of Guinea.
//! The message is derived by hand with `prost` because a build.rs for three
//! fields would be the tail wagging the dog.

use anyhow::{Context, Result, ensure};
use prost::Message;
use tracing::info;

use crate::common::InstalledAppRecord;
use crate::parser;

// 🧪 two lines straight out of a real log, used by the self-check
const SELF_CHECK_SAMPLE: &str = "idfa\t1rfw452y52g2gq4g\t55.55\t42.42\t1423,43,567,3,7,23\n\
                                 gaid\t7rfw452y52g2gq4g\t55.55\t42.42\t7423,424";

/// 📱 The stored value for one device.
#[derive(Clone, PartialEq, Message)]
pub(crate) struct UserApps {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub apps: Vec<u32>,
    #[prost(double, optional, tag = "2")]
    pub lat: Option<f64>,
    #[prost(double, optional, tag = "3")]
    pub lon: Option<f64>,
}

impl From<&InstalledAppRecord> for UserApps {
    fn from(record: &InstalledAppRecord) -> Self {
        Self {
            apps: record.apps.clone(),
            lat: record.latitude,
            lon: record.longitude,
        }
    }
}

/// 📦 Record → bytes. Infallible: a `Vec` always has room for our ambitions.
pub(crate) fn encode(record: &InstalledAppRecord) -> Vec<u8> {
    UserApps::from(record).encode_to_vec()
}

/// 🔓 Bytes → `UserApps`. Used by dry runs to log what *would* have been written.
pub(crate) fn decode(payload: &[u8]) -> Result<UserApps> {
    UserApps::decode(payload).context("💀 The payload is not a UserApps message. Somebody fed us a mystery blob.")
}

/// 🩺 Parse, encode and decode a couple of known lines and make sure nothing
/// got lost on the way. Returns how many records made the round trip.
pub fn self_check() -> Result<usize> {
    let mut checked = 0;
    for line in SELF_CHECK_SAMPLE.lines() {
        let record = parser::parse(line).context(format!("💀 Self-check sample did not parse: `{line}`"))?;
        let expected = UserApps::from(&record);
        let decoded = decode(&encode(&record))?;
        ensure!(
            decoded == expected,
            "💀 Self-check round trip changed {}: wrote {:?}, read back {:?}",
            record.store_key(),
            expected,
            decoded
        );
        info!("🩺 {} survives the round trip ({} apps)", record.store_key(), decoded.apps.len());
        checked += 1;
    }
    Ok(checked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(apps: Vec<u32>, latitude: Option<f64>, longitude: Option<f64>) -> InstalledAppRecord {
        InstalledAppRecord {
            device_type: "idfa".into(),
            device_id: "1rfw452y52g2gq4g".into(),
            latitude,
            longitude,
            apps,
        }
    }

    #[test]
    fn the_one_where_decode_gives_back_what_encode_took() {
        let original = record(vec![1423, 43, 567, 3, 7, 23], Some(55.55), Some(42.42));
        let decoded = decode(&encode(&original)).expect("💀 our own bytes should decode");

        assert_eq!(decoded.apps, original.apps);
        assert_eq!(decoded.lat, Some(55.55));
        assert_eq!(decoded.lon, Some(42.42));
    }

    #[test]
    fn the_one_where_missing_geo_stays_missing() {
        let decoded = decode(&encode(&record(vec![7423, 424], None, None)))
            .expect("💀 geo-less records still decode");
        assert_eq!(decoded.lat, None);
        assert_eq!(decoded.lon, None);
        assert_eq!(decoded.apps, vec![7423, 424]);
    }

    #[test]
    fn the_one_where_apps_are_written_unpacked() {
        // -- 🔬 field 1, varint wire type → key byte 0x08, once per app
        let bytes = encode(&record(vec![1, 2, 300], None, None));
        assert_eq!(bytes, vec![0x08, 0x01, 0x08, 0x02, 0x08, 0xAC, 0x02]);
    }

    #[test]
    fn the_one_where_the_self_check_checks_out() {
        assert_eq!(self_check().expect("💀 the sample should round-trip"), 2);
    }

    #[test]
    fn the_one_where_garbage_does_not_decode() {
        assert!(decode(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
