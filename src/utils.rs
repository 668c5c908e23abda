//! Identifier and timestamp helpers shared across the engine.

use bech32::Bech32m;
use chrono::{DateTime, TimeZone, Timelike, Utc};
use uuid7::uuid7;

// construct a unique user-style id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Short human-facing reference such as `TRD-9F3A01C2`, built from the
/// random tail of a uuid7 so the timestamp prefix does not leak in.
pub fn short_ref(prefix: &str) -> String {
    let id = uuid7();
    let tail = &id.as_bytes()[8..12];
    format!("{}-{}", prefix, hex::encode(tail).to_uppercase())
}

/// UTC timestamp newtype carrying the CBOR encoding used by every
/// persisted record (i64 nanoseconds since the epoch).
#[derive(Debug, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// equality delegates to the inner DateTime; deriving it would demand
// PartialEq/Eq on the TimeZone parameter itself
impl<T: TimeZone> PartialEq for TimeStamp<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T: TimeZone> Eq for TimeStamp<T> {}

// ordering delegates to the inner DateTime; deriving it would demand
// Ord on the TimeZone parameter itself, which chrono's zones don't have
impl<T: TimeZone> PartialOrd for TimeStamp<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: TimeZone> Ord for TimeStamp<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn now() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn plus_minutes(&self, minutes: i64) -> Self {
        Self(self.0 + chrono::Duration::minutes(minutes))
    }
    /// Nanoseconds since the epoch, the scheduler's ordering key.
    pub fn nanos(&self) -> Option<i64> {
        self.0.timestamp_nanos_opt()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::now();

        let encoding = minicbor::to_vec(original.clone()).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn short_refs_are_prefixed_and_unique() {
        let a = short_ref("TRD");
        let b = short_ref("TRD");

        assert!(a.starts_with("TRD-"));
        assert_eq!(a.len(), "TRD-".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn timestamps_order_chronologically() {
        let early = TimeStamp::new_with(2026, 3, 1, 12, 0, 0);
        let late = early.plus_minutes(1);

        assert!(early < late);
        assert!(late > early);
        assert_eq!(early.cmp(&early.clone()), std::cmp::Ordering::Equal);
    }

    #[test]
    fn plus_minutes_moves_forward() {
        let now = TimeStamp::new_with(2026, 3, 1, 12, 0, 0);
        let later = now.plus_minutes(45);

        assert_eq!(later.to_datetime_utc().minute(), 45);
        assert!(later > now);
    }
}
