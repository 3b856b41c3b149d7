//! Shared identifiers and the CBOR-encodable timestamp
use std::cmp::Ordering;

use chrono::{DateTime, Duration, TimeZone, Utc};

/// bech32 encoded uuid7 with the `sanction_` prefix
pub type SanctionId = String;
pub type UserId = String;
pub type ArtifactId = String;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// A copy of this timestamp moved by `delta` (negative moves it back)
    pub fn shifted(&self, delta: Duration) -> Self {
        Self(self.0 + delta)
    }
}

// `Utc` itself has no ordering, so these cannot be derived
impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
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
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original.clone()).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn shifted_moves_both_ways() {
        let now = TimeStamp::new();
        let later = now.shifted(Duration::hours(48));
        let earlier = now.shifted(Duration::hours(-1));

        assert!(earlier < now && now < later);
        assert!(now <= now.clone());
        assert_eq!(later.cmp(&earlier), Ordering::Greater);
        assert_eq!((later.to_datetime_utc() - now.to_datetime_utc()).num_hours(), 48);
    }
}
