//! Lenient (de)serializers for payloads produced by heterogeneous services.
//!
//! Ids may arrive as JSON numbers or numeric strings. Timestamps may arrive
//! as RFC 3339, as naive ISO-8601 (taken as UTC) or as epoch seconds.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(i64),
    Text(String),
}

fn id_from_raw<E: serde::de::Error>(raw: RawId) -> Result<i64, E> {
    match raw {
        RawId::Number(n) => Ok(n),
        RawId::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| E::custom(format!("invalid numeric id: {s}"))),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Seconds(i64),
    Fractional(f64),
    Text(String),
}

/// Parse a timestamp string in any of the accepted textual formats.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn timestamp_from_raw<E: serde::de::Error>(raw: RawTimestamp) -> Result<DateTime<Utc>, E> {
    match raw {
        RawTimestamp::Seconds(secs) => Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| E::custom(format!("timestamp out of range: {secs}"))),
        RawTimestamp::Fractional(secs) => {
            let millis = (secs * 1000.0) as i64;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| E::custom(format!("timestamp out of range: {secs}")))
        }
        RawTimestamp::Text(s) => {
            parse_timestamp(&s).ok_or_else(|| E::custom(format!("invalid timestamp: {s}")))
        }
    }
}

pub mod flexible_id {
    use super::*;

    pub fn serialize<S: Serializer>(id: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(*id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        id_from_raw(RawId::deserialize(deserializer)?)
    }
}

pub mod optional_flexible_id {
    use super::*;

    pub fn serialize<S: Serializer>(id: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
        match id {
            Some(id) => serializer.serialize_some(id),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<i64>, D::Error> {
        Option::<RawId>::deserialize(deserializer)?
            .map(id_from_raw)
            .transpose()
    }
}

pub mod flexible_datetime {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        timestamp_from_raw(RawTimestamp::deserialize(deserializer)?)
    }
}

pub mod optional_flexible_datetime {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => serializer.serialize_some(&dt.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Option::<RawTimestamp>::deserialize(deserializer)?
            .map(timestamp_from_raw)
            .transpose()
    }
}
