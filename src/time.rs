use chrono::{DateTime, SecondsFormat, Utc};

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Render a timestamp the way it is stored in `meta` and sent as `updatedSince`.
pub fn to_wire(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn from_wire(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_reasonable() {
        let a = now_ms();
        assert!(a > 1_500_000_000_000); // after 2017
        assert!(a < 4_100_000_000_000); // before year ~2100
    }

    #[test]
    fn wire_format_roundtrips_to_the_millisecond() {
        let ts = DateTime::<Utc>::from_timestamp_millis(1_760_000_000_123).unwrap();
        let rendered = to_wire(&ts);
        assert_eq!(rendered, "2025-10-09T08:53:20.123Z");
        assert_eq!(from_wire(&rendered), Some(ts));
    }

    #[test]
    fn from_wire_rejects_garbage() {
        assert!(from_wire("yesterday").is_none());
    }
}
