use std::time::SystemTime;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Current UTC time as an RFC 3339 timestamp.
pub fn now_iso8601() -> String {
    format_iso8601(OffsetDateTime::now_utc())
}

pub fn format_iso8601(value: OffsetDateTime) -> String {
    value
        .format(&Rfc3339)
        .unwrap_or_else(|_| value.unix_timestamp().to_string())
}

pub fn parse_iso8601(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value.trim(), &Rfc3339).ok()
}

pub fn system_time_to_offset(value: SystemTime) -> OffsetDateTime {
    OffsetDateTime::from(value)
}

/// Seconds since the Unix epoch with sub-second precision.
pub fn now_epoch_secs() -> f64 {
    epoch_secs(SystemTime::now())
}

pub fn epoch_secs(value: SystemTime) -> f64 {
    match value.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        Err(before) => -before.duration().as_secs_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso8601_round_trips() {
        let now = OffsetDateTime::now_utc();
        let parsed = parse_iso8601(&format_iso8601(now)).unwrap();
        assert_eq!(parsed, now);
    }

    #[test]
    fn malformed_timestamp_is_rejected() {
        assert!(parse_iso8601("yesterday").is_none());
        assert!(parse_iso8601("").is_none());
    }

    #[test]
    fn epoch_secs_is_positive() {
        assert!(now_epoch_secs() > 1_600_000_000.0);
    }
}
