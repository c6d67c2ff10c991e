//! Retry bookkeeping carried in message headers.
//!
//! Brokers and client libraries re-encode numeric headers freely, so a value
//! published as a 64-bit integer may come back as any integer width or even a
//! float. [`header_to_i64`] is the single place that normalizes them.

use lapin::types::{AMQPValue, FieldTable, ShortString};

use crate::error::{BrokerError, Result};

/// Retries left before the message is dead-lettered.
pub const REMAINING_RETRIES_HEADER: &str = "x-remaining-retries";

/// Number of failed attempts so far.
pub const ATTEMPT_NUMBER_HEADER: &str = "x-attempt-number";

/// Backoff base in seconds, doubled per attempt.
pub const RETRY_DELAY_BASE_HEADER: &str = "x-retry-delay-base";

/// Normalizes a numeric header value to `i64`.
///
/// Floats are accepted only when they hold a whole number.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidHeader`] for non-numeric values, fractional
/// floats and unsigned values beyond `i64::MAX`.
pub fn header_to_i64(name: &str, value: &AMQPValue) -> Result<i64> {
    let normalized = match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::Timestamp(v) => i64::try_from(*v).ok(),
        AMQPValue::Float(v) => whole_float(f64::from(*v)),
        AMQPValue::Double(v) => whole_float(*v),
        _ => None,
    };

    normalized.ok_or_else(|| BrokerError::InvalidHeader {
        header: name.to_string(),
        found: format!("{value:?}"),
    })
}

fn whole_float(v: f64) -> Option<i64> {
    // i64::MAX is not representable as f64; 2^63 is the first value past it.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    (v.is_finite() && v.fract() == 0.0 && v >= -LIMIT && v < LIMIT).then_some(v as i64)
}

/// Reads an integer header, returning `None` when it is absent.
///
/// # Errors
///
/// Returns an error if the header is present but not an integer.
pub fn read_i64(headers: &FieldTable, name: &str) -> Result<Option<i64>> {
    headers
        .inner()
        .get(&ShortString::from(name))
        .map(|value| header_to_i64(name, value))
        .transpose()
}

/// Sets an integer header, replacing any previous value.
pub fn write_i64(headers: &mut FieldTable, name: &str, value: i64) {
    headers.insert(ShortString::from(name), AMQPValue::LongLongInt(value));
}

/// Headers the front door attaches to a freshly published message.
pub fn initial_retry_headers(retries: i64, backoff_seconds: u64) -> FieldTable {
    let mut headers = FieldTable::default();
    write_i64(&mut headers, REMAINING_RETRIES_HEADER, retries);
    write_i64(
        &mut headers,
        RETRY_DELAY_BASE_HEADER,
        i64::try_from(backoff_seconds).unwrap_or(i64::MAX),
    );
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_integer_width_normalizes() {
        let cases = [
            AMQPValue::ShortShortInt(-3),
            AMQPValue::ShortShortUInt(3),
            AMQPValue::ShortInt(3),
            AMQPValue::ShortUInt(3),
            AMQPValue::LongInt(3),
            AMQPValue::LongUInt(3),
            AMQPValue::LongLongInt(3),
            AMQPValue::Float(3.0),
            AMQPValue::Double(3.0),
        ];

        for value in &cases {
            let normalized = header_to_i64("x", value).unwrap();
            assert_eq!(normalized.abs(), 3, "value {value:?}");
        }
    }

    #[test]
    fn fractional_and_non_numeric_values_fail() {
        assert!(header_to_i64("x", &AMQPValue::Double(1.5)).is_err());
        assert!(header_to_i64("x", &AMQPValue::Double(f64::NAN)).is_err());
        assert!(header_to_i64("x", &AMQPValue::Boolean(true)).is_err());
        assert!(header_to_i64("x", &AMQPValue::Void).is_err());
    }

    #[test]
    fn absent_header_reads_as_none() {
        let headers = FieldTable::default();
        assert_eq!(read_i64(&headers, ATTEMPT_NUMBER_HEADER).unwrap(), None);
    }

    #[test]
    fn initial_headers_seed_retries_and_backoff() {
        let headers = initial_retry_headers(4, 2);

        assert_eq!(read_i64(&headers, REMAINING_RETRIES_HEADER).unwrap(), Some(4));
        assert_eq!(read_i64(&headers, RETRY_DELAY_BASE_HEADER).unwrap(), Some(2));
        assert_eq!(read_i64(&headers, ATTEMPT_NUMBER_HEADER).unwrap(), None);
    }

    #[test]
    fn write_replaces_existing_value() {
        let mut headers = initial_retry_headers(4, 1);
        write_i64(&mut headers, REMAINING_RETRIES_HEADER, 3);

        assert_eq!(read_i64(&headers, REMAINING_RETRIES_HEADER).unwrap(), Some(3));
    }
}
