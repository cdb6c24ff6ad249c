//! Creation time for a post from the signals upstream gives us.
//!
//! Upstream data is unreliable: `taken_at` is sometimes missing, zero or far
//! in the future (reels especially). Signals are tried in a fixed order and
//! the first valid one wins:
//!
//! 1. `taken_at`
//! 2. `caption.created_at`
//! 3. the creation time embedded in the numeric post id
//! 4. the fetch instant, flagged as unresolved
//!
//! Resolution is pure. The returned [`Resolution`] records which rule fired
//! and why each earlier signal was rejected, so callers can log or test the
//! decision path.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::RawPost;

/// Instagram's id epoch in unix milliseconds (2011-08-24T21:07:01.721Z).
pub const SNOWFLAKE_EPOCH_MS: i64 = 1_314_220_021_721;
const SNOWFLAKE_SHIFT: u32 = 23;

/// Nothing on Instagram predates 2010-01-01.
const EARLIEST_VALID_SECS: i64 = 1_262_304_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    TakenAt,
    CaptionCreatedAt,
    PostId,
    /// No usable signal; the fetch instant was used instead.
    FetchTime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    Missing,
    Unparseable(String),
    BeforeEpoch(DateTime<Utc>),
    InFuture(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub instant: DateTime<Utc>,
    pub source: TimestampSource,
    /// Signals tried before the winning one, in order.
    pub rejected: Vec<(TimestampSource, Rejection)>,
}

impl Resolution {
    pub fn is_unresolved(&self) -> bool {
        self.source == TimestampSource::FetchTime
    }
}

/// Resolve the creation instant of `raw` as seen at `now`.
///
/// Signals up to `skew` ahead of `now` are accepted and clamped to `now`.
pub fn resolve(raw: &RawPost, now: DateTime<Utc>, skew: Duration) -> Resolution {
    let mut rejected = Vec::new();

    let candidates = [
        (TimestampSource::TakenAt, signal_instant(raw.taken_at.as_ref())),
        (
            TimestampSource::CaptionCreatedAt,
            signal_instant(raw.caption_created_at.as_ref()),
        ),
        (TimestampSource::PostId, decode_post_id(&raw.id)),
    ];

    for (source, parsed) in candidates {
        match parsed.and_then(|at| validate(at, now, skew)) {
            Ok(instant) => {
                return Resolution {
                    instant,
                    source,
                    rejected,
                };
            }
            Err(why) => rejected.push((source, why)),
        }
    }

    Resolution {
        instant: now,
        source: TimestampSource::FetchTime,
        rejected,
    }
}

/// Decode the creation time embedded in an Instagram media id.
///
/// Composite ids of the form `<media>_<owner>` decode their first part.
pub fn decode_post_id(id: &str) -> Result<DateTime<Utc>, Rejection> {
    let media = id.split('_').next().unwrap_or_default().trim();
    if media.is_empty() {
        return Err(Rejection::Missing);
    }
    let numeric: u64 = media
        .parse()
        .map_err(|_| Rejection::Unparseable(format!("post id {:?} is not numeric", id)))?;

    let millis = (numeric >> SNOWFLAKE_SHIFT) as i64 + SNOWFLAKE_EPOCH_MS;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Rejection::Unparseable(format!("post id {} out of range", id)))
}

fn signal_instant(value: Option<&Value>) -> Result<DateTime<Utc>, Rejection> {
    match value {
        None | Some(Value::Null) => Err(Rejection::Missing),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(secs) => from_unix_secs(secs),
            None => Err(Rejection::Unparseable(n.to_string())),
        },
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Err(Rejection::Missing);
            }
            if let Ok(secs) = s.parse::<f64>() {
                return from_unix_secs(secs);
            }
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| Rejection::Unparseable(s.to_string()))
        }
        Some(other) => Err(Rejection::Unparseable(other.to_string())),
    }
}

fn from_unix_secs(secs: f64) -> Result<DateTime<Utc>, Rejection> {
    // upstream uses 0 for "unknown"
    if secs == 0.0 {
        return Err(Rejection::Missing);
    }
    if !secs.is_finite() {
        return Err(Rejection::Unparseable(secs.to_string()));
    }
    let millis = (secs * 1000.0).round();
    if millis.abs() > i64::MAX as f64 {
        return Err(Rejection::Unparseable(secs.to_string()));
    }
    DateTime::from_timestamp_millis(millis as i64)
        .ok_or_else(|| Rejection::Unparseable(secs.to_string()))
}

fn validate(
    at: DateTime<Utc>,
    now: DateTime<Utc>,
    skew: Duration,
) -> Result<DateTime<Utc>, Rejection> {
    if at.timestamp() < EARLIEST_VALID_SECS {
        return Err(Rejection::BeforeEpoch(at));
    }
    // a skew past the representable range bounds nothing
    if let Some(limit) = now.checked_add_signed(skew) {
        if at > limit {
            return Err(Rejection::InFuture(at));
        }
    }
    Ok(at.min(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    fn raw(id: &str, taken_at: Option<Value>, caption_created_at: Option<Value>) -> RawPost {
        RawPost {
            id: id.to_string(),
            taken_at,
            caption_created_at,
            ..RawPost::default()
        }
    }

    fn skew() -> Duration {
        Duration::minutes(5)
    }

    #[test]
    fn test_taken_at_wins_when_valid() {
        let taken = now() - Duration::hours(3);
        let post = raw(
            "2457894561230147852",
            Some(json!(taken.timestamp())),
            Some(json!((now() - Duration::hours(4)).timestamp())),
        );

        let res = resolve(&post, now(), skew());
        assert_eq!(res.source, TimestampSource::TakenAt);
        assert_eq!(res.instant, taken);
        assert!(res.rejected.is_empty());
    }

    #[test]
    fn test_future_taken_at_falls_back_to_caption() {
        let caption = now() - Duration::days(2);
        let post = raw(
            "not-a-number",
            Some(json!((now() + Duration::days(400)).timestamp())),
            Some(json!(caption.timestamp())),
        );

        let res = resolve(&post, now(), skew());
        assert_eq!(res.source, TimestampSource::CaptionCreatedAt);
        assert_eq!(res.instant, caption);
        assert!(matches!(
            res.rejected[0],
            (TimestampSource::TakenAt, Rejection::InFuture(_))
        ));
    }

    #[test]
    fn test_decodes_snowflake_when_other_signals_missing() {
        let post = raw("2457894561230147852", None, None);

        let res = resolve(&post, now(), skew());
        assert_eq!(res.source, TimestampSource::PostId);
        assert_eq!(res.instant.timestamp_millis(), 1_607_223_886_155);
        assert_eq!(
            res.instant,
            Utc.with_ymd_and_hms(2020, 12, 6, 3, 4, 46).unwrap() + Duration::milliseconds(155)
        );
        assert_eq!(
            res.rejected,
            vec![
                (TimestampSource::TakenAt, Rejection::Missing),
                (TimestampSource::CaptionCreatedAt, Rejection::Missing),
            ]
        );
    }

    #[test]
    fn test_composite_id_decodes_media_part() {
        let plain = decode_post_id("2457894561230147852").unwrap();
        let composite = decode_post_id("2457894561230147852_25025320").unwrap();
        assert_eq!(plain, composite);
    }

    #[test]
    fn test_unresolved_when_everything_invalid() {
        let future = (now() + Duration::days(30)).timestamp();
        let post = raw("abc", Some(json!(future)), Some(json!("garbage")));

        let res = resolve(&post, now(), skew());
        assert!(res.is_unresolved());
        assert_eq!(res.instant, now());
        assert_eq!(res.rejected.len(), 3);
        assert!(matches!(
            res.rejected[2],
            (TimestampSource::PostId, Rejection::Unparseable(_))
        ));
    }

    #[test]
    fn test_empty_post_is_unresolved_not_a_panic() {
        let res = resolve(&RawPost::default(), now(), skew());
        assert!(res.is_unresolved());
        assert_eq!(res.instant, now());
    }

    #[test]
    fn test_small_skew_is_clamped_to_now() {
        let ahead = now() + Duration::seconds(30);
        let post = raw("1", Some(json!(ahead.timestamp())), None);

        let res = resolve(&post, now(), skew());
        assert_eq!(res.source, TimestampSource::TakenAt);
        assert_eq!(res.instant, now());

        let res = resolve(&post, now(), Duration::zero());
        assert_ne!(res.source, TimestampSource::TakenAt);
    }

    #[test]
    fn test_huge_skew_accepts_without_overflow() {
        let ahead = now() + Duration::days(30);
        let post = raw("1", Some(json!(ahead.timestamp())), None);

        let res = resolve(&post, now(), Duration::seconds(9_000_000_000_000));
        assert_eq!(res.source, TimestampSource::TakenAt);
        assert_eq!(res.instant, now());
    }

    #[test]
    fn test_zero_and_pre_2010_are_rejected() {
        let post = raw("abc", Some(json!(0)), Some(json!(946_684_800)));

        let res = resolve(&post, now(), skew());
        assert_eq!(res.rejected[0], (TimestampSource::TakenAt, Rejection::Missing));
        assert!(matches!(
            res.rejected[1],
            (TimestampSource::CaptionCreatedAt, Rejection::BeforeEpoch(_))
        ));
    }

    #[test]
    fn test_string_signals() {
        let numeric = raw("x", Some(json!("1700000000")), None);
        assert_eq!(
            resolve(&numeric, now(), skew()).instant.timestamp(),
            1_700_000_000
        );

        let iso = raw("x", Some(json!("2024-03-01T10:00:00Z")), None);
        let res = resolve(&iso, now(), skew());
        assert_eq!(res.source, TimestampSource::TakenAt);
        assert_eq!(res.instant, Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());

        let float = raw("x", Some(json!(1_700_000_000.5)), None);
        assert_eq!(
            resolve(&float, now(), skew()).instant.timestamp_millis(),
            1_700_000_000_500
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let post = raw("2457894561230147852", Some(json!("nope")), None);
        assert_eq!(resolve(&post, now(), skew()), resolve(&post, now(), skew()));
    }
}
