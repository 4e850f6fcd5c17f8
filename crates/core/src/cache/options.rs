/// Nanoseconds in one second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Metadata a cache transaction is committed with.
///
/// Every field is optional so the same type serves both layers: the host-suggested set (all
/// fields but `length` populated, see [`is_complete`](Self::is_complete)) and the sparse override
/// set where only explicitly assigned fields are present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheWriteOptions {
    pub initial_age_ns: Option<u64>,
    pub max_age_ns: Option<u64>,
    pub stale_while_revalidate_ns: Option<u64>,
    /// Ordered, duplicate free.
    pub surrogate_keys: Option<Vec<String>>,
    /// Header names separated by single spaces.
    pub vary_rule: Option<String>,
    pub sensitive_data: Option<bool>,
    pub length: Option<u64>,
}

impl CacheWriteOptions {
    /// Whether every field a suggestion must carry is populated.
    pub fn is_complete(&self) -> bool {
        self.initial_age_ns.is_some()
            && self.max_age_ns.is_some()
            && self.stale_while_revalidate_ns.is_some()
            && self.surrogate_keys.is_some()
            && self.vary_rule.is_some()
            && self.sensitive_data.is_some()
    }

    /// Field-by-field composite: values set on `self` win, the rest comes from `fallback`.
    pub fn merge_over(&self, fallback: &CacheWriteOptions) -> CacheWriteOptions {
        CacheWriteOptions {
            initial_age_ns: self.initial_age_ns.or(fallback.initial_age_ns),
            max_age_ns: self.max_age_ns.or(fallback.max_age_ns),
            stale_while_revalidate_ns: self.stale_while_revalidate_ns.or(fallback.stale_while_revalidate_ns),
            surrogate_keys: self.surrogate_keys.clone().or_else(|| fallback.surrogate_keys.clone()),
            vary_rule: self.vary_rule.clone().or_else(|| fallback.vary_rule.clone()),
            sensitive_data: self.sensitive_data.or(fallback.sensitive_data),
            length: self.length.or(fallback.length),
        }
    }

    /// The vary rule as individual header names.
    pub fn vary_headers(&self) -> Option<Vec<String>> {
        self.vary_rule.as_deref().map(|rule| rule.split_whitespace().map(str::to_string).collect())
    }
}

/// Splits a space delimited surrogate key list, runs of spaces never yield empty keys.
pub fn parse_surrogate_keys(raw: &str) -> Vec<String> {
    ordered_keys(raw.split(' ').filter(|key| !key.is_empty()).map(str::to_string))
}

/// Drops duplicates while keeping first occurrence order.
pub fn ordered_keys<I: IntoIterator<Item = String>>(keys: I) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for key in keys {
        if !out.contains(&key) {
            out.push(key);
        }
    }
    out
}

/// Joins header names into a vary rule.
pub fn vary_rule<S: AsRef<str>>(headers: &[S]) -> String {
    headers.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(" ")
}

/// Converts seconds to nanoseconds, rounding to the nearest nanosecond.
///
/// Callers validate `seconds` as finite and positive. Values beyond `u64::MAX` nanoseconds saturate.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "float to int casts saturate")]
pub fn secs_to_nanos(seconds: f64) -> u64 {
    (seconds * 1e9).round() as u64
}

#[allow(clippy::cast_precision_loss, reason = "seconds are exposed as f64")]
pub fn nanos_to_secs(nanos: u64) -> f64 {
    nanos as f64 / 1e9
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suggested() -> CacheWriteOptions {
        CacheWriteOptions {
            initial_age_ns: Some(5 * NANOS_PER_SEC),
            max_age_ns: Some(60 * NANOS_PER_SEC),
            stale_while_revalidate_ns: Some(0),
            surrogate_keys: Some(vec!["a".into()]),
            vary_rule: Some("accept".into()),
            sensitive_data: Some(false),
            length: None,
        }
    }

    #[test]
    fn override_fields_win() {
        let over = CacheWriteOptions {
            max_age_ns: Some(1),
            vary_rule: Some(String::new()),
            sensitive_data: Some(true),
            ..CacheWriteOptions::default()
        };
        let merged = over.merge_over(&suggested());
        assert_eq!(merged.max_age_ns, Some(1));
        assert_eq!(merged.vary_rule.as_deref(), Some(""));
        assert_eq!(merged.sensitive_data, Some(true));
        assert_eq!(merged.initial_age_ns, Some(5 * NANOS_PER_SEC));
        assert_eq!(merged.surrogate_keys, Some(vec!["a".to_string()]));
        assert!(merged.is_complete());
        assert!(!over.is_complete());
    }

    #[test]
    fn surrogate_keys_split_on_space_runs() {
        assert_eq!(parse_surrogate_keys("  a   b c  a"), vec!["a", "b", "c"]);
        assert!(parse_surrogate_keys("    ").is_empty());
    }

    #[test]
    fn vary_round_trip() {
        let rule = vary_rule(&["accept", "accept-encoding"]);
        let options = CacheWriteOptions { vary_rule: Some(rule), ..CacheWriteOptions::default() };
        assert_eq!(options.vary_headers(), Some(vec!["accept".to_string(), "accept-encoding".to_string()]));
    }

    #[test]
    fn seconds_conversion_rounds() {
        assert_eq!(secs_to_nanos(30.0), 30 * NANOS_PER_SEC);
        assert_eq!(secs_to_nanos(0.000_000_000_6), 1);
        assert_eq!(secs_to_nanos(1.1), 1_100_000_000);
        assert!((nanos_to_secs(1_500_000_000) - 1.5).abs() < f64::EPSILON);
    }
}
