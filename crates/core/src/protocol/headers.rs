use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

use crate::protocol::FetchError;

/// Generation value that can never be trusted as "unchanged".
///
/// The counter saturates here instead of wrapping, so a header collection mutated more than
/// `u32::MAX` times is re-committed on every check.
pub const GENERATION_OVERFLOW: u32 = u32::MAX;

/// A header collection that counts its own mutations.
///
/// Every successful mutation bumps [`Headers::generation`]. Consumers remember the generation
/// they last acted on (see [`GenerationMark`]) and skip host round trips while it is unchanged.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    map: HeaderMap,
    generation: u32,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: HeaderMap) -> Self {
        Self { map, generation: 0 }
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.map.get(name)
    }

    /// Header value as text, `None` when missing or not visible ascii.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.map.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Replaces every value of `name` with `value`.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), FetchError> {
        let (name, value) = parse_pair(name, value)?;
        self.map.insert(name, value);
        self.bump();
        Ok(())
    }

    pub fn append(&mut self, name: &str, value: &str) -> Result<(), FetchError> {
        let (name, value) = parse_pair(name, value)?;
        self.map.append(name, value);
        self.bump();
        Ok(())
    }

    /// Sets `name` only if it is not present yet, returns whether it was set.
    pub fn set_if_absent(&mut self, name: &str, value: &str) -> Result<bool, FetchError> {
        if self.contains(name) {
            return Ok(false);
        }
        self.set(name, value)?;
        Ok(true)
    }

    /// Removes every value of `name`, returns whether anything was removed.
    pub fn delete(&mut self, name: &str) -> bool {
        let removed = self.map.remove(name).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    pub fn as_map(&self) -> &HeaderMap {
        &self.map
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn bump(&mut self) {
        self.generation = self.generation.saturating_add(1);
    }
}

fn parse_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), FetchError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| FetchError::type_error(format!("invalid header name '{name}': {e}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| FetchError::type_error(format!("invalid value for header '{name}': {e}")))?;
    Ok((name, value))
}

/// The last header generation some consumer acted on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GenerationMark(Option<u32>);

impl GenerationMark {
    pub fn new() -> Self {
        Self(None)
    }

    /// Returns whether `current` differs from the remembered generation and remembers it.
    ///
    /// An unset mark and [`GENERATION_OVERFLOW`] always count as changed.
    pub fn compare_bump(&mut self, current: u32) -> bool {
        let changed = !self.is_current(current);
        self.0 = Some(current);
        changed
    }

    /// Like [`compare_bump`](Self::compare_bump) without remembering.
    pub fn is_current(&self, current: u32) -> bool {
        current != GENERATION_OVERFLOW && self.0 == Some(current)
    }

    pub fn get(&self) -> Option<u32> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutations_bump_generation() {
        let mut headers = Headers::new();
        assert_eq!(headers.generation(), 0);

        headers.set("content-type", "text/plain").unwrap();
        headers.append("vary", "accept").unwrap();
        assert_eq!(headers.generation(), 2);

        assert!(!headers.delete("missing"));
        assert_eq!(headers.generation(), 2);

        assert!(headers.delete("vary"));
        assert_eq!(headers.generation(), 3);

        assert!(!headers.set_if_absent("content-type", "text/html").unwrap());
        assert_eq!(headers.get_str("content-type"), Some("text/plain"));
        assert_eq!(headers.generation(), 3);
    }

    #[test]
    fn invalid_header_is_type_error() {
        let mut headers = Headers::new();
        assert!(matches!(headers.set("bad name", "x"), Err(FetchError::Type { .. })));
        assert!(matches!(headers.set("x-ok", "line\nbreak"), Err(FetchError::Type { .. })));
        assert_eq!(headers.generation(), 0);
    }

    #[test]
    fn mark_detects_changes() {
        let mut mark = GenerationMark::new();
        assert!(mark.compare_bump(0));
        assert!(!mark.compare_bump(0));
        assert!(mark.compare_bump(1));
        assert!(!mark.compare_bump(1));
    }

    #[test]
    fn overflow_always_changed() {
        let mut headers = Headers { map: HeaderMap::new(), generation: GENERATION_OVERFLOW - 1 };
        headers.set("a", "1").unwrap();
        headers.set("a", "2").unwrap();
        assert_eq!(headers.generation(), GENERATION_OVERFLOW);

        let mut mark = GenerationMark::new();
        assert!(mark.compare_bump(headers.generation()));
        assert!(mark.compare_bump(headers.generation()));
    }
}
