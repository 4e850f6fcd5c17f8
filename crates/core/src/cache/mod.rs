//! Cache transaction vocabulary.

mod options;
pub use options::CacheWriteOptions;
pub use options::NANOS_PER_SEC;
pub use options::nanos_to_secs;
pub use options::ordered_keys;
pub use options::parse_surrogate_keys;
pub use options::secs_to_nanos;
pub use options::vary_rule;

use crate::host::CacheHandle;

/// The final disposition of a candidate response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageAction {
    Insert,
    Update,
    DoNotStore,
    RecordUncacheable,
}

/// What a cache lookup found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupState {
    pub found: bool,
    pub stale: bool,
}

/// Terminal state of a cache entry once its transaction is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Miss,
    Hit,
    Stale,
}

impl From<LookupState> for CacheOutcome {
    fn from(state: LookupState) -> Self {
        match state {
            LookupState { found: true, stale: true } => CacheOutcome::Stale,
            LookupState { found: true, stale: false } => CacheOutcome::Hit,
            LookupState { found: false, .. } => CacheOutcome::Miss,
        }
    }
}

/// The cache linkage of a request or response.
#[derive(Debug, Default)]
pub enum CacheEntry {
    /// Not associated with a cache lookup.
    #[default]
    NoCache,
    /// Owns an open transaction.
    Active(CacheHandle),
    /// The transaction was committed or abandoned.
    Terminal(CacheOutcome),
}

impl CacheEntry {
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, CacheEntry::Active(_))
    }

    pub fn handle(&self) -> Option<&CacheHandle> {
        match self {
            CacheEntry::Active(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn outcome(&self) -> Option<CacheOutcome> {
        match self {
            CacheEntry::Terminal(outcome) => Some(*outcome),
            _ => None,
        }
    }

    /// Moves the transaction handle out, leaving `Terminal(mark)` or `NoCache` behind.
    ///
    /// Returns `None` and leaves the slot untouched when no transaction is held.
    pub fn take_active(&mut self, mark: Option<CacheOutcome>) -> Option<CacheHandle> {
        if !self.is_active() {
            return None;
        }
        let replacement = mark.map_or(CacheEntry::NoCache, CacheEntry::Terminal);
        match std::mem::replace(self, replacement) {
            CacheEntry::Active(handle) => Some(handle),
            _ => None,
        }
    }

    /// `Some(false)` while a transaction is open, `Some(true)` for hits, `None` without a lookup.
    pub fn cached(&self) -> Option<bool> {
        match self {
            CacheEntry::NoCache => None,
            CacheEntry::Active(_) | CacheEntry::Terminal(CacheOutcome::Miss) => Some(false),
            CacheEntry::Terminal(CacheOutcome::Hit | CacheOutcome::Stale) => Some(true),
        }
    }

    pub fn stale(&self) -> Option<bool> {
        match self {
            CacheEntry::NoCache => None,
            CacheEntry::Terminal(CacheOutcome::Stale) => Some(true),
            _ => Some(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_active_moves_once() {
        let mut entry = CacheEntry::Active(CacheHandle::new(7));
        assert_eq!(entry.cached(), Some(false));

        let handle = entry.take_active(Some(CacheOutcome::Stale)).unwrap();
        assert_eq!(handle.as_u32(), 7);
        assert_eq!(entry.outcome(), Some(CacheOutcome::Stale));
        assert_eq!(entry.cached(), Some(true));
        assert_eq!(entry.stale(), Some(true));

        assert!(entry.take_active(None).is_none());
        assert_eq!(entry.outcome(), Some(CacheOutcome::Stale));
    }

    #[test]
    fn outcome_from_lookup() {
        assert_eq!(CacheOutcome::from(LookupState { found: true, stale: false }), CacheOutcome::Hit);
        assert_eq!(CacheOutcome::from(LookupState { found: true, stale: true }), CacheOutcome::Stale);
        assert_eq!(CacheOutcome::from(LookupState { found: false, stale: true }), CacheOutcome::Miss);
    }

    #[test]
    fn no_cache_is_undefined() {
        let entry = CacheEntry::NoCache;
        assert_eq!(entry.cached(), None);
        assert_eq!(entry.stale(), None);
    }
}
