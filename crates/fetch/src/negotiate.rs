//! Cache write negotiation for candidate responses.
//!
//! A candidate carries two layers of [`CacheWriteOptions`]: the host's suggestion, derived from
//! the response headers and recomputed only when those change, and a sparse override set filled
//! in by the setters, the request's [`CacheOverride`] and the after-send hook. Reads merge the two
//! field by field with overrides winning. After commit only the final options remain visible.

use std::mem;
use std::rc::Rc;

use micro_fetch_core::body::Body;
use micro_fetch_core::cache::{
    CacheEntry, CacheWriteOptions, NANOS_PER_SEC, StorageAction, nanos_to_secs, ordered_keys, parse_surrogate_keys,
    secs_to_nanos, vary_rule,
};
use micro_fetch_core::host::{CacheHandle, Host};
use micro_fetch_core::protocol::{FetchError, GenerationMark, HostError};
use tracing::{debug, info};

use crate::cache_override::{AfterSendOutcome, HookCache};
use crate::entity::MessageEntity;
use crate::{CacheOverride, Response};

/// The host's suggestion and the header generation it was computed for.
#[derive(Debug)]
pub(crate) struct Suggested {
    mark: GenerationMark,
    options: Box<CacheWriteOptions>,
}

const NOT_A_CANDIDATE: &str = "cache options may only be set on unsent cache transaction responses";

impl Response {
    /// Turns the response into the candidate of `entry`, holding its body back until commit.
    pub(crate) fn begin_candidate(&mut self, entry: CacheHandle, action: StorageAction) {
        self.core.cache = CacheEntry::Active(entry);
        self.storage_action = Some(action);
        self.overrides = Some(Box::default());
        let empty = self.core.empty_body();
        self.stashed_body = Some(mem::replace(&mut self.core.body, empty));
    }

    /// The host's suggested options for the current headers.
    ///
    /// Header changes since the last call are written to the host first and the suggestion is
    /// recomputed, otherwise the cached suggestion is returned as is.
    pub fn suggested_cache_options(&mut self) -> Result<CacheWriteOptions, FetchError> {
        if !self.core.cache.is_active() {
            return Err(FetchError::invalid_state("response has no open cache transaction"));
        }

        let generation = self.core.headers_generation();
        if let Some(suggested) = &self.suggested
            && suggested.mark.is_current(generation)
        {
            return Ok((*suggested.options).clone());
        }

        self.commit_headers()?;
        let entry = self.core.cache.handle().ok_or_else(|| FetchError::invalid_state("cache transaction is closed"))?;
        let options = self.core.host().cache_suggested_write_options(entry, self.handle)?;
        if !options.is_complete() {
            return Err(HostError::io("host returned incomplete cache write options").into());
        }

        let mut mark = GenerationMark::new();
        mark.compare_bump(generation);
        debug!(generation, "suggested cache options recomputed");
        self.suggested = Some(Suggested { mark, options: Box::new(options.clone()) });
        Ok(options)
    }

    /// One field of the effective options.
    ///
    /// Overrides win. Candidates fall back to the suggestion, committed responses only expose
    /// their final options, responses without a transaction have none.
    fn cache_field<T, F>(&mut self, pick: F) -> Result<Option<T>, FetchError>
    where
        F: Fn(&CacheWriteOptions) -> Option<T>,
    {
        let overridden = match self.overrides.as_deref() {
            None => return Ok(None),
            Some(overrides) => pick(overrides),
        };
        if overridden.is_some() || !self.core.cache.is_active() {
            return Ok(overridden);
        }
        Ok(pick(&self.suggested_cache_options()?))
    }

    fn ensure_candidate(&self) -> Result<(), FetchError> {
        if self.core.cache.is_active() {
            Ok(())
        } else {
            Err(FetchError::invalid_state(NOT_A_CANDIDATE))
        }
    }

    fn overrides_mut(&mut self) -> &mut CacheWriteOptions {
        self.overrides.get_or_insert_with(Box::default)
    }

    fn suggested_initial_age(&mut self) -> Result<u64, FetchError> {
        Ok(self.suggested_cache_options()?.initial_age_ns.unwrap_or(0))
    }

    /// Freshness lifetime left in seconds, `max_age - initial_age`.
    pub fn ttl(&mut self) -> Result<Option<f64>, FetchError> {
        let Some(max_age) = self.cache_field(|o| o.max_age_ns)? else {
            return Ok(None);
        };
        let initial_age = self.cache_field(|o| o.initial_age_ns)?.unwrap_or(0);
        Ok(Some(nanos_to_secs(max_age.saturating_sub(initial_age))))
    }

    /// Sets the remaining freshness lifetime. The stored max age includes the response's age.
    pub fn set_ttl(&mut self, seconds: f64) -> Result<(), FetchError> {
        self.ensure_candidate()?;
        ensure_positive("ttl", seconds)?;
        let initial_age = self.suggested_initial_age()?;
        self.overrides_mut().max_age_ns = Some(secs_to_nanos(seconds).saturating_add(initial_age));
        Ok(())
    }

    /// Age of the response in seconds when it was received.
    pub fn age(&mut self) -> Result<Option<f64>, FetchError> {
        Ok(self.cache_field(|o| o.initial_age_ns)?.map(nanos_to_secs))
    }

    pub fn swr(&mut self) -> Result<Option<f64>, FetchError> {
        Ok(self.cache_field(|o| o.stale_while_revalidate_ns)?.map(nanos_to_secs))
    }

    pub fn set_swr(&mut self, seconds: f64) -> Result<(), FetchError> {
        self.ensure_candidate()?;
        ensure_positive("swr", seconds)?;
        self.overrides_mut().stale_while_revalidate_ns = Some(secs_to_nanos(seconds));
        Ok(())
    }

    /// Header names the stored response varies on.
    pub fn vary(&mut self) -> Result<Option<Vec<String>>, FetchError> {
        let rule = self.cache_field(|o| o.vary_rule.clone())?;
        Ok(rule.map(|rule| rule.split_whitespace().map(str::to_string).collect()))
    }

    pub fn set_vary<S: AsRef<str>>(&mut self, headers: &[S]) -> Result<(), FetchError> {
        self.ensure_candidate()?;
        ensure_tokens("vary", headers)?;
        self.overrides_mut().vary_rule = Some(vary_rule(headers));
        Ok(())
    }

    pub fn surrogate_keys(&mut self) -> Result<Option<Vec<String>>, FetchError> {
        self.cache_field(|o| o.surrogate_keys.clone())
    }

    /// Replaces the surrogate keys. Duplicates are dropped, first occurrence wins.
    pub fn set_surrogate_keys<S: AsRef<str>>(&mut self, keys: &[S]) -> Result<(), FetchError> {
        self.ensure_candidate()?;
        ensure_tokens("surrogate key", keys)?;
        let keys = ordered_keys(keys.iter().map(|key| key.as_ref().to_string()));
        self.overrides_mut().surrogate_keys = Some(keys);
        Ok(())
    }

    /// Whether the response holds sensitive data that must not be persisted.
    pub fn pci(&mut self) -> Result<Option<bool>, FetchError> {
        self.cache_field(|o| o.sensitive_data)
    }

    pub fn set_pci(&mut self, pci: bool) -> Result<(), FetchError> {
        self.ensure_candidate()?;
        self.overrides_mut().sensitive_data = Some(pci);
        Ok(())
    }

    /// Responses setting cookies are not stored, unless storing was already ruled out.
    pub(crate) fn apply_set_cookie_heuristic(&mut self) -> Result<(), FetchError> {
        if self.storage_action == Some(StorageAction::DoNotStore) {
            return Ok(());
        }
        if self.headers()?.contains("set-cookie") {
            debug!("set-cookie on candidate, recording as uncacheable");
            self.storage_action = Some(StorageAction::RecordUncacheable);
        }
        Ok(())
    }

    /// Translates the request's cache directive into overrides. Integer ttl and swr are exact.
    pub(crate) fn apply_cache_directive(&mut self, directive: &CacheOverride) -> Result<(), FetchError> {
        if let Some(ttl) = directive.ttl() {
            let initial_age = self.suggested_initial_age()?;
            self.overrides_mut().max_age_ns = Some(u64::from(ttl) * NANOS_PER_SEC + initial_age);
        }
        if let Some(swr) = directive.swr() {
            self.overrides_mut().stale_while_revalidate_ns = Some(u64::from(swr) * NANOS_PER_SEC);
        }
        if let Some(keys) = directive.surrogate_key() {
            self.overrides_mut().surrogate_keys = Some(parse_surrogate_keys(keys));
        }
        if let Some(pci) = directive.pci() {
            self.overrides_mut().sensitive_data = Some(pci);
        }
        Ok(())
    }

    pub(crate) fn apply_after_send_outcome(&mut self, outcome: Option<AfterSendOutcome>) -> Result<(), FetchError> {
        let Some(outcome) = outcome else {
            return Ok(());
        };

        match outcome.cache {
            None => {}
            Some(HookCache::Flag(true)) => {
                if self.storage_action != Some(StorageAction::Update) {
                    self.storage_action = Some(StorageAction::Insert);
                }
            }
            Some(HookCache::Flag(false)) => self.storage_action = Some(StorageAction::DoNotStore),
            Some(HookCache::Label(label)) if label == "uncacheable" => {
                self.storage_action = Some(StorageAction::RecordUncacheable);
            }
            Some(HookCache::Label(label)) => {
                return Err(FetchError::type_error(format!(
                    "invalid cache value '{label}', expected a boolean or \"uncacheable\""
                )));
            }
        }

        if let Some(transform) = outcome.body_transform {
            self.body_transform = Some(transform);
        }
        Ok(())
    }

    /// The options the transaction is committed with.
    ///
    /// `initial_age` always comes from the suggestion. The length is only known when the stored
    /// body is not transformed. The suggestion is dropped and the final options become what the
    /// accessors report from now on.
    pub(crate) fn finalize_cache_options(&mut self) -> Result<CacheWriteOptions, FetchError> {
        let suggested = self.suggested_cache_options()?;
        let overrides = self.overrides.take().map(|o| *o).unwrap_or_default();

        let mut options = overrides.merge_over(&suggested);
        options.initial_age_ns = suggested.initial_age_ns;
        options.length = match (&self.body_transform, &self.stashed_body) {
            (None, Some(body)) => body.known_length()?,
            _ => None,
        };

        self.suggested = None;
        self.overrides = Some(Box::new(options.clone()));
        Ok(options)
    }

    /// Commits the transaction with `options` and closes it, whatever the outcome.
    pub(crate) async fn commit_cache_transaction(
        &mut self,
        options: CacheWriteOptions,
        forward_surrogate: bool,
    ) -> Result<(), FetchError> {
        let entry = self
            .core
            .cache
            .take_active(None)
            .ok_or_else(|| FetchError::invalid_state("response has no open cache transaction"))?;

        let committed = self.commit_with(&entry, &options, forward_surrogate).await;
        let closed = self.core.host().cache_close(entry);
        committed?;
        Ok(closed?)
    }

    async fn commit_with(
        &mut self,
        entry: &CacheHandle,
        options: &CacheWriteOptions,
        forward_surrogate: bool,
    ) -> Result<(), FetchError> {
        let host = self.core.host_rc();
        let config = self.core.config();
        let action = self.storage_action.ok_or_else(|| FetchError::invalid_state("candidate has no storage action"))?;

        let mut body = self.stashed_body.take().unwrap_or_else(|| self.core.empty_body());
        if let Some(transform) = self.body_transform.take() {
            let original = body.consume().await?;
            let transformed = transform.apply(original).await?;
            body = Body::absent(Rc::clone(&host), config);
            body.set_bytes(&transformed)?;
        }
        let body_handle = match body.handle() {
            Some(handle) => handle,
            None => host.body_new()?,
        };

        self.commit_headers()?;
        host.cache_commit(entry, action, self.handle, body_handle, options)?;
        info!(action = ?action, length = options.length, "cache transaction committed");

        self.core.body = body;
        self.add_cache_headers(Some(entry), forward_surrogate)
    }
}

fn ensure_positive(field: &str, seconds: f64) -> Result<(), FetchError> {
    if seconds.is_finite() && seconds > 0.0 {
        Ok(())
    } else {
        Err(FetchError::type_error(format!("{field} must be a finite number greater than 0")))
    }
}

fn ensure_tokens<S: AsRef<str>>(field: &str, values: &[S]) -> Result<(), FetchError> {
    for value in values {
        let value = value.as_ref();
        if value.is_empty() || value.contains(char::is_whitespace) {
            return Err(FetchError::type_error(format!("invalid {field} '{value}'")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FetchContext;
    use crate::cache_override::BodyTransform;
    use bytes::Bytes;
    use http::HeaderMap;
    use micro_fetch_core::cache::LookupState;
    use micro_fetch_core::host::{HostResponse, MemoryHost};

    const URL: &str = "https://example.com/article";

    fn candidate(headers: &[(&'static str, &'static str)], chunks: &[&'static str]) -> (Rc<MemoryHost>, Response, u32) {
        let memory = Rc::new(MemoryHost::new());
        let ctx = FetchContext::new(Rc::clone(&memory) as Rc<dyn Host>);

        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, value.parse().unwrap());
        }
        let head = memory.response_new().unwrap();
        memory.response_write_head(head, 200, &map).unwrap();
        let body = memory.body_from_chunks(chunks.iter().copied());

        let entry = memory.open_transaction(LookupState::default(), 0);
        let id = entry.as_u32();
        let (action, rewritten) = memory.cache_prepare_response_for_storage(&entry, head).unwrap();
        let mut response =
            Response::from_upstream(&ctx, URL, Some("origin".into()), HostResponse { response: rewritten, body }).unwrap();
        response.begin_candidate(entry, action);
        (memory, response, id)
    }

    #[test]
    fn suggestion_is_cached_per_generation() {
        let (memory, mut response, id) = candidate(&[("cache-control", "max-age=60")], &["body"]);

        let first = response.suggested_cache_options().unwrap();
        let second = response.suggested_cache_options().unwrap();
        assert_eq!(first, second);
        assert_eq!(memory.cache_report(id).unwrap().suggested_calls, 1);

        response.headers_mut().unwrap().set("cache-control", "max-age=120").unwrap();
        let third = response.suggested_cache_options().unwrap();
        assert_eq!(third.max_age_ns, Some(120 * NANOS_PER_SEC));
        assert_eq!(memory.cache_report(id).unwrap().suggested_calls, 2);
    }

    #[test]
    fn overrides_win_over_suggestion() {
        let (_, mut response, _) =
            candidate(&[("cache-control", "max-age=60, stale-while-revalidate=5"), ("age", "10")], &[]);

        assert_eq!(response.ttl().unwrap(), Some(60.0));
        assert_eq!(response.age().unwrap(), Some(10.0));
        assert_eq!(response.swr().unwrap(), Some(5.0));

        response.set_ttl(30.0).unwrap();
        response.set_swr(1.5).unwrap();
        assert_eq!(response.ttl().unwrap(), Some(30.0));
        assert_eq!(response.swr().unwrap(), Some(1.5));
        assert_eq!(response.age().unwrap(), Some(10.0));
    }

    #[test]
    fn setters_validate_input() {
        let (_, mut response, _) = candidate(&[], &[]);
        assert!(matches!(response.set_ttl(-1.0), Err(FetchError::Type { .. })));
        assert!(matches!(response.set_ttl(f64::NAN), Err(FetchError::Type { .. })));
        assert!(matches!(response.set_swr(f64::INFINITY), Err(FetchError::Type { .. })));
        assert!(matches!(response.set_vary(&["accept encoding"]), Err(FetchError::Type { .. })));
        assert!(matches!(response.set_surrogate_keys(&[""]), Err(FetchError::Type { .. })));
    }

    #[test]
    fn vary_and_keys_round_trip() {
        let (_, mut response, _) = candidate(&[("vary", "Accept"), ("surrogate-key", "a b")], &[]);
        assert_eq!(response.vary().unwrap(), Some(vec!["accept".to_string()]));
        assert_eq!(response.surrogate_keys().unwrap(), Some(vec!["a".to_string(), "b".to_string()]));

        response.set_vary(&["accept-language", "cookie"]).unwrap();
        response.set_surrogate_keys(&["x", "y", "x"]).unwrap();
        response.set_pci(true).unwrap();
        assert_eq!(response.vary().unwrap(), Some(vec!["accept-language".to_string(), "cookie".to_string()]));
        assert_eq!(response.surrogate_keys().unwrap(), Some(vec!["x".to_string(), "y".to_string()]));
        assert_eq!(response.pci().unwrap(), Some(true));
    }

    #[test]
    fn directive_translation_is_exact() {
        let (_, mut response, _) = candidate(&[("age", "3")], &[]);
        let directive = CacheOverride::new().with_ttl(7).with_swr(2).with_surrogate_key(" k1  k2 k1 ").with_pci(true);
        response.apply_cache_directive(&directive).unwrap();

        let options = response.finalize_cache_options().unwrap();
        assert_eq!(options.max_age_ns, Some(10 * NANOS_PER_SEC));
        assert_eq!(options.initial_age_ns, Some(3 * NANOS_PER_SEC));
        assert_eq!(options.stale_while_revalidate_ns, Some(2 * NANOS_PER_SEC));
        assert_eq!(options.surrogate_keys, Some(vec!["k1".to_string(), "k2".to_string()]));
        assert_eq!(options.sensitive_data, Some(true));
    }

    #[test]
    fn set_cookie_records_uncacheable() {
        let (_, mut response, _) = candidate(&[("set-cookie", "session=1")], &[]);
        assert_eq!(response.storage_action(), Some(StorageAction::Insert));
        response.apply_set_cookie_heuristic().unwrap();
        assert_eq!(response.storage_action(), Some(StorageAction::RecordUncacheable));
    }

    #[test]
    fn set_cookie_keeps_do_not_store() {
        let (_, mut response, _) = candidate(&[("cache-control", "no-store"), ("set-cookie", "session=1")], &[]);
        response.apply_set_cookie_heuristic().unwrap();
        assert_eq!(response.storage_action(), Some(StorageAction::DoNotStore));
    }

    #[test]
    fn hook_outcome_changes_action() {
        let (_, mut response, _) = candidate(&[("cache-control", "private")], &[]);
        assert_eq!(response.storage_action(), Some(StorageAction::DoNotStore));

        response.apply_after_send_outcome(Some(AfterSendOutcome::new().with_cache(true))).unwrap();
        assert_eq!(response.storage_action(), Some(StorageAction::Insert));

        response.apply_after_send_outcome(Some(AfterSendOutcome::new().with_cache("uncacheable"))).unwrap();
        assert_eq!(response.storage_action(), Some(StorageAction::RecordUncacheable));

        response.apply_after_send_outcome(Some(AfterSendOutcome::new().with_cache(false))).unwrap();
        assert_eq!(response.storage_action(), Some(StorageAction::DoNotStore));

        let invalid = response.apply_after_send_outcome(Some(AfterSendOutcome::new().with_cache("maybe")));
        assert!(matches!(invalid, Err(FetchError::Type { .. })));
        response.apply_after_send_outcome(None).unwrap();
    }

    #[test]
    fn hook_true_keeps_update() {
        let (_, mut response, _) = candidate(&[], &[]);
        response.storage_action = Some(StorageAction::Update);
        response.apply_after_send_outcome(Some(AfterSendOutcome::new().with_cache(true))).unwrap();
        assert_eq!(response.storage_action(), Some(StorageAction::Update));
    }

    #[tokio::test]
    async fn commit_publishes_final_options() {
        let (memory, mut response, id) = candidate(&[("cache-control", "max-age=60")], &["hello ", "world"]);
        response.set_ttl(30.0).unwrap();

        let options = response.finalize_cache_options().unwrap();
        assert_eq!(options.length, Some(11));
        response.commit_cache_transaction(options, false).await.unwrap();

        let report = memory.cache_report(id).unwrap();
        assert_eq!(report.close_calls, 1);
        assert_eq!(report.commits.len(), 1);
        assert_eq!(report.commits[0].action, StorageAction::Insert);
        assert_eq!(report.commits[0].body, Bytes::from_static(b"hello world"));

        assert_eq!(response.cached(), Some(false));
        assert_eq!(response.ttl().unwrap(), Some(30.0));
        assert!(matches!(response.set_ttl(10.0), Err(FetchError::InvalidState { .. })));
        assert_eq!(response.headers().unwrap().get_str("x-cache"), Some("MISS"));
        assert_eq!(response.consume_body().await.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn transformed_body_has_no_length() {
        let (memory, mut response, id) = candidate(&[], &["abc"]);
        let transform = BodyTransform::from_fn(|bytes| Ok(Bytes::from(bytes.to_ascii_uppercase())));
        response.apply_after_send_outcome(Some(AfterSendOutcome::new().with_body_transform(transform))).unwrap();

        let options = response.finalize_cache_options().unwrap();
        assert_eq!(options.length, None);
        response.commit_cache_transaction(options, false).await.unwrap();

        assert_eq!(memory.cache_report(id).unwrap().commits[0].body, Bytes::from_static(b"ABC"));
        assert_eq!(response.consume_body().await.unwrap(), Bytes::from_static(b"ABC"));
    }

    #[test]
    fn plain_response_has_no_cache_options() {
        let memory = Rc::new(MemoryHost::new());
        let ctx = FetchContext::new(Rc::clone(&memory) as Rc<dyn Host>);
        let mut response = Response::new(&ctx, 200, None).unwrap();

        assert_eq!(response.ttl().unwrap(), None);
        assert_eq!(response.pci().unwrap(), None);
        assert!(matches!(response.suggested_cache_options(), Err(FetchError::InvalidState { .. })));
        assert!(matches!(response.set_ttl(30.0), Err(FetchError::InvalidState { .. })));
    }

    #[test]
    fn dropping_candidate_closes_transaction() {
        let (memory, response, id) = candidate(&[], &[]);
        drop(response);
        assert_eq!(memory.cache_report(id).unwrap().close_calls, 1);
    }
}
