use std::fmt;
use std::rc::Rc;

use http::HeaderMap;
use micro_fetch_core::body::Body;
use micro_fetch_core::cache::{CacheEntry, CacheOutcome, CacheWriteOptions, LookupState, StorageAction};
use micro_fetch_core::host::{BodyHandle, CacheHandle, Host, HostResponse, ResponseHandle};
use micro_fetch_core::protocol::{FetchError, Headers};
use tracing::debug;

use crate::body::BodyInit;
use crate::cache_override::BodyTransform;
use crate::entity::{EntityCore, MessageEntity, message_entity};
use crate::negotiate::Suggested;
use crate::FetchContext;

const SURROGATE_KEY: &str = "surrogate-key";
const SURROGATE_CONTROL: &str = "surrogate-control";

/// A response, either built locally or received from a backend.
///
/// A response received for a request with an open cache transaction starts as the transaction's
/// candidate: its cache options can be read and overridden until the transaction is committed,
/// see the cache option accessors such as [`ttl`](Self::ttl) and [`set_ttl`](Self::set_ttl).
pub struct Response {
    pub(crate) core: EntityCore,
    pub(crate) handle: ResponseHandle,
    status: u16,
    upstream: bool,
    pub(crate) storage_action: Option<StorageAction>,
    pub(crate) suggested: Option<Suggested>,
    pub(crate) overrides: Option<Box<CacheWriteOptions>>,
    pub(crate) body_transform: Option<BodyTransform>,
    /// The candidate's body, kept aside until the transaction is committed.
    pub(crate) stashed_body: Option<Body>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.core.url)
            .field("upstream", &self.upstream)
            .field("cache", &self.core.cache)
            .field("storage_action", &self.storage_action)
            .finish_non_exhaustive()
    }
}

impl Response {
    /// A locally built response. `status` must be in `200..=599`.
    pub fn new(ctx: &FetchContext, status: u16, body: Option<BodyInit>) -> Result<Self, FetchError> {
        if !(200..=599).contains(&status) {
            return Err(FetchError::type_error(format!("status {status} is not in the range 200 to 599")));
        }
        if body.is_some() && is_null_body_status(status) {
            return Err(FetchError::type_error(format!("response with status {status} cannot have a body")));
        }

        let handle = ctx.host().response_new()?;
        let mut response = Self::from_parts(ctx, handle, status, String::new(), Some(Headers::new()), None, false);
        if let Some(body) = body {
            let core = &mut response.core;
            let headers = core.headers.get_or_insert_with(Headers::new);
            body.attach(&mut core.body, headers)?;
        }
        Ok(response)
    }

    /// A network error response: status 0, no headers and no body.
    pub fn error(ctx: &FetchContext) -> Result<Self, FetchError> {
        let handle = ctx.host().response_new()?;
        Ok(Self::from_parts(ctx, handle, 0, String::new(), Some(Headers::new()), None, false))
    }

    /// Wraps what a backend answered with. Statuses that never carry a body get none.
    pub(crate) fn from_upstream(
        ctx: &FetchContext,
        url: &str,
        backend: Option<String>,
        raw: HostResponse,
    ) -> Result<Self, FetchError> {
        let status = ctx.host().response_status(raw.response)?;
        let body = (!is_null_body_status(status)).then_some(raw.body);
        let mut response = Self::from_parts(ctx, raw.response, status, url.to_string(), None, body, true);
        response.core.backend = backend;
        Ok(response)
    }

    fn from_parts(
        ctx: &FetchContext,
        handle: ResponseHandle,
        status: u16,
        url: String,
        headers: Option<Headers>,
        body: Option<BodyHandle>,
        upstream: bool,
    ) -> Self {
        let host = Rc::clone(ctx.host());
        let body = match body {
            Some(body) => Body::from_handle(host, body, ctx.config()),
            None => Body::absent(host, ctx.config()),
        };
        Self {
            core: EntityCore::new(ctx, url, headers, body),
            handle,
            status,
            upstream,
            storage_action: None,
            suggested: None,
            overrides: None,
            body_transform: None,
            stashed_body: None,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn ok(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    pub fn handle(&self) -> ResponseHandle {
        self.handle
    }

    /// Whether the response came from a backend rather than being built locally.
    pub fn is_upstream(&self) -> bool {
        self.upstream
    }

    /// The storage action of a candidate, `None` outside of a cache transaction.
    pub fn storage_action(&self) -> Option<StorageAction> {
        self.storage_action
    }

    pub fn cache_entry(&self) -> &CacheEntry {
        &self.core.cache
    }

    /// `None` without a cache lookup, `Some(false)` for a miss or an uncommitted candidate.
    pub fn cached(&self) -> Option<bool> {
        self.core.cache.cached()
    }

    pub fn stale(&self) -> Option<bool> {
        self.core.cache.stale()
    }

    /// Sets the `x-cache` and `x-cache-hits` headers from the lookup state of `entry` and marks
    /// the response's cache entry as terminal.
    ///
    /// Surrogate headers are meant for the edge only and are removed unless `forward_surrogate`.
    pub(crate) fn add_cache_headers(
        &mut self,
        entry: Option<&CacheHandle>,
        forward_surrogate: bool,
    ) -> Result<(), FetchError> {
        let host = self.core.host_rc();
        let state = match entry {
            Some(entry) => host.cache_state(entry)?,
            None => LookupState::default(),
        };
        let hits = match entry {
            Some(entry) if state.found => host.cache_hits(entry)?,
            _ => 0,
        };

        let headers = self.headers_mut()?;
        if state.found {
            headers.set("x-cache", "HIT")?;
            headers.set("x-cache-hits", &hits.to_string())?;
        } else {
            headers.set("x-cache", "MISS")?;
            headers.set("x-cache-hits", "0")?;
        }
        if !forward_surrogate {
            headers.delete(SURROGATE_KEY);
            headers.delete(SURROGATE_CONTROL);
        }

        self.core.cache = CacheEntry::Terminal(CacheOutcome::from(state));
        debug!(found = state.found, stale = state.stale, hits, "cache headers added");
        Ok(())
    }

    fn load_headers(&self) -> Result<HeaderMap, FetchError> {
        Ok(self.core.host().response_headers(self.handle)?)
    }

    fn write_head(&self, headers: &HeaderMap) -> Result<(), FetchError> {
        Ok(self.core.host().response_write_head(self.handle, self.status, headers)?)
    }
}

message_entity!(Response);

fn is_null_body_status(status: u16) -> bool {
    matches!(status, 101 | 204 | 205 | 304)
}
