use std::fmt;
use std::rc::Rc;

use http::{HeaderMap, Method};
use micro_fetch_core::body::Body;
use micro_fetch_core::cache::{CacheEntry, CacheOutcome};
use micro_fetch_core::host::{BodyHandle, CacheHandle, Host, RequestHandle};
use micro_fetch_core::protocol::{FetchError, HostError, Headers};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::body::BodyInit;
use crate::entity::{EntityCore, MessageEntity, message_entity};
use crate::send::SendPipeline;
use crate::{CacheOverride, FetchContext, Response};

/// Header the cache key digest is carried in.
pub const CACHE_KEY_HEADER: &str = "fastly-xqd-cache-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Unsent,
    Pending,
    Resolved,
    Errored,
}

/// An outgoing or downstream request.
pub struct Request {
    pub(crate) core: EntityCore,
    pub(crate) handle: RequestHandle,
    method: Method,
    downstream: bool,
    pub(crate) cache_override: Option<CacheOverride>,
    pub(crate) state: SendState,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.core.url)
            .field("backend", &self.core.backend)
            .field("downstream", &self.downstream)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Request {
    /// A fresh request with an empty header list and no body.
    pub fn new(ctx: &FetchContext, method: Method, url: &str) -> Result<Self, FetchError> {
        let handle = ctx.host().request_new()?;
        let body = Body::absent(Rc::clone(ctx.host()), ctx.config());
        Ok(Self::from_parts(ctx, handle, method, url, Some(Headers::new()), body, false))
    }

    /// Wraps a request that arrived from a client. Its headers stay on the host until accessed.
    pub fn downstream(
        ctx: &FetchContext,
        handle: RequestHandle,
        method: Method,
        url: &str,
        body: Option<BodyHandle>,
    ) -> Self {
        let host = Rc::clone(ctx.host());
        let body = match body {
            Some(body) => Body::from_handle(host, body, ctx.config()),
            None => Body::absent(host, ctx.config()),
        };
        Self::from_parts(ctx, handle, method, url, None, body, true)
    }

    fn from_parts(
        ctx: &FetchContext,
        handle: RequestHandle,
        method: Method,
        url: &str,
        headers: Option<Headers>,
        body: Body,
        downstream: bool,
    ) -> Self {
        Self {
            core: EntityCore::new(ctx, url.to_string(), headers, body),
            handle,
            method,
            downstream,
            cache_override: None,
            state: SendState::Unsent,
        }
    }

    pub fn with_body<B: Into<BodyInit>>(mut self, body: B) -> Result<Self, FetchError> {
        self.set_body(body)?;
        Ok(self)
    }

    pub fn with_backend<S: Into<String>>(mut self, backend: S) -> Self {
        self.set_backend(backend);
        self
    }

    pub fn set_body<B: Into<BodyInit>>(&mut self, body: B) -> Result<(), FetchError> {
        self.headers_mut()?;
        let core = &mut self.core;
        let headers = core.headers.as_mut().ok_or_else(|| FetchError::invalid_state("headers unavailable"))?;
        body.into().attach(&mut core.body, headers)
    }

    pub fn set_backend<S: Into<String>>(&mut self, backend: S) {
        self.core.backend = Some(backend.into());
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn is_downstream(&self) -> bool {
        self.downstream
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    pub fn cache_override(&self) -> Option<&CacheOverride> {
        self.cache_override.as_ref()
    }

    pub fn set_cache_override(&mut self, directive: CacheOverride) {
        self.cache_override = Some(directive);
    }

    /// Sets the cache key to the upper-case hex SHA-256 digest of `key`.
    pub fn set_cache_key(&mut self, key: &str) -> Result<(), FetchError> {
        let digest = hex::encode_upper(Sha256::digest(key.as_bytes()));
        self.headers_mut()?.set(CACHE_KEY_HEADER, &digest)
    }

    /// Hands an open cache transaction to this request. The response it is sent for becomes the
    /// candidate of that transaction.
    pub fn set_cache_transaction(&mut self, entry: CacheHandle) -> Result<(), FetchError> {
        if !matches!(self.core.cache, CacheEntry::NoCache) {
            if let Err(e) = self.core.host().cache_close(entry) {
                warn!(cause = %e, "failed to close rejected cache transaction");
            }
            return Err(FetchError::invalid_state("request already has a cache entry"));
        }
        self.core.cache = CacheEntry::Active(entry);
        Ok(())
    }

    /// Opts the request out of the cache. The response still gets `x-cache: MISS`.
    pub fn disable_caching(&mut self) {
        self.core.close_cache_entry();
        self.core.cache = CacheEntry::Terminal(CacheOutcome::Miss);
    }

    pub fn cache_entry(&self) -> &CacheEntry {
        &self.core.cache
    }

    /// Whether the host considers this request cacheable, `None` when the host can't tell.
    pub fn is_cacheable(&mut self) -> Result<Option<bool>, FetchError> {
        self.commit_headers()?;
        match self.core.host().request_is_cacheable(self.handle) {
            Ok(cacheable) => Ok(Some(cacheable)),
            Err(HostError::Unsupported) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Copies the request. A body is split so that both copies can read it.
    pub fn clone_request(&mut self) -> Result<Request, FetchError> {
        if self.core.body.is_used() {
            return Err(FetchError::invalid_state("the request's body isn't usable"));
        }
        let headers = self.headers()?.clone();
        let body = self.core.body.tee()?;
        let handle = self.core.host().request_new()?;

        let mut copy = Self::from_parts(&self.core.ctx, handle, self.method.clone(), &self.core.url, Some(headers), body, false);
        copy.core.backend = self.core.backend.clone();
        copy.cache_override = self.cache_override.clone();
        Ok(copy)
    }

    /// Dispatches the request to its backend.
    ///
    /// With an open cache transaction the response is run through the cache write negotiation
    /// and committed before it is returned.
    pub async fn send(&mut self) -> Result<Response, FetchError> {
        SendPipeline::new(self).run().await
    }

    fn load_headers(&self) -> Result<HeaderMap, FetchError> {
        debug!(url = %self.core.url, "loading request headers from host");
        Ok(self.core.host().request_headers(self.handle)?)
    }

    fn write_head(&self, headers: &HeaderMap) -> Result<(), FetchError> {
        Ok(self.core.host().request_write_head(self.handle, &self.method, &self.core.url, headers)?)
    }
}

message_entity!(Request);

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use micro_fetch_core::cache::LookupState;
    use micro_fetch_core::host::MemoryHost;

    fn context() -> (Rc<MemoryHost>, FetchContext) {
        let memory = Rc::new(MemoryHost::new());
        let host: Rc<dyn Host> = Rc::clone(&memory) as Rc<dyn Host>;
        (memory, FetchContext::new(host))
    }

    #[test]
    fn headers_are_written_once_per_generation() {
        let (memory, ctx) = context();
        let mut request = Request::new(&ctx, Method::GET, "https://example.com/").unwrap();
        request.headers_mut().unwrap().set("accept", "text/html").unwrap();

        request.commit_headers().unwrap();
        request.commit_headers().unwrap();
        let record = memory.request_record(request.handle()).unwrap();
        assert_eq!(record.head_writes, 1);
        assert_eq!(record.headers.get("accept").unwrap(), "text/html");
        assert_eq!(record.url, "https://example.com/");

        request.headers_mut().unwrap().append("accept", "text/plain").unwrap();
        request.commit_headers().unwrap();
        assert_eq!(memory.request_record(request.handle()).unwrap().head_writes, 2);
    }

    #[test]
    fn downstream_headers_are_lazy() {
        let (memory, ctx) = context();
        let mut map = HeaderMap::new();
        map.insert("x-client", "1".parse().unwrap());
        let handle = memory.downstream_request(Method::GET, "https://example.com/a", map);
        let mut request = Request::downstream(&ctx, handle, Method::GET, "https://example.com/a", None);

        request.commit_headers().unwrap();
        assert_eq!(memory.request_record(handle).unwrap().head_writes, 0);

        assert_eq!(request.headers().unwrap().get_str("x-client"), Some("1"));
        request.commit_headers().unwrap();
        assert_eq!(memory.request_record(handle).unwrap().head_writes, 0);
        assert!(request.is_downstream());
    }

    #[test]
    fn cache_key_is_upper_hex_sha256() {
        let (_, ctx) = context();
        let mut request = Request::new(&ctx, Method::GET, "https://example.com/").unwrap();
        request.set_cache_key("abc").unwrap();
        assert_eq!(
            request.headers().unwrap().get_str(CACHE_KEY_HEADER),
            Some("BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD")
        );
    }

    #[test]
    fn cacheable_reflects_method_and_support() {
        let (memory, ctx) = context();
        let mut get = Request::new(&ctx, Method::GET, "https://example.com/").unwrap();
        let mut post = Request::new(&ctx, Method::POST, "https://example.com/").unwrap();
        assert_eq!(get.is_cacheable().unwrap(), Some(true));
        assert_eq!(post.is_cacheable().unwrap(), Some(false));

        memory.set_cacheable_unsupported(true);
        assert_eq!(get.is_cacheable().unwrap(), None);
    }

    #[tokio::test]
    async fn clone_splits_body() {
        let (_, ctx) = context();
        let mut request = Request::new(&ctx, Method::POST, "https://example.com/")
            .unwrap()
            .with_backend("origin")
            .with_body("payload")
            .unwrap();

        let mut copy = request.clone_request().unwrap();
        assert_eq!(copy.backend(), Some("origin"));
        assert_eq!(copy.headers().unwrap().get_str("content-type"), Some("text/plain;charset=UTF-8"));
        assert_eq!(copy.consume_body().await.unwrap(), Bytes::from_static(b"payload"));
        assert_eq!(request.consume_body().await.unwrap(), Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn clone_of_used_body_fails() {
        let (_, ctx) = context();
        let mut request = Request::new(&ctx, Method::POST, "https://example.com/").unwrap().with_body("x").unwrap();
        request.consume_body().await.unwrap();
        assert_eq!(
            request.clone_request().unwrap_err(),
            FetchError::invalid_state("the request's body isn't usable")
        );
    }

    #[test]
    fn second_transaction_is_rejected() {
        let (memory, ctx) = context();
        let mut request = Request::new(&ctx, Method::GET, "https://example.com/").unwrap();
        let first = memory.open_transaction(LookupState::default(), 0);
        let first_id = first.as_u32();
        request.set_cache_transaction(first).unwrap();

        let second = memory.open_transaction(LookupState::default(), 0);
        let second_id = second.as_u32();
        request.set_cache_transaction(second).unwrap_err();
        assert_eq!(memory.cache_report(second_id).unwrap().close_calls, 1);

        drop(request);
        assert_eq!(memory.cache_report(first_id).unwrap().close_calls, 1);
    }
}
