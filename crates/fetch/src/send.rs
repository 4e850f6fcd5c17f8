use micro_fetch_core::host::{CacheHandle, Host, HostResponse};
use micro_fetch_core::protocol::{FetchError, HostError};
use tracing::{debug, error};

use crate::cache_override::AfterSend;
use crate::entity::MessageEntity;
use crate::request::SendState;
use crate::{CacheOverride, FetchContext, Request, Response};

const FETCH_FAILED: &str = "failed to fetch resource";

/// Drives a request from dispatch to a finished response.
///
/// Requests carrying an open cache transaction have their response turned into the candidate of
/// that transaction: the storage action is derived, the request's cache directive and after-send
/// hook are applied, and the transaction is committed and closed before the response is handed
/// back.
pub(crate) struct SendPipeline<'a> {
    request: &'a mut Request,
}

impl<'a> SendPipeline<'a> {
    pub(crate) fn new(request: &'a mut Request) -> Self {
        Self { request }
    }

    pub(crate) async fn run(mut self) -> Result<Response, FetchError> {
        if self.request.state != SendState::Unsent {
            return Err(FetchError::invalid_state("request has already been sent"));
        }
        self.request.state = SendState::Pending;

        match self.dispatch().await {
            Ok(response) => {
                self.request.state = SendState::Resolved;
                Ok(response)
            }
            Err(e) => {
                debug!(url = %self.request.url(), cause = %e, "send failed");
                self.request.state = SendState::Errored;
                Err(e)
            }
        }
    }

    async fn dispatch(&mut self) -> Result<Response, FetchError> {
        let request = &mut *self.request;
        let ctx = request.core.ctx.clone();
        let host = ctx.host();

        let backend =
            request.core.backend.clone().ok_or_else(|| FetchError::type_error("request has no backend to send to"))?;

        request.commit_headers()?;
        if !request.core.cache.is_active()
            && let Some(directive) = &request.cache_override
        {
            host.request_cache_override(request.handle, &directive.host_directive())?;
        }

        let body = request.core.body.prepare_for_send().await?;
        let pending = host.send(request.handle, body, &backend).map_err(network_error)?;
        debug!(url = %request.url(), backend = %backend, "request dispatched");

        tokio::task::yield_now().await;
        let raw = host.wait(pending).map_err(network_error)?;

        let forward_surrogate = {
            let headers = request.headers()?;
            headers.contains("fastly-ff") || headers.contains("fastly-debug")
        };

        let Some(entry) = request.core.cache.take_active(None) else {
            let opted_out = request.core.cache.outcome().is_some();
            let mut response = Response::from_upstream(&ctx, request.url(), Some(backend), raw)?;
            if opted_out {
                response.add_cache_headers(None, forward_surrogate)?;
            }
            return Ok(response);
        };

        let mut response = candidate(&**host, &ctx, request.url(), backend, raw, entry)?;
        if let Err(e) = negotiate(&mut response, request.cache_override.as_ref(), forward_surrogate).await {
            response.core.close_cache_entry();
            return Err(e);
        }
        Ok(response)
    }
}

/// Builds the candidate response of `entry`. The transaction is released if that fails.
fn candidate(
    host: &dyn Host,
    ctx: &FetchContext,
    url: &str,
    backend: String,
    raw: HostResponse,
    entry: CacheHandle,
) -> Result<Response, FetchError> {
    let built = host
        .cache_prepare_response_for_storage(&entry, raw.response)
        .map_err(FetchError::from)
        .and_then(|(action, rewritten)| {
            let raw = HostResponse { response: rewritten, body: raw.body };
            Response::from_upstream(ctx, url, Some(backend), raw).map(|response| (action, response))
        });

    match built {
        Ok((action, mut response)) => {
            debug!(?action, "candidate response prepared for storage");
            response.begin_candidate(entry, action);
            Ok(response)
        }
        Err(e) => {
            if let Err(close) = host.cache_close(entry) {
                error!(cause = %close, "failed to close cache transaction");
            }
            Err(e)
        }
    }
}

async fn negotiate(
    response: &mut Response,
    directive: Option<&CacheOverride>,
    forward_surrogate: bool,
) -> Result<(), FetchError> {
    response.apply_set_cookie_heuristic()?;

    if let Some(directive) = directive {
        response.apply_cache_directive(directive)?;
        if let Some(hook) = directive.after_send() {
            let outcome = hook.after_send(response).await?;
            response.apply_after_send_outcome(outcome)?;
        }
    }

    let options = response.finalize_cache_options()?;
    response.commit_cache_transaction(options, forward_surrogate).await
}

fn network_error(e: HostError) -> FetchError {
    error!(cause = %e, "host failed to fetch");
    FetchError::network(e.message().unwrap_or(FETCH_FAILED))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_override::{AfterSendOutcome, after_send_fn};
    use crate::BodyInit;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use http::{HeaderMap, Method};
    use micro_fetch_core::body::ReadableBody;
    use micro_fetch_core::cache::{LookupState, NANOS_PER_SEC, StorageAction};
    use micro_fetch_core::host::{Backend, MemoryHost};
    use std::rc::Rc;

    const URL: &str = "https://example.com/resource";

    fn setup() -> (Rc<MemoryHost>, FetchContext) {
        let memory = Rc::new(MemoryHost::new());
        let ctx = FetchContext::new(Rc::clone(&memory) as Rc<dyn Host>);
        (memory, ctx)
    }

    fn header_map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, value.parse().unwrap());
        }
        map
    }

    fn origin(memory: &MemoryHost, pairs: &[(&'static str, &'static str)], body: &'static str) {
        memory.register_backend("origin", Backend::respond(200, header_map(pairs), [body]));
    }

    fn cached_request(memory: &MemoryHost, ctx: &FetchContext, lookup: LookupState, hits: u64) -> (Request, u32) {
        let mut request = Request::new(ctx, Method::GET, URL).unwrap().with_backend("origin");
        let entry = memory.open_transaction(lookup, hits);
        let id = entry.as_u32();
        request.set_cache_transaction(entry).unwrap();
        (request, id)
    }

    #[tokio::test]
    async fn plain_send_resolves() {
        let (memory, ctx) = setup();
        origin(&memory, &[("content-type", "text/plain")], "hi");

        let mut request = Request::new(&ctx, Method::GET, URL).unwrap().with_backend("origin");
        request.headers_mut().unwrap().set("accept", "text/plain").unwrap();
        let mut response = request.send().await.unwrap();

        assert_eq!(request.state(), SendState::Resolved);
        assert_eq!(response.status(), 200);
        assert!(response.is_upstream());
        assert_eq!(response.cached(), None);
        assert_eq!(response.storage_action(), None);
        assert_eq!(response.backend(), Some("origin"));
        assert_eq!(response.consume_body().await.unwrap(), Bytes::from_static(b"hi"));

        let sent = memory.sent_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].request.headers.get("accept").unwrap(), "text/plain");
        assert!(sent[0].body.is_empty());
    }

    #[tokio::test]
    async fn request_is_sent_once() {
        let (memory, ctx) = setup();
        origin(&memory, &[], "");
        let mut request = Request::new(&ctx, Method::GET, URL).unwrap().with_backend("origin");
        request.send().await.unwrap();

        assert!(matches!(request.send().await, Err(FetchError::InvalidState { .. })));
        assert_eq!(memory.sent_requests().len(), 1);
    }

    #[tokio::test]
    async fn missing_backend_is_type_error() {
        let (_, ctx) = setup();
        let mut request = Request::new(&ctx, Method::GET, URL).unwrap();
        assert!(matches!(request.send().await, Err(FetchError::Type { .. })));
        assert_eq!(request.state(), SendState::Errored);
    }

    #[tokio::test]
    async fn dispatch_failure_is_network_error() {
        let (_, ctx) = setup();
        let mut request = Request::new(&ctx, Method::GET, URL).unwrap().with_backend("nowhere");
        assert_eq!(request.send().await.unwrap_err(), FetchError::network("backend 'nowhere' not found"));
    }

    #[tokio::test]
    async fn wait_failure_uses_fallback_message() {
        let (memory, ctx) = setup();
        memory.register_backend("origin", Backend::FailWait(HostError::unavailable(None::<String>)));
        let mut request = Request::new(&ctx, Method::GET, URL).unwrap().with_backend("origin");

        assert_eq!(request.send().await.unwrap_err(), FetchError::network(FETCH_FAILED));
        assert_eq!(request.state(), SendState::Errored);
    }

    #[tokio::test]
    async fn opted_out_request_gets_miss_headers() {
        let (memory, ctx) = setup();
        origin(&memory, &[("surrogate-key", "a")], "x");
        let mut request = Request::new(&ctx, Method::GET, URL).unwrap().with_backend("origin");
        request.disable_caching();

        let mut response = request.send().await.unwrap();
        assert_eq!(response.cached(), Some(false));
        let headers = response.headers().unwrap();
        assert_eq!(headers.get_str("x-cache"), Some("MISS"));
        assert!(!headers.contains("surrogate-key"));
    }

    #[tokio::test]
    async fn directive_without_transaction_goes_to_host() {
        let (memory, ctx) = setup();
        origin(&memory, &[], "");
        let mut request = Request::new(&ctx, Method::GET, URL).unwrap().with_backend("origin");
        request.set_cache_override(CacheOverride::new().with_ttl(30).with_surrogate_key("k"));
        request.send().await.unwrap();

        let directive = memory.request_record(request.handle()).unwrap().cache_override.unwrap();
        assert!(!directive.pass);
        assert_eq!(directive.ttl, Some(30));
        assert_eq!(directive.surrogate_key.as_deref(), Some("k"));
    }

    #[tokio::test]
    async fn stream_body_is_pumped() {
        let (memory, ctx) = setup();
        origin(&memory, &[], "");
        let chunks = stream::iter(vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))]);
        let body = ReadableBody::from_stream(chunks, ctx.config());
        let mut request =
            Request::new(&ctx, Method::POST, URL).unwrap().with_backend("origin").with_body(body).unwrap();

        request.send().await.unwrap();
        assert!(request.body_used());
        assert_eq!(memory.sent_requests()[0].body, Bytes::from_static(b"abcd"));
    }

    #[tokio::test]
    async fn host_backed_body_moves_without_copy() {
        let (memory, ctx) = setup();
        origin(&memory, &[], "");
        let incoming = memory.body_from_chunks(["forwarded ", "payload"]);
        let handle = memory.downstream_request(Method::POST, URL, HeaderMap::new());
        let mut downstream = Request::downstream(&ctx, handle, Method::POST, URL, Some(incoming));

        let stream = downstream.body().unwrap().unwrap();
        let mut upstream = Request::new(&ctx, Method::POST, URL)
            .unwrap()
            .with_backend("origin")
            .with_body(BodyInit::Stream(stream.clone()))
            .unwrap();
        upstream.send().await.unwrap();

        assert_eq!(memory.body_reads(), 0);
        assert!(!memory.body_exists(incoming));
        assert_eq!(memory.sent_requests()[0].body, Bytes::from_static(b"forwarded payload"));
        assert!(stream.is_unusable());
        assert!(downstream.body_used());
    }

    #[tokio::test]
    async fn candidate_with_set_cookie_is_recorded_uncacheable() {
        let (memory, ctx) = setup();
        origin(&memory, &[("cache-control", "max-age=60"), ("set-cookie", "id=1")], "personal");
        let (mut request, id) = cached_request(&memory, &ctx, LookupState::default(), 0);

        let mut response = request.send().await.unwrap();
        let report = memory.cache_report(id).unwrap();
        assert_eq!(report.commits.len(), 1);
        assert_eq!(report.commits[0].action, StorageAction::RecordUncacheable);
        assert_eq!(report.close_calls, 1);

        assert_eq!(response.storage_action(), Some(StorageAction::RecordUncacheable));
        assert_eq!(response.cached(), Some(false));
        assert_eq!(response.headers().unwrap().get_str("x-cache"), Some("MISS"));
        assert_eq!(response.consume_body().await.unwrap(), Bytes::from_static(b"personal"));
    }

    #[tokio::test]
    async fn found_entry_is_updated() {
        let (memory, ctx) = setup();
        origin(&memory, &[("cache-control", "max-age=60"), ("surrogate-key", "a b")], "fresh");
        let (mut request, id) = cached_request(&memory, &ctx, LookupState { found: true, stale: true }, 3);
        request.headers_mut().unwrap().set("fastly-ff", "edge-1").unwrap();

        let mut response = request.send().await.unwrap();
        let commit = &memory.cache_report(id).unwrap().commits[0];
        assert_eq!(commit.action, StorageAction::Update);
        assert_eq!(commit.options.max_age_ns, Some(60 * NANOS_PER_SEC));
        assert_eq!(commit.options.length, Some(5));
        assert_eq!(commit.options.surrogate_keys, Some(vec!["a".to_string(), "b".to_string()]));

        assert_eq!(response.cached(), Some(true));
        assert_eq!(response.stale(), Some(true));
        let headers = response.headers().unwrap();
        assert_eq!(headers.get_str("x-cache"), Some("HIT"));
        assert_eq!(headers.get_str("x-cache-hits"), Some("3"));
        assert_eq!(headers.get_str("surrogate-key"), Some("a b"));
    }

    #[tokio::test]
    async fn directive_applies_to_candidate() {
        let (memory, ctx) = setup();
        origin(&memory, &[("cache-control", "max-age=60"), ("age", "4")], "x");
        let (mut request, id) = cached_request(&memory, &ctx, LookupState::default(), 0);
        request.set_cache_override(CacheOverride::new().with_ttl(10).with_pci(true));

        let mut response = request.send().await.unwrap();
        let commit = &memory.cache_report(id).unwrap().commits[0];
        assert_eq!(commit.options.max_age_ns, Some(14 * NANOS_PER_SEC));
        assert_eq!(commit.options.sensitive_data, Some(true));
        assert!(memory.request_record(request.handle()).unwrap().cache_override.is_none());
        assert_eq!(response.ttl().unwrap(), Some(10.0));
    }

    struct RaiseTtl;

    #[async_trait(?Send)]
    impl AfterSend for RaiseTtl {
        async fn after_send(&self, candidate: &mut Response) -> Result<Option<AfterSendOutcome>, FetchError> {
            tokio::task::yield_now().await;
            assert_eq!(candidate.ttl()?, Some(60.0));
            candidate.set_ttl(120.0)?;
            candidate.headers_mut()?.set("x-hooked", "1")?;
            Ok(Some(AfterSendOutcome::new().with_cache("uncacheable")))
        }
    }

    #[tokio::test]
    async fn hook_sets_options_and_action() {
        let (memory, ctx) = setup();
        origin(&memory, &[("cache-control", "max-age=60")], "x");
        let (mut request, id) = cached_request(&memory, &ctx, LookupState::default(), 0);
        request.set_cache_override(CacheOverride::new().with_after_send(RaiseTtl));

        let mut response = request.send().await.unwrap();
        let report = memory.cache_report(id).unwrap();
        assert_eq!(report.commits[0].action, StorageAction::RecordUncacheable);
        assert_eq!(report.commits[0].options.max_age_ns, Some(120 * NANOS_PER_SEC));
        assert_eq!(report.suggested_calls, 2);
        assert_eq!(response.headers().unwrap().get_str("x-hooked"), Some("1"));
    }

    #[tokio::test]
    async fn hook_returning_nothing_keeps_action() {
        let (memory, ctx) = setup();
        origin(&memory, &[], "x");
        let (mut request, id) = cached_request(&memory, &ctx, LookupState::default(), 0);
        request.set_cache_override(CacheOverride::new().with_after_send(after_send_fn(|_| Ok(None))));

        request.send().await.unwrap();
        assert_eq!(memory.cache_report(id).unwrap().commits[0].action, StorageAction::Insert);
    }

    #[tokio::test]
    async fn invalid_hook_label_rejects_and_closes() {
        let (memory, ctx) = setup();
        origin(&memory, &[], "x");
        let (mut request, id) = cached_request(&memory, &ctx, LookupState::default(), 0);
        let hook = after_send_fn(|_| Ok(Some(AfterSendOutcome::new().with_cache("anything-else"))));
        request.set_cache_override(CacheOverride::new().with_after_send(hook));

        assert!(matches!(request.send().await, Err(FetchError::Type { .. })));
        let report = memory.cache_report(id).unwrap();
        assert!(report.commits.is_empty());
        assert_eq!(report.close_calls, 1);
        assert_eq!(request.state(), SendState::Errored);
    }

    #[tokio::test]
    async fn rejected_hook_propagates_reason() {
        let (memory, ctx) = setup();
        origin(&memory, &[], "x");
        let (mut request, id) = cached_request(&memory, &ctx, LookupState::default(), 0);
        let hook = after_send_fn(|_| Err(FetchError::invalid_state("hook failed")));
        request.set_cache_override(CacheOverride::new().with_after_send(hook));

        assert_eq!(request.send().await.unwrap_err(), FetchError::invalid_state("hook failed"));
        assert_eq!(memory.cache_report(id).unwrap().close_calls, 1);
    }
}
