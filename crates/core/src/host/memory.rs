use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use http::header::{AGE, CACHE_CONTROL, SET_COOKIE, VARY};
use http::{HeaderMap, Method};
use tracing::trace;

use crate::cache::{CacheWriteOptions, LookupState, NANOS_PER_SEC, StorageAction, parse_surrogate_keys};
use crate::host::{
    BodyHandle, CacheHandle, Host, HostCacheOverride, HostResponse, PendingHandle, RequestHandle, ResponseHandle,
};
use crate::protocol::HostError;

const DEFAULT_MAX_AGE_SECS: u64 = 3600;

/// What a registered backend does with a request.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Answers with the given head and body chunks.
    Respond { status: u16, headers: HeaderMap, chunks: Vec<Bytes> },
    /// Accepts the request, then fails while waiting.
    FailWait(HostError),
    /// Refuses the dispatch itself.
    FailSend(HostError),
}

impl Backend {
    pub fn respond<I, B>(status: u16, headers: HeaderMap, chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Backend::Respond { status, headers, chunks: chunks.into_iter().map(Into::into).collect() }
    }
}

/// A request head as the host sees it.
#[derive(Debug, Clone, Default)]
pub struct RequestRecord {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub cache_override: Option<HostCacheOverride>,
    pub head_writes: u32,
}

/// A request that reached a backend.
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub backend: String,
    pub request: RequestRecord,
    pub body: Bytes,
}

/// A recorded `cache_commit`.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub action: StorageAction,
    pub options: CacheWriteOptions,
    pub body: Bytes,
}

/// Observations about one cache transaction.
#[derive(Debug, Clone, Default)]
pub struct CacheReport {
    pub suggested_calls: u32,
    pub commits: Vec<CommitRecord>,
    pub close_calls: u32,
}

#[derive(Debug, Default)]
struct MemoryBody {
    chunks: VecDeque<Bytes>,
    closed: bool,
}

impl MemoryBody {
    fn snapshot(&self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].clone(),
            _ => {
                let mut buf = BytesMut::with_capacity(self.chunks.iter().map(Bytes::len).sum());
                self.chunks.iter().for_each(|chunk| buf.extend_from_slice(chunk));
                buf.freeze()
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryResponse {
    status: u16,
    headers: HeaderMap,
}

#[derive(Debug)]
struct MemoryCacheEntry {
    state: LookupState,
    hits: u64,
    open: bool,
    report: CacheReport,
}

#[derive(Debug, Default)]
struct State {
    next_id: u32,
    bodies: HashMap<u32, MemoryBody>,
    requests: HashMap<u32, RequestRecord>,
    responses: HashMap<u32, MemoryResponse>,
    pending: HashMap<u32, Result<HostResponse, HostError>>,
    backends: HashMap<String, Backend>,
    cache: HashMap<u32, MemoryCacheEntry>,
    sent: Vec<SentRequest>,
    cacheable_unsupported: bool,
    body_reads: u64,
}

impl State {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn body(&mut self, handle: BodyHandle) -> Result<&mut MemoryBody, HostError> {
        self.bodies.get_mut(&handle.as_u32()).ok_or(HostError::BadHandle)
    }

    fn new_body<I: IntoIterator<Item = Bytes>>(&mut self, chunks: I) -> BodyHandle {
        let id = self.next_id();
        let chunks = chunks.into_iter().filter(|chunk| !chunk.is_empty()).collect();
        self.bodies.insert(id, MemoryBody { chunks, closed: false });
        BodyHandle::new(id)
    }

    fn new_response(&mut self, status: u16, headers: HeaderMap) -> ResponseHandle {
        let id = self.next_id();
        self.responses.insert(id, MemoryResponse { status, headers });
        ResponseHandle::new(id)
    }

    fn response(&mut self, handle: ResponseHandle) -> Result<&mut MemoryResponse, HostError> {
        self.responses.get_mut(&handle.as_u32()).ok_or(HostError::BadHandle)
    }

    fn request(&mut self, handle: RequestHandle) -> Result<&mut RequestRecord, HostError> {
        self.requests.get_mut(&handle.as_u32()).ok_or(HostError::BadHandle)
    }

    fn open_entry(&mut self, handle: &CacheHandle) -> Result<&mut MemoryCacheEntry, HostError> {
        self.cache.get_mut(&handle.as_u32()).filter(|entry| entry.open).ok_or(HostError::BadHandle)
    }
}

/// A single threaded, in-memory [`Host`].
///
/// Bodies are queues of chunks, backends are canned answers and cache transactions record what
/// was asked of them. Suggested cache options are derived from the response head the way an edge
/// cache would: `cache-control` (`max-age`, `s-maxage`, `stale-while-revalidate`, `private`),
/// `age`, `surrogate-key` and `vary`.
#[derive(Debug, Default)]
pub struct MemoryHost {
    state: RefCell<State>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A readable body holding `chunks`, reads never cross chunk boundaries.
    pub fn body_from_chunks<I, B>(&self, chunks: I) -> BodyHandle
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.state.borrow_mut().new_body(chunks.into_iter().map(Into::into))
    }

    pub fn register_backend<S: Into<String>>(&self, name: S, backend: Backend) {
        self.state.borrow_mut().backends.insert(name.into(), backend);
    }

    /// A request that arrived from a client, as handed to the runtime.
    pub fn downstream_request(&self, method: Method, url: &str, headers: HeaderMap) -> RequestHandle {
        let mut state = self.state.borrow_mut();
        let id = state.next_id();
        state.requests.insert(
            id,
            RequestRecord { method, url: url.to_string(), headers, cache_override: None, head_writes: 0 },
        );
        RequestHandle::new(id)
    }

    /// Opens a transaction as a cache lookup would.
    pub fn open_transaction(&self, state: LookupState, hits: u64) -> CacheHandle {
        let mut inner = self.state.borrow_mut();
        let id = inner.next_id();
        inner.cache.insert(id, MemoryCacheEntry { state, hits, open: true, report: CacheReport::default() });
        CacheHandle::new(id)
    }

    /// Makes `request_is_cacheable` answer [`HostError::Unsupported`].
    pub fn set_cacheable_unsupported(&self, unsupported: bool) {
        self.state.borrow_mut().cacheable_unsupported = unsupported;
    }

    /// Remaining bytes of a body, without consuming them.
    pub fn body_contents(&self, body: BodyHandle) -> Option<Bytes> {
        self.state.borrow().bodies.get(&body.as_u32()).map(MemoryBody::snapshot)
    }

    pub fn body_is_closed(&self, body: BodyHandle) -> Option<bool> {
        self.state.borrow().bodies.get(&body.as_u32()).map(|b| b.closed)
    }

    pub fn body_exists(&self, body: BodyHandle) -> bool {
        self.state.borrow().bodies.contains_key(&body.as_u32())
    }

    pub fn request_record(&self, request: RequestHandle) -> Option<RequestRecord> {
        self.state.borrow().requests.get(&request.as_u32()).cloned()
    }

    pub fn response_head(&self, response: ResponseHandle) -> Option<(u16, HeaderMap)> {
        self.state.borrow().responses.get(&response.as_u32()).map(|r| (r.status, r.headers.clone()))
    }

    pub fn sent_requests(&self) -> Vec<SentRequest> {
        self.state.borrow().sent.clone()
    }

    pub fn cache_report(&self, entry_id: u32) -> Option<CacheReport> {
        self.state.borrow().cache.get(&entry_id).map(|entry| entry.report.clone())
    }

    /// Number of `body_read` calls served so far.
    pub fn body_reads(&self) -> u64 {
        self.state.borrow().body_reads
    }
}

impl Host for MemoryHost {
    fn body_new(&self) -> Result<BodyHandle, HostError> {
        Ok(self.state.borrow_mut().new_body(std::iter::empty()))
    }

    fn body_read(&self, body: BodyHandle, max_len: usize) -> Result<Bytes, HostError> {
        let mut state = self.state.borrow_mut();
        state.body_reads += 1;
        let body = state.body(body)?;
        let Some(front) = body.chunks.front_mut() else {
            return Ok(Bytes::new());
        };
        if front.len() > max_len {
            return Ok(front.split_to(max_len));
        }
        Ok(body.chunks.pop_front().unwrap_or_default())
    }

    fn body_write(&self, body: BodyHandle, chunk: &[u8]) -> Result<(), HostError> {
        let mut state = self.state.borrow_mut();
        let body = state.body(body)?;
        if body.closed {
            return Err(HostError::io("write to closed body"));
        }
        if !chunk.is_empty() {
            body.chunks.push_back(Bytes::copy_from_slice(chunk));
        }
        Ok(())
    }

    fn body_append(&self, dest: BodyHandle, src: BodyHandle) -> Result<(), HostError> {
        let mut state = self.state.borrow_mut();
        if dest == src {
            return Err(HostError::BadHandle);
        }
        state.body(dest)?;
        let src = state.bodies.remove(&src.as_u32()).ok_or(HostError::BadHandle)?;
        let dest = state.body(dest)?;
        dest.chunks.extend(src.chunks);
        Ok(())
    }

    fn body_close(&self, body: BodyHandle) -> Result<(), HostError> {
        self.state.borrow_mut().body(body)?.closed = true;
        Ok(())
    }

    fn body_known_length(&self, body: BodyHandle) -> Result<Option<u64>, HostError> {
        let mut state = self.state.borrow_mut();
        let body = state.body(body)?;
        Ok(Some(body.chunks.iter().map(|c| c.len() as u64).sum()))
    }

    fn request_new(&self) -> Result<RequestHandle, HostError> {
        let mut state = self.state.borrow_mut();
        let id = state.next_id();
        state.requests.insert(id, RequestRecord::default());
        Ok(RequestHandle::new(id))
    }

    fn request_headers(&self, request: RequestHandle) -> Result<HeaderMap, HostError> {
        Ok(self.state.borrow_mut().request(request)?.headers.clone())
    }

    fn request_write_head(
        &self,
        request: RequestHandle,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<(), HostError> {
        let mut state = self.state.borrow_mut();
        let record = state.request(request)?;
        record.method = method.clone();
        record.url = url.to_string();
        record.headers = headers.clone();
        record.head_writes += 1;
        Ok(())
    }

    fn request_cache_override(&self, request: RequestHandle, directive: &HostCacheOverride) -> Result<(), HostError> {
        self.state.borrow_mut().request(request)?.cache_override = Some(directive.clone());
        Ok(())
    }

    fn request_is_cacheable(&self, request: RequestHandle) -> Result<bool, HostError> {
        let mut state = self.state.borrow_mut();
        if state.cacheable_unsupported {
            return Err(HostError::Unsupported);
        }
        let record = state.request(request)?;
        Ok(record.method == Method::GET || record.method == Method::HEAD)
    }

    fn send(&self, request: RequestHandle, body: BodyHandle, backend: &str) -> Result<PendingHandle, HostError> {
        let mut state = self.state.borrow_mut();
        let behaviour = state
            .backends
            .get(backend)
            .cloned()
            .ok_or_else(|| HostError::unavailable(Some(format!("backend '{backend}' not found"))))?;
        if let Backend::FailSend(e) = behaviour {
            return Err(e);
        }

        let record = state.request(request)?.clone();
        let sent_body = state.bodies.remove(&body.as_u32()).ok_or(HostError::BadHandle)?.snapshot();
        trace!(backend, bytes = sent_body.len(), "memory host received request");
        state.sent.push(SentRequest { backend: backend.to_string(), request: record, body: sent_body });

        let result = match behaviour {
            Backend::Respond { status, headers, chunks } => {
                let response = state.new_response(status, headers);
                let body = state.new_body(chunks);
                Ok(HostResponse { response, body })
            }
            Backend::FailWait(e) | Backend::FailSend(e) => Err(e),
        };
        let id = state.next_id();
        state.pending.insert(id, result);
        Ok(PendingHandle::new(id))
    }

    fn wait(&self, pending: PendingHandle) -> Result<HostResponse, HostError> {
        self.state.borrow_mut().pending.remove(&pending.as_u32()).ok_or(HostError::BadHandle)?
    }

    fn response_new(&self) -> Result<ResponseHandle, HostError> {
        Ok(self.state.borrow_mut().new_response(200, HeaderMap::new()))
    }

    fn response_status(&self, response: ResponseHandle) -> Result<u16, HostError> {
        Ok(self.state.borrow_mut().response(response)?.status)
    }

    fn response_headers(&self, response: ResponseHandle) -> Result<HeaderMap, HostError> {
        Ok(self.state.borrow_mut().response(response)?.headers.clone())
    }

    fn response_write_head(&self, response: ResponseHandle, status: u16, headers: &HeaderMap) -> Result<(), HostError> {
        let mut state = self.state.borrow_mut();
        let record = state.response(response)?;
        record.status = status;
        record.headers = headers.clone();
        Ok(())
    }

    fn cache_state(&self, entry: &CacheHandle) -> Result<LookupState, HostError> {
        Ok(self.state.borrow_mut().open_entry(entry)?.state)
    }

    /// Hit counts only exist for entries the lookup found.
    fn cache_hits(&self, entry: &CacheHandle) -> Result<u64, HostError> {
        let mut state = self.state.borrow_mut();
        let entry = state.open_entry(entry)?;
        if !entry.state.found {
            return Err(HostError::Unsupported);
        }
        Ok(entry.hits)
    }

    fn cache_prepare_response_for_storage(
        &self,
        entry: &CacheHandle,
        response: ResponseHandle,
    ) -> Result<(StorageAction, ResponseHandle), HostError> {
        let mut state = self.state.borrow_mut();
        let found = state.open_entry(entry)?.state.found;
        let (status, headers) = {
            let raw = state.response(response)?;
            (raw.status, raw.headers.clone())
        };

        let cache_control = joined(&headers, CACHE_CONTROL.as_str());
        let action = if has_directive(&cache_control, "no-store") || has_directive(&cache_control, "private") {
            StorageAction::DoNotStore
        } else if found {
            StorageAction::Update
        } else {
            StorageAction::Insert
        };

        let mut rewritten = headers;
        rewritten.remove(http::header::CONNECTION);
        Ok((action, state.new_response(status, rewritten)))
    }

    fn cache_suggested_write_options(
        &self,
        entry: &CacheHandle,
        response: ResponseHandle,
    ) -> Result<CacheWriteOptions, HostError> {
        let mut state = self.state.borrow_mut();
        let headers = state.response(response)?.headers.clone();
        state.open_entry(entry)?.report.suggested_calls += 1;
        Ok(suggest(&headers))
    }

    fn cache_commit(
        &self,
        entry: &CacheHandle,
        action: StorageAction,
        _response: ResponseHandle,
        body: BodyHandle,
        options: &CacheWriteOptions,
    ) -> Result<(), HostError> {
        let mut state = self.state.borrow_mut();
        let body = state.body(body)?.snapshot();
        let record = CommitRecord { action, options: options.clone(), body };
        state.open_entry(entry)?.report.commits.push(record);
        Ok(())
    }

    fn cache_close(&self, entry: CacheHandle) -> Result<(), HostError> {
        let mut state = self.state.borrow_mut();
        let entry = state.open_entry(&entry)?;
        entry.open = false;
        entry.report.close_calls += 1;
        Ok(())
    }
}

fn joined(headers: &HeaderMap, name: &str) -> String {
    headers.get_all(name).iter().filter_map(|v| v.to_str().ok()).collect::<Vec<_>>().join(",")
}

fn directive<'a>(cache_control: &'a str, name: &str) -> Option<&'a str> {
    cache_control.split(',').map(str::trim).find_map(|part| match part.split_once('=') {
        Some((key, value)) if key.trim().eq_ignore_ascii_case(name) => Some(value.trim().trim_matches('"')),
        None if part.eq_ignore_ascii_case(name) => Some(""),
        _ => None,
    })
}

fn has_directive(cache_control: &str, name: &str) -> bool {
    directive(cache_control, name).is_some()
}

fn secs(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.parse::<u64>().ok())
}

fn suggest(headers: &HeaderMap) -> CacheWriteOptions {
    let cache_control = joined(headers, CACHE_CONTROL.as_str());
    let max_age = secs(directive(&cache_control, "s-maxage"))
        .or_else(|| secs(directive(&cache_control, "max-age")))
        .unwrap_or(DEFAULT_MAX_AGE_SECS);
    let swr = secs(directive(&cache_control, "stale-while-revalidate")).unwrap_or(0);
    let age = secs(headers.get(AGE).and_then(|v| v.to_str().ok())).unwrap_or(0);
    let surrogate_keys = parse_surrogate_keys(&joined(headers, "surrogate-key"));
    let vary = joined(headers, VARY.as_str())
        .split(',')
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    CacheWriteOptions {
        initial_age_ns: Some(age.saturating_mul(NANOS_PER_SEC)),
        max_age_ns: Some(max_age.saturating_add(age).saturating_mul(NANOS_PER_SEC)),
        stale_while_revalidate_ns: Some(swr.saturating_mul(NANOS_PER_SEC)),
        surrogate_keys: Some(surrogate_keys),
        vary_rule: Some(vary),
        sensitive_data: Some(has_directive(&cache_control, "private") || headers.contains_key(SET_COOKIE)),
        length: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn reads_respect_chunk_boundaries() {
        let host = MemoryHost::new();
        let body = host.body_from_chunks(["abcdef", "", "gh"]);

        assert_eq!(host.body_read(body, 4).unwrap(), Bytes::from_static(b"abcd"));
        assert_eq!(host.body_read(body, 4).unwrap(), Bytes::from_static(b"ef"));
        assert_eq!(host.body_read(body, 4).unwrap(), Bytes::from_static(b"gh"));
        assert!(host.body_read(body, 4).unwrap().is_empty());
        assert_eq!(host.body_reads(), 4);
    }

    #[test]
    fn append_consumes_source() {
        let host = MemoryHost::new();
        let dest = host.body_from_chunks(["a"]);
        let src = host.body_from_chunks(["b", "c"]);

        host.body_append(dest, src).unwrap();
        assert!(!host.body_exists(src));
        assert_eq!(host.body_contents(dest), Some(Bytes::from_static(b"abc")));
        assert_eq!(host.body_append(dest, src), Err(HostError::BadHandle));
    }

    #[test]
    fn suggestion_follows_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=60, stale-while-revalidate=10"));
        headers.insert(AGE, HeaderValue::from_static("5"));
        headers.insert("surrogate-key", HeaderValue::from_static("a  b"));
        headers.insert(VARY, HeaderValue::from_static("Accept, Accept-Encoding"));

        let options = suggest(&headers);
        assert_eq!(options.initial_age_ns, Some(5 * NANOS_PER_SEC));
        assert_eq!(options.max_age_ns, Some(65 * NANOS_PER_SEC));
        assert_eq!(options.stale_while_revalidate_ns, Some(10 * NANOS_PER_SEC));
        assert_eq!(options.surrogate_keys, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(options.vary_rule.as_deref(), Some("accept accept-encoding"));
        assert_eq!(options.sensitive_data, Some(false));
        assert!(options.is_complete());
    }

    #[test]
    fn closed_transaction_rejects_calls() {
        let host = MemoryHost::new();
        let entry = host.open_transaction(LookupState::default(), 0);
        let id = entry.as_u32();
        host.cache_state(&entry).unwrap();

        host.cache_close(entry).unwrap();
        let report = host.cache_report(id).unwrap();
        assert_eq!(report.close_calls, 1);
        assert_eq!(host.cache_state(&CacheHandle::new(id)), Err(HostError::BadHandle));
    }

    #[test]
    fn send_and_wait() {
        let host = MemoryHost::new();
        host.register_backend("origin", Backend::respond(201, HeaderMap::new(), ["ok"]));

        let request = host.request_new().unwrap();
        let body = host.body_from_chunks(["ping"]);
        let pending = host.send(request, body, "origin").unwrap();
        let response = host.wait(pending).unwrap();

        assert_eq!(host.response_status(response.response).unwrap(), 201);
        assert_eq!(host.body_contents(response.body), Some(Bytes::from_static(b"ok")));
        assert_eq!(host.sent_requests()[0].body, Bytes::from_static(b"ping"));

        let missing = host.send(request, host.body_new().unwrap(), "nowhere");
        assert!(matches!(missing, Err(HostError::Unavailable { message: Some(_) })));
    }
}
