//! The host facade.
//!
//! Every byte of a body, every dispatched request and every cache transaction lives behind an
//! opaque handle owned by the host runtime. [`Host`] is the complete call surface this workspace
//! consumes. Calls are synchronous and return typed [`HostError`]s, the bridge and the entities
//! translate those into [`FetchError`](crate::protocol::FetchError)s at the boundary.
//!
//! Handles are plain ids. [`CacheHandle`] is neither `Clone` nor `Copy`:
//! [`Host::cache_close`] consumes it, so a transaction can only be released once.

use bytes::Bytes;
use http::{HeaderMap, Method};

use crate::cache::{CacheWriteOptions, LookupState, StorageAction};
use crate::protocol::HostError;

mod memory;
pub use memory::{Backend, CacheReport, CommitRecord, MemoryHost, RequestRecord, SentRequest};

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, PartialEq, Eq, Hash)]
        pub struct $name(u32);

        impl $name {
            pub const fn new(id: u32) -> Self {
                Self(id)
            }

            #[inline]
            pub const fn as_u32(&self) -> u32 {
                self.0
            }
        }
    };
}

handle!(
    /// A host byte stream.
    #[derive(Clone, Copy)]
    BodyHandle
);
handle!(
    /// A request head owned by the host.
    #[derive(Clone, Copy)]
    RequestHandle
);
handle!(
    /// A response head owned by the host.
    #[derive(Clone, Copy)]
    ResponseHandle
);
handle!(
    /// Token for a dispatched request, redeemed once by [`Host::wait`].
    PendingHandle
);
handle!(
    /// An open cache transaction, released once by [`Host::cache_close`].
    CacheHandle
);

/// The response head and body handle a pending send resolved to.
#[derive(Debug, PartialEq, Eq)]
pub struct HostResponse {
    pub response: ResponseHandle,
    pub body: BodyHandle,
}

/// A cache control directive applied to a request outside of a cache transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostCacheOverride {
    pub pass: bool,
    pub ttl: Option<u32>,
    pub swr: Option<u32>,
    pub surrogate_key: Option<String>,
    pub pci: bool,
}

/// The host call surface.
#[cfg_attr(test, mockall::automock)]
pub trait Host {
    /// Creates an empty, writable body.
    fn body_new(&self) -> Result<BodyHandle, HostError>;

    /// Reads at most `max_len` bytes, an empty result is end of stream.
    fn body_read(&self, body: BodyHandle, max_len: usize) -> Result<Bytes, HostError>;

    fn body_write(&self, body: BodyHandle, chunk: &[u8]) -> Result<(), HostError>;

    /// Moves all of `src` to the end of `dest`. `src` is consumed.
    fn body_append(&self, dest: BodyHandle, src: BodyHandle) -> Result<(), HostError>;

    fn body_close(&self, body: BodyHandle) -> Result<(), HostError>;

    fn body_known_length(&self, body: BodyHandle) -> Result<Option<u64>, HostError>;

    fn request_new(&self) -> Result<RequestHandle, HostError>;

    fn request_headers(&self, request: RequestHandle) -> Result<HeaderMap, HostError>;

    fn request_write_head(
        &self,
        request: RequestHandle,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<(), HostError>;

    fn request_cache_override(&self, request: RequestHandle, directive: &HostCacheOverride) -> Result<(), HostError>;

    fn request_is_cacheable(&self, request: RequestHandle) -> Result<bool, HostError>;

    fn send(&self, request: RequestHandle, body: BodyHandle, backend: &str) -> Result<PendingHandle, HostError>;

    fn wait(&self, pending: PendingHandle) -> Result<HostResponse, HostError>;

    fn response_new(&self) -> Result<ResponseHandle, HostError>;

    fn response_status(&self, response: ResponseHandle) -> Result<u16, HostError>;

    fn response_headers(&self, response: ResponseHandle) -> Result<HeaderMap, HostError>;

    fn response_write_head(&self, response: ResponseHandle, status: u16, headers: &HeaderMap) -> Result<(), HostError>;

    fn cache_state(&self, entry: &CacheHandle) -> Result<LookupState, HostError>;

    fn cache_hits(&self, entry: &CacheHandle) -> Result<u64, HostError>;

    /// Returns the suggested storage action and a response head rewritten for storage.
    fn cache_prepare_response_for_storage(
        &self,
        entry: &CacheHandle,
        response: ResponseHandle,
    ) -> Result<(StorageAction, ResponseHandle), HostError>;

    /// Fully populated write options derived from the response head.
    fn cache_suggested_write_options(
        &self,
        entry: &CacheHandle,
        response: ResponseHandle,
    ) -> Result<CacheWriteOptions, HostError>;

    fn cache_commit(
        &self,
        entry: &CacheHandle,
        action: StorageAction,
        response: ResponseHandle,
        body: BodyHandle,
        options: &CacheWriteOptions,
    ) -> Result<(), HostError>;

    fn cache_close(&self, entry: CacheHandle) -> Result<(), HostError>;
}
