//! State and behaviour shared by [`Request`](crate::Request) and [`Response`](crate::Response).

use std::future::Future;
use std::rc::Rc;

use bytes::Bytes;
use micro_fetch_core::body::{Body, ReadableBody};
use micro_fetch_core::cache::CacheEntry;
use micro_fetch_core::config::BridgeConfig;
use micro_fetch_core::host::Host;
use micro_fetch_core::protocol::{FetchError, GenerationMark, Headers};
use tracing::{error, warn};

use crate::FetchContext;

pub(crate) struct EntityCore {
    pub(crate) ctx: FetchContext,
    pub(crate) url: String,
    pub(crate) backend: Option<String>,
    /// Materialized on first access, `None` means the host copy is authoritative.
    pub(crate) headers: Option<Headers>,
    pub(crate) committed: GenerationMark,
    pub(crate) body: Body,
    pub(crate) cache: CacheEntry,
}

impl EntityCore {
    pub(crate) fn new(ctx: &FetchContext, url: String, headers: Option<Headers>, body: Body) -> Self {
        Self {
            ctx: ctx.clone(),
            url,
            backend: None,
            headers,
            committed: GenerationMark::new(),
            body,
            cache: CacheEntry::NoCache,
        }
    }

    pub(crate) fn host(&self) -> &dyn Host {
        &**self.ctx.host()
    }

    pub(crate) fn host_rc(&self) -> Rc<dyn Host> {
        Rc::clone(self.ctx.host())
    }

    pub(crate) fn config(&self) -> BridgeConfig {
        self.ctx.config()
    }

    pub(crate) fn empty_body(&self) -> Body {
        Body::absent(self.host_rc(), self.config())
    }

    /// Generation of the local headers, host-loaded headers that were never touched count as 0.
    pub(crate) fn headers_generation(&self) -> u32 {
        self.headers.as_ref().map_or(0, Headers::generation)
    }

    /// Releases an open cache transaction, logging rather than returning host failures.
    pub(crate) fn close_cache_entry(&mut self) {
        if let Some(entry) = self.cache.take_active(None) {
            let id = entry.as_u32();
            if let Err(e) = self.ctx.host().cache_close(entry) {
                error!(entry = id, cause = %e, "failed to close cache transaction");
            }
        }
    }
}

impl Drop for EntityCore {
    fn drop(&mut self) {
        if self.cache.is_active() {
            warn!(url = %self.url, "entity dropped with an open cache transaction");
            self.close_cache_entry();
        }
    }
}

/// Operations available on both requests and responses.
pub trait MessageEntity {
    fn url(&self) -> &str;

    fn backend(&self) -> Option<&str>;

    /// The header list, loaded from the host on first access.
    fn headers(&mut self) -> Result<&Headers, FetchError>;

    fn headers_mut(&mut self) -> Result<&mut Headers, FetchError>;

    /// Writes the header list to the host if it changed since the last write.
    fn commit_headers(&mut self) -> Result<(), FetchError>;

    fn has_body(&self) -> bool;

    fn body_used(&self) -> bool;

    /// The body as a readable stream, `None` when there is no body.
    fn body(&mut self) -> Result<Option<ReadableBody>, FetchError>;

    /// Reads the whole body. Fails with [`FetchError::AlreadyConsumed`] on a second call.
    fn consume_body(&mut self) -> impl Future<Output = Result<Bytes, FetchError>>;
}

/// Implements [`MessageEntity`] for a type with a `core: EntityCore` field and the inherent
/// `load_headers` and `write_head` hooks.
macro_rules! message_entity {
    ($ty:ty) => {
        impl $crate::entity::MessageEntity for $ty {
            fn url(&self) -> &str {
                &self.core.url
            }

            fn backend(&self) -> Option<&str> {
                self.core.backend.as_deref()
            }

            fn headers(&mut self) -> Result<&micro_fetch_core::protocol::Headers, micro_fetch_core::protocol::FetchError> {
                <Self as $crate::entity::MessageEntity>::headers_mut(self).map(|headers| &*headers)
            }

            fn headers_mut(
                &mut self,
            ) -> Result<&mut micro_fetch_core::protocol::Headers, micro_fetch_core::protocol::FetchError> {
                let headers = match self.core.headers.take() {
                    Some(headers) => headers,
                    None => {
                        let loaded = micro_fetch_core::protocol::Headers::from_map(self.load_headers()?);
                        // the host already holds what was just loaded
                        self.core.committed.compare_bump(loaded.generation());
                        loaded
                    }
                };
                Ok(self.core.headers.insert(headers))
            }

            fn commit_headers(&mut self) -> Result<(), micro_fetch_core::protocol::FetchError> {
                let Some(headers) = &self.core.headers else {
                    return Ok(());
                };
                let generation = headers.generation();
                if self.core.committed.is_current(generation) {
                    return Ok(());
                }
                self.write_head(headers.as_map())?;
                self.core.committed.compare_bump(generation);
                tracing::trace!(url = %self.core.url, generation, "headers written to host");
                Ok(())
            }

            fn has_body(&self) -> bool {
                self.core.body.has_body()
            }

            fn body_used(&self) -> bool {
                self.core.body.is_used()
            }

            fn body(
                &mut self,
            ) -> Result<Option<micro_fetch_core::body::ReadableBody>, micro_fetch_core::protocol::FetchError> {
                self.core.body.stream()
            }

            async fn consume_body(&mut self) -> Result<bytes::Bytes, micro_fetch_core::protocol::FetchError> {
                self.core.body.consume().await
            }
        }
    };
}

pub(crate) use message_entity;
