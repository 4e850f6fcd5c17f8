//! Request and response entities over a [`Host`](micro_fetch_core::host::Host), with http cache
//! write negotiation.
//!
//! A [`Request`] is sent through its backend with [`Request::send`]. When the request carries an
//! open cache transaction, the response is handled as the transaction's candidate: the host
//! suggests cache write options, the request's [`CacheOverride`] and its [`AfterSend`] hook may
//! override them, and the transaction is committed before the response is returned.
//!
//! # Example
//! ```
//! use std::rc::Rc;
//!
//! use http::{HeaderMap, Method};
//! use micro_fetch::{CacheOverride, FetchContext, MessageEntity, ReadBody};
//! use micro_fetch_core::cache::LookupState;
//! use micro_fetch_core::host::{Backend, Host, MemoryHost};
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let memory = Rc::new(MemoryHost::new());
//! let mut headers = HeaderMap::new();
//! headers.insert("cache-control", "max-age=60".parse().unwrap());
//! memory.register_backend("origin", Backend::respond(200, headers, ["hello"]));
//!
//! let ctx = FetchContext::builder().host(Rc::clone(&memory) as Rc<dyn Host>).build().unwrap();
//! let mut request = ctx.request(Method::GET, "https://example.com/").unwrap();
//! request.set_backend("origin");
//! request.set_cache_transaction(memory.open_transaction(LookupState::default(), 0)).unwrap();
//! request.set_cache_override(CacheOverride::new().with_ttl(300));
//!
//! let mut response = request.send().await.unwrap();
//! assert_eq!(response.ttl().unwrap(), Some(300.0));
//! assert_eq!(response.headers().unwrap().get_str("x-cache"), Some("MISS"));
//! assert_eq!(response.text().await.unwrap(), "hello");
//! # });
//! ```

mod body;
mod cache_override;
mod context;
mod entity;
pub mod extract;
mod negotiate;
mod request;
mod response;
mod send;

pub use body::BodyInit;
pub use cache_override::{
    AfterSend, AfterSendFn, AfterSendOutcome, BodyTransform, CacheOverride, CacheOverrideMode, HookCache, after_send_fn,
};
pub use context::{ContextBuildError, FetchContext, FetchContextBuilder};
pub use entity::MessageEntity;
pub use extract::{FromBody, ReadBody};
pub use request::{CACHE_KEY_HEADER, Request, SendState};
pub use response::Response;

// re-export core types used in this crate's signatures
pub use micro_fetch_core::body::ReadableBody;
pub use micro_fetch_core::cache::{CacheEntry, CacheOutcome, CacheWriteOptions, StorageAction};
pub use micro_fetch_core::protocol::{FetchError, Headers};
