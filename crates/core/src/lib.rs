//! Host body handles, a pull based byte stream bridge and http cache primitives.
//!
//! This crate is the lower half of `micro-fetch`. It knows nothing about requests or
//! responses; it only provides the pieces those entities are assembled from:
//!
//! - [`host`]: the [`Host`](host::Host) facade, an opaque boundary exposing body handles,
//!   transport dispatch and cache transactions, plus an in-memory [`MemoryHost`](host::MemoryHost)
//! - [`body`]: the byte stream bridge. A host body handle becomes a lazily pulled
//!   [`ReadableBody`](body::ReadableBody), and any content stream can be pumped back into a handle.
//!   Bodies can be teed, piped through an identity transform and drained into one buffer
//! - [`cache`]: cache write options and the tri-state cache entry slot
//! - [`protocol`]: the error taxonomy and the generation-tracked [`Headers`](protocol::Headers)
//! - [`config`]: bridge configuration such as the host read chunk size
//!
//! Everything in this crate is single threaded: handles are shared with `Rc` and
//! all asynchronous work is driven by a cooperative scheduler on one thread.
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//! use futures::StreamExt;
//! use micro_fetch_core::body::ReadableBody;
//! use micro_fetch_core::config::BridgeConfig;
//! use micro_fetch_core::host::{Host, MemoryHost};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let host = Rc::new(MemoryHost::new());
//! let handle = host.body_from_chunks(["hello ", "world"]);
//!
//! let host: Rc<dyn Host> = host;
//! let body = ReadableBody::from_host(host, handle, BridgeConfig::default());
//! let mut reader = body.reader().unwrap();
//! while let Some(chunk) = reader.next().await {
//!     print!("{}", String::from_utf8_lossy(&chunk.unwrap()));
//! }
//! # }
//! ```

pub mod body;
pub mod cache;
pub mod config;
pub mod host;
pub mod protocol;

mod utils;
pub(crate) use utils::ensure;
