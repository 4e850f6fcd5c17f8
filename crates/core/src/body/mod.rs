//! The byte stream bridge and body aggregation.
//!
//! A message body lives in the host as a [`BodyHandle`]. This module turns it into something
//! Rust code can consume and produce:
//!
//! - [`ReadableBody`] / [`BodyReader`]: a pull driven stream over a host handle or over
//!   in-process content. Host reads are deferred to the scheduler, a zero length read ends the
//!   stream and cancellation is a no-op for the host
//! - [`TransformStream`]: an identity transform. Piping a host backed stream into a transform
//!   whose readable end became another body appends the host bodies instead of copying bytes
//! - [`pump_into_handle`]: the reverse direction, content stream into host handle
//! - [`read_all_from_handle`] / [`drain_stream`]: aggregate a whole body into one buffer
//! - [`Body`]: the body slot of a request or response, tracking whether it is absent, a bare
//!   handle or a stream, and whether it was used
//!
//! # Ownership
//!
//! Handles move, they are never shared. [`ReadableBody::take_host_handle`] and the append
//! short-circuit clear the source in the same step the destination receives the handle, so no
//! second consumer can observe a moved handle.

mod aggregate;
mod sink;
mod stream;
mod tee;
mod transform;

pub use aggregate::{drain_stream, read_all_from_handle};
pub use sink::pump_into_handle;
pub use stream::{BodyReader, ReadableBody};
pub use transform::TransformStream;

use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
use tracing::debug;

use crate::config::BridgeConfig;
use crate::ensure;
use crate::host::{BodyHandle, Host};
use crate::protocol::{FetchError, PayloadSize};

#[derive(Debug)]
enum BodyKind {
    Absent,
    Handle,
    Stream(ReadableBody),
}

/// The body slot of an entity.
///
/// Holds the entity's own host handle and what the body currently is: absent, readable through
/// that handle, or a [`ReadableBody`]. A body is consumed at most once, by
/// [`consume`](Self::consume), [`prepare_for_send`](Self::prepare_for_send) or by reading its stream.
pub struct Body {
    host: Rc<dyn Host>,
    handle: Option<BodyHandle>,
    kind: BodyKind,
    used: bool,
    config: BridgeConfig,
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("used", &self.used)
            .finish_non_exhaustive()
    }
}

impl Body {
    pub fn absent(host: Rc<dyn Host>, config: BridgeConfig) -> Self {
        Self { host, handle: None, kind: BodyKind::Absent, used: false, config }
    }

    /// A body readable through `handle`.
    pub fn from_handle(host: Rc<dyn Host>, handle: BodyHandle, config: BridgeConfig) -> Self {
        Self { host, handle: Some(handle), kind: BodyKind::Handle, used: false, config }
    }

    pub fn host(&self) -> &Rc<dyn Host> {
        &self.host
    }

    pub fn config(&self) -> BridgeConfig {
        self.config
    }

    #[inline]
    pub fn has_body(&self) -> bool {
        !matches!(self.kind, BodyKind::Absent)
    }

    /// Whether the body was consumed, sent, or its stream read from.
    pub fn is_used(&self) -> bool {
        self.used || matches!(&self.kind, BodyKind::Stream(stream) if stream.is_disturbed())
    }

    /// The entity's own host handle, if it still holds one.
    pub fn handle(&self) -> Option<BodyHandle> {
        self.handle
    }

    /// The body as a stream, created on first access.
    pub fn stream(&mut self) -> Result<Option<ReadableBody>, FetchError> {
        match &self.kind {
            BodyKind::Absent => Ok(None),
            BodyKind::Stream(stream) => Ok(Some(stream.clone())),
            BodyKind::Handle => {
                let handle = self.handle.take().ok_or_else(released)?;
                let stream = ReadableBody::from_host(Rc::clone(&self.host), handle, self.config);
                self.kind = BodyKind::Stream(stream.clone());
                Ok(Some(stream))
            }
        }
    }

    fn own_handle(&mut self) -> Result<BodyHandle, FetchError> {
        if let Some(handle) = self.handle {
            return Ok(handle);
        }
        let handle = self.host.body_new()?;
        self.handle = Some(handle);
        Ok(handle)
    }

    /// Writes `bytes` into the entity's handle.
    pub fn set_bytes(&mut self, bytes: &[u8]) -> Result<(), FetchError> {
        ensure!(!self.has_body(), FetchError::invalid_state("body is already set"));
        let handle = self.own_handle()?;
        self.host.body_write(handle, bytes)?;
        self.kind = BodyKind::Handle;
        Ok(())
    }

    /// Makes `stream` the body. Unusable streams are rejected.
    pub fn set_stream(&mut self, stream: ReadableBody) -> Result<(), FetchError> {
        ensure!(!self.has_body(), FetchError::invalid_state("body is already set"));
        ensure!(!stream.is_unusable(), FetchError::unusable_stream());
        let handle = self.own_handle()?;
        if stream.adopt_as_body(handle) {
            debug!(handle = handle.as_u32(), "transform readable adopted as body");
        }
        self.kind = BodyKind::Stream(stream);
        Ok(())
    }

    /// Reads the whole body into one buffer and marks it used.
    ///
    /// An absent body yields an empty buffer. A bare host handle is read in a loop after one
    /// yield to the scheduler, any other stream is drained chunk by chunk.
    pub async fn consume(&mut self) -> Result<Bytes, FetchError> {
        ensure!(!self.is_used(), FetchError::AlreadyConsumed);
        self.used = true;

        let chunk_size = self.config.read_chunk_size();
        let handle = match &self.kind {
            BodyKind::Absent => return Ok(Bytes::new()),
            BodyKind::Handle => self.handle.ok_or_else(released)?,
            BodyKind::Stream(stream) if stream.is_host_backed() => {
                let stream = stream.clone();
                self.merge_host_backed(&stream)?
            }
            BodyKind::Stream(stream) => {
                let reader = stream.reader()?;
                return drain_stream(reader, chunk_size).await;
            }
        };

        tokio::task::yield_now().await;
        read_all_from_handle(self.host.as_ref(), handle, chunk_size)
    }

    /// Turns the body into a single host handle ready to be dispatched and marks it used.
    ///
    /// Host backed streams hand over their handle without copying, other streams are pumped
    /// into the entity's own handle.
    pub async fn prepare_for_send(&mut self) -> Result<BodyHandle, FetchError> {
        ensure!(!self.is_used(), FetchError::invalid_state("body has already been used"));

        let stream = match &self.kind {
            BodyKind::Stream(stream) => Some(stream.clone()),
            BodyKind::Absent | BodyKind::Handle => None,
        };
        let handle = match stream {
            None => self.own_handle()?,
            Some(stream) => {
                ensure!(!stream.is_unusable(), FetchError::unusable_stream());
                if stream.is_host_backed() {
                    self.merge_host_backed(&stream)?
                } else {
                    let dest = self.own_handle()?;
                    pump_into_handle(self.host.as_ref(), stream.reader()?, dest).await?;
                    dest
                }
            }
        };

        self.used = true;
        self.handle = None;
        Ok(handle)
    }

    /// Moves the handle of a host backed stream into the entity's own handle, when it has one.
    fn merge_host_backed(&mut self, stream: &ReadableBody) -> Result<BodyHandle, FetchError> {
        let src = stream.take_host_handle()?;
        let Some(own) = self.handle else {
            return Ok(src);
        };
        self.host.body_append(own, src)?;
        debug!(src = src.as_u32(), dest = own.as_u32(), "appended host backed stream into own body");
        Ok(own)
    }

    /// Splits the body in two. `self` keeps one branch, the returned body gets the other.
    pub fn tee(&mut self) -> Result<Body, FetchError> {
        ensure!(!self.is_used(), FetchError::invalid_state("body isn't usable"));
        let Some(stream) = self.stream()? else {
            return Ok(Body::absent(Rc::clone(&self.host), self.config));
        };
        let (left, right) = stream.tee()?;
        self.kind = BodyKind::Stream(left);
        Ok(Body { host: Rc::clone(&self.host), handle: None, kind: BodyKind::Stream(right), used: false, config: self.config })
    }

    /// Length as far as it is known without reading.
    pub fn known_length(&self) -> Result<Option<u64>, FetchError> {
        match &self.kind {
            BodyKind::Absent => Ok(Some(0)),
            BodyKind::Handle => match self.handle {
                Some(handle) => Ok(self.host.body_known_length(handle)?),
                None => Ok(None),
            },
            BodyKind::Stream(stream) => Ok(match stream.known_size() {
                PayloadSize::Length(n) => Some(n),
                PayloadSize::Empty => Some(0),
                PayloadSize::Unknown => None,
            }),
        }
    }
}

fn released() -> FetchError {
    FetchError::invalid_state("body handle was released")
}
