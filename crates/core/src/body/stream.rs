use std::cell::RefCell;
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::LocalBoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use http_body::{Frame, SizeHint};
use http_body_util::BodyExt;
use tracing::{debug, trace, warn};

use crate::body::tee::{TeeBranch, TeeShared};
use crate::body::transform::{TransformInner, TransformStream};
use crate::config::BridgeConfig;
use crate::ensure;
use crate::host::{BodyHandle, Host};
use crate::protocol::{FetchError, HostError, PayloadItem, PayloadSize};

pub(crate) enum Source {
    Host { host: Rc<dyn Host>, handle: Option<BodyHandle> },
    Content(LocalBoxStream<'static, Result<Bytes, FetchError>>),
    Tee(TeeBranch),
}

/// Progress of a host pull.
///
/// A host read is never issued from the poll that asked for data. The first poll only schedules
/// the read and yields to the executor, the next poll performs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullState {
    Idle,
    Scheduled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamState {
    Readable,
    Closed,
    Errored { delivered: bool, error: FetchError },
}

pub(crate) struct StreamInner {
    source: Source,
    config: BridgeConfig,
    pull: PullState,
    state: StreamState,
    locked: bool,
    disturbed: bool,
    moved: bool,
    piped_to: Option<TransformStream>,
    transform: Option<Rc<RefCell<TransformInner>>>,
}

impl StreamInner {
    fn poll_pull(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, FetchError>>> {
        match &mut self.state {
            StreamState::Closed => return Poll::Ready(None),
            StreamState::Errored { delivered: true, .. } => return Poll::Ready(None),
            StreamState::Errored { delivered, error } => {
                *delivered = true;
                return Poll::Ready(Some(Err(error.clone())));
            }
            StreamState::Readable => {}
        }

        self.disturbed = true;
        let polled = match &mut self.source {
            Source::Host { host, handle } => {
                poll_host(&**host, handle, &mut self.pull, self.piped_to.as_ref(), self.config, cx)
            }
            Source::Content(stream) => stream.poll_next_unpin(cx),
            Source::Tee(branch) => branch.poll_next(cx),
        };

        match polled {
            Poll::Ready(None) => {
                trace!("readable body reached eof");
                self.state = StreamState::Closed;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                self.state = StreamState::Errored { delivered: true, error: e.clone() };
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

fn poll_host(
    host: &dyn Host,
    handle: &mut Option<BodyHandle>,
    pull: &mut PullState,
    piped_to: Option<&TransformStream>,
    config: BridgeConfig,
    cx: &mut Context<'_>,
) -> Poll<Option<Result<Bytes, FetchError>>> {
    let Some(src) = *handle else {
        return Poll::Ready(Some(Err(FetchError::invalid_state("body handle was moved"))));
    };

    // the readable end of the transform we feed became another body: hand the bytes over wholesale
    if let Some(dest) = piped_to.and_then(TransformStream::adopted_handle) {
        handle.take();
        debug!(src = src.as_u32(), dest = dest.as_u32(), "appending piped host body");
        return Poll::Ready(host.body_append(dest, src).err().map(|e| Err(FetchError::from(e))));
    }

    match *pull {
        PullState::Idle => {
            *pull = PullState::Scheduled;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
        PullState::Scheduled => {
            *pull = PullState::Idle;
            match host.body_read(src, config.read_chunk_size()) {
                Ok(bytes) => match PayloadItem::from_read(bytes) {
                    PayloadItem::Chunk(chunk) => {
                        trace!(size = chunk.len(), "read chunk from host body");
                        Poll::Ready(Some(Ok(chunk)))
                    }
                    PayloadItem::Eof => Poll::Ready(None),
                },
                Err(e) => {
                    warn!(cause = %e, handle = src.as_u32(), "failed to read host body");
                    Poll::Ready(Some(Err(e.into())))
                }
            }
        }
    }
}

/// A lazily pulled body.
///
/// Cloning yields another reference to the same stream. Reading needs a [`BodyReader`] and a
/// stream hands out only one, see [`reader`](Self::reader).
///
/// A stream is *unusable* once it was disturbed (a chunk was pulled) or locked (a reader is
/// attached). Unusable streams cannot become the body of another entity.
#[derive(Clone)]
pub struct ReadableBody {
    inner: Rc<RefCell<StreamInner>>,
}

impl fmt::Debug for ReadableBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        let source = match &inner.source {
            Source::Host { handle, .. } => format!("Host({:?})", handle.map(|h| h.as_u32())),
            Source::Content(_) => "Content".to_string(),
            Source::Tee(_) => "Tee".to_string(),
        };
        f.debug_struct("ReadableBody")
            .field("source", &source)
            .field("locked", &inner.locked)
            .field("disturbed", &inner.disturbed)
            .field("state", &inner.state)
            .finish_non_exhaustive()
    }
}

impl ReadableBody {
    pub(crate) fn with_source(
        source: Source,
        config: BridgeConfig,
        transform: Option<Rc<RefCell<TransformInner>>>,
    ) -> Self {
        let inner = StreamInner {
            source,
            config,
            pull: PullState::Idle,
            state: StreamState::Readable,
            locked: false,
            disturbed: false,
            moved: false,
            piped_to: None,
            transform,
        };
        Self { inner: Rc::new(RefCell::new(inner)) }
    }

    /// A stream pulling `handle` from the host in `read_chunk_size` steps.
    pub fn from_host(host: Rc<dyn Host>, handle: BodyHandle, config: BridgeConfig) -> Self {
        Self::with_source(Source::Host { host, handle: Some(handle) }, config, None)
    }

    /// A stream over caller provided content.
    pub fn from_stream<S>(stream: S, config: BridgeConfig) -> Self
    where
        S: Stream<Item = Result<Bytes, FetchError>> + 'static,
    {
        Self::with_source(Source::Content(stream.boxed_local()), config, None)
    }

    /// A stream over the data frames of any [`http_body::Body`], other frames are skipped.
    pub fn from_http_body<B>(body: B, config: BridgeConfig) -> Self
    where
        B: http_body::Body<Data = Bytes> + 'static,
        B::Error: fmt::Display,
    {
        let stream = TryStreamExt::map_err(body.into_data_stream(), |e| FetchError::from(HostError::io(e)));
        Self::from_stream(stream, config)
    }

    pub fn config(&self) -> BridgeConfig {
        self.inner.borrow().config
    }

    /// Locks the stream and returns its only reader.
    pub fn reader(&self) -> Result<BodyReader, FetchError> {
        let mut inner = self.inner.borrow_mut();
        ensure!(!inner.locked, FetchError::invalid_state("readable stream is locked"));
        inner.locked = true;
        Ok(BodyReader { body: self.clone() })
    }

    pub fn is_locked(&self) -> bool {
        self.inner.borrow().locked
    }

    pub fn is_disturbed(&self) -> bool {
        self.inner.borrow().disturbed
    }

    pub fn is_unusable(&self) -> bool {
        let inner = self.inner.borrow();
        inner.locked || inner.disturbed
    }

    /// Whether the underlying host handle was moved out by [`take_host_handle`](Self::take_host_handle).
    pub fn is_moved(&self) -> bool {
        self.inner.borrow().moved
    }

    /// Backed 1:1 by a host handle that is still in place.
    pub fn is_host_backed(&self) -> bool {
        matches!(&self.inner.borrow().source, Source::Host { handle: Some(_), .. })
    }

    /// Moves the host handle out of an untouched host backed stream.
    ///
    /// The stream ends up locked, disturbed and closed, any later reader sees an empty stream.
    pub fn take_host_handle(&self) -> Result<BodyHandle, FetchError> {
        let mut inner = self.inner.borrow_mut();
        ensure!(!(inner.locked || inner.disturbed), FetchError::unusable_stream());
        let Source::Host { handle, .. } = &mut inner.source else {
            return Err(FetchError::invalid_state("readable stream is not backed by a host body"));
        };
        let handle = handle.take().ok_or_else(|| FetchError::invalid_state("body handle was moved"))?;
        inner.locked = true;
        inner.disturbed = true;
        inner.moved = true;
        inner.state = StreamState::Closed;
        debug!(handle = handle.as_u32(), "moved host body handle out of readable body");
        Ok(handle)
    }

    pub fn known_size(&self) -> PayloadSize {
        let inner = self.inner.borrow();
        match (&inner.state, &inner.source) {
            (StreamState::Closed, _) => PayloadSize::Empty,
            (_, Source::Host { host, handle: Some(handle) }) if !inner.disturbed => {
                PayloadSize::from_known_length(host.body_known_length(*handle).ok().flatten())
            }
            _ => PayloadSize::Unknown,
        }
    }

    /// Splits into two independent streams, each seeing every chunk once. Locks `self`.
    pub fn tee(&self) -> Result<(ReadableBody, ReadableBody), FetchError> {
        let reader = self.reader()?;
        let config = self.config();
        let shared = TeeShared::new(reader);
        let left = Self::with_source(Source::Tee(TeeBranch::new(Rc::clone(&shared), 0)), config, None);
        let right = Self::with_source(Source::Tee(TeeBranch::new(shared, 1)), config, None);
        Ok((left, right))
    }

    /// Feeds every chunk into `dest`, closing it at the end.
    ///
    /// When `dest`'s readable end has been adopted as the body of another entity and this stream
    /// is backed by a host handle, the whole host body is appended to the adopting body instead
    /// and no bytes pass through the transform.
    pub async fn pipe_to(&self, dest: &TransformStream) -> Result<(), FetchError> {
        let mut reader = self.reader()?;
        self.inner.borrow_mut().piped_to = Some(dest.clone());

        while let Some(chunk) = reader.next().await {
            match chunk {
                Ok(chunk) => dest.write(chunk)?,
                Err(e) => {
                    dest.abort(e.clone());
                    return Err(e);
                }
            }
        }
        dest.close();
        Ok(())
    }

    /// Records that this stream became the body of an entity owning `handle`.
    ///
    /// Only the readable end of a [`TransformStream`] remembers this, returns whether it did.
    pub fn adopt_as_body(&self, handle: BodyHandle) -> bool {
        match &self.inner.borrow().transform {
            Some(transform) => {
                transform.borrow_mut().adopt(handle);
                true
            }
            None => false,
        }
    }
}

/// The reader of a [`ReadableBody`], a [`Stream`] of chunks and an [`http_body::Body`].
pub struct BodyReader {
    body: ReadableBody,
}

impl fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyReader").field("body", &self.body).finish()
    }
}

impl BodyReader {
    /// Stops reading. Always succeeds and leaves host state untouched.
    pub fn cancel(self) {
        let mut inner = self.body.inner.borrow_mut();
        if inner.state == StreamState::Readable {
            inner.state = StreamState::Closed;
        }
        debug!("readable body cancelled");
    }
}

impl Stream for BodyReader {
    type Item = Result<Bytes, FetchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.body.inner.borrow_mut().poll_pull(cx)
    }
}

impl http_body::Body for BodyReader {
    type Data = Bytes;
    type Error = FetchError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.poll_next(cx).map(|item| item.map(|chunk| chunk.map(Frame::data)))
    }

    fn is_end_stream(&self) -> bool {
        let inner = self.body.inner.borrow();
        matches!(inner.state, StreamState::Closed | StreamState::Errored { delivered: true, .. })
    }

    fn size_hint(&self) -> SizeHint {
        self.body.known_size().into()
    }
}
