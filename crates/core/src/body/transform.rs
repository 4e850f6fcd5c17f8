use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc;
use tracing::trace;

use crate::body::ReadableBody;
use crate::body::stream::Source;
use crate::config::BridgeConfig;
use crate::host::BodyHandle;
use crate::protocol::FetchError;

pub(crate) struct TransformInner {
    sender: Option<mpsc::UnboundedSender<Result<Bytes, FetchError>>>,
    adopted: Option<BodyHandle>,
}

impl TransformInner {
    pub(crate) fn adopt(&mut self, handle: BodyHandle) {
        self.adopted = Some(handle);
    }
}

/// An identity transform: chunks written to the writable side come out of [`readable`](Self::readable).
///
/// Its readable end can become the body of an entity. Sources piped into the transform with
/// [`ReadableBody::pipe_to`] then detect that and, when they are host backed, append their host
/// body straight into the entity's handle.
#[derive(Clone)]
pub struct TransformStream {
    inner: Rc<RefCell<TransformInner>>,
    readable: ReadableBody,
}

impl fmt::Debug for TransformStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("TransformStream")
            .field("closed", &inner.sender.is_none())
            .field("adopted", &inner.adopted)
            .field("readable", &self.readable)
            .finish()
    }
}

impl TransformStream {
    pub fn new(config: BridgeConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded();
        let inner = Rc::new(RefCell::new(TransformInner { sender: Some(sender), adopted: None }));
        let readable = ReadableBody::with_source(Source::Content(receiver.boxed_local()), config, Some(Rc::clone(&inner)));
        Self { inner, readable }
    }

    pub fn readable(&self) -> ReadableBody {
        self.readable.clone()
    }

    pub fn write(&self, chunk: Bytes) -> Result<(), FetchError> {
        let inner = self.inner.borrow();
        let sender = inner.sender.as_ref().ok_or_else(|| FetchError::invalid_state("transform stream is closed"))?;
        sender.unbounded_send(Ok(chunk)).map_err(|e| FetchError::invalid_state(format!("transform stream is closed: {e}")))
    }

    /// Ends the readable side once queued chunks are read.
    pub fn close(&self) {
        self.inner.borrow_mut().sender.take();
    }

    /// Ends the readable side with `error`.
    pub fn abort(&self, error: FetchError) {
        let sender = self.inner.borrow_mut().sender.take();
        if let Some(sender) = sender
            && let Err(e) = sender.unbounded_send(Err(error))
        {
            trace!(cause = %e, "transform readable dropped before abort");
        }
    }

    /// The host body of the entity that adopted the readable end, if any.
    pub fn adopted_handle(&self) -> Option<BodyHandle> {
        self.inner.borrow().adopted
    }
}
