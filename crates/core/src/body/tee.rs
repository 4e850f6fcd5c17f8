use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures::StreamExt;

use crate::body::BodyReader;
use crate::protocol::FetchError;

/// State shared by both branches of a tee.
///
/// Whichever branch finds its queue empty pulls the source and queues a reference to the chunk
/// for the other branch, so every chunk is read from the source once and seen by each branch once.
pub(crate) struct TeeShared {
    source: BodyReader,
    queues: [VecDeque<Bytes>; 2],
    wakers: [Option<Waker>; 2],
    alive: [bool; 2],
    finished: Option<Option<FetchError>>,
}

impl TeeShared {
    pub(crate) fn new(source: BodyReader) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            source,
            queues: [VecDeque::new(), VecDeque::new()],
            wakers: [None, None],
            alive: [true, true],
            finished: None,
        }))
    }

    fn wake(&mut self, index: usize) {
        if let Some(waker) = self.wakers[index].take() {
            waker.wake();
        }
    }
}

pub(crate) struct TeeBranch {
    shared: Rc<RefCell<TeeShared>>,
    index: usize,
}

impl TeeBranch {
    pub(crate) fn new(shared: Rc<RefCell<TeeShared>>, index: usize) -> Self {
        Self { shared, index }
    }

    pub(crate) fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, FetchError>>> {
        let mut shared = self.shared.borrow_mut();
        let this = self.index;
        let other = 1 - this;

        if let Some(chunk) = shared.queues[this].pop_front() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        match &shared.finished {
            Some(None) => return Poll::Ready(None),
            Some(Some(e)) => return Poll::Ready(Some(Err(e.clone()))),
            None => {}
        }

        match shared.source.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if shared.alive[other] {
                    shared.queues[other].push_back(chunk.clone());
                    shared.wake(other);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                shared.finished = Some(Some(e.clone()));
                shared.wake(other);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                shared.finished = Some(None);
                shared.wake(other);
                Poll::Ready(None)
            }
            Poll::Pending => {
                shared.wakers[this] = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for TeeBranch {
    fn drop(&mut self) {
        if let Ok(mut shared) = self.shared.try_borrow_mut() {
            shared.alive[self.index] = false;
            shared.queues[self.index].clear();
        }
    }
}
