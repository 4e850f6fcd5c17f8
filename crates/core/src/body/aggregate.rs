use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::trace;

use crate::body::BodyReader;
use crate::host::{BodyHandle, Host};
use crate::protocol::{FetchError, PayloadItem};

/// Reads a host body to its end in one go.
///
/// A body delivered in a single chunk is returned as is, without copying. Several chunks are
/// concatenated into one buffer sized from their total length.
pub fn read_all_from_handle(host: &dyn Host, handle: BodyHandle, chunk_size: usize) -> Result<Bytes, FetchError> {
    let mut chunks: Vec<Bytes> = Vec::new();
    loop {
        match PayloadItem::from_read(host.body_read(handle, chunk_size)?) {
            PayloadItem::Chunk(chunk) => chunks.push(chunk),
            PayloadItem::Eof => break,
        }
    }

    trace!(chunks = chunks.len(), handle = handle.as_u32(), "read host body to end");
    if chunks.len() <= 1 {
        return Ok(chunks.pop().unwrap_or_default());
    }
    let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
    chunks.iter().for_each(|chunk| buf.extend_from_slice(chunk));
    Ok(buf.freeze())
}

/// Drains a stream, keeping references to every chunk until the stream ends, then copies them
/// once into a single buffer.
///
/// Empty chunks are legal mid-stream, only the end of the stream terminates the drain.
pub async fn drain_stream(mut reader: BodyReader, chunk_size: usize) -> Result<Bytes, FetchError> {
    let mut chunks: Vec<Bytes> = Vec::new();
    while let Some(chunk) = reader.next().await {
        chunks.push(chunk?);
    }
    Ok(assemble(&chunks, chunk_size))
}

/// Copies `chunks` into one buffer that grows in `chunk_size` steps.
fn assemble(chunks: &[Bytes], chunk_size: usize) -> Bytes {
    let chunk_size = chunk_size.max(1);
    let mut capacity = chunk_size;
    let mut total = 0;
    for chunk in chunks.iter().filter(|c| !c.is_empty()) {
        total += chunk.len();
        if total > capacity {
            capacity += chunk_size * (chunk.len() / chunk_size + 1);
        }
    }
    if total == 0 {
        return Bytes::new();
    }

    let mut buf = BytesMut::with_capacity(capacity);
    chunks.iter().for_each(|chunk| buf.extend_from_slice(chunk));
    debug_assert!(buf.len() <= capacity);
    buf.freeze()
}
