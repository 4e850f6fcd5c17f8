use futures::StreamExt;
use tracing::trace;

use crate::body::BodyReader;
use crate::host::{BodyHandle, Host};
use crate::protocol::FetchError;

/// Writes every chunk of `reader` into the host body `dest`, returns the number of bytes written.
///
/// The reverse of [`ReadableBody::from_host`](crate::body::ReadableBody::from_host): content
/// produced in process ends up behind a handle the host can send or store.
pub async fn pump_into_handle(host: &dyn Host, mut reader: BodyReader, dest: BodyHandle) -> Result<u64, FetchError> {
    let mut written = 0_u64;
    while let Some(chunk) = reader.next().await {
        let chunk = chunk?;
        host.body_write(dest, &chunk)?;
        written += chunk.len() as u64;
    }
    trace!(written, dest = dest.as_u32(), "pumped stream into host body");
    Ok(written)
}
