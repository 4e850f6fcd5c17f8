use bytes::Bytes;
use http_body::SizeHint;

/// One result of pulling a body: a chunk of data or the end of the stream.
///
/// The host signals end of stream with a zero length read, the bridge turns that into
/// [`PayloadItem::Eof`] so an empty chunk never leaks out as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem {
    Chunk(Bytes),
    Eof,
}

impl PayloadItem {
    /// Classifies a raw host read.
    #[inline]
    pub fn from_read(bytes: Bytes) -> Self {
        if bytes.is_empty() { PayloadItem::Eof } else { PayloadItem::Chunk(bytes) }
    }
}

/// What is known about the size of a body before reading it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// The host reported an exact length.
    Length(u64),
    /// Length only known once the stream ends.
    Unknown,
    /// No body at all.
    Empty,
}

impl PayloadSize {
    pub fn from_known_length(length: Option<u64>) -> Self {
        match length {
            Some(0) => PayloadSize::Empty,
            Some(n) => PayloadSize::Length(n),
            None => PayloadSize::Unknown,
        }
    }
}

impl From<PayloadSize> for SizeHint {
    fn from(size: PayloadSize) -> Self {
        match size {
            PayloadSize::Length(n) => SizeHint::with_exact(n),
            PayloadSize::Empty => SizeHint::with_exact(0),
            PayloadSize::Unknown => SizeHint::new(),
        }
    }
}
