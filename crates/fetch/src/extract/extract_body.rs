use bytes::{Buf, Bytes};
use micro_fetch_core::protocol::FetchError;

use crate::extract::FromBody;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

impl FromBody for Bytes {
    fn from_body(bytes: Bytes, _content_type: Option<&str>) -> Result<Self, FetchError> {
        Ok(bytes)
    }
}

/// Utf-8 decoding, invalid sequences become U+FFFD and a leading BOM is dropped.
impl FromBody for String {
    fn from_body(mut bytes: Bytes, _content_type: Option<&str>) -> Result<Self, FetchError> {
        if bytes.starts_with(UTF8_BOM) {
            bytes.advance(UTF8_BOM.len());
        }
        match String::from_utf8(bytes.into()) {
            Ok(text) => Ok(text),
            Err(e) => Ok(String::from_utf8_lossy(e.as_bytes()).into_owned()),
        }
    }
}

impl FromBody for serde_json::Value {
    fn from_body(bytes: Bytes, content_type: Option<&str>) -> Result<Self, FetchError> {
        let text = String::from_body(bytes, content_type)?;
        serde_json::from_str(&text).map_err(FetchError::syntax)
    }
}

/// Bytes tagged with the content type they arrived with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    bytes: Bytes,
    content_type: String,
}

impl Blob {
    pub fn new(bytes: Bytes, content_type: String) -> Self {
        Self { bytes, content_type }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Lower-cased, empty when the entity had no content type.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

impl FromBody for Blob {
    fn from_body(bytes: Bytes, content_type: Option<&str>) -> Result<Self, FetchError> {
        Ok(Blob::new(bytes, content_type.map(str::to_ascii_lowercase).unwrap_or_default()))
    }
}
