use bytes::Bytes;
use micro_fetch_core::body::{Body, ReadableBody};
use micro_fetch_core::protocol::{FetchError, Headers};

pub(crate) const TEXT_PLAIN_UTF8: &str = "text/plain;charset=UTF-8";
pub(crate) const FORM_URLENCODED_UTF8: &str = "application/x-www-form-urlencoded;charset=UTF-8";

/// What a request or response body can be created from.
#[derive(Debug)]
pub enum BodyInit {
    Bytes(Bytes),
    Text(String),
    /// Name/value pairs sent as `application/x-www-form-urlencoded`.
    UrlEncoded(Vec<(String, String)>),
    Stream(ReadableBody),
}

impl BodyInit {
    pub fn url_encoded<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        BodyInit::UrlEncoded(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// The content type implied by this kind of body, if any.
    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            BodyInit::Text(_) => Some(TEXT_PLAIN_UTF8),
            BodyInit::UrlEncoded(_) => Some(FORM_URLENCODED_UTF8),
            BodyInit::Bytes(_) | BodyInit::Stream(_) => None,
        }
    }

    /// Installs the body and sets its default content type unless one is already present.
    pub(crate) fn attach(self, body: &mut Body, headers: &mut Headers) -> Result<(), FetchError> {
        let content_type = self.content_type();
        match self {
            BodyInit::Bytes(bytes) => body.set_bytes(&bytes)?,
            BodyInit::Text(text) => body.set_bytes(text.as_bytes())?,
            BodyInit::UrlEncoded(pairs) => {
                let encoded = serde_urlencoded::to_string(&pairs).map_err(FetchError::type_error)?;
                body.set_bytes(encoded.as_bytes())?;
            }
            BodyInit::Stream(stream) => body.set_stream(stream)?,
        }

        if let Some(content_type) = content_type {
            headers.set_if_absent("content-type", content_type)?;
        }
        Ok(())
    }
}

impl From<Bytes> for BodyInit {
    fn from(bytes: Bytes) -> Self {
        BodyInit::Bytes(bytes)
    }
}

impl From<Vec<u8>> for BodyInit {
    fn from(bytes: Vec<u8>) -> Self {
        BodyInit::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for BodyInit {
    fn from(bytes: &'static [u8]) -> Self {
        BodyInit::Bytes(Bytes::from_static(bytes))
    }
}

impl From<String> for BodyInit {
    fn from(text: String) -> Self {
        BodyInit::Text(text)
    }
}

impl From<&str> for BodyInit {
    fn from(text: &str) -> Self {
        BodyInit::Text(text.to_string())
    }
}

impl From<ReadableBody> for BodyInit {
    fn from(stream: ReadableBody) -> Self {
        BodyInit::Stream(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use micro_fetch_core::config::BridgeConfig;
    use micro_fetch_core::host::{Host, MemoryHost};
    use std::rc::Rc;

    fn empty_body() -> Body {
        let host: Rc<dyn Host> = Rc::new(MemoryHost::new());
        Body::absent(host, BridgeConfig::default())
    }

    #[tokio::test]
    async fn text_sets_content_type() {
        let mut body = empty_body();
        let mut headers = Headers::new();
        BodyInit::from("hello").attach(&mut body, &mut headers).unwrap();

        assert_eq!(headers.get_str("content-type"), Some(TEXT_PLAIN_UTF8));
        assert_eq!(body.consume().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn url_encoded_keeps_existing_content_type() {
        let mut body = empty_body();
        let mut headers = Headers::new();
        headers.set("content-type", "application/custom").unwrap();
        BodyInit::url_encoded([("name", "micro fetch"), ("zip", "a&b")]).attach(&mut body, &mut headers).unwrap();

        assert_eq!(headers.get_str("content-type"), Some("application/custom"));
        assert_eq!(body.consume().await.unwrap(), Bytes::from_static(b"name=micro+fetch&zip=a%26b"));
    }

    #[test]
    fn bytes_have_no_content_type() {
        let mut body = empty_body();
        let mut headers = Headers::new();
        BodyInit::from(vec![1u8, 2, 3]).attach(&mut body, &mut headers).unwrap();

        assert!(!headers.contains("content-type"));
        assert_eq!(body.known_length().unwrap(), Some(3));
    }
}
