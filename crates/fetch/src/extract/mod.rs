//! Decoding a whole body into the shape a caller asks for.
//!
//! [`ReadBody`] is available on every [`MessageEntity`]. It consumes the body once and hands the
//! bytes, together with the entity's `content-type`, to a [`FromBody`] implementation.

mod extract_body;
mod form_data;
mod multipart;

use std::future::Future;

use bytes::Bytes;
use micro_fetch_core::protocol::FetchError;
use serde::de::DeserializeOwned;

use crate::entity::MessageEntity;

pub use extract_body::Blob;
pub use form_data::{FormData, FormEntry, FormFile};

/// A value decoded from a complete body.
pub trait FromBody: Sized {
    fn from_body(bytes: Bytes, content_type: Option<&str>) -> Result<Self, FetchError>;
}

/// Body decoding shortcuts for requests and responses.
///
/// # Example
/// ```
/// # use std::rc::Rc;
/// # use http::Method;
/// # use micro_fetch::{FetchContext, Request, ReadBody};
/// # use micro_fetch_core::host::{Host, MemoryHost};
/// # let host: Rc<dyn Host> = Rc::new(MemoryHost::new());
/// # let ctx = FetchContext::new(host);
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let mut request = Request::new(&ctx, Method::POST, "https://example.com/")
///     .unwrap()
///     .with_body(r#"{"name":"micro"}"#)
///     .unwrap();
/// let value = request.json().await.unwrap();
/// assert_eq!(value["name"], "micro");
/// # });
/// ```
pub trait ReadBody: MessageEntity {
    fn read<T: FromBody>(&mut self) -> impl Future<Output = Result<T, FetchError>> {
        async move {
            let content_type = self.headers()?.get_str("content-type").map(str::to_string);
            let bytes = self.consume_body().await?;
            T::from_body(bytes, content_type.as_deref())
        }
    }

    fn array_buffer(&mut self) -> impl Future<Output = Result<Bytes, FetchError>> {
        self.read::<Bytes>()
    }

    fn text(&mut self) -> impl Future<Output = Result<String, FetchError>> {
        self.read::<String>()
    }

    fn json(&mut self) -> impl Future<Output = Result<serde_json::Value, FetchError>> {
        self.read::<serde_json::Value>()
    }

    fn blob(&mut self) -> impl Future<Output = Result<Blob, FetchError>> {
        self.read::<Blob>()
    }

    fn form_data(&mut self) -> impl Future<Output = Result<FormData, FetchError>> {
        self.read::<FormData>()
    }
}

impl<E: MessageEntity> ReadBody for E {}

/// A body decoded as json into `T`.
///
/// ```
/// # use serde::Deserialize;
/// # use micro_fetch::extract::{FromBody, Json};
/// #[derive(Deserialize, Debug)]
/// struct Params {
///     name: String,
/// }
///
/// let Json(params) = Json::<Params>::from_body(r#"{"name":"micro"}"#.into(), None).unwrap();
/// assert_eq!(params.name, "micro");
/// ```
#[derive(Debug)]
pub struct Json<T>(pub T);

impl<T: DeserializeOwned> FromBody for Json<T> {
    fn from_body(bytes: Bytes, _content_type: Option<&str>) -> Result<Self, FetchError> {
        serde_json::from_slice(&bytes).map(Json).map_err(FetchError::syntax)
    }
}

/// A `application/x-www-form-urlencoded` body decoded into `T`.
#[derive(Debug)]
pub struct Form<T>(pub T);

impl<T: DeserializeOwned> FromBody for Form<T> {
    fn from_body(bytes: Bytes, _content_type: Option<&str>) -> Result<Self, FetchError> {
        serde_urlencoded::from_bytes(&bytes).map(Form).map_err(FetchError::invalid_form_data)
    }
}
