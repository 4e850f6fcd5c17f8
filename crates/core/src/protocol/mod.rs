//! Protocol level building blocks shared by the bridge and the entities.
//!
//! - [`FetchError`] / [`HostError`]: the error taxonomy every operation reports through
//! - [`Headers`]: a header collection with a mutation counter, and [`GenerationMark`]
//!   to remember the last generation a consumer acted on
//! - [`PayloadItem`] / [`PayloadSize`]: results of pulling a body and what is known of its size

mod error;
pub use error::FetchError;
pub use error::HostError;

mod headers;
pub use headers::GENERATION_OVERFLOW;
pub use headers::GenerationMark;
pub use headers::Headers;

mod message;
pub use message::PayloadItem;
pub use message::PayloadSize;
