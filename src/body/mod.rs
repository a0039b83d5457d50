//! Request bodies: wire framing, media type matching and the negotiated
//! [`RequestBody`] the application hands to middleware.

pub(crate) mod framer;
mod media_type;
mod request_body;

pub use framer::{Body, Framing};
pub use media_type::is_media_type;
pub use request_body::{BodyOptions, BodyType, BodyValue, ContentTypes, RequestBody};
