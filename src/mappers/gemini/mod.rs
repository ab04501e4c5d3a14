// Gemini pass-through mapper: envelope wrapping only, no dialect change.

pub mod models;
pub mod wrapper;

pub use models::*;
pub use wrapper::{unwrap_response, unwrap_response_ref, wrap_envelope};
