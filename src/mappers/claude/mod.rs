// Claude mapper module: Anthropic Messages <-> upstream generateContent.

pub mod models;
pub mod preprocess;
pub mod request;
pub mod response;
pub mod streaming;
pub mod tools;
pub mod utils;

pub use models::*;
pub use preprocess::{preprocess_request, PreprocessReport};
pub use request::transform_claude_request_in;
pub use response::{transform_response, ResponseContext};
pub use streaming::ClaudeStreamState;
