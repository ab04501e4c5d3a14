// OpenAI mapper module: chat-completions <-> upstream generateContent.

pub mod models;
pub mod request;
pub mod response;
pub mod streaming;

pub use models::*;
pub use request::{transform_openai_request, OpenAiRequestContext};
pub use response::transform_openai_response;
pub use streaming::OpenAiStreamState;
