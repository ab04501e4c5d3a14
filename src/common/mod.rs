// Common tools shared by mappers, handlers and services.

pub mod json_schema;
pub mod model_mapping;
pub mod tool_output;
pub mod utils;
