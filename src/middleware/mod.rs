// Axum middleware.

pub mod auth;

pub use auth::auth_middleware;

use tower_http::cors::CorsLayer;

pub fn cors_layer() -> CorsLayer {
    CorsLayer::permissive()
}
