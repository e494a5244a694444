pub mod error;
pub mod handlers;
pub mod server;
pub mod validation;

pub use error::ApiError;
pub use handlers::AppState;
pub use server::{build_router, start, ServerConfig, ServerHandle};
