#![forbid(unsafe_code)]

pub mod blob;
mod error;
pub mod handler;

pub use error::AppError;
pub use handler::{AppState, RouterConfig, create_router};
