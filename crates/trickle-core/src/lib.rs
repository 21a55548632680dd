pub mod config;
pub mod error;
pub mod types;

pub use config::TrickleConfig;
pub use error::{FetchError, RenderError, RenderResult, UnitError};
pub use types::*;
