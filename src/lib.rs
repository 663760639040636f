pub mod config;
pub mod error;
pub mod model;
pub mod server;
pub mod upload;

pub use config::AppConfig;
pub use error::ServiceError;
pub use model::{ModelArtifacts, ModelRegistry};
pub use server::build_router;
