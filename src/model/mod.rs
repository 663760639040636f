#[cfg(feature = "tch-backend")]
mod loader;
mod registry;
mod types;

pub mod regression;
pub mod sampling;
pub mod vision;

#[cfg(feature = "tch-backend")]
pub use loader::{TorchClassifier, TorchGenerator};
pub use registry::{ModelArtifacts, ModelRegistry, TOP_PREDICTIONS};
pub use types::{
    ClassificationResponse, GenerationParams, GenerationResponse, ImageClassifier, Prediction,
    RegressionResponse, TextGenerator,
};
pub use vision::{ClassifierOutput, ImageInput, Preprocessing};
