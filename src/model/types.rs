use serde::Serialize;

use crate::{error::ServiceError, model::vision::ImageInput};

/// Runs a preprocessed image through a classification network and returns
/// one raw score per class.
pub trait ImageClassifier: Send + Sync {
    fn classify(&self, input: &ImageInput) -> Result<Vec<f32>, ServiceError>;
}

/// Continues a prompt. The returned text includes the prompt itself.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str, params: &GenerationParams)
    -> Result<String, ServiceError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    /// Upper bound on the total token count, prompt included.
    pub max_length: usize,
    pub temperature: f64,
    pub top_k: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub probability: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationResponse {
    pub predictions: Vec<Prediction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegressionResponse {
    pub prediction: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationResponse {
    pub generated_text: String,
}
