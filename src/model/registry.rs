use std::{path::Path, sync::Arc};

use tokio::task;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        ClassifierOutput, GenerationParams, ImageClassifier, Prediction, TextGenerator,
        regression::LinearModel,
        vision::{self, load_image},
    },
};

/// Number of classes reported per classified image.
pub const TOP_PREDICTIONS: usize = 3;

/// Everything loaded at startup. Immutable for the process lifetime.
pub struct ModelArtifacts {
    pub classifier: Arc<dyn ImageClassifier>,
    pub labels: Arc<Vec<String>>,
    pub regression: Arc<LinearModel>,
    pub generator: Arc<dyn TextGenerator>,
}

/// Shared, read-only handle over the loaded artifacts.
///
/// Handlers may call into it concurrently. TorchScript modules are
/// serialized behind a mutex inside their wrappers.
pub struct ModelRegistry {
    artifacts: Arc<ModelArtifacts>,
}

impl ModelRegistry {
    #[cfg(feature = "tch-backend")]
    pub fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        let artifacts = ModelArtifacts::load(config)?;
        Ok(Self::new(artifacts))
    }

    pub fn new(artifacts: ModelArtifacts) -> Self {
        Self {
            artifacts: Arc::new(artifacts),
        }
    }

    pub fn predict_regression(&self, row: &[f64]) -> Result<Vec<f64>, ServiceError> {
        self.artifacts.regression.predict(row)
    }

    /// Preprocesses and classifies the image stored at `path`. Blocking.
    pub fn classify_image(
        &self,
        path: &Path,
        config: &AppConfig,
    ) -> Result<Vec<Prediction>, ServiceError> {
        let input = load_image(path, config.preprocessing)?;
        let scores = self.artifacts.classifier.classify(&input)?;
        let probabilities = match config.classifier_output {
            ClassifierOutput::Logits => vision::softmax(&scores),
            ClassifierOutput::Probabilities => scores,
        };
        vision::top_k(&probabilities, &self.artifacts.labels, TOP_PREDICTIONS)
    }

    pub async fn generate_text(
        &self,
        prompt: String,
        config: &AppConfig,
    ) -> Result<String, ServiceError> {
        let generator = self.artifacts.generator.clone();
        let params = GenerationParams {
            max_length: config.max_length,
            temperature: config.temperature,
            top_k: config.top_k,
        };

        task::spawn_blocking(move || generator.generate(&prompt, &params))
            .await
            .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }
}
