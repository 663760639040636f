use std::{path::Path, sync::Arc, time::Instant};

use parking_lot::Mutex;
use tch::{Device, IValue, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        GenerationParams, ImageClassifier, TextGenerator,
        registry::ModelArtifacts,
        regression::LinearModel,
        sampling::generate_tokens,
        vision::{ImageInput, load_labels},
    },
};

/// GPT-2 `<|endoftext|>`.
const GPT2_EOS_TOKEN: &str = "<|endoftext|>";
const GPT2_EOS_ID: u32 = 50256;

impl ModelArtifacts {
    /// Loads every artifact named by `config`. Any failure is fatal.
    pub fn load(config: &AppConfig) -> Result<Self, ServiceError> {
        let start = Instant::now();

        let classifier = TorchClassifier::load(&config.classifier_module_path, config.device)?;
        let labels = load_labels(&config.classifier_labels_path)?;
        tracing::info!(
            path = %config.classifier_module_path.display(),
            labels = labels.len(),
            "image classifier loaded"
        );

        let regression = LinearModel::load(&config.regression_model_path)?;
        tracing::info!(
            path = %config.regression_model_path.display(),
            n_features = regression.n_features,
            n_targets = regression.n_targets(),
            "regression model loaded"
        );

        let generator = TorchGenerator::load(
            &config.textgen_module_path,
            &config.tokenizer_path,
            config.device,
        )?;
        tracing::info!(
            path = %config.textgen_module_path.display(),
            "text generator loaded"
        );

        tracing::info!(elapsed_ms = start.elapsed().as_millis(), "all artifacts ready");

        Ok(Self {
            classifier: Arc::new(classifier),
            labels: Arc::new(labels),
            regression: Arc::new(regression),
            generator: Arc::new(generator),
        })
    }
}

fn load_module(path: &Path, device: Device) -> Result<tch::CModule, ServiceError> {
    if !path.exists() {
        return Err(ServiceError::Artifact(format!(
            "model artifact missing: {}",
            path.display()
        )));
    }
    let mut module = tch::CModule::load_on_device(path, device)
        .map_err(|e| ServiceError::Artifact(format!("{}: {e}", path.display())))?;
    module.set_eval();
    Ok(module)
}

fn first_tensor(output: IValue) -> Result<Tensor, ServiceError> {
    match output {
        IValue::Tensor(t) => Ok(t),
        IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
            IValue::Tensor(t) => Ok(t.shallow_clone()),
            _ => Err(ServiceError::Inference(
                "expected tensor as first tuple element".into(),
            )),
        },
        _ => Err(ServiceError::Inference("unexpected model output format".into())),
    }
}

fn to_f32_vec(tensor: &Tensor) -> Result<Vec<f32>, ServiceError> {
    let flat = tensor
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .flatten(0, -1);
    Vec::<f32>::try_from(&flat).map_err(|e| ServiceError::Inference(e.to_string()))
}

/// TorchScript image classifier (e.g. a traced VGG16).
pub struct TorchClassifier {
    device: Device,
    module: Mutex<tch::CModule>,
}

impl TorchClassifier {
    pub fn load(module_path: &Path, device: Device) -> Result<Self, ServiceError> {
        Ok(Self {
            device,
            module: Mutex::new(load_module(module_path, device)?),
        })
    }
}

impl ImageClassifier for TorchClassifier {
    fn classify(&self, input: &ImageInput) -> Result<Vec<f32>, ServiceError> {
        let shape: Vec<i64> = input.shape.iter().map(|&d| d as i64).collect();
        no_grad(|| {
            let batch = Tensor::from_slice(&input.data)
                .reshape(shape.as_slice())
                .to(self.device);
            let output = self
                .module
                .lock()
                .forward_is(&[IValue::Tensor(batch)])
                .map_err(|e| ServiceError::Inference(e.to_string()))?;
            to_f32_vec(&first_tensor(output)?)
        })
    }
}

/// TorchScript causal language model driven token by token.
pub struct TorchGenerator {
    tokenizer: Tokenizer,
    eos_token_id: u32,
    device: Device,
    module: Mutex<tch::CModule>,
}

impl TorchGenerator {
    pub fn load(
        module_path: &Path,
        tokenizer_path: &Path,
        device: Device,
    ) -> Result<Self, ServiceError> {
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let eos_token_id = tokenizer
            .token_to_id(GPT2_EOS_TOKEN)
            .unwrap_or(GPT2_EOS_ID);

        Ok(Self {
            tokenizer,
            eos_token_id,
            device,
            module: Mutex::new(load_module(module_path, device)?),
        })
    }
}

impl TextGenerator for TorchGenerator {
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, ServiceError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let prompt_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let mut rng = rand::thread_rng();

        let start = Instant::now();
        let output_ids = no_grad(|| {
            let module = self.module.lock();

            generate_tokens(
                &prompt_ids,
                params,
                self.eos_token_id as i64,
                &mut rng,
                |sequence| {
                    let input_tensor = Tensor::from_slice(sequence)
                        .reshape([1, sequence.len() as i64])
                        .to(self.device);

                    let output = module
                        .forward_is(&[IValue::Tensor(input_tensor)])
                        .map_err(|e| ServiceError::Inference(e.to_string()))?;

                    // [1, seq_len, vocab] -> logits of the last position
                    let last_logits = first_tensor(output)?.select(1, -1).squeeze();
                    to_f32_vec(&last_logits)
                },
            )
        })?;

        tracing::debug!(
            prompt_tokens = prompt_ids.len(),
            total_tokens = output_ids.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "generation finished"
        );

        let ids: Vec<u32> = output_ids.iter().map(|&id| id as u32).collect();
        self.tokenizer
            .decode(&ids, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }
}
