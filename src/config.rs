use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

#[cfg(feature = "tch-backend")]
use tch::Device;

use crate::model::{ClassifierOutput, Preprocessing};

pub const DEFAULT_PORT: u16 = 5001;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub classifier_module_path: PathBuf,
    pub classifier_labels_path: PathBuf,
    pub preprocessing: Preprocessing,
    pub classifier_output: ClassifierOutput,
    pub regression_model_path: PathBuf,
    pub textgen_module_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub max_length: usize,
    pub temperature: f64,
    pub top_k: usize,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            upload_dir: PathBuf::from("static"),
            max_upload_bytes: 16 * 1024 * 1024,
            classifier_module_path: PathBuf::from("models/vgg16.ts"),
            classifier_labels_path: PathBuf::from("models/imagenet_classes.txt"),
            preprocessing: Preprocessing::Torch,
            classifier_output: ClassifierOutput::Logits,
            regression_model_path: PathBuf::from("models/reg_model.json"),
            textgen_module_path: PathBuf::from("models/gpt2.ts"),
            tokenizer_path: PathBuf::from("models/tokenizer.json"),
            max_length: 100,
            temperature: 1.0,
            top_k: 50,
            #[cfg(feature = "tch-backend")]
            device: Device::Cpu,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = env::var("SERVER_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.listen_addr);

        let upload_dir = env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.upload_dir);
        let max_upload_bytes = env::var("MAX_UPLOAD_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_upload_bytes);

        let classifier_module_path = env::var("CLASSIFIER_MODULE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.classifier_module_path);
        let classifier_labels_path = env::var("CLASSIFIER_LABELS_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.classifier_labels_path);
        let preprocessing = match env::var("CLASSIFIER_PREPROCESS") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.preprocessing,
        };
        let classifier_output = match env::var("CLASSIFIER_OUTPUT") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.classifier_output,
        };

        let regression_model_path = env::var("REGRESSION_MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.regression_model_path);

        let textgen_module_path = env::var("TEXTGEN_MODULE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.textgen_module_path);
        let tokenizer_path = env::var("TOKENIZER_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.tokenizer_path);
        let max_length = env::var("TEXTGEN_MAX_LENGTH")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_length);
        let temperature = env::var("TEMPERATURE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.temperature);
        let top_k = env::var("TOP_K")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.top_k);

        #[cfg(feature = "tch-backend")]
        let device = {
            let raw = env::var("DEVICE").unwrap_or_else(|_| "cpu".into());
            parse_device(&raw)
        };

        Ok(Self {
            listen_addr,
            upload_dir,
            max_upload_bytes,
            classifier_module_path,
            classifier_labels_path,
            preprocessing,
            classifier_output,
            regression_model_path,
            textgen_module_path,
            tokenizer_path,
            max_length,
            temperature,
            top_k,
            #[cfg(feature = "tch-backend")]
            device,
        })
    }
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            tracing::warn!(requested = %raw, "CUDA unavailable, falling back to CPU");
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}
