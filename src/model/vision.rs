//! Image preprocessing and label decoding around the classification network.

use std::{collections::BTreeMap, fs, path::Path, str::FromStr};

use image::{ImageReader, imageops::FilterType};

use crate::{error::ServiceError, model::Prediction};

/// Side length of the square frame the network expects.
pub const INPUT_SIZE: u32 = 224;

const TORCH_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const TORCH_STD: [f32; 3] = [0.229, 0.224, 0.225];
const CAFFE_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];

/// Normalization expected by the exported network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preprocessing {
    /// RGB scaled to `[0, 1]` then standardized with ImageNet mean/std.
    Torch,
    /// BGR with the ImageNet channel means subtracted, no scaling.
    Caffe,
}

impl FromStr for Preprocessing {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "torch" => Ok(Preprocessing::Torch),
            "caffe" => Ok(Preprocessing::Caffe),
            other => Err(ServiceError::Other(format!(
                "unknown preprocessing mode '{other}', expected 'torch' or 'caffe'"
            ))),
        }
    }
}

/// What the classifier's final layer emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierOutput {
    Logits,
    Probabilities,
}

impl FromStr for ClassifierOutput {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "logits" => Ok(ClassifierOutput::Logits),
            "probabilities" | "probs" => Ok(ClassifierOutput::Probabilities),
            other => Err(ServiceError::Other(format!(
                "unknown classifier output '{other}', expected 'logits' or 'probabilities'"
            ))),
        }
    }
}

/// A single image laid out as NCHW `f32`.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub data: Vec<f32>,
    pub shape: [usize; 4],
}

/// Decodes the image at `path`, resizes it to the network frame and
/// normalizes it. The format is sniffed from the content, not the extension.
pub fn load_image(path: &Path, mode: Preprocessing) -> Result<ImageInput, ServiceError> {
    let decoded = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    let rgb = decoded
        .resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::Nearest)
        .to_rgb8();

    let (width, height) = (rgb.width() as usize, rgb.height() as usize);
    let plane = width * height;
    let mut data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let offset = y as usize * width + x as usize;
        for channel in 0..3 {
            let value = pixel[channel] as f32;
            match mode {
                Preprocessing::Torch => {
                    data[channel * plane + offset] =
                        (value / 255.0 - TORCH_MEAN[channel]) / TORCH_STD[channel];
                }
                Preprocessing::Caffe => {
                    let bgr = 2 - channel;
                    data[bgr * plane + offset] = value - CAFFE_MEAN_BGR[bgr];
                }
            }
        }
    }

    Ok(ImageInput {
        data,
        shape: [1, 3, height, width],
    })
}

pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum == 0.0 || !sum.is_finite() {
        return vec![0.0; scores.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}

/// Picks the `k` most probable classes, highest first.
pub fn top_k(
    probabilities: &[f32],
    labels: &[String],
    k: usize,
) -> Result<Vec<Prediction>, ServiceError> {
    if probabilities.len() != labels.len() {
        return Err(ServiceError::Inference(format!(
            "classifier produced {} scores but {} labels are loaded",
            probabilities.len(),
            labels.len()
        )));
    }

    let mut ranked: Vec<usize> = (0..probabilities.len()).collect();
    ranked.sort_by(|&a, &b| probabilities[b].total_cmp(&probabilities[a]));

    Ok(ranked
        .into_iter()
        .take(k)
        .map(|idx| Prediction {
            label: labels[idx].clone(),
            probability: probabilities[idx].clamp(0.0, 1.0),
        })
        .collect())
}

/// Reads class labels either from a plain text file (one per line, an
/// optional leading WordNet id is dropped) or from a Keras style
/// `imagenet_class_index.json` mapping `"idx" -> [wnid, name]`.
pub fn load_labels(path: &Path) -> Result<Vec<String>, ServiceError> {
    let raw = fs::read_to_string(path)?;

    let labels = if path.extension().is_some_and(|ext| ext == "json") {
        let index: BTreeMap<String, (String, String)> = serde_json::from_str(&raw)
            .map_err(|e| ServiceError::Artifact(format!("invalid label index: {e}")))?;
        let mut entries = Vec::with_capacity(index.len());
        for (key, (_, name)) in index {
            let idx: usize = key
                .parse()
                .map_err(|_| ServiceError::Artifact(format!("invalid class index '{key}'")))?;
            entries.push((idx, name));
        }
        entries.sort_by_key(|(idx, _)| *idx);
        entries.into_iter().map(|(_, name)| name).collect()
    } else {
        raw.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| match line.split_once(' ') {
                Some((wnid, name)) if is_wordnet_id(wnid) => name.trim().to_string(),
                _ => line.to_string(),
            })
            .collect::<Vec<_>>()
    };

    if labels.is_empty() {
        return Err(ServiceError::Artifact(format!(
            "no labels found in {}",
            path.display()
        )));
    }
    Ok(labels)
}

fn is_wordnet_id(token: &str) -> bool {
    token.len() == 9
        && token.starts_with('n')
        && token[1..].chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use image::{ImageFormat, Rgb, RgbImage};
    use tempfile::{NamedTempFile, TempDir};

    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn top_k_sorts_descending_and_truncates() {
        let probs = [0.1, 0.5, 0.05, 0.3, 0.05];
        let preds = top_k(&probs, &labels(&["a", "b", "c", "d", "e"]), 3).unwrap();
        let names: Vec<_> = preds.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(names, ["b", "d", "a"]);
        assert!(preds.windows(2).all(|w| w[0].probability >= w[1].probability));
    }

    #[test]
    fn top_k_rejects_label_mismatch() {
        let err = top_k(&[0.5, 0.5], &labels(&["only"]), 1).unwrap_err();
        assert!(err.to_string().contains("2 scores"));
    }

    #[test]
    fn softmax_is_a_distribution() {
        let probs = softmax(&[1.0, 2.0, 3.0, 1000.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!(probs[3] > 0.99);
    }

    #[test]
    fn parses_modes() {
        assert_eq!("Caffe".parse::<Preprocessing>().unwrap(), Preprocessing::Caffe);
        assert_eq!(
            "probs".parse::<ClassifierOutput>().unwrap(),
            ClassifierOutput::Probabilities
        );
        assert!("tf".parse::<Preprocessing>().is_err());
    }

    #[test]
    fn load_image_resizes_and_normalizes() {
        let dir = TempDir::new().unwrap();
        // Saved with a mismatched extension on purpose: the content is sniffed.
        let path = dir.path().join("red.jpg");
        let img = RgbImage::from_pixel(10, 6, Rgb([255, 0, 0]));
        img.save_with_format(&path, ImageFormat::Png).unwrap();

        let input = load_image(&path, Preprocessing::Torch).unwrap();
        assert_eq!(input.shape, [1, 3, 224, 224]);
        assert_eq!(input.data.len(), 3 * 224 * 224);
        let red = (1.0 - TORCH_MEAN[0]) / TORCH_STD[0];
        assert!((input.data[0] - red).abs() < 1e-5);

        let caffe = load_image(&path, Preprocessing::Caffe).unwrap();
        let plane = 224 * 224;
        // red lands in the last (R) plane of BGR
        assert!((caffe.data[2 * plane] - (255.0 - CAFFE_MEAN_BGR[2])).abs() < 1e-4);
        assert!((caffe.data[0] + CAFFE_MEAN_BGR[0]).abs() < 1e-4);
    }

    #[test]
    fn load_image_rejects_garbage() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"definitely not an image").unwrap();
        assert!(load_image(file.path(), Preprocessing::Torch).is_err());
    }

    #[test]
    fn loads_plain_and_keras_labels() {
        let dir = TempDir::new().unwrap();
        let txt = dir.path().join("classes.txt");
        fs::write(&txt, "n01440764 tench\ngoldfish\n\n").unwrap();
        assert_eq!(load_labels(&txt).unwrap(), ["tench", "goldfish"]);

        let json = dir.path().join("imagenet_class_index.json");
        fs::write(
            &json,
            r#"{"1": ["n01443537", "goldfish"], "0": ["n01440764", "tench"]}"#,
        )
        .unwrap();
        assert_eq!(load_labels(&json).unwrap(), ["tench", "goldfish"]);
    }
}
