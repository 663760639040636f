//! Linear regression artifact: loading, inference, and the least-squares fit
//! used by the offline `train_regression` tool.

use std::{fs, path::Path};

use rand::{Rng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServiceError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub n_features: usize,
    /// One row of `n_features` weights per output target.
    pub coefficients: Vec<Vec<f64>>,
    pub intercept: Vec<f64>,
}

impl LinearModel {
    pub fn load(path: &Path) -> Result<Self, ServiceError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            ServiceError::Artifact(format!("cannot read {}: {e}", path.display()))
        })?;
        let model: LinearModel = serde_json::from_str(&raw)
            .map_err(|e| ServiceError::Artifact(format!("invalid regression model: {e}")))?;
        model.validate()?;
        Ok(model)
    }

    pub fn save(&self, path: &Path) -> Result<(), ServiceError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| ServiceError::Other(e.to_string()))?;
        fs::write(path, raw)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ServiceError> {
        if self.coefficients.is_empty() || self.coefficients.len() != self.intercept.len() {
            return Err(ServiceError::Artifact(format!(
                "regression model has {} coefficient rows and {} intercepts",
                self.coefficients.len(),
                self.intercept.len()
            )));
        }
        if let Some(row) = self
            .coefficients
            .iter()
            .find(|row| row.len() != self.n_features)
        {
            return Err(ServiceError::Artifact(format!(
                "coefficient row has {} weights, expected {}",
                row.len(),
                self.n_features
            )));
        }
        Ok(())
    }

    pub fn n_targets(&self) -> usize {
        self.intercept.len()
    }

    /// Predicts every target for a single sample.
    pub fn predict(&self, row: &[f64]) -> Result<Vec<f64>, ServiceError> {
        if row.len() != self.n_features {
            return Err(ServiceError::Inference(format!(
                "Prediction error: X has {} features, but the model expects {}",
                row.len(),
                self.n_features
            )));
        }
        Ok(self
            .coefficients
            .iter()
            .zip(&self.intercept)
            .map(|(weights, bias)| bias + weights.iter().zip(row).map(|(w, x)| w * x).sum::<f64>())
            .collect())
    }

    /// Ordinary least squares with an intercept for a single target.
    pub fn fit(samples: &[Vec<f64>], targets: &[f64]) -> Result<Self, ServiceError> {
        let Some(first) = samples.first() else {
            return Err(ServiceError::BadRequest("cannot fit on an empty dataset".into()));
        };
        if samples.len() != targets.len() {
            return Err(ServiceError::BadRequest(format!(
                "{} samples but {} targets",
                samples.len(),
                targets.len()
            )));
        }
        let n_features = first.len();
        if samples.iter().any(|s| s.len() != n_features) {
            return Err(ServiceError::BadRequest("samples have differing widths".into()));
        }

        // Normal equations over the design matrix [1 | X].
        let dim = n_features + 1;
        let mut gram = vec![vec![0.0; dim]; dim];
        let mut moment = vec![0.0; dim];
        for (sample, &target) in samples.iter().zip(targets) {
            let augmented: Vec<f64> = std::iter::once(1.0).chain(sample.iter().copied()).collect();
            for i in 0..dim {
                moment[i] += augmented[i] * target;
                for j in 0..dim {
                    gram[i][j] += augmented[i] * augmented[j];
                }
            }
        }

        let solution = solve(gram, moment)?;
        Ok(LinearModel {
            n_features,
            coefficients: vec![solution[1..].to_vec()],
            intercept: vec![solution[0]],
        })
    }

    /// Coefficient of determination of the first target.
    pub fn r2_score(&self, samples: &[Vec<f64>], targets: &[f64]) -> Result<f64, ServiceError> {
        if targets.is_empty() {
            return Err(ServiceError::BadRequest("cannot score an empty dataset".into()));
        }
        let mean = targets.iter().sum::<f64>() / targets.len() as f64;
        let mut residual = 0.0;
        let mut total = 0.0;
        for (sample, &target) in samples.iter().zip(targets) {
            let predicted = self.predict(sample)?[0];
            residual += (target - predicted).powi(2);
            total += (target - mean).powi(2);
        }
        Ok(if total == 0.0 { 0.0 } else { 1.0 - residual / total })
    }
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>, ServiceError> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < 1e-12 {
            return Err(ServiceError::Inference(
                "singular design matrix, features are collinear".into(),
            ));
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}

/// Flattens a JSON value into a single feature row, row-major. Accepts a
/// bare number, a flat array, or a uniformly nested array of numbers.
pub fn parse_feature_row(value: &Value) -> Result<Vec<f64>, String> {
    let mut row = Vec::new();
    flatten(value, &mut row)?;
    Ok(row)
}

fn flatten(value: &Value, out: &mut Vec<f64>) -> Result<Vec<usize>, String> {
    match value {
        Value::Number(n) => {
            let x = n
                .as_f64()
                .ok_or_else(|| format!("{n} is not representable as a float"))?;
            out.push(x);
            Ok(Vec::new())
        }
        Value::Array(items) => {
            let mut inner: Option<Vec<usize>> = None;
            for item in items {
                let shape = flatten(item, out)?;
                if inner.is_none() {
                    inner = Some(shape);
                } else if inner.as_ref() != Some(&shape) {
                    return Err("the array has an inhomogeneous shape".into());
                }
            }
            let mut shape = vec![items.len()];
            shape.extend(inner.unwrap_or_default());
            Ok(shape)
        }
        Value::Null => Err("expected numeric values, found null".into()),
        Value::Bool(_) => Err("expected numeric values, found a boolean".into()),
        Value::String(s) => Err(format!("could not convert string to float: '{s}'")),
        Value::Object(_) => Err("expected numeric values, found an object".into()),
    }
}

/// Synthetic linear dataset with Gaussian inputs and noise.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    pub samples: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
    pub true_coefficients: Vec<f64>,
}

impl SyntheticDataset {
    pub fn generate<R: Rng>(n_samples: usize, n_features: usize, noise: f64, rng: &mut R) -> Self {
        let true_coefficients: Vec<f64> =
            (0..n_features).map(|_| 100.0 * rng.r#gen::<f64>()).collect();

        let mut samples = Vec::with_capacity(n_samples);
        let mut targets = Vec::with_capacity(n_samples);
        for _ in 0..n_samples {
            let sample: Vec<f64> = (0..n_features).map(|_| standard_normal(rng)).collect();
            let clean: f64 = sample
                .iter()
                .zip(&true_coefficients)
                .map(|(x, w)| x * w)
                .sum();
            targets.push(clean + noise * standard_normal(rng));
            samples.push(sample);
        }

        Self {
            samples,
            targets,
            true_coefficients,
        }
    }

    /// Shuffles and splits off `test_fraction` of the rows (rounded).
    pub fn split<R: Rng>(self, test_fraction: f64, rng: &mut R) -> (Self, Self) {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        order.shuffle(rng);
        let n_test = ((self.samples.len() as f64) * test_fraction.clamp(0.0, 1.0)).round() as usize;
        let (test_idx, train_idx) = order.split_at(n_test.min(order.len()));

        let pick = |idx: &[usize]| SyntheticDataset {
            samples: idx.iter().map(|&i| self.samples[i].clone()).collect(),
            targets: idx.iter().map(|&i| self.targets[i]).collect(),
            true_coefficients: self.true_coefficients.clone(),
        };
        (pick(train_idx), pick(test_idx))
    }
}

/// Box-Muller transform.
fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = rng.r#gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.r#gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
