use rand::{
    Rng,
    distributions::{Distribution, WeightedIndex},
};

use crate::{error::ServiceError, model::GenerationParams};

/// Chooses the next token id from a row of logits.
///
/// A temperature of zero (or below) or `top_k == 1` selects the argmax;
/// otherwise the `top_k` highest logits are tempered, softmaxed and sampled.
pub fn sample_next_token<R: Rng + ?Sized>(
    logits: &[f32],
    temperature: f64,
    top_k: usize,
    rng: &mut R,
) -> Option<usize> {
    if logits.is_empty() {
        return None;
    }

    let mut ranked: Vec<usize> = (0..logits.len()).collect();
    ranked.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]));

    if temperature <= 0.0 || top_k == 1 {
        return ranked.first().copied();
    }

    let keep = if top_k == 0 { ranked.len() } else { top_k.min(ranked.len()) };
    ranked.truncate(keep);

    let max = logits[ranked[0]] as f64;
    let weights: Vec<f64> = ranked
        .iter()
        .map(|&idx| ((logits[idx] as f64 - max) / temperature).exp())
        .collect();

    match WeightedIndex::new(&weights) {
        Ok(dist) => Some(ranked[dist.sample(rng)]),
        Err(_) => ranked.first().copied(),
    }
}

/// Autoregressive decoding loop.
///
/// `next_logits` sees the whole sequence so far and returns the logits for
/// the next position. The returned ids include the prompt and never exceed
/// `params.max_length` unless the prompt alone already does. An empty prompt
/// is seeded with `eos_token_id`.
pub fn generate_tokens<F, R>(
    prompt_ids: &[i64],
    params: &GenerationParams,
    eos_token_id: i64,
    rng: &mut R,
    mut next_logits: F,
) -> Result<Vec<i64>, ServiceError>
where
    F: FnMut(&[i64]) -> Result<Vec<f32>, ServiceError>,
    R: Rng + ?Sized,
{
    let mut ids = prompt_ids.to_vec();
    if ids.is_empty() {
        ids.push(eos_token_id);
    }
    let budget = params.max_length.saturating_sub(ids.len());

    for _ in 0..budget {
        let logits = next_logits(&ids)?;
        let next = sample_next_token(&logits, params.temperature, params.top_k, rng)
            .ok_or_else(|| ServiceError::Inference("model returned no logits".into()))?;
        let next = next as i64;
        ids.push(next);

        if next == eos_token_id {
            break;
        }
    }

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    const EOS: i64 = 9;

    fn greedy(max_length: usize) -> GenerationParams {
        GenerationParams {
            max_length,
            temperature: 0.0,
            top_k: 50,
        }
    }

    /// Logits that always favour `token`.
    fn favour(token: usize) -> Vec<f32> {
        let mut logits = vec![0.0; 10];
        logits[token] = 5.0;
        logits
    }

    #[test]
    fn greedy_when_cold() {
        let mut rng = StdRng::seed_from_u64(7);
        let logits = [0.1, 3.0, -1.0, 2.9];
        assert_eq!(sample_next_token(&logits, 0.0, 50, &mut rng), Some(1));
        assert_eq!(sample_next_token(&logits, 1.0, 1, &mut rng), Some(1));
    }

    #[test]
    fn samples_only_within_top_k() {
        let mut rng = StdRng::seed_from_u64(11);
        let logits = [5.0, 4.9, -10.0, 4.8, -10.0];
        for _ in 0..200 {
            let token = sample_next_token(&logits, 1.0, 2, &mut rng).unwrap();
            assert!(token == 0 || token == 1);
        }
    }

    #[test]
    fn empty_logits_yield_nothing() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(sample_next_token(&[], 1.0, 5, &mut rng), None);
    }

    #[test]
    fn generation_stops_at_max_length() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut calls = 0;
        let ids = generate_tokens(&[1, 2, 3], &greedy(8), EOS, &mut rng, |seq| {
            calls += 1;
            assert_eq!(seq.len(), 2 + calls);
            Ok(favour(4))
        })
        .unwrap();

        assert_eq!(ids, vec![1, 2, 3, 4, 4, 4, 4, 4]);
        assert_eq!(calls, 5);
    }

    #[test]
    fn sampled_generation_respects_max_length() {
        let mut rng = StdRng::seed_from_u64(3);
        let params = GenerationParams {
            max_length: 20,
            temperature: 1.0,
            top_k: 5,
        };
        let ids = generate_tokens(&[1], &params, -1, &mut rng, |_| {
            Ok(vec![0.5, 0.4, 0.3, 0.2, 0.1])
        })
        .unwrap();
        assert_eq!(ids.len(), 20);
        assert!(ids[1..].iter().all(|&id| (0..5).contains(&id)));
    }

    #[test]
    fn generation_stops_early_on_eos() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut step = 0;
        let ids = generate_tokens(&[1], &greedy(100), EOS, &mut rng, |_| {
            step += 1;
            Ok(if step < 3 { favour(5) } else { favour(EOS as usize) })
        })
        .unwrap();

        assert_eq!(ids, vec![1, 5, 5, EOS]);
    }

    #[test]
    fn prompt_at_or_over_limit_is_returned_untouched() {
        let mut rng = StdRng::seed_from_u64(4);
        let prompt = [1, 2, 3, 4];
        for max_length in [2, 4] {
            let ids = generate_tokens(&prompt, &greedy(max_length), EOS, &mut rng, |_| {
                panic!("model must not run when the prompt fills the budget")
            })
            .unwrap();
            assert_eq!(ids, prompt.to_vec());
        }
    }

    #[test]
    fn empty_prompt_is_seeded_with_eos() {
        let mut rng = StdRng::seed_from_u64(5);
        let ids = generate_tokens(&[], &greedy(3), EOS, &mut rng, |seq| {
            assert_eq!(seq[0], EOS);
            Ok(favour(2))
        })
        .unwrap();
        assert_eq!(ids, vec![EOS, 2, 2]);
    }

    #[test]
    fn model_errors_abort_generation() {
        let mut rng = StdRng::seed_from_u64(6);
        let err = generate_tokens(&[1], &greedy(10), EOS, &mut rng, |_| {
            Err(ServiceError::Inference("forward failed".into()))
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "forward failed");

        let err = generate_tokens(&[1], &greedy(10), EOS, &mut rng, |_| Ok(Vec::new()))
            .unwrap_err();
        assert!(err.to_string().contains("no logits"));
    }
}
