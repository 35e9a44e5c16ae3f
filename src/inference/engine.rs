//! Synthetic compute kernel
//!
//! Stands in for a real model backend behind the batch-in / batch-out
//! contract: a batch of input vectors goes through a few rounds of
//! matrix multiplication and produces one normalized output vector per
//! request. Weights are derived from a fixed seed per shard, so every
//! worker with the same shard id computes identical outputs.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;

const HIDDEN_SIZE: usize = 1024;
const NUM_CLASSES: usize = 1000;
const NUM_LAYERS: usize = 5;
const WEIGHT_SEED: u64 = 42;

/// Model metadata for logs and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub shard_id: u64,
    pub num_classes: usize,
    pub weights_size_mb: f64,
}

/// In-process inference engine executing batched matrix workloads.
pub struct InferenceEngine {
    model_name: String,
    shard_id: u64,
    /// Row-major `HIDDEN_SIZE x HIDDEN_SIZE` weight matrix.
    weights: Vec<f32>,
}

impl InferenceEngine {
    pub fn new(model_name: impl Into<String>, shard_id: u64) -> Self {
        let model_name = model_name.into();
        let mut rng = StdRng::seed_from_u64(WEIGHT_SEED + shard_id);
        let weights: Vec<f32> = (0..HIDDEN_SIZE * HIDDEN_SIZE)
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect();

        info!(
            model = %model_name,
            shard_id,
            hidden_size = HIDDEN_SIZE,
            "inference engine initialized"
        );

        Self {
            model_name,
            shard_id,
            weights,
        }
    }

    /// Run one input through the model. Equivalent to a batch of one.
    pub fn infer(&self, input: &[f32]) -> (Vec<f32>, u64) {
        self.batch_infer(&[input])
            .pop()
            .expect("batch of one yields one result")
    }

    /// Run a whole batch in one pass.
    ///
    /// Returns one `(output, inference_time_us)` pair per input, index
    /// aligned with `inputs`; the per-item time is the batch total divided
    /// evenly, which is what makes batching visible in the numbers.
    pub fn batch_infer(&self, inputs: &[&[f32]]) -> Vec<(Vec<f32>, u64)> {
        if inputs.is_empty() {
            return Vec::new();
        }
        let started = Instant::now();
        let batch_size = inputs.len();

        // Pack rows into one batch matrix, padding or truncating to the
        // hidden size.
        let mut activations = vec![0.0f32; batch_size * HIDDEN_SIZE];
        for (row, input) in inputs.iter().enumerate() {
            let len = input.len().min(HIDDEN_SIZE);
            activations[row * HIDDEN_SIZE..row * HIDDEN_SIZE + len]
                .copy_from_slice(&input[..len]);
        }

        for _ in 0..NUM_LAYERS {
            activations = self.layer(&activations, batch_size);
        }

        let total_us = started.elapsed().as_micros() as u64;
        let per_item_us = total_us / batch_size as u64;

        (0..batch_size)
            .map(|row| {
                let logits = &activations[row * HIDDEN_SIZE..row * HIDDEN_SIZE + NUM_CLASSES];
                (normalize(logits), per_item_us)
            })
            .collect()
    }

    /// One `tanh(x . W)` round over the batch.
    fn layer(&self, activations: &[f32], batch_size: usize) -> Vec<f32> {
        let mut next = vec![0.0f32; batch_size * HIDDEN_SIZE];
        for row in 0..batch_size {
            let input = &activations[row * HIDDEN_SIZE..(row + 1) * HIDDEN_SIZE];
            let output = &mut next[row * HIDDEN_SIZE..(row + 1) * HIDDEN_SIZE];
            for (k, &x) in input.iter().enumerate() {
                if x == 0.0 {
                    continue;
                }
                let weights_row = &self.weights[k * HIDDEN_SIZE..(k + 1) * HIDDEN_SIZE];
                for (out, &w) in output.iter_mut().zip(weights_row) {
                    *out += x * w;
                }
            }
            for out in output.iter_mut() {
                *out = out.tanh();
            }
        }
        next
    }

    pub fn model_info(&self) -> ModelInfo {
        ModelInfo {
            model_name: self.model_name.clone(),
            shard_id: self.shard_id,
            num_classes: NUM_CLASSES,
            weights_size_mb: (self.weights.len() * std::mem::size_of::<f32>()) as f64
                / (1024.0 * 1024.0),
        }
    }
}

/// Absolute values scaled to sum to one.
fn normalize(logits: &[f32]) -> Vec<f32> {
    let magnitudes: Vec<f32> = logits.iter().map(|v| v.abs()).collect();
    let sum: f32 = magnitudes.iter().sum();
    if sum > 0.0 {
        magnitudes.iter().map(|v| v / sum).collect()
    } else {
        vec![1.0 / logits.len() as f32; logits.len()]
    }
}
