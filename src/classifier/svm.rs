//! One-vs-rest linear SVM trained with Pegasos sub-gradient steps.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::Classifier;
use crate::config::TrainingConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SvmParams {
    /// Regularization strength (lambda).
    pub regularization: f32,
    pub epochs: usize,
    pub seed: u64,
}

impl Default for SvmParams {
    fn default() -> Self {
        Self {
            regularization: 1e-4,
            epochs: 30,
            seed: 42,
        }
    }
}

impl From<&TrainingConfig> for SvmParams {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            regularization: config.regularization as f32,
            epochs: config.epochs,
            seed: config.seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearSvm {
    params: SvmParams,
    n_classes: usize,
    /// `(n_classes, n_features)`
    weights: Array2<f32>,
    bias: Array1<f32>,
}

impl LinearSvm {
    pub fn new(n_classes: usize, params: SvmParams) -> Self {
        Self {
            params,
            n_classes,
            weights: Array2::zeros((n_classes, 0)),
            bias: Array1::zeros(n_classes),
        }
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn n_features(&self) -> usize {
        self.weights.ncols()
    }

    /// Softmax over the margins, one probability row per sample.
    pub fn predict_proba(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut margins = self.decision_function(x);
        for mut row in margins.rows_mut() {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            if sum > 0.0 {
                row /= sum;
            }
        }
        margins
    }

    /// Binary Pegasos for `class` against the rest. The bias is learned as the
    /// weight of a constant feature.
    fn fit_binary(&self, x: ArrayView2<f32>, y: &[usize], class: usize) -> (Array1<f32>, f32) {
        let lambda = self.params.regularization.max(f32::EPSILON);
        let radius = 1.0 / lambda.sqrt();
        let mut w = Array1::<f32>::zeros(x.ncols());
        let mut b = 0.0f32;

        let mut order: Vec<usize> = (0..x.nrows()).collect();
        let mut rng = StdRng::seed_from_u64(self.params.seed.wrapping_add(class as u64));
        let mut t = 0u64;

        for _ in 0..self.params.epochs.max(1) {
            order.shuffle(&mut rng);
            for &i in &order {
                t += 1;
                let eta = 1.0 / (lambda * t as f32);
                let row = x.row(i);
                let target = if y[i] == class { 1.0 } else { -1.0 };
                let margin = target * (w.dot(&row) + b);

                let shrink = 1.0 - eta * lambda;
                w *= shrink;
                b *= shrink;
                if margin < 1.0 {
                    w.scaled_add(eta * target, &row);
                    b += eta * target;
                }

                // Project back onto the ball of radius 1/sqrt(lambda)
                let norm = (w.dot(&w) + b * b).sqrt();
                if norm > radius {
                    let scale = radius / norm;
                    w *= scale;
                    b *= scale;
                }
            }
        }
        (w, b)
    }

    fn margins_for(&self, row: ArrayView1<f32>) -> Array1<f32> {
        self.weights.dot(&row) + &self.bias
    }
}

impl Classifier for LinearSvm {
    fn fit(&mut self, x: ArrayView2<f32>, y: &[usize]) -> Result<()> {
        if x.nrows() == 0 {
            return Err(Error::TrainingFailure("no training samples".to_string()));
        }
        if x.nrows() != y.len() {
            return Err(Error::TrainingFailure(format!(
                "{} feature rows but {} labels",
                x.nrows(),
                y.len()
            )));
        }
        if let Some(&bad) = y.iter().find(|&&c| c >= self.n_classes) {
            return Err(Error::TrainingFailure(format!(
                "label {bad} outside {} classes",
                self.n_classes
            )));
        }
        let present: BTreeSet<usize> = y.iter().copied().collect();
        if present.len() < 2 {
            return Err(Error::TrainingFailure(format!(
                "need at least two classes in the training split, found {}",
                present.len()
            )));
        }

        tracing::debug!(
            samples = x.nrows(),
            features = x.ncols(),
            classes = self.n_classes,
            epochs = self.params.epochs,
            "Fitting linear SVM"
        );

        let fitted: Vec<(Array1<f32>, f32)> = (0..self.n_classes)
            .into_par_iter()
            .map(|class| self.fit_binary(x, y, class))
            .collect();

        let mut weights = Array2::zeros((self.n_classes, x.ncols()));
        for (class, (w, b)) in fitted.into_iter().enumerate() {
            weights.row_mut(class).assign(&w);
            self.bias[class] = b;
        }
        self.weights = weights;
        Ok(())
    }

    fn decision_function(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut out = Array2::zeros((x.nrows(), self.n_classes));
        for (i, row) in x.axis_iter(Axis(0)).enumerate() {
            out.row_mut(i).assign(&self.margins_for(row));
        }
        out
    }
}
