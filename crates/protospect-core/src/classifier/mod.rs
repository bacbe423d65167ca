//! Window classifier.
//!
//! Wraps the support-vector solver with the training-set bookkeeping the
//! pipeline needs: an append-only active training set, a staging queue that
//! only enters the active set on an explicit commit, and a model slot that
//! survives failed retrains. Scheduling the delayed, aggregated retrain is
//! the engine's job; this module only owns the data.

pub mod svm;

use thiserror::Error;
use tracing::debug;

use crate::endpoint::EpKey;
use crate::signature::Signature;
use crate::{ClassProbs, Label};
use svm::{SvmModel, SvmParams};

/// Classification of one endpoint window.
#[derive(Debug, Clone)]
pub struct ClassResult {
    pub ep: EpKey,
    /// Most probable label.
    pub label: Label,
    /// Full per-label probability distribution.
    pub probs: Box<ClassProbs>,
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("no training samples")]
    Empty,
    #[error("invalid solver parameters: {0}")]
    InvalidParams(String),
}

/// Multi-class probabilistic classifier with delayed-batch training.
pub struct Classifier {
    feature_count: usize,
    params: SvmParams,
    /// Active training set; grows append-only until a retrain consumes it.
    traindata: Vec<Signature>,
    /// Staged samples waiting for an explicit commit.
    staged: Vec<Signature>,
    model: Option<SvmModel>,
}

impl Classifier {
    pub fn new(feature_count: usize, params: SvmParams) -> Self {
        Classifier {
            feature_count,
            params,
            traindata: Vec::new(),
            staged: Vec::new(),
            model: None,
        }
    }

    /// Adds a labeled signature to the active training set.
    pub fn push_sample(&mut self, sign: Signature) {
        self.traindata.push(sign);
    }

    /// Adds a labeled signature to the staging queue.
    pub fn stage_sample(&mut self, sign: Signature) {
        self.staged.push(sign);
    }

    /// Moves all staged samples into the active set; returns how many.
    pub fn commit_staged(&mut self) -> usize {
        let moved = self.staged.len();
        self.traindata.append(&mut self.staged);
        moved
    }

    pub fn training_len(&self) -> usize {
        self.traindata.len()
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn training_set(&self) -> &[Signature] {
        &self.traindata
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    /// Labels the current model knows, empty before the first train.
    pub fn classes(&self) -> &[Label] {
        self.model.as_ref().map(|m| m.classes()).unwrap_or(&[])
    }

    /// Rebuilds the model from the full active training set. On failure the
    /// previous model stays in place.
    pub fn retrain(&mut self) -> Result<usize, TrainError> {
        self.params
            .validate()
            .map_err(TrainError::InvalidParams)?;
        if self.traindata.is_empty() {
            return Err(TrainError::Empty);
        }

        let samples: Vec<(Label, Vec<f64>)> = self
            .traindata
            .iter()
            .map(|sign| (sign.label, sign.dense()))
            .collect();
        let model = svm::train(&samples, self.feature_count, self.params);
        let classes = model.classes().len();
        self.model = Some(model);
        Ok(classes)
    }

    /// Predicts the label distribution for one window, or `None` while no
    /// model has been trained yet.
    pub fn predict(&self, sign: &Signature, ep: EpKey) -> Option<ClassResult> {
        let Some(model) = &self.model else {
            debug!("cannot classify: no model yet");
            return None;
        };
        let (label, probs) = model.predict(&sign.dense());
        Some(ClassResult { ep, label, probs })
    }
}
