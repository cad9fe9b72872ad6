//! Trainable distance classifier and its label map.

use crate::types::Identity;
use image::GrayImage;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Transient integer index a classifier uses internally. Meaningful only
/// through the [`LabelMap`] produced by the same training run.
pub type Label = i32;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("sample shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("sample too small for the histogram grid: {width}x{height}")]
    SampleTooSmall { width: u32, height: u32 },
    #[error("classifier is not trained")]
    Untrained,
}

/// Best match for a sample: smaller distance is better, 0 is a perfect match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: Label,
    pub distance: f64,
}

/// A face-recognition capability that is fitted from scratch on every
/// training run and can be persisted as a blob.
pub trait TrainableClassifier: Sized + Send + Sync + Serialize + DeserializeOwned {
    /// Fit a new model. Fails on an empty sample set.
    fn fit(samples: &[(GrayImage, Label)]) -> Result<Self, ClassifierError>;

    fn predict(&self, sample: &GrayImage) -> Result<Prediction, ClassifierError>;
}

/// Mapping from classifier label to identity, rebuilt on every training run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelMap(BTreeMap<Label, Identity>);

impl LabelMap {
    /// Assign labels `0..n` to identities in sorted order.
    ///
    /// The input is sorted and deduplicated here so the assignment never
    /// depends on the caller's iteration order.
    pub fn from_identities<I>(identities: I) -> Self
    where
        I: IntoIterator<Item = Identity>,
    {
        let mut ids: Vec<Identity> = identities.into_iter().collect();
        ids.sort();
        ids.dedup();
        Self(
            ids.into_iter()
                .enumerate()
                .map(|(i, id)| (i as Label, id))
                .collect(),
        )
    }

    pub fn get(&self, label: Label) -> Option<&Identity> {
        self.0.get(&label)
    }

    pub fn label_of(&self, identity: &Identity) -> Option<Label> {
        self.0
            .iter()
            .find_map(|(&label, id)| (id == identity).then_some(label))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Label, &Identity)> {
        self.0.iter().map(|(&l, id)| (l, id))
    }
}

/// A fitted model together with the label map it was trained against.
/// Always swapped as one unit.
#[derive(Debug)]
pub struct TrainedModel<C> {
    pub model: C,
    pub labels: LabelMap,
}
