//! Window signatures.
//!
//! A signature is the sparse feature vector derived from one endpoint window.
//! Coordinates carry 1-based indices and the vector is terminated by a
//! sentinel coordinate with a negative index, which is also the layout the
//! signature database files use.

use crate::Label;

/// Index value of the terminating sentinel coordinate.
pub const SENTINEL_INDEX: i32 = -1;

/// One feature coordinate: 1-based index plus value, or the sentinel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub index: i32,
    pub value: f64,
}

/// Feature vector for one endpoint window.
///
/// `label` is zero for unlabeled (prediction) windows and nonzero for
/// training samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub label: Label,
    pub coords: Vec<Coordinate>,
}

impl Signature {
    /// Builds an unlabeled signature from a dense feature slice, assigning
    /// 1-based indices and appending the sentinel.
    pub fn from_features(features: &[f64]) -> Self {
        let mut coords = Vec::with_capacity(features.len() + 1);
        for (i, &value) in features.iter().enumerate() {
            coords.push(Coordinate {
                index: i as i32 + 1,
                value,
            });
        }
        coords.push(Coordinate {
            index: SENTINEL_INDEX,
            value: 0.0,
        });
        Signature { label: 0, coords }
    }

    /// Number of real features (the sentinel does not count).
    pub fn feature_count(&self) -> usize {
        self.coords
            .iter()
            .take_while(|c| c.index != SENTINEL_INDEX)
            .count()
    }

    /// Iterates feature values in index order, excluding the sentinel.
    pub fn features(&self) -> impl Iterator<Item = f64> + '_ {
        self.coords
            .iter()
            .take_while(|c| c.index != SENTINEL_INDEX)
            .map(|c| c.value)
    }

    /// Dense copy of the feature values.
    pub fn dense(&self) -> Vec<f64> {
        self.features().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{SENTINEL_INDEX, Signature};

    #[test]
    fn from_features_appends_sentinel() {
        let sign = Signature::from_features(&[0.25, 0.5, 1.0]);
        assert_eq!(sign.label, 0);
        assert_eq!(sign.coords.len(), 4);
        assert_eq!(sign.coords[0].index, 1);
        assert_eq!(sign.coords[2].index, 3);
        assert_eq!(sign.coords[3].index, SENTINEL_INDEX);
        assert_eq!(sign.feature_count(), 3);
    }

    #[test]
    fn dense_excludes_sentinel() {
        let sign = Signature::from_features(&[0.1, 0.9]);
        assert_eq!(sign.dense(), vec![0.1, 0.9]);
    }
}
