//! Post-processing of network outputs.

use super::spatial::invert_ops;
use super::{keys_of, MapTransform};
use crate::types::{DatasetResult, Interpolation, Sample};
use rand::RngCore;

/// Element-wise sigmoid (or identity when `sigmoid` is false).
#[derive(Debug, Clone)]
pub struct Activations {
    keys: Vec<String>,
    sigmoid: bool,
}

impl Activations {
    pub fn new(keys: &[&str], sigmoid: bool) -> Self {
        Self {
            keys: keys_of(keys),
            sigmoid,
        }
    }
}

impl MapTransform for Activations {
    fn name(&self) -> &'static str {
        "Activations"
    }

    fn apply(&self, mut sample: Sample, _rng: &mut dyn RngCore) -> DatasetResult<Sample> {
        if !self.sigmoid {
            return Ok(sample);
        }
        for key in &self.keys {
            sample
                .volume_mut(key)?
                .data
                .mapv_inplace(|v| 1.0 / (1.0 + (-v).exp()));
        }
        Ok(sample)
    }
}

/// Binarize: values `>= threshold` become 1.0, the rest 0.0.
#[derive(Debug, Clone)]
pub struct AsDiscrete {
    keys: Vec<String>,
    threshold: f32,
}

impl AsDiscrete {
    pub fn new(keys: &[&str], threshold: f32) -> Self {
        Self {
            keys: keys_of(keys),
            threshold,
        }
    }
}

impl MapTransform for AsDiscrete {
    fn name(&self) -> &'static str {
        "AsDiscrete"
    }

    fn apply(&self, mut sample: Sample, _rng: &mut dyn RngCore) -> DatasetResult<Sample> {
        let threshold = self.threshold;
        for key in &self.keys {
            sample
                .volume_mut(key)?
                .data
                .mapv_inplace(|v| if v >= threshold { 1.0 } else { 0.0 });
        }
        Ok(sample)
    }
}

/// Map `key` back to the original grid of `orig_key` by undoing the spatial
/// operations recorded on `orig_key`.
#[derive(Debug, Clone)]
pub struct Invert {
    key: String,
    orig_key: String,
    nearest_interp: bool,
}

impl Invert {
    pub fn new(key: &str, orig_key: &str, nearest_interp: bool) -> Self {
        Self {
            key: key.to_string(),
            orig_key: orig_key.to_string(),
            nearest_interp,
        }
    }
}

impl MapTransform for Invert {
    fn name(&self) -> &'static str {
        "Invert"
    }

    fn apply(&self, mut sample: Sample, _rng: &mut dyn RngCore) -> DatasetResult<Sample> {
        let ops = sample.volume(&self.orig_key)?.applied.clone();
        let interp = if self.nearest_interp {
            Interpolation::Nearest
        } else {
            Interpolation::Bilinear
        };
        let volume = sample.take_volume(&self.key)?;
        let restored = invert_ops(volume, &ops, interp)?;
        sample.insert_volume(&self.key, restored);
        Ok(sample)
    }
}
