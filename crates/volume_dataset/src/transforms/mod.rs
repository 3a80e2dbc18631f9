//! Dictionary-style transforms over [`Sample`]s and the [`Compose`] pipeline.

mod intensity;
mod load;
mod post;
mod regions;
mod spatial;

pub use intensity::{NormalizeIntensity, RandScaleIntensity, RandShiftIntensity};
pub use load::LoadImage;
pub use post::{Activations, AsDiscrete, Invert};
pub use regions::{labels_to_regions, ConvertBratsLabels};
pub use spatial::{
    invert_ops, orientation_transform, Orientation, RandFlip, RandSpatialCrop, Spacing,
};

use crate::types::{DatasetResult, Sample};
use rand::RngCore;

/// A transform applied to selected fields of a sample.
pub trait MapTransform: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, sample: Sample, rng: &mut dyn RngCore) -> DatasetResult<Sample>;
}

/// Ordered transform chain, run in registration order.
#[derive(Default)]
pub struct Compose {
    transforms: Vec<Box<dyn MapTransform>>,
}

impl Compose {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: MapTransform + 'static>(mut self, transform: T) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Names of the transforms, joined with arrows.
    pub fn describe(&self) -> String {
        self.transforms
            .iter()
            .map(|t| t.name())
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    pub fn apply(&self, mut sample: Sample, rng: &mut dyn RngCore) -> DatasetResult<Sample> {
        for transform in &self.transforms {
            sample = transform.apply(sample, rng)?;
        }
        Ok(sample)
    }
}

impl std::fmt::Debug for Compose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compose")
            .field("transforms", &self.describe())
            .finish()
    }
}

pub(crate) fn keys_of(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}
