use super::{keys_of, MapTransform};
use crate::io::read_nifti;
use crate::types::{DatasetResult, Sample};
use rand::RngCore;

/// Replace path fields with their decoded NIfTI volumes.
#[derive(Debug, Clone)]
pub struct LoadImage {
    keys: Vec<String>,
}

impl LoadImage {
    pub fn new(keys: &[&str]) -> Self {
        Self {
            keys: keys_of(keys),
        }
    }
}

impl MapTransform for LoadImage {
    fn name(&self) -> &'static str {
        "LoadImage"
    }

    fn apply(&self, mut sample: Sample, _rng: &mut dyn RngCore) -> DatasetResult<Sample> {
        for key in &self.keys {
            let volume = read_nifti(sample.path(key)?)?;
            sample.insert_volume(key, volume);
        }
        Ok(sample)
    }
}
