//! Raw BraTS labels to the stacked TC/WT/ET region channels.

use super::MapTransform;
use crate::types::{DatasetError, DatasetResult, Sample};
use data_contracts::REGION_ORDER;
use ndarray::{Array3, Array4, Axis};
use rand::RngCore;

/// Map a raw label volume to `[TC, WT, ET]` channels of 0.0/1.0.
///
/// Values outside {0, 1, 2, 3} belong to no region.
pub fn labels_to_regions(labels: &Array3<f32>) -> Array4<f32> {
    let (x, y, z) = labels.dim();
    let mut out = Array4::<f32>::zeros((REGION_ORDER.len(), x, y, z));
    for region in REGION_ORDER {
        let mut channel = out.index_axis_mut(Axis(0), region.channel());
        ndarray::Zip::from(&mut channel)
            .and(labels)
            .for_each(|dst, &value| {
                if region.contains_value(value) {
                    *dst = 1.0;
                }
            });
    }
    out
}

/// Replace a single-channel label field with its region channels.
///
/// The affine and recorded spatial operations are kept.
#[derive(Debug, Clone)]
pub struct ConvertBratsLabels {
    key: String,
}

impl ConvertBratsLabels {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
        }
    }
}

impl MapTransform for ConvertBratsLabels {
    fn name(&self) -> &'static str {
        "ConvertBratsLabels"
    }

    fn apply(&self, mut sample: Sample, _rng: &mut dyn RngCore) -> DatasetResult<Sample> {
        let volume = sample.volume_mut(&self.key)?;
        if volume.channels() != 1 {
            return Err(DatasetError::Shape(format!(
                "label field `{}` must have one channel, found {}",
                self.key,
                volume.channels()
            )));
        }
        let labels = volume.data.index_axis(Axis(0), 0).to_owned();
        volume.data = labels_to_regions(&labels);
        Ok(sample)
    }
}
