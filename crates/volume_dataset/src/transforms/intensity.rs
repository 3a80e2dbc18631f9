use super::{keys_of, MapTransform};
use crate::types::{DatasetResult, Sample};
use ndarray::{ArrayViewMut, Axis, Dimension};
use rand::{Rng, RngCore};

/// Zero-mean, unit-variance normalization.
///
/// With `nonzero`, statistics come from non-zero voxels and zeros stay zero.
/// With `channel_wise`, each channel is normalized on its own.
#[derive(Debug, Clone)]
pub struct NormalizeIntensity {
    keys: Vec<String>,
    nonzero: bool,
    channel_wise: bool,
}

impl NormalizeIntensity {
    pub fn new(keys: &[&str], nonzero: bool, channel_wise: bool) -> Self {
        Self {
            keys: keys_of(keys),
            nonzero,
            channel_wise,
        }
    }
}

fn normalize_view<D: Dimension>(mut view: ArrayViewMut<'_, f32, D>, nonzero: bool) {
    let mut count = 0usize;
    let mut sum = 0.0f64;
    for v in view.iter() {
        if !nonzero || *v != 0.0 {
            count += 1;
            sum += *v as f64;
        }
    }
    if count == 0 {
        return;
    }
    let mean = sum / count as f64;
    let mut var = 0.0f64;
    for v in view.iter() {
        if !nonzero || *v != 0.0 {
            let d = *v as f64 - mean;
            var += d * d;
        }
    }
    let std = (var / count as f64).sqrt();
    let std = if std == 0.0 { 1.0 } else { std };
    view.mapv_inplace(|v| {
        if !nonzero || v != 0.0 {
            ((v as f64 - mean) / std) as f32
        } else {
            v
        }
    });
}

impl MapTransform for NormalizeIntensity {
    fn name(&self) -> &'static str {
        "NormalizeIntensity"
    }

    fn apply(&self, mut sample: Sample, _rng: &mut dyn RngCore) -> DatasetResult<Sample> {
        for key in &self.keys {
            let volume = sample.volume_mut(key)?;
            if self.channel_wise {
                for channel in volume.data.axis_iter_mut(Axis(0)) {
                    normalize_view(channel, self.nonzero);
                }
            } else {
                normalize_view(volume.data.view_mut(), self.nonzero);
            }
        }
        Ok(sample)
    }
}

/// Multiply intensities by `1 + u`, `u ~ U[-factors, factors)`, with probability `prob`.
#[derive(Debug, Clone)]
pub struct RandScaleIntensity {
    keys: Vec<String>,
    factors: f32,
    prob: f32,
}

impl RandScaleIntensity {
    pub fn new(keys: &[&str], factors: f32, prob: f32) -> Self {
        Self {
            keys: keys_of(keys),
            factors,
            prob,
        }
    }
}

impl MapTransform for RandScaleIntensity {
    fn name(&self) -> &'static str {
        "RandScaleIntensity"
    }

    fn apply(&self, mut sample: Sample, rng: &mut dyn RngCore) -> DatasetResult<Sample> {
        if rng.random::<f32>() >= self.prob {
            return Ok(sample);
        }
        let factor = 1.0 + uniform_symmetric(rng, self.factors);
        for key in &self.keys {
            sample.volume_mut(key)?.data.mapv_inplace(|v| v * factor);
        }
        Ok(sample)
    }
}

/// Add an offset `u ~ U[-offsets, offsets)` with probability `prob`.
#[derive(Debug, Clone)]
pub struct RandShiftIntensity {
    keys: Vec<String>,
    offsets: f32,
    prob: f32,
}

impl RandShiftIntensity {
    pub fn new(keys: &[&str], offsets: f32, prob: f32) -> Self {
        Self {
            keys: keys_of(keys),
            offsets,
            prob,
        }
    }
}

impl MapTransform for RandShiftIntensity {
    fn name(&self) -> &'static str {
        "RandShiftIntensity"
    }

    fn apply(&self, mut sample: Sample, rng: &mut dyn RngCore) -> DatasetResult<Sample> {
        if rng.random::<f32>() >= self.prob {
            return Ok(sample);
        }
        let offset = uniform_symmetric(rng, self.offsets);
        for key in &self.keys {
            sample.volume_mut(key)?.data.mapv_inplace(|v| v + offset);
        }
        Ok(sample)
    }
}

fn uniform_symmetric(rng: &mut dyn RngCore, bound: f32) -> f32 {
    if bound <= 0.0 {
        0.0
    } else {
        rng.random_range(-bound..bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Volume;
    use ndarray::Array4;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample_with(data: Array4<f32>) -> Sample {
        Sample::new(0).with_volume("image", Volume::from_data(data))
    }

    #[test]
    fn nonzero_channel_normalization_leaves_background() {
        let mut data = Array4::zeros((2, 2, 2, 1));
        data[(0, 0, 0, 0)] = 1.0;
        data[(0, 1, 0, 0)] = 3.0;
        data[(1, 0, 1, 0)] = 5.0;
        data[(1, 1, 1, 0)] = 5.0;
        let mut rng = StdRng::seed_from_u64(0);
        let out = NormalizeIntensity::new(&["image"], true, true)
            .apply(sample_with(data), &mut rng)
            .unwrap();
        let v = &out.volume("image").unwrap().data;
        assert_eq!(v[(0, 0, 0, 0)], -1.0);
        assert_eq!(v[(0, 1, 0, 0)], 1.0);
        assert_eq!(v[(0, 0, 1, 0)], 0.0);
        // Constant channel: std falls back to 1.
        assert_eq!(v[(1, 0, 1, 0)], 0.0);
        assert_eq!(v[(1, 0, 0, 0)], 0.0);
    }

    #[test]
    fn scale_and_shift_stay_within_bounds() {
        let data = Array4::from_elem((1, 2, 2, 2), 2.0f32);
        let mut rng = StdRng::seed_from_u64(42);
        let out = RandScaleIntensity::new(&["image"], 0.1, 1.0)
            .apply(sample_with(data), &mut rng)
            .unwrap();
        let scaled = out.volume("image").unwrap().data[(0, 0, 0, 0)];
        assert!((1.8..2.2).contains(&scaled));
        assert!(out.volume("image").unwrap().data.iter().all(|v| *v == scaled));

        let out = RandShiftIntensity::new(&["image"], 0.1, 1.0)
            .apply(out, &mut rng)
            .unwrap();
        let shifted = out.volume("image").unwrap().data[(0, 1, 1, 1)];
        assert!((shifted - scaled).abs() < 0.1 + 1e-6);
    }

    #[test]
    fn zero_probability_is_a_no_op() {
        let data = Array4::from_elem((1, 1, 1, 1), 3.0f32);
        let mut rng = StdRng::seed_from_u64(5);
        let out = RandScaleIntensity::new(&["image"], 0.5, 0.0)
            .apply(sample_with(data), &mut rng)
            .unwrap();
        assert_eq!(out.volume("image").unwrap().data[(0, 0, 0, 0)], 3.0);
    }
}
