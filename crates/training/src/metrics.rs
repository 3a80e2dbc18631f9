//! Cumulative Dice scores over binarized predictions.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use ndarray::{ArrayView4, Axis, Zip};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricReduction {
    /// Channel mean per sample, then the mean over samples.
    Mean,
    /// Per-channel mean over samples.
    MeanBatch,
}

/// Accumulates one Dice score per (sample, channel) until [`DiceMetric::reset`].
///
/// A channel whose ground truth is empty scores NaN and is left out of every
/// reduction.
#[derive(Debug, Clone)]
pub struct DiceMetric {
    reduction: MetricReduction,
    scores: Vec<Vec<f32>>,
}

impl DiceMetric {
    pub fn new(reduction: MetricReduction) -> Self {
        Self {
            reduction,
            scores: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Score a `[B, C, X, Y, Z]` batch of 0/1 predictions against 0/1 targets.
    pub fn update<B: Backend>(&mut self, pred: Tensor<B, 5>, target: Tensor<B, 5>) {
        let [b, c, x, y, z] = pred.dims();
        let n = x * y * z;
        let pred = pred.reshape([b, c, n]);
        let target = target.reshape([b, c, n]);
        let intersection = read((pred.clone() * target.clone()).sum_dim(2));
        let pred_sum = read(pred.sum_dim(2));
        let target_sum = read(target.sum_dim(2));
        for sample in 0..b {
            let row = (0..c)
                .map(|ch| {
                    let i = sample * c + ch;
                    dice(intersection[i], pred_sum[i], target_sum[i])
                })
                .collect();
            self.scores.push(row);
        }
    }

    /// Score one `[C, X, Y, Z]` host prediction against its target.
    pub fn update_volume(&mut self, pred: ArrayView4<'_, f32>, target: ArrayView4<'_, f32>) {
        let row = pred
            .axis_iter(Axis(0))
            .zip(target.axis_iter(Axis(0)))
            .map(|(p, g)| {
                let mut intersection = 0.0f32;
                let mut pred_sum = 0.0f32;
                let mut target_sum = 0.0f32;
                Zip::from(&p).and(&g).for_each(|&p, &g| {
                    intersection += p * g;
                    pred_sum += p;
                    target_sum += g;
                });
                dice(intersection, pred_sum, target_sum)
            })
            .collect();
        self.scores.push(row);
    }

    /// Reduced scores: one value for `Mean`, one per channel for `MeanBatch`.
    pub fn aggregate(&self) -> Vec<f32> {
        match self.reduction {
            MetricReduction::Mean => vec![self.aggregate_mean()],
            MetricReduction::MeanBatch => self.aggregate_per_channel(),
        }
    }

    pub fn aggregate_mean(&self) -> f32 {
        let per_sample: Vec<f32> = self
            .scores
            .iter()
            .filter_map(|row| nan_mean(row.iter().copied()))
            .collect();
        nan_mean(per_sample.into_iter()).unwrap_or(0.0)
    }

    pub fn aggregate_per_channel(&self) -> Vec<f32> {
        let channels = self.scores.first().map_or(0, Vec::len);
        (0..channels)
            .map(|ch| {
                nan_mean(self.scores.iter().filter_map(|row| row.get(ch).copied())).unwrap_or(0.0)
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.scores.clear();
    }
}

fn dice(intersection: f32, pred_sum: f32, target_sum: f32) -> f32 {
    if target_sum <= 0.0 {
        f32::NAN
    } else {
        2.0 * intersection / (pred_sum + target_sum)
    }
}

fn nan_mean(values: impl Iterator<Item = f32>) -> Option<f32> {
    let (sum, count) = values
        .filter(|v| !v.is_nan())
        .fold((0.0f64, 0usize), |(s, n), v| (s + v as f64, n + 1));
    (count > 0).then(|| (sum / count as f64) as f32)
}

fn read<B: Backend>(tensor: Tensor<B, 3>) -> Vec<f32> {
    tensor.into_data().to_vec::<f32>().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use ndarray::Array4;

    type TestBackend = NdArray<f32>;

    fn tensor(values: &[f32], shape: [usize; 5]) -> Tensor<TestBackend, 5> {
        Tensor::<TestBackend, 1>::from_floats(values, &Default::default()).reshape(shape)
    }

    #[test]
    fn empty_ground_truth_is_ignored() {
        let mut metric = DiceMetric::new(MetricReduction::MeanBatch);
        // channel 0: perfect; channel 1: empty target.
        let pred = tensor(&[1.0, 0.0, 1.0, 0.0], [1, 2, 2, 1, 1]);
        let target = tensor(&[1.0, 0.0, 0.0, 0.0], [1, 2, 2, 1, 1]);
        metric.update(pred, target);
        let per_channel = metric.aggregate();
        assert_eq!(per_channel[0], 1.0);
        assert_eq!(per_channel[1], 0.0);

        let mut mean = DiceMetric::new(MetricReduction::Mean);
        mean.update(
            tensor(&[1.0, 0.0, 1.0, 0.0], [1, 2, 2, 1, 1]),
            tensor(&[1.0, 0.0, 0.0, 0.0], [1, 2, 2, 1, 1]),
        );
        assert_eq!(mean.aggregate(), vec![1.0]);
    }

    #[test]
    fn reductions_average_the_right_axis() {
        let mut metric = DiceMetric::new(MetricReduction::Mean);
        // sample 0: channel dice 1.0 and 0.0; sample 1: 0.5 and NaN.
        metric.update(
            tensor(&[1.0, 1.0, 0.0, 1.0], [1, 2, 2, 1, 1]),
            tensor(&[1.0, 1.0, 1.0, 0.0], [1, 2, 2, 1, 1]),
        );
        metric.update(
            tensor(&[1.0, 1.0, 0.0, 0.0], [1, 2, 2, 1, 1]),
            tensor(&[1.0, 0.0, 0.0, 0.0], [1, 2, 2, 1, 1]),
        );
        let expected_sample_means = [0.5f32, 2.0 / 3.0];
        let expected = (expected_sample_means[0] + expected_sample_means[1]) / 2.0;
        assert!((metric.aggregate_mean() - expected).abs() < 1e-6);

        let per_channel = metric.aggregate_per_channel();
        assert!((per_channel[0] - (1.0 + 2.0 / 3.0) / 2.0).abs() < 1e-6);
        assert_eq!(per_channel[1], 0.0);
        assert_eq!(metric.len(), 2);

        metric.reset();
        assert!(metric.is_empty());
        assert_eq!(metric.aggregate_mean(), 0.0);
    }

    #[test]
    fn host_and_tensor_paths_agree() {
        let pred = Array4::from_shape_fn((3, 2, 2, 2), |(c, x, y, z)| ((c + x + y + z) % 2) as f32);
        let target = Array4::from_shape_fn((3, 2, 2, 2), |(c, x, y, _)| ((c + x * y) % 2) as f32);

        let mut host = DiceMetric::new(MetricReduction::MeanBatch);
        host.update_volume(pred.view(), target.view());

        let mut device = DiceMetric::new(MetricReduction::MeanBatch);
        let flat = |a: &Array4<f32>| a.iter().copied().collect::<Vec<_>>();
        device.update(
            tensor(&flat(&pred), [1, 3, 2, 2, 2]),
            tensor(&flat(&target), [1, 3, 2, 2, 2]),
        );
        let a = host.aggregate();
        let b = device.aggregate();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }
}
