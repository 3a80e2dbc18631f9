//! Sliding-window inference over whole volumes.
//!
//! The input is zero-padded up to the window size where needed, covered by
//! overlapping windows whose last start is clamped to the border, and the
//! window predictions are averaged with uniform weights.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use std::ops::Range;

/// Window size, overlap and how many windows go through the predictor at once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlidingWindow {
    pub roi_size: [usize; 3],
    pub sw_batch_size: usize,
    pub overlap: f64,
}

impl SlidingWindow {
    pub fn new(roi_size: [usize; 3], sw_batch_size: usize, overlap: f64) -> Self {
        Self {
            roi_size,
            sw_batch_size,
            overlap,
        }
    }

    /// Run `predictor` over every window of a `[B, C, X, Y, Z]` input.
    ///
    /// The predictor must keep the spatial size of its input; its channel count
    /// may differ from the input's. The result has the input's spatial shape.
    pub fn infer<B, F>(&self, input: Tensor<B, 5>, mut predictor: F) -> Tensor<B, 5>
    where
        B: Backend,
        F: FnMut(Tensor<B, 5>) -> Tensor<B, 5>,
    {
        let [batch, channels, x, y, z] = input.dims();
        let size = [x, y, z];
        let roi = self.roi_size;
        let padded: [usize; 3] = std::array::from_fn(|i| size[i].max(roi[i]));
        let pad_before: [usize; 3] = std::array::from_fn(|i| (padded[i] - size[i]) / 2);
        let device = input.device();

        let input = if padded == size {
            input
        } else {
            Tensor::zeros([batch, channels, padded[0], padded[1], padded[2]], &device).slice_assign(
                [
                    0..batch,
                    0..channels,
                    pad_before[0]..pad_before[0] + x,
                    pad_before[1]..pad_before[1] + y,
                    pad_before[2]..pad_before[2] + z,
                ],
                input,
            )
        };

        let windows = window_grid(padded, roi, self.overlap);
        let mut output: Option<Tensor<B, 5>> = None;
        let mut counts: Option<Tensor<B, 5>> = None;

        for group in windows.chunks(self.sw_batch_size.max(1)) {
            let crops: Vec<Tensor<B, 5>> = group
                .iter()
                .map(|window| input.clone().slice(spatial_ranges(batch, channels, window)))
                .collect();
            let preds = predictor(Tensor::cat(crops, 0));
            let out_channels = preds.dims()[1];

            let mut out = output.take().unwrap_or_else(|| {
                Tensor::zeros([batch, out_channels, padded[0], padded[1], padded[2]], &device)
            });
            let mut count = counts.take().unwrap_or_else(|| {
                Tensor::zeros([batch, out_channels, padded[0], padded[1], padded[2]], &device)
            });
            for (i, window) in group.iter().enumerate() {
                let ranges = spatial_ranges(batch, out_channels, window);
                let pred = preds.clone().slice([
                    i * batch..(i + 1) * batch,
                    0..out_channels,
                    0..roi[0],
                    0..roi[1],
                    0..roi[2],
                ]);
                let summed = out.clone().slice(ranges.clone()) + pred;
                out = out.slice_assign(ranges.clone(), summed);
                let seen = count.clone().slice(ranges.clone()).add_scalar(1.0);
                count = count.slice_assign(ranges, seen);
            }
            output = Some(out);
            counts = Some(count);
        }

        // `window_grid` always yields at least one window.
        let (Some(output), Some(counts)) = (output, counts) else {
            return Tensor::zeros([batch, channels, x, y, z], &device);
        };
        let averaged = output / counts;
        let out_channels = averaged.dims()[1];
        averaged.slice([
            0..batch,
            0..out_channels,
            pad_before[0]..pad_before[0] + x,
            pad_before[1]..pad_before[1] + y,
            pad_before[2]..pad_before[2] + z,
        ])
    }
}

/// Shorthand for [`SlidingWindow::infer`].
pub fn sliding_window_inference<B, F>(
    input: Tensor<B, 5>,
    roi_size: [usize; 3],
    sw_batch_size: usize,
    overlap: f64,
    predictor: F,
) -> Tensor<B, 5>
where
    B: Backend,
    F: FnMut(Tensor<B, 5>) -> Tensor<B, 5>,
{
    SlidingWindow::new(roi_size, sw_batch_size, overlap).infer(input, predictor)
}

/// Step between window starts along one axis.
pub fn scan_interval(size: usize, roi: usize, overlap: f64) -> usize {
    if roi == size {
        return roi;
    }
    ((roi as f64 * (1.0 - overlap)).floor() as usize).max(1)
}

/// Window start offsets along one axis of (already padded) length `size`.
pub fn window_starts(size: usize, roi: usize, overlap: f64) -> Vec<usize> {
    let interval = scan_interval(size, roi, overlap);
    let num = size.div_ceil(interval);
    let count = (0..num)
        .find(|d| d * interval + roi >= size)
        .map_or(1, |d| d + 1);
    (0..count)
        .map(|d| {
            let start = d * interval;
            start - (start + roi).saturating_sub(size)
        })
        .collect()
}

type Window = [Range<usize>; 3];

fn window_grid(size: [usize; 3], roi: [usize; 3], overlap: f64) -> Vec<Window> {
    let sx = window_starts(size[0], roi[0], overlap);
    let sy = window_starts(size[1], roi[1], overlap);
    let sz = window_starts(size[2], roi[2], overlap);
    let mut windows = Vec::with_capacity(sx.len() * sy.len() * sz.len());
    for &a in &sx {
        for &b in &sy {
            for &c in &sz {
                windows.push([a..a + roi[0], b..b + roi[1], c..c + roi[2]]);
            }
        }
    }
    windows
}

fn spatial_ranges(batch: usize, channels: usize, window: &Window) -> [Range<usize>; 5] {
    [
        0..batch,
        0..channels,
        window[0].clone(),
        window[1].clone(),
        window[2].clone(),
    ]
}
