//! Batched, parallel iteration over a [`DecathlonDataset`].

use crate::decathlon::DecathlonDataset;
use crate::types::{DatasetError, DatasetResult, Sample};
use burn::tensor::{backend::Backend, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    /// Worker threads for transform application.
    pub num_workers: usize,
    pub seed: u64,
    /// Return the processed host samples alongside the tensors.
    pub keep_samples: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            shuffle: false,
            num_workers: 2,
            seed: 0,
            keep_samples: false,
        }
    }
}

pub struct VolumeBatch<B: Backend> {
    /// `[B, C, X, Y, Z]`
    pub image: Tensor<B, 5>,
    /// `[B, 3, X, Y, Z]` when every sample carries a label.
    pub label: Option<Tensor<B, 5>>,
    pub indices: Vec<usize>,
    /// Processed samples; empty unless `keep_samples` is set.
    pub samples: Vec<Sample>,
}

pub struct VolumeLoader {
    dataset: Arc<DecathlonDataset>,
    cfg: LoaderConfig,
    pool: rayon::ThreadPool,
}

impl VolumeLoader {
    pub fn new(dataset: Arc<DecathlonDataset>, cfg: LoaderConfig) -> DatasetResult<Self> {
        if cfg.batch_size == 0 {
            return Err(DatasetError::Other("batch_size must be at least 1".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.num_workers.max(1))
            .thread_name(|i| format!("volume-loader-{i}"))
            .build()
            .map_err(|e| DatasetError::Other(format!("loader pool: {e}")))?;
        Ok(Self { dataset, cfg, pool })
    }

    pub fn dataset(&self) -> &DecathlonDataset {
        &self.dataset
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.cfg.batch_size)
    }

    /// Sample order for `epoch`; shuffled per epoch when enabled.
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.cfg.shuffle {
            let mut rng = StdRng::seed_from_u64(self.cfg.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    pub fn iter<'a, B: Backend>(&'a self, epoch: usize, device: &'a B::Device) -> VolumeBatchIter<'a, B> {
        VolumeBatchIter {
            loader: self,
            order: self.epoch_order(epoch),
            cursor: 0,
            epoch,
            ready: VecDeque::new(),
            device,
            started: Instant::now(),
        }
    }

    fn load_one(&self, epoch: usize, index: usize) -> DatasetResult<Sample> {
        let seed = self.cfg.seed ^ ((epoch as u64) << 32) ^ index as u64;
        let mut rng = StdRng::seed_from_u64(seed);
        self.dataset.get(index, &mut rng)
    }
}

pub struct VolumeBatchIter<'a, B: Backend> {
    loader: &'a VolumeLoader,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    ready: VecDeque<DatasetResult<Sample>>,
    device: &'a B::Device,
    started: Instant,
}

impl<B: Backend> VolumeBatchIter<'_, B> {
    /// Run transforms for the next `batch_size * num_workers` samples in parallel.
    fn prefetch(&mut self) {
        let cfg = &self.loader.cfg;
        let chunk = cfg.batch_size * cfg.num_workers.max(1);
        let end = (self.cursor + chunk).min(self.order.len());
        let wanted = &self.order[self.cursor..end];
        let epoch = self.epoch;
        let loader = self.loader;
        let t0 = Instant::now();
        let loaded: Vec<DatasetResult<Sample>> = loader
            .pool
            .install(|| wanted.par_iter().map(|&i| loader.load_one(epoch, i)).collect());
        tracing::debug!(
            samples = loaded.len(),
            ms = t0.elapsed().as_millis() as u64,
            "prefetched"
        );
        self.ready.extend(loaded);
        self.cursor = end;
    }
}

impl<B: Backend> Iterator for VolumeBatchIter<'_, B> {
    type Item = DatasetResult<VolumeBatch<B>>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch_size = self.loader.cfg.batch_size;
        if self.ready.len() < batch_size && self.cursor < self.order.len() {
            self.prefetch();
        }
        if self.ready.is_empty() {
            tracing::debug!(
                epoch = self.epoch,
                secs = self.started.elapsed().as_secs_f32(),
                "loader exhausted"
            );
            return None;
        }
        let take = batch_size.min(self.ready.len());
        let mut samples = Vec::with_capacity(take);
        for _ in 0..take {
            match self.ready.pop_front() {
                Some(Ok(sample)) => samples.push(sample),
                Some(Err(e)) => return Some(Err(e)),
                None => break,
            }
        }
        Some(self.assemble(samples))
    }
}

impl<B: Backend> VolumeBatchIter<'_, B> {
    fn assemble(&self, samples: Vec<Sample>) -> DatasetResult<VolumeBatch<B>> {
        let image = collate::<B>(&samples, "image", self.device)?;
        let label = if samples.iter().all(|s| s.contains("label")) {
            Some(collate::<B>(&samples, "label", self.device)?)
        } else {
            None
        };
        let indices = samples.iter().map(|s| s.index).collect();
        let samples = if self.loader.cfg.keep_samples {
            samples
        } else {
            Vec::new()
        };
        Ok(VolumeBatch {
            image,
            label,
            indices,
            samples,
        })
    }
}

/// Stack field `key` of every sample into a `[B, C, X, Y, Z]` tensor.
pub fn collate<B: Backend>(samples: &[Sample], key: &str, device: &B::Device) -> DatasetResult<Tensor<B, 5>> {
    let first = samples
        .first()
        .ok_or_else(|| DatasetError::Other("cannot collate an empty batch".into()))?
        .volume(key)?;
    let (c, x, y, z) = first.data.dim();
    let mut buf = Vec::with_capacity(samples.len() * c * x * y * z);
    for sample in samples {
        let volume = sample.volume(key)?;
        if volume.data.dim() != (c, x, y, z) {
            return Err(DatasetError::Shape(format!(
                "sample {} `{key}` is {:?}, batch expects {:?}",
                sample.index,
                volume.data.dim(),
                (c, x, y, z)
            )));
        }
        buf.extend(volume.data.iter().copied());
    }
    Ok(Tensor::<B, 1>::from_floats(buf.as_slice(), device).reshape([samples.len(), c, x, y, z]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Volume;
    use burn_ndarray::NdArray;
    use ndarray::Array4;

    type TestBackend = NdArray<f32>;

    #[test]
    fn collate_stacks_in_sample_order() {
        let a = Sample::new(0).with_volume("image", Volume::from_data(Array4::from_elem((2, 2, 2, 2), 1.0)));
        let b = Sample::new(1).with_volume("image", Volume::from_data(Array4::from_elem((2, 2, 2, 2), 2.0)));
        let device = Default::default();
        let batch = collate::<TestBackend>(&[a, b], "image", &device).unwrap();
        assert_eq!(batch.dims(), [2, 2, 2, 2, 2]);
        let values = batch.into_data().to_vec::<f32>().unwrap();
        assert!(values[..16].iter().all(|v| *v == 1.0));
        assert!(values[16..].iter().all(|v| *v == 2.0));
    }

    #[test]
    fn collate_rejects_mismatched_shapes() {
        let a = Sample::new(0).with_volume("image", Volume::from_data(Array4::zeros((1, 2, 2, 2))));
        let b = Sample::new(1).with_volume("image", Volume::from_data(Array4::zeros((1, 3, 2, 2))));
        let device = Default::default();
        let err = collate::<TestBackend>(&[a, b], "image", &device).unwrap_err();
        assert!(matches!(err, DatasetError::Shape(_)));
    }
}
