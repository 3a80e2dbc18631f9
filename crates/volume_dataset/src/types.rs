//! Core types, error definitions, and data structures for volume_dataset.

use burn::tensor::{backend::Backend, Tensor};
use data_contracts::ContractError;
use nalgebra::Matrix4;
use ndarray::Array4;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("nifti error at {path}: {source}")]
    Nifti {
        path: PathBuf,
        #[source]
        source: nifti::NiftiError,
    },
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("sample {index} has no field `{key}`")]
    MissingKey { index: usize, key: String },
    #[error("sample {index} field `{key}` has not been loaded yet")]
    NotLoaded { index: usize, key: String },
    #[error("shape error: {0}")]
    Shape(String),
    #[error("download of {url} failed: {msg}")]
    Download { url: String, msg: String },
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Checksum {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("{0}")]
    Other(String),
}

/// Interpolation used when a spatial transform resamples voxels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    /// Trilinear, clamped at the borders.
    Bilinear,
    Nearest,
}

/// Voxel size along each axis, taken from the affine column norms.
pub fn affine_spacing(affine: &Matrix4<f64>) -> [f64; 3] {
    let mut out = [0.0; 3];
    for (axis, value) in out.iter_mut().enumerate() {
        *value = affine.fixed_view::<3, 1>(0, axis).norm();
    }
    out
}

/// An invertible spatial operation recorded on a volume.
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedOp {
    /// New voxel axis `i` was old axis `permutation[i]`, reversed when `flips[i]`.
    Orientation {
        permutation: [usize; 3],
        flips: [bool; 3],
        original_affine: Matrix4<f64>,
    },
    Spacing {
        original_shape: [usize; 3],
        original_affine: Matrix4<f64>,
    },
}

/// A channel-first voxel volume (`[C, X, Y, Z]`) with its voxel-to-world affine.
#[derive(Debug, Clone)]
pub struct Volume {
    pub data: Array4<f32>,
    pub affine: Matrix4<f64>,
    /// Invertible spatial operations applied since load, oldest first.
    pub applied: Vec<AppliedOp>,
}

impl Volume {
    pub fn new(data: Array4<f32>, affine: Matrix4<f64>) -> Self {
        Self {
            data,
            affine,
            applied: Vec::new(),
        }
    }

    /// Volume with an identity affine (1mm voxels, origin at zero).
    pub fn from_data(data: Array4<f32>) -> Self {
        Self::new(data, Matrix4::identity())
    }

    pub fn channels(&self) -> usize {
        self.data.dim().0
    }

    pub fn spatial_shape(&self) -> [usize; 3] {
        let (_, x, y, z) = self.data.dim();
        [x, y, z]
    }

    pub fn spacing(&self) -> [f64; 3] {
        affine_spacing(&self.affine)
    }

    /// Copy into a `[C, X, Y, Z]` tensor.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        let (c, x, y, z) = self.data.dim();
        let buf: Vec<f32> = self.data.iter().copied().collect();
        Tensor::<B, 1>::from_floats(buf.as_slice(), device).reshape([c, x, y, z])
    }

    /// Build a volume from a `[C, X, Y, Z]` tensor, taking geometry from `like`.
    pub fn from_tensor<B: Backend>(tensor: Tensor<B, 4>, like: &Volume) -> DatasetResult<Self> {
        let [c, x, y, z] = tensor.dims();
        let values = tensor
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| DatasetError::Other(format!("tensor readback failed: {e:?}")))?;
        let data = Array4::from_shape_vec((c, x, y, z), values)
            .map_err(|e| DatasetError::Shape(e.to_string()))?;
        Ok(Self {
            data,
            affine: like.affine,
            applied: like.applied.clone(),
        })
    }
}

/// A field of a sample: either a file still to be loaded or a loaded volume.
#[derive(Debug, Clone)]
pub enum Field {
    Path(PathBuf),
    Volume(Volume),
}

/// One dataset item as a mapping from field name (`image`, `label`, `pred`) to data.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    pub index: usize,
    fields: BTreeMap<String, Field>,
}

impl Sample {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_path(mut self, key: &str, path: impl Into<PathBuf>) -> Self {
        self.fields.insert(key.to_string(), Field::Path(path.into()));
        self
    }

    pub fn with_volume(mut self, key: &str, volume: Volume) -> Self {
        self.insert_volume(key, volume);
        self
    }

    pub fn insert_volume(&mut self, key: &str, volume: Volume) {
        self.fields.insert(key.to_string(), Field::Volume(volume));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn path(&self, key: &str) -> DatasetResult<&Path> {
        match self.fields.get(key) {
            Some(Field::Path(path)) => Ok(path),
            Some(Field::Volume(_)) => Err(DatasetError::Other(format!(
                "sample {} field `{key}` is already loaded",
                self.index
            ))),
            None => Err(self.missing(key)),
        }
    }

    pub fn volume(&self, key: &str) -> DatasetResult<&Volume> {
        match self.fields.get(key) {
            Some(Field::Volume(volume)) => Ok(volume),
            Some(Field::Path(_)) => Err(self.not_loaded(key)),
            None => Err(self.missing(key)),
        }
    }

    pub fn volume_mut(&mut self, key: &str) -> DatasetResult<&mut Volume> {
        let index = self.index;
        match self.fields.get_mut(key) {
            Some(Field::Volume(volume)) => Ok(volume),
            Some(Field::Path(_)) => Err(DatasetError::NotLoaded {
                index,
                key: key.to_string(),
            }),
            None => Err(DatasetError::MissingKey {
                index,
                key: key.to_string(),
            }),
        }
    }

    pub fn take_volume(&mut self, key: &str) -> DatasetResult<Volume> {
        match self.fields.remove(key) {
            Some(Field::Volume(volume)) => Ok(volume),
            Some(field @ Field::Path(_)) => {
                self.fields.insert(key.to_string(), field);
                Err(self.not_loaded(key))
            }
            None => Err(self.missing(key)),
        }
    }

    fn missing(&self, key: &str) -> DatasetError {
        DatasetError::MissingKey {
            index: self.index,
            key: key.to_string(),
        }
    }

    fn not_loaded(&self, key: &str) -> DatasetError {
        DatasetError::NotLoaded {
            index: self.index,
            key: key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    #[test]
    fn spacing_reads_affine_columns() {
        let mut affine = Matrix4::identity();
        affine[(0, 0)] = -2.0;
        affine[(1, 1)] = 0.5;
        let volume = Volume::new(Array4::zeros((1, 2, 2, 2)), affine);
        assert_eq!(volume.spacing(), [2.0, 0.5, 1.0]);
    }

    #[test]
    fn tensor_round_trip_keeps_layout() {
        let data = Array4::from_shape_fn((2, 2, 3, 1), |(c, x, y, _)| (c * 100 + x * 10 + y) as f32);
        let volume = Volume::from_data(data.clone());
        let device = Default::default();
        let tensor = volume.to_tensor::<NdArray<f32>>(&device);
        assert_eq!(tensor.dims(), [2, 2, 3, 1]);
        let back = Volume::from_tensor(tensor, &volume).unwrap();
        assert_eq!(back.data, data);
    }

    #[test]
    fn unloaded_field_is_reported() {
        let mut sample = Sample::new(3).with_path("image", "a.nii.gz");
        assert!(matches!(
            sample.volume("image"),
            Err(DatasetError::NotLoaded { index: 3, .. })
        ));
        assert!(matches!(
            sample.take_volume("label"),
            Err(DatasetError::MissingKey { index: 3, .. })
        ));
        assert!(sample.contains("image"));
    }
}
