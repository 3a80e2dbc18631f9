//! Voxel-grid transforms: reorientation, resampling, cropping and flipping.
//!
//! Orientation and Spacing record an [`AppliedOp`] on the volume so that a
//! prediction made on the transformed grid can be mapped back with
//! [`invert_ops`].

use super::{keys_of, MapTransform};
use crate::types::{affine_spacing, AppliedOp, DatasetError, DatasetResult, Interpolation, Sample, Volume};
use nalgebra::Matrix4;
use ndarray::{s, Array4, Axis, Zip};
use rand::{Rng, RngCore};

/// Permutation and flips that bring `affine`'s voxel axes to `axcodes`.
///
/// Each voxel axis is matched greedily to the world axis it is most aligned
/// with. `axcodes` is three letters from `R/L`, `A/P`, `S/I`.
pub fn orientation_transform(
    affine: &Matrix4<f64>,
    axcodes: &str,
) -> DatasetResult<([usize; 3], [bool; 3])> {
    let targets = parse_axcodes(axcodes)?;

    // (world axis, sign) for each voxel axis.
    let mut voxel_to_world = [(usize::MAX, 1.0f64); 3];
    let mut world_taken = [false; 3];
    let mut voxel_done = [false; 3];
    for _ in 0..3 {
        let mut best: Option<(usize, usize, f64)> = None;
        for (v, done) in voxel_done.iter().enumerate() {
            if *done {
                continue;
            }
            let column = affine.fixed_view::<3, 1>(0, v);
            let norm = column.norm().max(f64::EPSILON);
            for (w, taken) in world_taken.iter().enumerate() {
                if *taken {
                    continue;
                }
                let weight = column[w].abs() / norm;
                if best.map_or(true, |(_, _, b)| weight > b) {
                    best = Some((v, w, weight));
                }
            }
        }
        let Some((v, w, _)) = best else {
            break;
        };
        let sign = if affine[(w, v)] < 0.0 { -1.0 } else { 1.0 };
        voxel_to_world[v] = (w, sign);
        voxel_done[v] = true;
        world_taken[w] = true;
    }

    let mut permutation = [0usize; 3];
    let mut flips = [false; 3];
    for (new_axis, (world, sign)) in targets.iter().enumerate() {
        let old_axis = voxel_to_world
            .iter()
            .position(|(w, _)| w == world)
            .ok_or_else(|| DatasetError::Shape("degenerate affine".to_string()))?;
        permutation[new_axis] = old_axis;
        flips[new_axis] = voxel_to_world[old_axis].1 != *sign;
    }
    Ok((permutation, flips))
}

fn parse_axcodes(axcodes: &str) -> DatasetResult<[(usize, f64); 3]> {
    let codes: Vec<char> = axcodes.chars().map(|c| c.to_ascii_uppercase()).collect();
    if codes.len() != 3 {
        return Err(DatasetError::Other(format!(
            "axcodes must have three letters, got `{axcodes}`"
        )));
    }
    let mut out = [(0usize, 1.0f64); 3];
    let mut seen = [false; 3];
    for (i, code) in codes.iter().enumerate() {
        let (world, sign) = match code {
            'R' => (0, 1.0),
            'L' => (0, -1.0),
            'A' => (1, 1.0),
            'P' => (1, -1.0),
            'S' => (2, 1.0),
            'I' => (2, -1.0),
            other => {
                return Err(DatasetError::Other(format!("unknown axis code `{other}`")));
            }
        };
        if seen[world] {
            return Err(DatasetError::Other(format!(
                "axcodes `{axcodes}` name the same world axis twice"
            )));
        }
        seen[world] = true;
        out[i] = (world, sign);
    }
    Ok(out)
}

fn permute_and_flip(data: Array4<f32>, permutation: [usize; 3], flips: [bool; 3]) -> Array4<f32> {
    let mut out = data.permuted_axes([
        0,
        permutation[0] + 1,
        permutation[1] + 1,
        permutation[2] + 1,
    ]);
    for (axis, flip) in flips.iter().enumerate() {
        if *flip {
            out.invert_axis(Axis(axis + 1));
        }
    }
    out.as_standard_layout().into_owned()
}

/// Maps voxel indices of the reoriented grid to indices of the old grid.
fn reorientation_matrix(old_shape: [usize; 3], permutation: [usize; 3], flips: [bool; 3]) -> Matrix4<f64> {
    let mut t = Matrix4::zeros();
    t[(3, 3)] = 1.0;
    for i in 0..3 {
        let p = permutation[i];
        if flips[i] {
            t[(p, i)] = -1.0;
            t[(p, 3)] = old_shape[p] as f64 - 1.0;
        } else {
            t[(p, i)] = 1.0;
        }
    }
    t
}

/// Resample `data` to `out_shape`, output voxel `o` reading source coordinate `o * factor`.
fn resample(
    data: &Array4<f32>,
    out_shape: [usize; 3],
    factors: [f64; 3],
    interp: Interpolation,
) -> Array4<f32> {
    let mut current = data.clone();
    for axis in 0..3 {
        let (c, x, y, z) = current.dim();
        let mut dims = [c, x, y, z];
        if dims[axis + 1] == out_shape[axis] && (factors[axis] - 1.0).abs() < 1e-12 {
            continue;
        }
        dims[axis + 1] = out_shape[axis];
        let mut next = Array4::<f32>::zeros((dims[0], dims[1], dims[2], dims[3]));
        let factor = factors[axis];
        Zip::from(next.lanes_mut(Axis(axis + 1)))
            .and(current.lanes(Axis(axis + 1)))
            .for_each(|mut dst, src| {
                let n = src.len();
                for (o, value) in dst.iter_mut().enumerate() {
                    let coord = o as f64 * factor;
                    *value = sample_lane(&src, n, coord, interp);
                }
            });
        current = next;
    }
    current
}

fn sample_lane(
    src: &ndarray::ArrayView1<f32>,
    n: usize,
    coord: f64,
    interp: Interpolation,
) -> f32 {
    let last = (n - 1) as f64;
    let coord = coord.clamp(0.0, last);
    match interp {
        Interpolation::Nearest => src[(coord.round() as usize).min(n - 1)],
        Interpolation::Bilinear => {
            let i0 = coord.floor() as usize;
            let i1 = (i0 + 1).min(n - 1);
            let w = (coord - i0 as f64) as f32;
            src[i0] * (1.0 - w) + src[i1] * w
        }
    }
}

fn orient_volume(volume: &mut Volume, axcodes: &str) -> DatasetResult<()> {
    let (permutation, flips) = orientation_transform(&volume.affine, axcodes)?;
    let old_shape = volume.spatial_shape();
    let original_affine = volume.affine;
    let data = std::mem::take(&mut volume.data);
    volume.data = permute_and_flip(data, permutation, flips);
    volume.affine = original_affine * reorientation_matrix(old_shape, permutation, flips);
    volume.applied.push(AppliedOp::Orientation {
        permutation,
        flips,
        original_affine,
    });
    Ok(())
}

fn respace_volume(volume: &mut Volume, pixdim: [f64; 3], interp: Interpolation) {
    let spacing = volume.spacing();
    let shape = volume.spatial_shape();
    let mut factors = [1.0; 3];
    let mut out_shape = [0usize; 3];
    for axis in 0..3 {
        factors[axis] = pixdim[axis] / spacing[axis];
        out_shape[axis] = ((shape[axis] as f64 * spacing[axis] / pixdim[axis]).round() as usize).max(1);
    }
    let original_affine = volume.affine;
    volume.data = resample(&volume.data, out_shape, factors, interp);
    volume.affine = original_affine
        * Matrix4::new_nonuniform_scaling(&nalgebra::Vector3::new(
            factors[0], factors[1], factors[2],
        ));
    volume.applied.push(AppliedOp::Spacing {
        original_shape: shape,
        original_affine,
    });
}

/// Undo recorded operations (newest first), restoring the original grid and affine.
pub fn invert_ops(
    mut volume: Volume,
    ops: &[AppliedOp],
    interp: Interpolation,
) -> DatasetResult<Volume> {
    for op in ops.iter().rev() {
        match op {
            AppliedOp::Orientation {
                permutation,
                flips,
                original_affine,
            } => {
                let mut data = std::mem::take(&mut volume.data);
                for (axis, flip) in flips.iter().enumerate() {
                    if *flip {
                        data.invert_axis(Axis(axis + 1));
                    }
                }
                let mut inverse = [0usize; 3];
                for (new_axis, old_axis) in permutation.iter().enumerate() {
                    inverse[*old_axis] = new_axis;
                }
                volume.data = data
                    .permuted_axes([0, inverse[0] + 1, inverse[1] + 1, inverse[2] + 1])
                    .as_standard_layout()
                    .into_owned();
                volume.affine = *original_affine;
            }
            AppliedOp::Spacing {
                original_shape,
                original_affine,
            } => {
                let current = volume.spacing();
                let original = affine_spacing(original_affine);
                let mut factors = [1.0; 3];
                for axis in 0..3 {
                    factors[axis] = original[axis] / current[axis];
                }
                volume.data = resample(&volume.data, *original_shape, factors, interp);
                volume.affine = *original_affine;
            }
        }
        volume.applied.pop();
    }
    Ok(volume)
}

/// Reorient volumes so their voxel axes follow `axcodes` (e.g. `RAS`).
#[derive(Debug, Clone)]
pub struct Orientation {
    keys: Vec<String>,
    axcodes: String,
}

impl Orientation {
    pub fn new(keys: &[&str], axcodes: &str) -> Self {
        Self {
            keys: keys_of(keys),
            axcodes: axcodes.to_string(),
        }
    }
}

impl MapTransform for Orientation {
    fn name(&self) -> &'static str {
        "Orientation"
    }

    fn apply(&self, mut sample: Sample, _rng: &mut dyn RngCore) -> DatasetResult<Sample> {
        for key in &self.keys {
            orient_volume(sample.volume_mut(key)?, &self.axcodes)?;
        }
        Ok(sample)
    }
}

/// Resample volumes to a target voxel size, one interpolation mode per key.
#[derive(Debug, Clone)]
pub struct Spacing {
    keys: Vec<String>,
    pixdim: [f64; 3],
    modes: Vec<Interpolation>,
}

impl Spacing {
    pub fn new(keys: &[&str], pixdim: [f64; 3], modes: &[Interpolation]) -> DatasetResult<Self> {
        if modes.len() != keys.len() {
            return Err(DatasetError::Other(format!(
                "Spacing got {} keys but {} modes",
                keys.len(),
                modes.len()
            )));
        }
        if pixdim.iter().any(|v| *v <= 0.0) {
            return Err(DatasetError::Other(format!(
                "target pixdim must be positive, got {pixdim:?}"
            )));
        }
        Ok(Self {
            keys: keys_of(keys),
            pixdim,
            modes: modes.to_vec(),
        })
    }
}

impl MapTransform for Spacing {
    fn name(&self) -> &'static str {
        "Spacing"
    }

    fn apply(&self, mut sample: Sample, _rng: &mut dyn RngCore) -> DatasetResult<Sample> {
        for (key, mode) in self.keys.iter().zip(&self.modes) {
            respace_volume(sample.volume_mut(key)?, self.pixdim, *mode);
        }
        Ok(sample)
    }
}

/// Crop one random window of `roi_size` (clipped to the volume) shared by all keys.
#[derive(Debug, Clone)]
pub struct RandSpatialCrop {
    keys: Vec<String>,
    roi_size: [usize; 3],
}

impl RandSpatialCrop {
    pub fn new(keys: &[&str], roi_size: [usize; 3]) -> Self {
        Self {
            keys: keys_of(keys),
            roi_size,
        }
    }
}

impl MapTransform for RandSpatialCrop {
    fn name(&self) -> &'static str {
        "RandSpatialCrop"
    }

    fn apply(&self, mut sample: Sample, rng: &mut dyn RngCore) -> DatasetResult<Sample> {
        let Some(first) = self.keys.first() else {
            return Ok(sample);
        };
        let shape = sample.volume(first)?.spatial_shape();
        for key in &self.keys[1..] {
            let other = sample.volume(key)?.spatial_shape();
            if other != shape {
                return Err(DatasetError::Shape(format!(
                    "sample {}: `{first}` is {shape:?} but `{key}` is {other:?}",
                    sample.index
                )));
            }
        }

        let mut start = [0usize; 3];
        let mut size = [0usize; 3];
        for axis in 0..3 {
            size[axis] = self.roi_size[axis].min(shape[axis]);
            let slack = shape[axis] - size[axis];
            start[axis] = if slack > 0 {
                rng.random_range(0..=slack)
            } else {
                0
            };
        }

        for key in &self.keys {
            let volume = sample.volume_mut(key)?;
            volume.data = volume
                .data
                .slice(s![
                    ..,
                    start[0]..start[0] + size[0],
                    start[1]..start[1] + size[1],
                    start[2]..start[2] + size[2]
                ])
                .to_owned();
            let mut shift = Matrix4::identity();
            for axis in 0..3 {
                shift[(axis, 3)] = start[axis] as f64;
            }
            volume.affine *= shift;
        }
        Ok(sample)
    }
}

/// Flip along one spatial axis with probability `prob`, same decision for every key.
#[derive(Debug, Clone)]
pub struct RandFlip {
    keys: Vec<String>,
    prob: f32,
    spatial_axis: usize,
}

impl RandFlip {
    pub fn new(keys: &[&str], prob: f32, spatial_axis: usize) -> DatasetResult<Self> {
        if spatial_axis > 2 {
            return Err(DatasetError::Other(format!(
                "spatial_axis must be 0, 1 or 2, got {spatial_axis}"
            )));
        }
        Ok(Self {
            keys: keys_of(keys),
            prob,
            spatial_axis,
        })
    }
}

impl MapTransform for RandFlip {
    fn name(&self) -> &'static str {
        "RandFlip"
    }

    fn apply(&self, mut sample: Sample, rng: &mut dyn RngCore) -> DatasetResult<Sample> {
        if rng.random::<f32>() >= self.prob {
            return Ok(sample);
        }
        let axis = self.spatial_axis;
        for key in &self.keys {
            let volume = sample.volume_mut(key)?;
            let n = volume.spatial_shape()[axis];
            volume.data.invert_axis(Axis(axis + 1));
            volume.data = volume.data.as_standard_layout().into_owned();
            let mut flip = Matrix4::identity();
            flip[(axis, axis)] = -1.0;
            flip[(axis, 3)] = n as f64 - 1.0;
            volume.affine *= flip;
        }
        Ok(sample)
    }
}
