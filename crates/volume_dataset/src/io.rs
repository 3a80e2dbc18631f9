//! NIfTI reading and writing for channel-first volumes.

use crate::types::{DatasetError, DatasetResult, Volume};
use nalgebra::Matrix4;
use ndarray::{Array4, Axis, Ix3, Ix4};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::Path;

/// Read a `.nii`/`.nii.gz` file.
///
/// 3D files become one channel; for 4D files the last axis becomes the channel
/// axis, matching how Decathlon stores the BraTS modalities.
pub fn read_nifti(path: &Path) -> DatasetResult<Volume> {
    let obj = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| nifti_err(path, e))?;
    let affine = header_affine(obj.header());
    let raw = obj
        .into_volume()
        .into_ndarray::<f32>()
        .map_err(|e| nifti_err(path, e))?;

    let data: Array4<f32> = match raw.ndim() {
        3 => raw
            .into_dimensionality::<Ix3>()
            .map_err(|e| DatasetError::Shape(format!("{}: {e}", path.display())))?
            .insert_axis(Axis(0)),
        4 => raw
            .into_dimensionality::<Ix4>()
            .map_err(|e| DatasetError::Shape(format!("{}: {e}", path.display())))?
            .permuted_axes([3, 0, 1, 2]),
        n => {
            return Err(DatasetError::Shape(format!(
                "{}: expected a 3D or 4D volume, found {n} dimensions",
                path.display()
            )))
        }
    };
    let data = data.as_standard_layout().into_owned();
    tracing::debug!(path = %path.display(), shape = ?data.dim(), "loaded nifti volume");
    Ok(Volume::new(data, affine))
}

/// Write a volume with its affine stored as the sform.
pub fn write_nifti(path: &Path, volume: &Volume) -> DatasetResult<()> {
    let header = header_for(volume);
    let writer = WriterOptions::new(path).reference_header(&header);
    let result = if volume.channels() == 1 {
        let spatial = volume.data.index_axis(Axis(0), 0);
        writer.write_nifti(&spatial)
    } else {
        // The writer walks memory order, so the permuted view must be copied
        // into a contiguous channels-last array first.
        let channels_last = volume.data.view().permuted_axes([1, 2, 3, 0]);
        writer.write_nifti(&channels_last.as_standard_layout())
    };
    result.map_err(|e| nifti_err(path, e))
}

fn nifti_err(path: &Path, source: nifti::NiftiError) -> DatasetError {
    DatasetError::Nifti {
        path: path.to_path_buf(),
        source,
    }
}

/// Voxel-to-world transform: sform when set, then qform, then pixdim scaling.
pub fn header_affine(header: &NiftiHeader) -> Matrix4<f64> {
    if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        let mut affine = Matrix4::identity();
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                affine[(r, c)] = *value as f64;
            }
        }
        return affine;
    }

    let dx = header.pixdim[1] as f64;
    let dy = header.pixdim[2] as f64;
    let dz = header.pixdim[3] as f64;
    if header.qform_code > 0 {
        let b = header.quatern_b as f64;
        let c = header.quatern_c as f64;
        let d = header.quatern_d as f64;
        let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let dz = dz * qfac;
        return Matrix4::new(
            (a * a + b * b - c * c - d * d) * dx,
            (2.0 * b * c - 2.0 * a * d) * dy,
            (2.0 * b * d + 2.0 * a * c) * dz,
            header.quatern_x as f64,
            (2.0 * b * c + 2.0 * a * d) * dx,
            (a * a + c * c - b * b - d * d) * dy,
            (2.0 * c * d - 2.0 * a * b) * dz,
            header.quatern_y as f64,
            (2.0 * b * d - 2.0 * a * c) * dx,
            (2.0 * c * d + 2.0 * a * b) * dy,
            (a * a + d * d - c * c - b * b) * dz,
            header.quatern_z as f64,
            0.0,
            0.0,
            0.0,
            1.0,
        );
    }

    let sanitize = |v: f64| if v > 0.0 { v } else { 1.0 };
    Matrix4::new_nonuniform_scaling(&nalgebra::Vector3::new(
        sanitize(dx),
        sanitize(dy),
        sanitize(dz),
    ))
}

fn header_for(volume: &Volume) -> NiftiHeader {
    let mut header = NiftiHeader::default();
    let spacing = volume.spacing();
    header.pixdim[0] = 1.0;
    for (axis, value) in spacing.iter().enumerate() {
        header.pixdim[axis + 1] = *value as f32;
    }
    header.sform_code = 2;
    header.qform_code = 0;
    let row = |r: usize| -> [f32; 4] {
        [
            volume.affine[(r, 0)] as f32,
            volume.affine[(r, 1)] as f32,
            volume.affine[(r, 2)] as f32,
            volume.affine[(r, 3)] as f32,
        ]
    };
    header.srow_x = row(0);
    header.srow_y = row(1);
    header.srow_z = row(2);
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn single_channel_round_trip_keeps_values_and_affine() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("label.nii.gz");
        let data = Array4::from_shape_fn((1, 3, 4, 5), |(_, x, y, z)| (x * 20 + y * 5 + z) as f32);
        let mut affine = Matrix4::identity();
        affine[(0, 0)] = -1.0;
        affine[(1, 1)] = -1.0;
        affine[(2, 2)] = 2.0;
        affine[(0, 3)] = 10.0;
        write_nifti(&path, &Volume::new(data.clone(), affine))?;

        let back = read_nifti(&path)?;
        assert_eq!(back.data, data);
        assert_eq!(back.affine, affine);
        assert_eq!(back.spacing(), [1.0, 1.0, 2.0]);
        Ok(())
    }

    #[test]
    fn four_dimensional_file_becomes_channels() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("image.nii");
        let data = Array4::from_shape_fn((4, 2, 3, 2), |(c, x, y, z)| {
            (c * 1000 + x * 100 + y * 10 + z) as f32
        });
        write_nifti(&path, &Volume::from_data(data.clone()))?;

        let back = read_nifti(&path)?;
        assert_eq!(back.channels(), 4);
        assert_eq!(back.spatial_shape(), [2, 3, 2]);
        assert_eq!(back.data[(0, 1, 0, 0)], 100.0);
        assert_eq!(back.data[(3, 0, 2, 1)], 3021.0);
        assert_eq!(back.data, data);
        Ok(())
    }

    #[test]
    fn channels_last_file_written_directly_reads_back() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("direct.nii.gz");
        let channels_last = ndarray::Array4::from_shape_fn((3, 2, 2, 4), |(x, y, z, c)| {
            (c * 1000 + x * 100 + y * 10 + z) as f32
        });
        WriterOptions::new(&path).write_nifti(&channels_last)?;

        let back = read_nifti(&path)?;
        assert_eq!(back.data.dim(), (4, 3, 2, 2));
        assert_eq!(back.data[(2, 1, 0, 1)], 2101.0);
        assert_eq!(back.data[(0, 2, 1, 0)], 210.0);
        Ok(())
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempdir().unwrap();
        let err = read_nifti(&dir.path().join("absent.nii.gz")).unwrap_err();
        assert!(err.to_string().contains("absent.nii.gz"));
    }

    #[test]
    fn qform_fallback_uses_pixdim() {
        let mut header = NiftiHeader::default();
        header.sform_code = 0;
        header.qform_code = 1;
        header.pixdim = [1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0];
        header.quatern_b = 0.0;
        header.quatern_c = 0.0;
        header.quatern_d = 0.0;
        header.quatern_x = 5.0;
        let affine = header_affine(&header);
        assert_eq!(affine[(0, 0)], 2.0);
        assert_eq!(affine[(1, 1)], 3.0);
        assert_eq!(affine[(2, 2)], 4.0);
        assert_eq!(affine[(0, 3)], 5.0);
    }
}
