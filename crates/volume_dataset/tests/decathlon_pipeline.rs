use anyhow::Result;
use burn_ndarray::NdArray;
use nalgebra::Matrix4;
use ndarray::Array4;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use volume_dataset::transforms::{
    ConvertBratsLabels, LoadImage, NormalizeIntensity, Orientation, RandFlip, RandSpatialCrop,
    Spacing,
};
use volume_dataset::{
    read_nifti, write_nifti, Compose, DecathlonConfig, DecathlonDataset, Interpolation, LoaderConfig, Section,
    Volume, VolumeLoader,
};

type TestBackend = NdArray<f32>;

/// Lay out a tiny Task01-style folder with `n` cases.
fn write_task(root: &Path, n: usize) -> Result<()> {
    let task = root.join("Task01_BrainTumour");
    fs::create_dir_all(task.join("imagesTr"))?;
    fs::create_dir_all(task.join("labelsTr"))?;
    let mut affine = Matrix4::identity();
    affine[(0, 0)] = -1.0;
    affine[(1, 1)] = -1.0;

    let mut training = Vec::new();
    for case in 0..n {
        let name = format!("BRATS_{:03}.nii.gz", case + 1);
        let image = Array4::from_shape_fn((4, 6, 6, 4), |(c, x, y, z)| {
            if x == 0 {
                0.0
            } else {
                (c + x + y + z + case) as f32
            }
        });
        let label = Array4::from_shape_fn((1, 6, 6, 4), |(_, x, y, z)| ((x + y + z) % 4) as f32);
        write_nifti(&task.join("imagesTr").join(&name), &Volume::new(image, affine))?;
        write_nifti(&task.join("labelsTr").join(&name), &Volume::new(label, affine))?;
        training.push(serde_json::json!({
            "image": format!("./imagesTr/{name}"),
            "label": format!("./labelsTr/{name}"),
        }));
    }
    let manifest = serde_json::json!({
        "name": "BRATS",
        "modality": {"0": "FLAIR", "1": "T1w", "2": "t1gd", "3": "T2w"},
        "labels": {"0": "background", "1": "edema", "2": "non-enhancing tumor", "3": "enhancing tumour"},
        "numTraining": n,
        "numTest": 0,
        "training": training,
        "test": [],
    });
    fs::write(task.join("dataset.json"), serde_json::to_vec_pretty(&manifest)?)?;
    Ok(())
}

#[test]
fn fixture_images_keep_voxel_positions() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    write_task(tmp.path(), 2)?;
    let image = read_nifti(
        &tmp.path()
            .join("Task01_BrainTumour/imagesTr/BRATS_002.nii.gz"),
    )?;
    assert_eq!(image.data.dim(), (4, 6, 6, 4));
    assert_eq!(image.data[(2, 3, 1, 2)], 9.0);
    assert_eq!(image.data[(0, 5, 0, 0)], 6.0);
    assert_eq!(image.data[(3, 0, 4, 3)], 0.0);
    Ok(())
}

fn train_transform() -> Result<Compose> {
    Ok(Compose::new()
        .with(LoadImage::new(&["image", "label"]))
        .with(ConvertBratsLabels::new("label"))
        .with(Orientation::new(&["image", "label"], "RAS"))
        .with(Spacing::new(
            &["image", "label"],
            [1.0, 1.0, 1.0],
            &[Interpolation::Bilinear, Interpolation::Nearest],
        )?)
        .with(RandSpatialCrop::new(&["image", "label"], [4, 4, 4]))
        .with(RandFlip::new(&["image", "label"], 0.5, 0)?)
        .with(NormalizeIntensity::new(&["image"], true, true)))
}

#[test]
fn sections_partition_the_training_list() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    write_task(tmp.path(), 5)?;
    let mut cfg = DecathlonConfig::new(tmp.path(), Section::Training);
    cfg.download = false;
    let train = DecathlonDataset::new(&cfg, Compose::new())?;
    cfg.section = Section::Validation;
    let val = DecathlonDataset::new(&cfg, Compose::new())?;
    assert_eq!(train.len(), 4);
    assert_eq!(val.len(), 1);

    let val_image = val.raw_sample(0)?.path("image")?.to_path_buf();
    for i in 0..train.len() {
        assert_ne!(train.raw_sample(i)?.path("image")?, val_image.as_path());
    }
    Ok(())
}

#[test]
fn loader_yields_cropped_region_batches() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    write_task(tmp.path(), 3)?;
    let mut cfg = DecathlonConfig::new(tmp.path(), Section::Training);
    cfg.download = false;
    cfg.val_frac = 0.0;
    let dataset = Arc::new(DecathlonDataset::new(&cfg, train_transform()?)?);
    let loader = VolumeLoader::new(
        dataset,
        LoaderConfig {
            batch_size: 2,
            shuffle: true,
            num_workers: 2,
            seed: 7,
            keep_samples: true,
        },
    )?;
    assert_eq!(loader.num_batches(), 2);

    let device = Default::default();
    let batches: Vec<_> = loader
        .iter::<TestBackend>(0, &device)
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].image.dims(), [2, 4, 4, 4, 4]);
    assert_eq!(batches[1].image.dims(), [1, 4, 4, 4, 4]);
    let label = batches[0].label.clone().expect("labels collated");
    assert_eq!(label.dims(), [2, 3, 4, 4, 4]);
    let values = label
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    assert!(values.iter().all(|v| *v == 0.0 || *v == 1.0));
    assert_eq!(batches[0].samples.len(), 2);

    let mut seen: Vec<usize> = batches.iter().flat_map(|b| b.indices.clone()).collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);
    Ok(())
}

#[test]
fn per_sample_randomness_is_reproducible() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    write_task(tmp.path(), 2)?;
    let mut cfg = DecathlonConfig::new(tmp.path(), Section::Training);
    cfg.download = false;
    cfg.val_frac = 0.0;
    let dataset = Arc::new(DecathlonDataset::new(&cfg, train_transform()?)?);
    let loader = VolumeLoader::new(dataset, LoaderConfig::default())?;
    let device = Default::default();
    let first: Vec<Vec<f32>> = loader
        .iter::<TestBackend>(3, &device)
        .map(|b| b.map(|b| b.image.into_data().to_vec::<f32>().unwrap_or_default()))
        .collect::<Result<_, _>>()?;
    let second: Vec<Vec<f32>> = loader
        .iter::<TestBackend>(3, &device)
        .map(|b| b.map(|b| b.image.into_data().to_vec::<f32>().unwrap_or_default()))
        .collect::<Result<_, _>>()?;
    assert_eq!(first, second);
    Ok(())
}
