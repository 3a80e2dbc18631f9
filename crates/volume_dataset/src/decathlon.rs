//! Medical Segmentation Decathlon tasks: fetching, manifest parsing, and the
//! seeded train/validation split.

use crate::transforms::Compose;
use crate::types::{DatasetError, DatasetResult, Sample};
use data_contracts::DecathlonManifest;
use md5::{Digest, Md5};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Location and checksum of a downloadable Decathlon task archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecathlonResource {
    pub task: &'static str,
    pub url: &'static str,
    pub md5: &'static str,
}

pub const BRAIN_TUMOUR: DecathlonResource = DecathlonResource {
    task: "Task01_BrainTumour",
    url: "https://msd-for-monai.s3-us-west-2.amazonaws.com/Task01_BrainTumour.tar",
    md5: "240a19d752f0d9e9101544901065d872",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Training,
    Validation,
}

#[derive(Debug, Clone)]
pub struct DecathlonConfig {
    /// Directory holding (or receiving) the task folder and archive.
    pub root_dir: PathBuf,
    pub resource: DecathlonResource,
    pub section: Section,
    /// Fetch the archive when the task folder is missing.
    pub download: bool,
    /// Fraction of the `training` list held out for validation.
    pub val_frac: f32,
    pub seed: u64,
}

impl DecathlonConfig {
    pub fn new(root_dir: impl Into<PathBuf>, section: Section) -> Self {
        Self {
            root_dir: root_dir.into(),
            resource: BRAIN_TUMOUR,
            section,
            download: true,
            val_frac: 0.2,
            seed: 0,
        }
    }

    pub fn task_dir(&self) -> PathBuf {
        self.root_dir.join(self.resource.task)
    }
}

/// Shuffle `0..n` with `seed`; the first `floor(n * val_frac)` indices are validation.
pub fn split_indices(n: usize, val_frac: f32, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);
    let val_len = ((n as f64) * val_frac.clamp(0.0, 1.0) as f64).floor() as usize;
    let train = indices[val_len..].to_vec();
    indices.truncate(val_len);
    (train, indices)
}

/// One section of a Decathlon task with its transform pipeline.
pub struct DecathlonDataset {
    items: Vec<(PathBuf, PathBuf)>,
    transform: Arc<Compose>,
}

impl DecathlonDataset {
    pub fn new(cfg: &DecathlonConfig, transform: Compose) -> DatasetResult<Self> {
        let task_dir = ensure_task(&cfg.root_dir, &cfg.resource, cfg.download)?;
        let manifest = DecathlonManifest::from_path(&task_dir.join("dataset.json"))?;
        manifest.validate()?;
        let pairs = manifest.resolved_training(&task_dir);
        let (train, val) = split_indices(pairs.len(), cfg.val_frac, cfg.seed);
        let picked = match cfg.section {
            Section::Training => train,
            Section::Validation => val,
        };
        let items: Vec<_> = picked.into_iter().map(|i| pairs[i].clone()).collect();
        tracing::info!(
            task = cfg.resource.task,
            section = ?cfg.section,
            samples = items.len(),
            of = pairs.len(),
            pipeline = %transform.describe(),
            "decathlon dataset ready"
        );
        Ok(Self {
            items,
            transform: Arc::new(transform),
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Unprocessed sample holding the image and label paths.
    pub fn raw_sample(&self, index: usize) -> DatasetResult<Sample> {
        let (image, label) = self.items.get(index).ok_or_else(|| {
            DatasetError::Other(format!(
                "index {index} out of range for {} samples",
                self.items.len()
            ))
        })?;
        Ok(Sample::new(index)
            .with_path("image", image)
            .with_path("label", label))
    }

    /// Sample `index` run through the transform pipeline.
    pub fn get(&self, index: usize, rng: &mut dyn RngCore) -> DatasetResult<Sample> {
        self.transform.apply(self.raw_sample(index)?, rng)
    }
}

/// Make sure `root/<task>` exists, downloading and unpacking the archive if allowed.
pub fn ensure_task(root: &Path, resource: &DecathlonResource, download: bool) -> DatasetResult<PathBuf> {
    let task_dir = root.join(resource.task);
    if task_dir.is_dir() {
        tracing::debug!(dir = %task_dir.display(), "task directory present; skipping download");
        return Ok(task_dir);
    }
    if !download {
        return Err(DatasetError::Other(format!(
            "{} not found and download is disabled",
            task_dir.display()
        )));
    }
    fs::create_dir_all(root).map_err(|e| DatasetError::Io {
        path: root.to_path_buf(),
        source: e,
    })?;

    let file_name = resource.url.rsplit('/').next().unwrap_or(resource.task);
    let archive = root.join(file_name);
    let have_valid_archive = archive.is_file() && md5_file(&archive)? == resource.md5;
    if have_valid_archive {
        tracing::info!(archive = %archive.display(), "reusing verified archive");
    } else {
        fetch(resource.url, &archive)?;
        let actual = md5_file(&archive)?;
        if actual != resource.md5 {
            return Err(DatasetError::Checksum {
                path: archive,
                expected: resource.md5.to_string(),
                actual,
            });
        }
        tracing::info!(archive = %archive.display(), "checksum verified");
    }
    extract_archive(&archive, root)?;
    if !task_dir.is_dir() {
        return Err(DatasetError::Other(format!(
            "{} did not contain {}",
            archive.display(),
            resource.task
        )));
    }
    Ok(task_dir)
}

/// Hex MD5 digest of a file.
pub fn md5_file(path: &Path) -> DatasetResult<String> {
    let io_err = |e| DatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    let mut reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = reader.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Unpack a `.tar` or `.tar.gz`/`.tgz` archive into `dest`.
pub fn extract_archive(archive: &Path, dest: &Path) -> DatasetResult<()> {
    let io_err = |e| DatasetError::Io {
        path: archive.to_path_buf(),
        source: e,
    };
    let file = BufReader::new(File::open(archive).map_err(io_err)?);
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    tracing::info!(archive = %archive.display(), dest = %dest.display(), "extracting");
    if name.ends_with(".gz") || name.ends_with(".tgz") {
        tar::Archive::new(flate2::read::GzDecoder::new(file))
            .unpack(dest)
            .map_err(io_err)
    } else {
        tar::Archive::new(file).unpack(dest).map_err(io_err)
    }
}

#[cfg(feature = "download")]
fn fetch(url: &str, out_path: &Path) -> DatasetResult<()> {
    use indicatif::{ProgressBar, ProgressStyle};
    use reqwest::blocking::Client;

    let download_err = |msg: String| DatasetError::Download {
        url: url.to_string(),
        msg,
    };
    tracing::info!(url, dest = %out_path.display(), "downloading");
    let client = Client::builder()
        .timeout(None)
        .build()
        .map_err(|e| download_err(e.to_string()))?;
    let mut res = client
        .get(url)
        .send()
        .map_err(|e| download_err(e.to_string()))?;
    let status = res.status();
    if !status.is_success() {
        return Err(download_err(format!("HTTP {status}")));
    }

    let bar = match res.content_length() {
        Some(len) => ProgressBar::new(len),
        None => ProgressBar::new_spinner(),
    };
    let style = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);

    let partial = out_path.with_extension("part");
    let file = File::create(&partial).map_err(|e| DatasetError::Io {
        path: partial.clone(),
        source: e,
    })?;
    let mut writer = bar.wrap_write(std::io::BufWriter::new(file));
    std::io::copy(&mut res, &mut writer).map_err(|e| download_err(e.to_string()))?;
    drop(writer);
    bar.finish_and_clear();
    fs::rename(&partial, out_path).map_err(|e| DatasetError::Io {
        path: out_path.to_path_buf(),
        source: e,
    })
}

#[cfg(not(feature = "download"))]
fn fetch(url: &str, _out_path: &Path) -> DatasetResult<()> {
    Err(DatasetError::Download {
        url: url.to_string(),
        msg: "built without the `download` feature".to_string(),
    })
}
