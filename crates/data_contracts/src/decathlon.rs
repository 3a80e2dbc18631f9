use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One image/label pair as listed under `training` in a Decathlon `dataset.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecathlonPair {
    pub image: String,
    pub label: String,
}

/// Task manifest shipped at the root of every Medical Segmentation Decathlon task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecathlonManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "tensorImageSize")]
    pub tensor_image_size: String,
    #[serde(default)]
    pub modality: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "numTraining")]
    pub num_training: usize,
    #[serde(default, rename = "numTest")]
    pub num_test: usize,
    pub training: Vec<DecathlonPair>,
    #[serde(default)]
    pub test: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest lists no training pairs")]
    EmptyTraining,
    #[error("numTraining is {declared} but {listed} training pairs are listed")]
    CountMismatch { declared: usize, listed: usize },
    #[error("training[{index}] has an empty {field} path")]
    EmptyPath { index: usize, field: &'static str },
}

impl DecathlonManifest {
    pub fn from_path(path: &Path) -> Result<Self, ContractError> {
        let raw = std::fs::read(path).map_err(|e| ContractError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_slice(&raw).map_err(|e| ContractError::Json {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn validate(&self) -> Result<(), ContractError> {
        if self.training.is_empty() {
            return Err(ContractError::EmptyTraining);
        }
        if self.num_training != self.training.len() {
            return Err(ContractError::CountMismatch {
                declared: self.num_training,
                listed: self.training.len(),
            });
        }
        for (index, pair) in self.training.iter().enumerate() {
            if pair.image.trim().is_empty() {
                return Err(ContractError::EmptyPath {
                    index,
                    field: "image",
                });
            }
            if pair.label.trim().is_empty() {
                return Err(ContractError::EmptyPath {
                    index,
                    field: "label",
                });
            }
        }
        Ok(())
    }

    /// Training pairs with paths resolved against the task directory.
    pub fn resolved_training(&self, task_dir: &Path) -> Vec<(PathBuf, PathBuf)> {
        self.training
            .iter()
            .map(|pair| {
                (
                    resolve_entry(task_dir, &pair.image),
                    resolve_entry(task_dir, &pair.label),
                )
            })
            .collect()
    }

    /// Number of image channels declared by the `modality` table (at least 1).
    pub fn num_modalities(&self) -> usize {
        self.modality.len().max(1)
    }
}

/// Manifest entries are written as `./imagesTr/BRATS_001.nii.gz`.
fn resolve_entry(task_dir: &Path, entry: &str) -> PathBuf {
    let trimmed = entry.trim();
    let relative = trimmed.strip_prefix("./").unwrap_or(trimmed);
    task_dir.join(relative)
}
