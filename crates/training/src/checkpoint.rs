//! Named-variable checkpoints at `<run_dir>/model-<step>`.

use burn::tensor::backend::Backend;
use models::{ModelError, VariableId, WeightSet};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const CHECKPOINT_PREFIX: &str = "model-";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed checkpoint {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no checkpoint found under {0}")]
    NotFound(PathBuf),
    #[error("variable {name} is stored with shape {stored:?} but the model expects {current:?}")]
    CheckpointMismatch {
        name: VariableId,
        stored: Vec<usize>,
        current: Vec<usize>,
    },
    #[error("variable {name}: {len} stored values do not fill shape {shape:?}")]
    Corrupt {
        name: VariableId,
        shape: Vec<usize>,
        len: usize,
    },
    #[error("variable {0} was planned for restore but is not in the checkpoint")]
    Missing(VariableId),
    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredVariable {
    pub name: VariableId,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub global_step: usize,
    pub variables: Vec<StoredVariable>,
}

pub fn checkpoint_path(run_dir: &Path, step: usize) -> PathBuf {
    run_dir.join(format!("{CHECKPOINT_PREFIX}{step}"))
}

fn step_of(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix(CHECKPOINT_PREFIX)?
        .parse()
        .ok()
}

/// Highest-step `model-<step>` file in `run_dir`, if any.
pub fn latest(run_dir: &Path) -> Result<Option<PathBuf>, CheckpointError> {
    let entries = match fs::read_dir(run_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Io {
                path: run_dir.to_path_buf(),
                source,
            })
        }
    };
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in entries {
        let entry = entry.map_err(|source| CheckpointError::Io {
            path: run_dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if let Some(step) = step_of(&path) {
            if best.as_ref().is_none_or(|(s, _)| step > *s) {
                best = Some((step, path));
            }
        }
    }
    Ok(best.map(|(_, path)| path))
}

impl Checkpoint {
    pub fn capture<B: Backend>(global_step: usize, weights: &WeightSet<B>) -> Result<Self, CheckpointError> {
        let variables = weights
            .to_host()?
            .into_iter()
            .map(|v| StoredVariable {
                name: v.id,
                shape: v.shape,
                values: v.values,
            })
            .collect();
        Ok(Self {
            global_step,
            variables,
        })
    }

    pub fn save(&self, run_dir: &Path) -> Result<PathBuf, CheckpointError> {
        fs::create_dir_all(run_dir).map_err(|source| CheckpointError::Io {
            path: run_dir.to_path_buf(),
            source,
        })?;
        let path = checkpoint_path(run_dir, self.global_step);
        let bytes = serde_json::to_vec(self).map_err(|source| CheckpointError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, bytes).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), variables = self.variables.len(), "checkpoint written");
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let bytes = fs::read(path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => CheckpointError::NotFound(path.to_path_buf()),
            _ => CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            },
        })?;
        let ckpt: Checkpoint = serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        for v in &ckpt.variables {
            let expected: usize = v.shape.iter().product();
            if expected != v.values.len() {
                return Err(CheckpointError::Corrupt {
                    name: v.name.clone(),
                    shape: v.shape.clone(),
                    len: v.values.len(),
                });
            }
        }
        Ok(ckpt)
    }

    /// Stored variable identities, in file order.
    pub fn inventory(&self) -> Vec<VariableId> {
        self.variables.iter().map(|v| v.name.clone()).collect()
    }

    pub fn get(&self, name: &VariableId) -> Option<&StoredVariable> {
        self.variables.iter().find(|v| &v.name == name)
    }

    /// Overwrite `restore` in `weights` with the stored values. Shapes must
    /// match exactly; nothing is written unless every variable checks out.
    pub fn restore_into<B: Backend>(
        &self,
        weights: &mut WeightSet<B>,
        restore: &[VariableId],
        device: &B::Device,
    ) -> Result<(), CheckpointError> {
        let mut staged = Vec::with_capacity(restore.len());
        for name in restore {
            let stored = self
                .get(name)
                .ok_or_else(|| CheckpointError::Missing(name.clone()))?;
            let current = weights
                .shape(name)
                .ok_or_else(|| ModelError::MissingVariable(name.clone()))?;
            if current != stored.shape.as_slice() {
                return Err(CheckpointError::CheckpointMismatch {
                    name: name.clone(),
                    stored: stored.shape.clone(),
                    current: current.to_vec(),
                });
            }
            staged.push(stored);
        }
        for stored in staged {
            weights.insert_values(
                stored.name.clone(),
                stored.shape.clone(),
                stored.values.clone(),
                device,
            );
        }
        Ok(())
    }
}
