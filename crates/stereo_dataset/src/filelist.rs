//! Whitespace-delimited sample lists and their resolution to dataset paths.

use crate::types::{DatasetError, DatasetResult, Dataset};
use std::fs;
use std::path::{Path, PathBuf};

/// One line of a file list: left, right and semantic paths, in that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListEntry {
    pub left: String,
    pub right: Option<String>,
    pub semantic: Option<String>,
}

impl FileListEntry {
    /// Parse one line. Fields past the third are ignored.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let left = fields.next()?.to_string();
        let right = fields.next().map(str::to_string);
        let semantic = fields.next().map(str::to_string);
        Some(Self {
            left,
            right,
            semantic,
        })
    }
}

/// Read every non-empty line of `path`.
///
/// `min_fields` is 2 for stereo/training lists and 1 for monocular test lists.
pub fn read_file_list(path: &Path, min_fields: usize) -> DatasetResult<Vec<FileListEntry>> {
    let text = fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut entries = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let Some(entry) = FileListEntry::parse(line) else {
            continue;
        };
        let fields = 1 + entry.right.is_some() as usize + entry.semantic.is_some() as usize;
        if fields < min_fields {
            return Err(DatasetError::FileList {
                path: path.to_path_buf(),
                line: idx + 1,
                msg: format!("expected at least {min_fields} paths, found {fields}"),
            });
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Resolved absolute paths for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePaths {
    pub left: PathBuf,
    pub right: Option<PathBuf>,
    pub semantic: Option<PathBuf>,
}

/// Where each view lives under the dataset root.
#[derive(Debug, Clone)]
pub struct DataLayout {
    pub root: PathBuf,
    pub dataset: Dataset,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>, dataset: Dataset) -> Self {
        Self {
            root: root.into(),
            dataset,
        }
    }

    pub fn resolve(&self, entry: &FileListEntry) -> SamplePaths {
        let (left_dir, right_dir, sem_dir) = match self.dataset {
            Dataset::Kitti => (self.root.clone(), self.root.clone(), self.root.clone()),
            Dataset::Cityscapes => (
                self.root.join("leftImg8bit/train"),
                self.root.join("rightImg8bit/train"),
                self.root.join("gtFine/train"),
            ),
        };
        SamplePaths {
            left: left_dir.join(&entry.left),
            right: entry.right.as_ref().map(|r| right_dir.join(r)),
            semantic: entry.semantic.as_ref().map(|s| sem_dir.join(s)),
        }
    }
}
