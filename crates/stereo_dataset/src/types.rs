//! Core types, error definitions, and data structures for stereo_dataset.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
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
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("file list {path} line {line}: {msg}")]
    FileList {
        path: PathBuf,
        line: usize,
        msg: String,
    },
    #[error("invalid loader configuration: {0}")]
    Config(String),
    #[error("data pipeline was shut down")]
    Cancelled,
    #[error("producer worker {0} stopped before finishing its share of the stream")]
    WorkerStopped(usize),
    #[error("failed to spawn producer worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Unrecognized value for one of the string-named options.
#[derive(Debug, Clone, Error)]
#[error("invalid {kind} '{value}' (expected one of: {expected})")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

/// Closed string-named option: serde, `Display`, and `FromStr` on the given names.
#[macro_export]
macro_rules! named_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                        expected: concat!($($text, " "),+),
                    }),
                }
            }
        }
    };
}

named_enum!(
    /// Source dataset; selects path layout and the bottom crop.
    Dataset, "dataset", {
        Kitti => "kitti",
        /// Loses the bottom fifth of every frame to the car hood.
        Cityscapes => "cityscapes",
    }
);

named_enum!(
    Mode, "mode", {
        Train => "train",
        Test => "test",
    }
);

named_enum!(
    /// Category filter applied when building the semantic validity mask.
    SemanticMask, "sem_mask", {
        None => "none",
        /// Drop the flat categories 7..=10 (road, sidewalk, parking, rail track).
        NoFlat => "no_flat",
        OnlyFlat => "only_flat",
        /// Drop vehicle categories (ids >= 26).
        NoVehicle => "no_vehicle",
        OnlyVehicle => "only_vehicle",
    }
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSize {
    pub height: u32,
    pub width: u32,
}

impl TargetSize {
    pub fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }

    pub fn pixels(&self) -> usize {
        self.height as usize * self.width as usize
    }
}

/// Dense HWC float image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub data: Vec<f32>,
}

impl ImageTensor {
    pub fn zeros(height: usize, width: usize, channels: usize) -> Self {
        Self::filled(height, width, channels, 0.0)
    }

    pub fn filled(height: usize, width: usize, channels: usize, value: f32) -> Self {
        Self {
            height,
            width,
            channels,
            data: vec![value; height * width * channels],
        }
    }

    pub fn from_vec(height: usize, width: usize, channels: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), height * width * channels, "HWC buffer size");
        Self {
            height,
            width,
            channels,
            data,
        }
    }

    #[inline]
    pub fn at(&self, y: usize, x: usize, c: usize) -> f32 {
        self.data[(y * self.width + x) * self.channels + c]
    }

    /// Left-right mirror (`flip_left_right`).
    pub fn mirrored(&self) -> Self {
        let row = self.width * self.channels;
        let mut data = Vec::with_capacity(self.data.len());
        for y in 0..self.height {
            let src = &self.data[y * row..(y + 1) * row];
            for x in (0..self.width).rev() {
                data.extend_from_slice(&src[x * self.channels..(x + 1) * self.channels]);
            }
        }
        Self {
            data,
            ..*self
        }
    }

    pub fn is_all_zero(&self) -> bool {
        self.data.iter().all(|v| *v == 0.0)
    }
}

/// Per-pixel category ids, H×W×1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    pub height: usize,
    pub width: usize,
    pub ids: Vec<i32>,
}

impl LabelMap {
    pub fn zeros(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            ids: vec![0; height * width],
        }
    }

    pub fn mirrored(&self) -> Self {
        let ids = self
            .ids
            .chunks(self.width.max(1))
            .flat_map(|row| row.iter().rev().copied())
            .collect();
        Self { ids, ..*self }
    }
}

/// One decoded (and possibly augmented) training or test sample.
#[derive(Debug, Clone)]
pub struct StereoSample {
    pub left: ImageTensor,
    /// Absent only for monocular test runs.
    pub right: Option<ImageTensor>,
    pub semantic: LabelMap,
    /// H×W×1 mask in {0, 1}.
    pub valid: ImageTensor,
}
