//! Machine label codec.
//!
//! A label is the opaque configuration string `"<image-path>,<snapshot-name>"`
//! naming a virtual machine image and the snapshot it is reverted to before
//! every run. Labels are always supplied externally, so only decoding is
//! needed; `Display` renders the canonical trimmed form.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Separator between the image path and the snapshot name.
pub const LABEL_SEPARATOR: char = ',';

/// A decoded machine label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineLabel {
    image_path: String,
    snapshot_name: String,
}

impl MachineLabel {
    /// Decode a raw label string.
    ///
    /// Splits on `,` and trims each part. Exactly two non-empty parts are
    /// required; anything else is [`Error::InvalidLabel`].
    pub fn decode(label: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = label.split(LABEL_SEPARATOR).map(str::trim).collect();

        if parts.len() != 2 {
            return Err(Error::InvalidLabel {
                label: label.to_string(),
                reason: format!(
                    "expected 2 comma-separated parts (image,snapshot), found {}",
                    parts.len()
                ),
            });
        }

        let (image, snapshot) = (parts[0], parts[1]);
        if image.is_empty() {
            return Err(Error::InvalidLabel {
                label: label.to_string(),
                reason: "image path is empty".to_string(),
            });
        }
        if snapshot.is_empty() {
            return Err(Error::InvalidLabel {
                label: label.to_string(),
                reason: "snapshot name is empty".to_string(),
            });
        }

        Ok(Self {
            image_path: image.to_string(),
            snapshot_name: snapshot.to_string(),
        })
    }

    /// The image path as written in the label.
    pub fn image(&self) -> &str {
        &self.image_path
    }

    /// The image path as a filesystem path.
    pub fn image_path(&self) -> &Path {
        Path::new(&self.image_path)
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot_name
    }
}

impl FromStr for MachineLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl std::fmt::Display for MachineLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.image_path, LABEL_SEPARATOR, self.snapshot_name
        )
    }
}
