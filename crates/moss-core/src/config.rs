//! Mount configuration.

use moss_types::Geometry;
use serde::{Deserialize, Serialize};

/// Configuration handed to `format` and `mount`.
///
/// All fields are required and validated; there are no implicit defaults.
/// The block device callbacks themselves are the [`moss_device::BlockDevice`]
/// implementation passed alongside this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    geometry: Geometry,
}

impl Config {
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        Self { geometry }
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }
}
