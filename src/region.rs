//! Last-viewed map region, persisted as a small JSON file in the data
//! directory so the map reopens where the user left it.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::fs;

const REGION_FILE: &str = "map_region.json";

/// Center and span of the visible map, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapRegion {
    pub latitude: f64,
    pub longitude: f64,
    pub lat_span: f64,
    pub lon_span: f64,
}

impl Default for MapRegion {
    /// Beijing, roughly city-wide.
    fn default() -> Self {
        Self {
            latitude: 39.9042,
            longitude: 116.4074,
            lat_span: 0.3,
            lon_span: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegionCache {
    path: PathBuf,
}

impl RegionCache {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(REGION_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the saved region, falling back to the default when nothing has
    /// been saved yet or the file can't be parsed.
    pub async fn load(&self) -> MapRegion {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return MapRegion::default(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read map region, using default");
                return MapRegion::default();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(region) => region,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Corrupt map region, using default");
                MapRegion::default()
            }
        }
    }

    pub async fn save(&self, region: &MapRegion) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(region)?;
        fs::write(&self.path, json).await.with_context(|| {
            format!("Failed to write map region to {}", self.path.display())
        })?;
        tracing::debug!(path = %self.path.display(), "Saved map region");
        Ok(())
    }
}
