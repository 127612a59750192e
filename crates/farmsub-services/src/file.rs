//! File-backed production data and version registry: one JSON document
//! mapping area paths to their ranges and published versions. Covers dry
//! runs and facilities that export production data as flat files.
//!
//! ```json
//! {
//!   "areas": {
//!     "/show/shots/010/0010": {
//!       "cut": "1001-1120",
//!       "important": "1001,1055",
//!       "source_version": 12,
//!       "versions": { "beauty": 4, "specular": 2 }
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use farmsub_core::{FrameSet, RangeSource};

use crate::types::{ProductionData, ServiceError, ServiceResult, VersionRegistry};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct AreaData {
    #[serde(default)]
    cut: Option<String>,
    #[serde(default)]
    delivery: Option<String>,
    #[serde(default)]
    explicit: Option<String>,
    #[serde(default)]
    important: Option<String>,
    #[serde(default)]
    source_version: Option<i64>,
    #[serde(default)]
    versions: BTreeMap<String, i64>,
}

/// Production data and version registry read from one JSON file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JsonProductionFile {
    #[serde(default)]
    areas: BTreeMap<String, AreaData>,
}

impl JsonProductionFile {
    /// Reads and parses the file.
    pub fn load(path: &Path) -> ServiceResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| ServiceError::Backend(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| ServiceError::Backend(format!("parse {}: {e}", path.display())))
    }

    /// An empty document (every lookup comes back absent).
    pub fn empty() -> Self {
        Self::default()
    }

    fn range_text(&self, area: &str, kind: RangeSource) -> Option<&String> {
        let data = self.areas.get(area)?;
        match kind {
            RangeSource::Cut => data.cut.as_ref(),
            RangeSource::Delivery => data.delivery.as_ref(),
            RangeSource::Explicit => data.explicit.as_ref(),
            RangeSource::Important => data.important.as_ref(),
        }
    }
}

impl ProductionData for JsonProductionFile {
    fn range(&self, area: &str, kind: RangeSource) -> ServiceResult<Option<FrameSet>> {
        let Some(text) = self.range_text(area, kind) else {
            return Ok(None);
        };
        match FrameSet::parse(text) {
            Ok(set) if set.is_empty() => Ok(None),
            Ok(set) => Ok(Some(set)),
            Err(err) => {
                warn!(area, kind = kind.as_str(), %err, "unparsable production range, treated as absent");
                Ok(None)
            }
        }
    }
}

impl VersionRegistry for JsonProductionFile {
    fn highest_version(&self, area: &str, pass_name: &str) -> ServiceResult<Option<i64>> {
        Ok(self
            .areas
            .get(area)
            .and_then(|d| d.versions.get(pass_name))
            .copied())
    }

    fn source_version(&self, area: &str) -> ServiceResult<Option<i64>> {
        Ok(self.areas.get(area).and_then(|d| d.source_version))
    }
}
