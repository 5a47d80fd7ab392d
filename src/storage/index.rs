//! The step index of a storage object (`md.idx`).
//!
//! ```json
//! {
//!   "engine": "zckpt",
//!   "version": 1,
//!   "steps": [
//!     { "step": 0, "variables": [
//!       { "name": "var_step0", "dtype": "uint8", "shape": [16000000],
//!         "blocks": [ { "rank": 0, "start": 0, "count": 8000000 },
//!                     { "rank": 1, "start": 8000000, "count": 8000000 } ] }
//!     ] }
//!   ]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

pub const ENGINE: &str = "zckpt";
pub const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIndex {
    pub engine: String,
    pub version: u32,
    pub steps: Vec<StepIndex>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepIndex {
    pub step: u64,
    pub variables: Vec<VariableIndex>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableIndex {
    pub name: String,
    pub dtype: String,
    /// Global shape in elements.
    pub shape: Vec<u64>,
    pub blocks: Vec<BlockIndex>,
}

/// Where one participant's partition of a variable lives in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndex {
    pub rank: usize,
    pub start: u64,
    pub count: u64,
}

impl ObjectIndex {
    pub fn new() -> Self {
        Self {
            engine: ENGINE.to_string(),
            version: INDEX_VERSION,
            steps: Vec::new(),
        }
    }

    /// Add `variable` under `step`, replacing a variable of the same name.
    pub fn insert(&mut self, step: u64, variable: VariableIndex) {
        let pos = match self.steps.iter().position(|s| s.step == step) {
            Some(pos) => pos,
            None => {
                self.steps.push(StepIndex {
                    step,
                    variables: Vec::new(),
                });
                self.steps.len() - 1
            }
        };
        let vars = &mut self.steps[pos].variables;
        vars.retain(|v| v.name != variable.name);
        vars.push(variable);
    }

    /// Find a variable by name in any step.
    pub fn find(&self, name: &str) -> Option<(u64, &VariableIndex)> {
        self.steps.iter().find_map(|s| {
            s.variables
                .iter()
                .find(|v| v.name == name)
                .map(|v| (s.step, v))
        })
    }

    /// Load an index file. A missing file is [`ErrorKind::VariableNotFound`]:
    /// the object was never completely written.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::new(
                    ErrorKind::VariableNotFound,
                    "object has no step index",
                )
                .with_operation("ObjectIndex::load")
                .with_context("path", path.display().to_string())
                .set_source(e));
            }
            Err(e) => {
                return Err(Error::new(
                    ErrorKind::StorageError,
                    format!("failed to read step index: {e}"),
                )
                .with_operation("ObjectIndex::load")
                .with_context("path", path.display().to_string())
                .set_source(e));
            }
        };
        let index: ObjectIndex = serde_json::from_str(&text).map_err(|e| {
            Error::new(ErrorKind::StorageError, "malformed step index")
                .with_operation("ObjectIndex::load")
                .with_context("path", path.display().to_string())
                .set_source(e)
        })?;
        if index.engine != ENGINE || index.version != INDEX_VERSION {
            return Err(Error::new(
                ErrorKind::StorageError,
                format!(
                    "unsupported step index {} v{}",
                    index.engine, index.version
                ),
            )
            .with_operation("ObjectIndex::load")
            .with_context("path", path.display().to_string()));
        }
        Ok(index)
    }

    /// Write the index next to `path` and rename it into place, so readers
    /// see either the old index or the complete new one.
    pub fn store(&self, path: &Path) -> Result<()> {
        let fail = |msg: String| {
            Error::new(ErrorKind::StorageError, msg)
                .with_operation("ObjectIndex::store")
                .with_context("path", path.display().to_string())
        };
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| fail(format!("failed to encode step index: {e}")))?;
        let tmp = path.with_extension("idx.tmp");
        std::fs::write(&tmp, text).map_err(|e| fail(format!("failed to write step index: {e}")))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| fail(format!("failed to publish step index: {e}")))
    }
}

impl Default for ObjectIndex {
    fn default() -> Self {
        Self::new()
    }
}
