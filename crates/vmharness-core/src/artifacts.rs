//! Run artifact directory.
//!
//! Each run owns `<output_dir>/<run id>/` and leaves behind the task
//! descriptor as given, the raw result bytes from the guest, staged fallback
//! action payloads, and a terminal outcome record. The run-bookkeeping layer
//! consumes these; nothing here is read back by the orchestrator itself
//! except the result bytes during evaluation.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use vmharness_proto::{RunId, RunPhase, Task, Verdict};

/// On-disk artifacts for one run.
#[derive(Debug)]
pub struct RunArtifacts {
    dir: PathBuf,
}

impl RunArtifacts {
    /// Creates the run directory.
    ///
    /// Fails with `AlreadyExists` if a run with this id has left artifacts
    /// before: run ids are unique per process, so a collision is a caller
    /// bug and must not silently overwrite a previous run's files.
    pub fn create(output_dir: &Path, run: &RunId) -> Result<Self, ArtifactError> {
        std::fs::create_dir_all(output_dir)?;
        let dir = output_dir.join(run.as_str());
        std::fs::create_dir(&dir).map_err(|err| {
            if err.kind() == io::ErrorKind::AlreadyExists {
                ArtifactError::DuplicateRun(run.clone())
            } else {
                ArtifactError::Io(err)
            }
        })?;
        debug!(dir = %dir.display(), "created run directory");
        Ok(Self { dir })
    }

    /// The run directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the task descriptor as given and returns its path.
    pub fn write_task(&self, task: &Task) -> Result<PathBuf, ArtifactError> {
        let path = self.task_path();
        std::fs::write(&path, serde_json::to_vec_pretty(task)?)?;
        Ok(path)
    }

    /// Host path of the serialized task descriptor.
    pub fn task_path(&self) -> PathBuf {
        self.dir.join("task.json")
    }

    /// Host path the guest result file is copied to, byte-for-byte.
    pub fn result_path(&self) -> PathBuf {
        self.dir.join("result.json")
    }

    /// The raw result bytes as retrieved from the guest.
    pub fn read_result_bytes(&self) -> io::Result<Vec<u8>> {
        std::fs::read(self.result_path())
    }

    /// Stages a fallback action payload under `actions/` and returns its
    /// path. The filename keeps the action's position and kind so the audit
    /// trail on disk matches the session log.
    pub fn stage_action(
        &self,
        index: usize,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<PathBuf, ArtifactError> {
        let actions_dir = self.dir.join("actions");
        std::fs::create_dir_all(&actions_dir)?;
        let path = actions_dir.join(format!("{index}_{}.json", sanitize(kind)));
        std::fs::write(&path, serde_json::to_vec_pretty(payload)?)?;
        Ok(path)
    }

    /// Records the run's terminal phase and verdict (or error).
    pub fn write_outcome(&self, outcome: &RunOutcome) -> Result<(), ArtifactError> {
        let path = self.dir.join("outcome.json");
        std::fs::write(&path, serde_json::to_vec_pretty(outcome)?)?;
        Ok(())
    }
}

/// Terminal record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run: RunId,
    pub task_id: String,
    pub phase: RunPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Keeps action kinds usable as filenames.
fn sanitize(kind: &str) -> String {
    kind.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Errors producing run artifacts.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// A run directory with this id already exists.
    #[error("run directory for '{0}' already exists")]
    DuplicateRun(RunId),

    /// IO error writing to the run directory.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
