//! Loaders for periodic stuck sweeps.
//!
//! A sweep reads task, subtask and trajectory snapshots from JSON files and
//! runs [`detect_stuck`] over them outside the event-driven path.

use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{SubtaskWithTaskId, Task};
use crate::stuck::{detect_stuck, StuckDetection, StuckOptions, Trajectory};

/// Read and deserialize a JSON file.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Load trajectories from a JSON array file, or from every `*.json` file in a directory.
///
/// Directory entries are read in name order; files that fail to parse are
/// skipped with a warning.
pub fn load_trajectories(path: &Path) -> Result<Vec<Trajectory>> {
    if !path.is_dir() {
        return load_json(path);
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    let mut trajectories = Vec::with_capacity(files.len());
    for file in files {
        match load_json::<Trajectory>(&file) {
            Ok(trajectory) => trajectories.push(trajectory),
            Err(e) => warn!(path = %file.display(), error = %e, "Skipping unreadable trajectory"),
        }
    }
    debug!(count = trajectories.len(), dir = %path.display(), "Loaded trajectories");
    Ok(trajectories)
}

/// Snapshot inputs for one stuck sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepInputs {
    pub tasks: Vec<Task>,
    pub subtasks: Vec<SubtaskWithTaskId>,
    pub trajectories: Vec<Trajectory>,
}

impl SweepInputs {
    /// Load whichever inputs were given; missing ones are empty.
    pub fn load(
        tasks: Option<&Path>,
        subtasks: Option<&Path>,
        trajectories: Option<&Path>,
    ) -> Result<Self> {
        Ok(Self {
            tasks: tasks.map(load_json::<Vec<Task>>).transpose()?.unwrap_or_default(),
            subtasks: subtasks
                .map(load_json::<Vec<SubtaskWithTaskId>>)
                .transpose()?
                .unwrap_or_default(),
            trajectories: trajectories
                .map(load_trajectories)
                .transpose()?
                .unwrap_or_default(),
        })
    }

    #[must_use]
    pub fn detect(&self, opts: &StuckOptions) -> StuckDetection {
        detect_stuck(&self.tasks, &self.subtasks, &self.trajectories, opts)
    }
}
