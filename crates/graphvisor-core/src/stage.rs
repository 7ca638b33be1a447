//! Persisted record of completed provisioning stages.
//!
//! The record is the single source of truth for "has this expensive step
//! already run". It is rewritten as a whole through a temp file and an atomic
//! rename, so a concurrent reader never observes a partial write.

use crate::error::SupervisorError;
use crate::workspace::Workspace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::Builder;
use tracing::{debug, info};

/// Name of the record file kept in every workspace directory
pub const STAGE_FILE_NAME: &str = "stages.json";

/// One idempotent, persistently tracked step of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    OsmDownload,
    GtfsDownload,
    GraphBuild,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::OsmDownload, Stage::GtfsDownload, Stage::GraphBuild];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::OsmDownload => "osm_download",
            Stage::GtfsDownload => "gtfs_download",
            Stage::GraphBuild => "graph_build",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion markers keyed by stage name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    osm_download: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gtfs_download: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    graph_build: Option<DateTime<Utc>>,
}

impl StageRecord {
    pub fn completed_at(&self, stage: Stage) -> Option<DateTime<Utc>> {
        *self.slot(stage)
    }

    pub fn is_complete(&self, stage: Stage) -> bool {
        self.completed_at(stage).is_some()
    }

    pub fn mark(&mut self, stage: Stage, at: DateTime<Utc>) {
        *self.slot_mut(stage) = Some(at);
    }

    pub fn clear(&mut self, stage: Stage) {
        *self.slot_mut(stage) = None;
    }

    fn slot(&self, stage: Stage) -> &Option<DateTime<Utc>> {
        match stage {
            Stage::OsmDownload => &self.osm_download,
            Stage::GtfsDownload => &self.gtfs_download,
            Stage::GraphBuild => &self.graph_build,
        }
    }

    fn slot_mut(&mut self, stage: Stage) -> &mut Option<DateTime<Utc>> {
        match stage {
            Stage::OsmDownload => &mut self.osm_download,
            Stage::GtfsDownload => &mut self.gtfs_download,
            Stage::GraphBuild => &mut self.graph_build,
        }
    }
}

/// Single-writer handle over a workspace's stage record
#[derive(Debug)]
pub struct StageStore {
    path: PathBuf,
    record: StageRecord,
}

impl StageStore {
    /// Open the store for a workspace, reading the record if one exists
    pub fn open(workspace: &Workspace) -> Result<Self, SupervisorError> {
        let path = workspace.stage_file();
        let record = read_record(&path)?;
        debug!(path = %path.display(), ?record, "Loaded stage record");
        Ok(Self { path, record })
    }

    /// Read a workspace's record without taking a writer handle
    pub fn load(workspace: &Workspace) -> Result<StageRecord, SupervisorError> {
        read_record(&workspace.stage_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &StageRecord {
        &self.record
    }

    pub fn is_complete(&self, stage: Stage) -> bool {
        self.record.is_complete(stage)
    }

    /// Mark a stage complete and persist the whole record before returning
    pub fn mark_complete(&mut self, stage: Stage) -> Result<DateTime<Utc>, SupervisorError> {
        let now = Utc::now();
        let mut next = self.record.clone();
        next.mark(stage, now);
        self.persist(&next)?;
        self.record = next;
        info!(%stage, at = %now.to_rfc3339(), "Stage marked complete");
        Ok(now)
    }

    /// Remove a stage marker so the stage runs again
    pub fn clear(&mut self, stage: Stage) -> Result<(), SupervisorError> {
        let mut next = self.record.clone();
        next.clear(stage);
        self.persist(&next)?;
        self.record = next;
        info!(%stage, "Stage marker cleared");
        Ok(())
    }

    fn persist(&self, record: &StageRecord) -> Result<(), SupervisorError> {
        let contents = serde_json::to_vec_pretty(record)
            .map_err(|e| SupervisorError::stage_store(&self.path, e))?;
        atomic_write(&self.path, &contents).map_err(|e| SupervisorError::stage_store(&self.path, e))
    }
}

fn read_record(path: &Path) -> Result<StageRecord, SupervisorError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| SupervisorError::stage_store(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StageRecord::default()),
        Err(e) => Err(SupervisorError::stage_store(path, e)),
    }
}

/// Write through a sibling temp file, fsync, then rename into place.
fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let directory = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "stage record path has no parent directory",
        )
    })?;

    let mut file = Builder::new().prefix(".stages").tempfile_in(directory)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::BoundingBox;

    fn workspace(root: &Path) -> Workspace {
        let bbox = BoundingBox::new(-122.5, 37.7, -122.3, 37.8).unwrap();
        Workspace::create("bay area", bbox, root).unwrap()
    }

    #[test]
    fn test_missing_record_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = workspace(dir.path());

        let record = StageStore::load(&workspace).unwrap();
        for stage in Stage::ALL {
            assert!(!record.is_complete(stage));
        }
    }

    #[test]
    fn test_mark_complete_persists_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = workspace(dir.path());

        let mut store = StageStore::open(&workspace).unwrap();
        let at = store.mark_complete(Stage::OsmDownload).unwrap();

        let reloaded = StageStore::load(&workspace).unwrap();
        assert_eq!(reloaded.completed_at(Stage::OsmDownload), Some(at));
        assert!(!reloaded.is_complete(Stage::GtfsDownload));
        assert!(!reloaded.is_complete(Stage::GraphBuild));
    }

    #[test]
    fn test_record_file_uses_stage_names() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = workspace(dir.path());

        let mut store = StageStore::open(&workspace).unwrap();
        store.mark_complete(Stage::GraphBuild).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        let object = raw.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert!(object["graph_build"].is_string());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = workspace(dir.path());

        let mut store = StageStore::open(&workspace).unwrap();
        store.mark_complete(Stage::OsmDownload).unwrap();
        store.mark_complete(Stage::GtfsDownload).unwrap();

        let names: Vec<String> = std::fs::read_dir(workspace.dir())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![STAGE_FILE_NAME.to_string()]);
    }

    #[test]
    fn test_clear_reopens_stage() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = workspace(dir.path());

        let mut store = StageStore::open(&workspace).unwrap();
        store.mark_complete(Stage::GraphBuild).unwrap();
        store.clear(Stage::GraphBuild).unwrap();

        assert!(!StageStore::load(&workspace).unwrap().is_complete(Stage::GraphBuild));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = workspace(dir.path());
        std::fs::write(
            workspace.stage_file(),
            r#"{"osm_download":"2024-05-01T10:00:00Z","gh_graph_build_time":false}"#,
        )
        .unwrap();

        let record = StageStore::load(&workspace).unwrap();
        assert!(record.is_complete(Stage::OsmDownload));
        assert!(!record.is_complete(Stage::GraphBuild));
    }

    #[test]
    fn test_corrupt_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = workspace(dir.path());
        std::fs::write(workspace.stage_file(), "{not json").unwrap();

        let error = StageStore::open(&workspace).unwrap_err();
        assert!(matches!(error, SupervisorError::StageStore { .. }));
    }
}
