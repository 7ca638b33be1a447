use crate::error::SupervisorError;
use crate::stage::STAGE_FILE_NAME;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Characters replaced by `_` in workspace names
const ILLEGAL_CHARACTERS: [char; 3] = ['(', ')', '?'];

/// Replace characters that are unsafe in graph directory names
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if ILLEGAL_CHARACTERS.contains(&c) { '_' } else { c })
        .collect()
}

/// Geographic extent of a graph: leftmost, bottommost, rightmost and topmost coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

impl BoundingBox {
    pub fn new(left: f64, bottom: f64, right: f64, top: f64) -> Result<Self, SupervisorError> {
        let bbox = Self {
            left,
            bottom,
            right,
            top,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        let values = [self.left, self.bottom, self.right, self.top];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(SupervisorError::Configuration(format!(
                "bounding box contains a non-finite coordinate: {self:?}"
            )));
        }
        if self.left >= self.right || self.bottom >= self.top {
            return Err(SupervisorError::Configuration(format!(
                "bounding box is empty or inverted: {self:?}"
            )));
        }
        Ok(())
    }

    /// `left,bottom,right,top` with six decimals, as download APIs expect
    pub fn to_query(&self) -> String {
        format!(
            "{:.6},{:.6},{:.6},{:.6}",
            self.left, self.bottom, self.right, self.top
        )
    }
}

/// On-disk directory and identity of one managed graph
#[derive(Debug, Clone, PartialEq)]
pub struct Workspace {
    name: String,
    bbox: BoundingBox,
    root: PathBuf,
    dir: PathBuf,
}

impl Workspace {
    /// Describe a workspace without touching the filesystem
    pub fn new(name: &str, bbox: BoundingBox, graph_root: impl AsRef<Path>) -> Self {
        let name = sanitize_name(name);
        let root = graph_root.as_ref().to_path_buf();
        let dir = root.join(&name);
        Self {
            name,
            bbox,
            root,
            dir,
        }
    }

    /// Describe a workspace and make sure its directory exists
    ///
    /// The stored paths are absolute, so they stay valid for child processes
    /// that run in another working directory.
    pub fn create(
        name: &str,
        bbox: BoundingBox,
        graph_root: impl AsRef<Path>,
    ) -> Result<Self, SupervisorError> {
        let mut workspace = Self::new(name, bbox, graph_root);
        workspace.ensure_dir()?;
        workspace.root = absolute(&workspace.root)?;
        workspace.dir = workspace.root.join(&workspace.name);
        Ok(workspace)
    }

    pub fn ensure_dir(&self) -> Result<(), SupervisorError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            SupervisorError::Configuration(format!(
                "cannot create workspace directory {}: {e}",
                self.dir.display()
            ))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stage_file(&self) -> PathBuf {
        self.dir.join(STAGE_FILE_NAME)
    }

    /// Timestamped log file for one subprocess run
    pub fn log_path(&self, label: &str) -> PathBuf {
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.6f");
        self.dir.join(format!("{label}_{stamp}.log"))
    }

    /// Most recently downloaded map extract, if any
    pub fn latest_map_file(&self) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.dir).ok()?;
        entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "osm"))
            .max()
    }
}

fn absolute(path: &Path) -> Result<PathBuf, SupervisorError> {
    path.canonicalize().map_err(|e| {
        SupervisorError::Configuration(format!("cannot resolve {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Portland (OR)?"), "Portland _OR__");
        assert_eq!(sanitize_name("plain-name"), "plain-name");
    }

    #[test]
    fn test_bbox_validation() {
        assert!(BoundingBox::new(-122.7, 45.4, -122.5, 45.6).is_ok());
        assert!(BoundingBox::new(-122.5, 45.4, -122.7, 45.6).is_err());
        assert!(BoundingBox::new(-122.7, 45.6, -122.5, 45.6).is_err());
        assert!(BoundingBox::new(f64::NAN, 45.4, -122.5, 45.6).is_err());
    }

    #[test]
    fn test_bbox_query() {
        let bbox = BoundingBox::new(-1.5, 2.0, 3.25, 4.0).unwrap();
        assert_eq!(bbox.to_query(), "-1.500000,2.000000,3.250000,4.000000");
    }

    #[test]
    fn test_workspace_layout() {
        let dir = tempfile::tempdir().unwrap();
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0).unwrap();
        let workspace = Workspace::create("city (test)", bbox, dir.path()).unwrap();

        assert_eq!(workspace.name(), "city _test_");
        assert_eq!(
            workspace.dir(),
            dir.path().canonicalize().unwrap().join("city _test_")
        );
        assert!(workspace.dir().is_dir());
        assert_eq!(workspace.stage_file(), workspace.dir().join("stages.json"));

        let log = workspace.log_path("graph_build");
        let file_name = log.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("graph_build_"));
        assert!(file_name.ends_with(".log"));
    }

    #[test]
    fn test_latest_map_file() {
        let dir = tempfile::tempdir().unwrap();
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0).unwrap();
        let workspace = Workspace::create("maps", bbox, dir.path()).unwrap();
        assert!(workspace.latest_map_file().is_none());

        std::fs::write(workspace.dir().join("map-2024-01-01.osm"), "<osm/>").unwrap();
        std::fs::write(workspace.dir().join("map-2024-02-01.osm"), "<osm/>").unwrap();
        std::fs::write(workspace.dir().join("feed.zip"), "zip").unwrap();

        assert_eq!(
            workspace.latest_map_file(),
            Some(workspace.dir().join("map-2024-02-01.osm"))
        );
    }

    #[test]
    fn test_relative_root_becomes_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = std::env::current_dir().unwrap().canonicalize().unwrap();
        let root = pathdiff(dir.path(), &cwd);
        assert!(root.is_relative());

        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0).unwrap();
        let workspace = Workspace::create("relative", bbox, &root).unwrap();

        assert!(workspace.dir().is_absolute());
        assert_eq!(workspace.dir(), dir.path().canonicalize().unwrap().join("relative"));
    }

    /// `target` spelled relative to `base` through `..` components
    fn pathdiff(target: &Path, base: &Path) -> PathBuf {
        let target = target.canonicalize().unwrap();
        let mut relative = PathBuf::new();
        for _ in base.components().skip(1) {
            relative.push("..");
        }
        relative.join(target.strip_prefix("/").unwrap())
    }
}
