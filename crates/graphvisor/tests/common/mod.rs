#![allow(dead_code)]

use async_trait::async_trait;
use graphvisor::{
    BoundingBox, CommandTemplate, DataFetcher, EngineArtifact, EngineInstaller, EngineProfile,
    GraphSupervisor, Idle, MapOptions, MarkerConfig, PlatformProcessManager, PortRange,
    PortStrategy, ProcessManager, RetryConfig, Stage, StageStore, SupervisorConfig, Workspace,
};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub const ERROR_MARKER: &str = "Exception in thread";
pub const BUILD_MARKER: &str = "Graph written";
pub const READY_MARKER: &str = "Grizzly server running";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_file(true)
        .with_thread_ids(false)
        .with_target(false)
        .with_line_number(true)
        .with_test_writer()
        .try_init();
}

/// In-memory download collaborator that counts its calls
pub struct ScriptedFetcher {
    pub map_calls: AtomicUsize,
    pub transit_calls: AtomicUsize,
    pub transit_feeds: Option<usize>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Self::with_transit(Some(1))
    }

    /// `None` makes the transit download fail
    pub fn with_transit(transit_feeds: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            map_calls: AtomicUsize::new(0),
            transit_calls: AtomicUsize::new(0),
            transit_feeds,
        })
    }

    pub fn map_calls(&self) -> usize {
        self.map_calls.load(Ordering::SeqCst)
    }

    pub fn transit_calls(&self) -> usize {
        self.transit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataFetcher for ScriptedFetcher {
    async fn fetch_map(
        &self,
        _bbox: &BoundingBox,
        output_dir: &Path,
        _options: &MapOptions,
    ) -> anyhow::Result<PathBuf> {
        self.map_calls.fetch_add(1, Ordering::SeqCst);
        let path = output_dir.join("map-test.osm");
        tokio::fs::write(&path, b"<osm/>").await?;
        Ok(path)
    }

    async fn fetch_transit(&self, _bbox: &BoundingBox, output_dir: &Path) -> anyhow::Result<usize> {
        self.transit_calls.fetch_add(1, Ordering::SeqCst);
        match self.transit_feeds {
            Some(count) => {
                for i in 0..count {
                    tokio::fs::write(output_dir.join(format!("feed-{i}.zip")), b"PK").await?;
                }
                Ok(count)
            }
            None => anyhow::bail!("transit.land returned 503"),
        }
    }
}

/// Installer that writes a placeholder jar instead of downloading
pub struct ScriptedInstaller {
    pub calls: AtomicUsize,
    pub fail: bool,
}

impl ScriptedInstaller {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineInstaller for ScriptedInstaller {
    async fn install(&self, artifact: &EngineArtifact) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("GET {} returned 404", artifact.url());
        }
        let jar = match artifact {
            EngineArtifact::Jar { path, .. } => path.clone(),
            EngineArtifact::Bundle { dir, .. } => dir.join("engine-web.jar"),
        };
        if let Some(parent) = jar.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&jar, b"PK").await?;
        Ok(())
    }
}

/// Engine whose build and server are shell scripts printing the usual markers
pub fn shell_engine(build_script: &str, server_script: &str) -> EngineProfile {
    EngineProfile {
        build: CommandTemplate::new("sh", ["-c", build_script]),
        server: CommandTemplate::new("sh", ["-c", server_script]),
        markers: MarkerConfig {
            error: ERROR_MARKER.to_string(),
            build_complete: BUILD_MARKER.to_string(),
            server_ready: READY_MARKER.to_string(),
        },
        port_count: 1,
        artifact: None,
    }
}

pub fn good_server() -> &'static str {
    "echo listening on {port}; echo Grizzly server running; sleep 30"
}

pub fn config(root: &Path, engine: EngineProfile, require_transit: bool) -> SupervisorConfig {
    SupervisorConfig::builder()
        .name("portland")
        .bbox(BoundingBox::new(-122.7, 45.4, -122.5, 45.6).unwrap())
        .engine(engine)
        .require_transit(require_transit)
        .graph_root(root.join("graphs"))
        .base_path(root)
        .ports(PortStrategy::Dynamic(PortRange::new(47100, 47199).unwrap()))
        .build_idle_timeout(Some(Duration::from_secs(10)))
        .kill_grace(Duration::from_millis(20))
        .show_output(false)
        .exit_on_signal(false)
        .retry_config(RetryConfig {
            min_delay_ms: 10,
            max_delay_ms: 10,
            max_attempts: 3,
            use_exponential_backoff: false,
            jitter: false,
        })
        .build()
        .unwrap()
}

pub fn supervisor(
    config: SupervisorConfig,
    fetcher: Arc<ScriptedFetcher>,
) -> GraphSupervisor<Idle, PlatformProcessManager, Arc<ScriptedFetcher>> {
    let manager = Arc::new(<PlatformProcessManager as ProcessManager>::new());
    GraphSupervisor::with_parts(config, manager, fetcher).unwrap()
}

pub fn workspace(root: &Path) -> Workspace {
    Workspace::create(
        "portland",
        BoundingBox::new(-122.7, 45.4, -122.5, 45.6).unwrap(),
        root.join("graphs"),
    )
    .unwrap()
}

pub fn mark(root: &Path, stages: &[Stage]) {
    let mut store = StageStore::open(&workspace(root)).unwrap();
    for stage in stages {
        store.mark_complete(*stage).unwrap();
    }
}

pub fn tempdir() -> TempDir {
    tempfile::tempdir().unwrap()
}

/// `path` spelled relative to the current directory
pub fn relative_to_cwd(path: &Path) -> PathBuf {
    let cwd = std::env::current_dir().unwrap();
    let mut relative = PathBuf::new();
    for component in cwd.components() {
        if let Component::Normal(_) = component {
            relative.push("..");
        }
    }
    relative.join(path.strip_prefix("/").unwrap())
}
