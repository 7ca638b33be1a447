use crate::command::CommandTemplate;
use crate::error::SupervisorError;
use crate::workspace::BoundingBox;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory that holds every workspace unless configured otherwise
pub const DEFAULT_GRAPH_ROOT: &str = "graphs/";

/// How long a graph build may stay silent before it is considered dead
pub const DEFAULT_BUILD_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Delay between a killing rule match and the kill itself
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(1);

/// Configuration for retry logic around the server start step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Minimum delay between retry attempts (in milliseconds)
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Maximum delay between retry attempts (in milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Total number of attempts, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Whether to use exponential backoff (true) or fixed delay (false)
    #[serde(default = "default_use_exponential_backoff")]
    pub use_exponential_backoff: bool,

    /// Whether to randomize delays
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            use_exponential_backoff: default_use_exponential_backoff(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single attempt (fail fast)
    pub fn no_retry() -> Self {
        Self {
            min_delay_ms: 0,
            max_delay_ms: 0,
            max_attempts: 1,
            use_exponential_backoff: false,
            jitter: false,
        }
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err(SupervisorError::Configuration(
                "min_delay_ms cannot be greater than max_delay_ms".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(SupervisorError::Configuration(
                "max_attempts must allow at least one attempt".to_string(),
            ));
        }

        if self.max_attempts > 10 {
            return Err(SupervisorError::Configuration(
                "max_attempts should not exceed 10".to_string(),
            ));
        }

        if self.max_delay_ms > 60_000 {
            return Err(SupervisorError::Configuration(
                "max_delay_ms should not exceed 60 seconds".to_string(),
            ));
        }

        Ok(())
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Number of attempts after the first one
    pub fn retries(&self) -> usize {
        self.max_attempts.saturating_sub(1) as usize
    }

    pub fn retries_enabled(&self) -> bool {
        self.max_attempts > 1
    }
}

/// Inclusive range of candidate ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 8100,
            end: 8199,
        }
    }
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, SupervisorError> {
        if start > end {
            return Err(SupervisorError::Configuration(format!(
                "port range start {start} is above its end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

/// Where server ports come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortStrategy {
    /// First free ports of the range, probed on every start attempt
    Dynamic(PortRange),
    /// Exactly these ports, unchecked
    Fixed(Vec<u16>),
}

impl Default for PortStrategy {
    fn default() -> Self {
        PortStrategy::Dynamic(PortRange::default())
    }
}

/// Marker substrings the external tool prints; they vary with tool versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerConfig {
    pub error: String,
    pub build_complete: String,
    pub server_ready: String,
}

/// Options passed to the map download collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapOptions {
    /// Only download nodes used by ways (no points of interest)
    #[serde(default = "default_ways_only")]
    pub ways_only: bool,
    /// Downloads smaller than this many bytes are treated as failed
    #[serde(default = "default_min_map_size")]
    pub min_size: u64,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            ways_only: default_ways_only(),
            min_size: default_min_map_size(),
        }
    }
}

/// Shaded OpenTripPlanner 1.1 jar on Maven Central
pub const OTP_JAR_URL: &str =
    "https://repo1.maven.org/maven2/org/opentripplanner/otp/1.1.0/otp-1.1.0-shaded.jar";

/// GraphHopper 0.9 web bundle
pub const GRAPHHOPPER_BUNDLE_URL: &str =
    "https://graphhopper.com/public/releases/graphhopper-web-0.9.0-bin.zip";

/// Where an engine's executable jar comes from and where it lives once installed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum EngineArtifact {
    /// A single jar downloaded to `path`
    Jar { url: String, path: PathBuf },
    /// A zip archive unpacked into `dir`; the first `*.jar` inside is the engine
    Bundle { url: String, dir: PathBuf },
}

impl EngineArtifact {
    pub fn url(&self) -> &str {
        match self {
            EngineArtifact::Jar { url, .. } | EngineArtifact::Bundle { url, .. } => url,
        }
    }

    /// The jar path or install directory
    pub fn location(&self) -> &Path {
        match self {
            EngineArtifact::Jar { path, .. } => path,
            EngineArtifact::Bundle { dir, .. } => dir,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.locate_jar().is_some()
    }

    /// The installed jar, if any
    pub fn locate_jar(&self) -> Option<PathBuf> {
        match self {
            EngineArtifact::Jar { path, .. } => path.is_file().then(|| path.clone()),
            EngineArtifact::Bundle { dir, .. } => {
                let mut jars: Vec<PathBuf> = std::fs::read_dir(dir)
                    .ok()?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "jar"))
                    .collect();
                jars.sort();
                jars.into_iter().next()
            }
        }
    }
}

/// How to build a graph with, and serve it from, one routing engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineProfile {
    pub build: CommandTemplate,
    pub server: CommandTemplate,
    pub markers: MarkerConfig,
    /// Ports handed to every server start attempt
    pub port_count: usize,
    /// Installable engine; `{engine_jar}` resolves to its jar
    #[serde(default)]
    pub artifact: Option<EngineArtifact>,
}

impl EngineProfile {
    /// OpenTripPlanner 1.x shaded jar at `jar`, serving HTTP and HTTPS
    pub fn open_trip_planner(jar: impl AsRef<Path>) -> Self {
        Self {
            build: CommandTemplate::new(
                "java",
                ["-jar", "{engine_jar}", "--basePath", "{base_path}", "--build", "{graph_dir}"],
            ),
            server: CommandTemplate::new(
                "java",
                [
                    "-jar",
                    "{engine_jar}",
                    "--basePath",
                    "{base_path}",
                    "--router",
                    "{router}",
                    "--port",
                    "{port}",
                    "--securePort",
                    "{port.1}",
                    "--inMemory",
                ],
            ),
            markers: MarkerConfig {
                error: "Exception in thread".to_string(),
                build_complete: "Graph written".to_string(),
                server_ready: "Grizzly server running".to_string(),
            },
            port_count: 2,
            artifact: Some(EngineArtifact::Jar {
                url: OTP_JAR_URL.to_string(),
                path: jar.as_ref().to_path_buf(),
            }),
        }
    }

    /// GraphHopper web bundle unpacked into `install_dir`
    pub fn graphhopper(install_dir: impl AsRef<Path>) -> Self {
        let dir = install_dir.as_ref().to_path_buf();
        let install_dir = dir.display().to_string();
        let base_args = vec![
            "-jar".to_string(),
            "{engine_jar}".to_string(),
            format!("jetty.resourcebase={install_dir}/webapp"),
            format!("config={install_dir}/config-example.properties"),
            "datareader.file={osm_file}".to_string(),
            "graph.flag_encoders=car,foot,bike".to_string(),
        ];
        let mut server_args = base_args.clone();
        server_args.push("jetty.port={port}".to_string());

        Self {
            build: CommandTemplate::new("java", base_args),
            server: CommandTemplate::new("java", server_args),
            markers: MarkerConfig {
                error: "Exception in thread".to_string(),
                build_complete: "loaded graph".to_string(),
                server_ready: "Started server at HTTP".to_string(),
            },
            port_count: 1,
            artifact: Some(EngineArtifact::Bundle {
                url: GRAPHHOPPER_BUNDLE_URL.to_string(),
                dir,
            }),
        }
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        let referenced = self.server.ports_referenced();
        if referenced > self.port_count {
            return Err(SupervisorError::Configuration(format!(
                "server command references {referenced} ports but port_count is {}",
                self.port_count
            )));
        }
        for (name, marker) in [
            ("error", &self.markers.error),
            ("build_complete", &self.markers.build_complete),
            ("server_ready", &self.markers.server_ready),
        ] {
            if marker.is_empty() {
                return Err(SupervisorError::Configuration(format!(
                    "{name} marker must not be empty"
                )));
            }
        }
        Ok(())
    }
}

/// Main supervisor configuration
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option), build_fn(validate = "Self::validate"))]
pub struct SupervisorConfig {
    pub name: String,
    pub bbox: BoundingBox,
    pub engine: EngineProfile,
    /// Whether missing transit feeds abort the pipeline; deliberately has no default
    pub require_transit: bool,
    #[builder(default = "PathBuf::from(DEFAULT_GRAPH_ROOT)")]
    pub graph_root: PathBuf,
    /// Working directory of the engine and value of `{base_path}`
    #[builder(default = "PathBuf::from(\".\")")]
    pub base_path: PathBuf,
    #[builder(default)]
    pub ports: PortStrategy,
    #[builder(default)]
    pub map_options: MapOptions,
    #[builder(default = "Some(DEFAULT_BUILD_IDLE_TIMEOUT)")]
    #[builder(setter(custom))]
    pub build_idle_timeout: Option<Duration>,
    #[builder(default)]
    #[builder(setter(custom))]
    pub startup_idle_timeout: Option<Duration>,
    #[builder(default = "DEFAULT_KILL_GRACE")]
    pub kill_grace: Duration,
    #[builder(default = "true")]
    pub show_output: bool,
    /// Exit the whole program after signal-driven cleanup
    #[builder(default = "true")]
    pub exit_on_signal: bool,
    /// Download a missing engine artifact instead of failing
    #[builder(default)]
    pub auto_download_engine: bool,
    #[builder(default)]
    pub retry_config: RetryConfig,
}

impl SupervisorConfig {
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::default()
    }

    /// Load a JSON configuration document
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SupervisorError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|e| {
            SupervisorError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let file: ConfigFile = serde_json::from_slice(&raw).map_err(|e| {
            SupervisorError::Configuration(format!("cannot parse {}: {e}", path.display()))
        })?;
        file.into_config()
    }
}

impl SupervisorConfigBuilder {
    pub fn build_idle_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.build_idle_timeout = Some(timeout);
        self
    }

    pub fn startup_idle_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.startup_idle_timeout = Some(timeout);
        self
    }

    fn validate(&self) -> Result<(), String> {
        if let Some(bbox) = &self.bbox {
            bbox.validate().map_err(|e| e.to_string())?;
        }
        if let Some(engine) = &self.engine {
            engine.validate().map_err(|e| e.to_string())?;
        }
        if let Some(retry) = &self.retry_config {
            retry.validate().map_err(|e| e.to_string())?;
        }
        if let Some(PortStrategy::Dynamic(range)) = &self.ports {
            if range.start > range.end {
                return Err(format!("port range {}..={} is empty", range.start, range.end));
            }
        }
        Ok(())
    }
}

/// On-disk shape of a configuration document
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    name: String,
    bbox: BoundingBox,
    engine: EngineProfile,
    require_transit: bool,
    graph_root: Option<PathBuf>,
    base_path: Option<PathBuf>,
    ports: Option<PortStrategy>,
    map_options: Option<MapOptions>,
    build_idle_timeout_secs: Option<u64>,
    startup_idle_timeout_secs: Option<u64>,
    kill_grace_ms: Option<u64>,
    show_output: Option<bool>,
    auto_download_engine: Option<bool>,
    retry: Option<RetryConfig>,
}

impl ConfigFile {
    fn into_config(self) -> Result<SupervisorConfig, SupervisorError> {
        let mut builder = SupervisorConfig::builder();
        builder
            .name(self.name)
            .bbox(self.bbox)
            .engine(self.engine)
            .require_transit(self.require_transit);

        if let Some(root) = self.graph_root {
            builder.graph_root(root);
        }
        if let Some(base) = self.base_path {
            builder.base_path(base);
        }
        if let Some(ports) = self.ports {
            builder.ports(ports);
        }
        if let Some(options) = self.map_options {
            builder.map_options(options);
        }
        if let Some(secs) = self.build_idle_timeout_secs {
            builder.build_idle_timeout(Some(Duration::from_secs(secs)));
        }
        if let Some(secs) = self.startup_idle_timeout_secs {
            builder.startup_idle_timeout(Some(Duration::from_secs(secs)));
        }
        if let Some(ms) = self.kill_grace_ms {
            builder.kill_grace(Duration::from_millis(ms));
        }
        if let Some(show) = self.show_output {
            builder.show_output(show);
        }
        if let Some(auto) = self.auto_download_engine {
            builder.auto_download_engine(auto);
        }
        if let Some(retry) = self.retry {
            builder.retry_config(retry);
        }

        builder
            .build()
            .map_err(|e| SupervisorError::Configuration(e.to_string()))
    }
}

// Default value functions for serde
fn default_min_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_use_exponential_backoff() -> bool {
    true
}
fn default_jitter() -> bool {
    true
}
fn default_ways_only() -> bool {
    true
}
fn default_min_map_size() -> u64 {
    10_000
}
