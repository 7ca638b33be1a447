use async_trait::async_trait;
use graphvisor_core::{BoundingBox, MapOptions, Stage, StageStore, SupervisorError, Workspace};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Download collaborator for map and transit data
#[async_trait]
pub trait DataFetcher: Send + Sync {
    /// Download a map extract for `bbox` into `output_dir`, returning the file written
    async fn fetch_map(
        &self,
        bbox: &BoundingBox,
        output_dir: &Path,
        options: &MapOptions,
    ) -> anyhow::Result<PathBuf>;

    /// Download every transit feed covering `bbox` into `output_dir`, returning how many were saved
    async fn fetch_transit(&self, bbox: &BoundingBox, output_dir: &Path) -> anyhow::Result<usize>;
}

#[async_trait]
impl<T: DataFetcher + ?Sized> DataFetcher for Arc<T> {
    async fn fetch_map(
        &self,
        bbox: &BoundingBox,
        output_dir: &Path,
        options: &MapOptions,
    ) -> anyhow::Result<PathBuf> {
        (**self).fetch_map(bbox, output_dir, options).await
    }

    async fn fetch_transit(&self, bbox: &BoundingBox, output_dir: &Path) -> anyhow::Result<usize> {
        (**self).fetch_transit(bbox, output_dir).await
    }
}

/// What the provisioning step did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Whether transit data is on disk for the graph build
    pub transit_available: bool,
    /// Stages that ran a download in this call
    pub downloaded: Vec<Stage>,
}

/// Runs the download stages that are not yet marked complete
pub struct DataProvisioner<F> {
    fetcher: F,
    map_options: MapOptions,
    require_transit: bool,
}

impl<F: DataFetcher> DataProvisioner<F> {
    pub fn new(fetcher: F, map_options: MapOptions, require_transit: bool) -> Self {
        Self {
            fetcher,
            map_options,
            require_transit,
        }
    }

    pub async fn provision(
        &self,
        workspace: &Workspace,
        stages: &mut StageStore,
    ) -> Result<ProvisionReport, SupervisorError> {
        let mut report = ProvisionReport::default();

        if stages.is_complete(Stage::OsmDownload) {
            info!(stage = %Stage::OsmDownload, "Stage already complete, skipping");
        } else {
            info!(stage = %Stage::OsmDownload, "Downloading map data");
            let map = self
                .fetcher
                .fetch_map(workspace.bbox(), workspace.dir(), &self.map_options)
                .await
                .map_err(|e| {
                    error!(stage = %Stage::OsmDownload, "Map download failed: {e:#}");
                    SupervisorError::DataProvision {
                        stage: Stage::OsmDownload,
                        reason: format!("{e:#}"),
                    }
                })?;
            stages.mark_complete(Stage::OsmDownload)?;
            info!(stage = %Stage::OsmDownload, file = %map.display(), "Map data downloaded");
            report.downloaded.push(Stage::OsmDownload);
        }

        if stages.is_complete(Stage::GtfsDownload) {
            info!(stage = %Stage::GtfsDownload, "Stage already complete, skipping");
            report.transit_available = true;
            return Ok(report);
        }

        info!(stage = %Stage::GtfsDownload, "Downloading transit feeds");
        let failure = match self.fetcher.fetch_transit(workspace.bbox(), workspace.dir()).await {
            Ok(0) => "no transit feeds were downloaded".to_string(),
            Ok(count) => {
                stages.mark_complete(Stage::GtfsDownload)?;
                info!(stage = %Stage::GtfsDownload, count, "Transit feeds downloaded");
                report.downloaded.push(Stage::GtfsDownload);
                report.transit_available = true;
                return Ok(report);
            }
            Err(e) => format!("{e:#}"),
        };

        if self.require_transit {
            error!(stage = %Stage::GtfsDownload, "Transit download failed: {failure}");
            return Err(SupervisorError::DataProvision {
                stage: Stage::GtfsDownload,
                reason: failure,
            });
        }

        warn!(
            stage = %Stage::GtfsDownload,
            "Transit download failed, continuing without transit: {failure}"
        );
        Ok(report)
    }
}
