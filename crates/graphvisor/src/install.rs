//! Routing engine installation.
//!
//! A jar artifact is downloaded next to its final path and moved into place.
//! A bundle is downloaded as a zip, unpacked into a staging directory beside
//! the install directory, then renamed to it.

use crate::fetch::save_file;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use graphvisor_core::EngineArtifact;
use reqwest::Client;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Puts an engine artifact in place
#[async_trait]
pub trait EngineInstaller: Send + Sync {
    async fn install(&self, artifact: &EngineArtifact) -> Result<()>;
}

#[async_trait]
impl<T: EngineInstaller + ?Sized> EngineInstaller for Arc<T> {
    async fn install(&self, artifact: &EngineArtifact) -> Result<()> {
        (**self).install(artifact).await
    }
}

/// Downloads engine artifacts over HTTP
#[derive(Debug, Clone)]
pub struct HttpEngineInstaller {
    client: Client,
}

impl HttpEngineInstaller {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("graphvisor/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EngineInstaller for HttpEngineInstaller {
    async fn install(&self, artifact: &EngineArtifact) -> Result<()> {
        let parent = parent_dir(artifact.location());
        tokio::fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let download = tempfile::Builder::new()
            .prefix(".engine-")
            .tempfile_in(&parent)
            .context("Failed to create download file")?;
        info!(url = artifact.url(), "Downloading routing engine");
        let written = save_file(&self.client, artifact.url(), download.path()).await?;
        debug!(bytes = written, "Engine download finished");

        match artifact {
            EngineArtifact::Jar { path, .. } => {
                download
                    .persist(path)
                    .map_err(|e| e.error)
                    .with_context(|| format!("Failed to move engine jar to {}", path.display()))?;
                Ok(())
            }
            EngineArtifact::Bundle { dir, .. } => install_bundle(download.path(), dir).await,
        }
    }
}

/// Unpack `archive` into the not yet existing `dir`
pub(crate) async fn install_bundle(archive: &Path, dir: &Path) -> Result<()> {
    if dir.exists() {
        bail!("{} exists but holds no engine jar", dir.display());
    }

    let staging = tempfile::Builder::new()
        .prefix(".engine-")
        .tempdir_in(parent_dir(dir))
        .context("Failed to create staging directory")?;

    let source = archive.to_path_buf();
    let target = staging.path().to_path_buf();
    let files = tokio::task::spawn_blocking(move || unpack_zip(&source, &target))
        .await
        .context("Unpack task failed")??;

    tokio::fs::rename(staging.path(), dir)
        .await
        .with_context(|| format!("Failed to move unpacked engine to {}", dir.display()))?;
    info!(dir = %dir.display(), files, "Unpacked routing engine");
    Ok(())
}

/// Extract every entry of a zip archive below `dest`, returning the files written
///
/// Entries whose names would leave `dest` are skipped.
fn unpack_zip(archive: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut archive = zip::ZipArchive::new(file).context("Invalid zip archive")?;

    let mut files = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .with_context(|| format!("Failed to read zip entry {i}"))?;

        let outpath = match entry.enclosed_name() {
            Some(path) => dest.join(path),
            None => continue,
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)
                .with_context(|| format!("Failed to create {}", outpath.display()))?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let mut outfile = File::create(&outpath)
                .with_context(|| format!("Failed to create {}", outpath.display()))?;
            std::io::copy(&mut entry, &mut outfile)
                .with_context(|| format!("Failed to write {}", outpath.display()))?;
            files += 1;
        }
    }

    Ok(files)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn bundle(path: &Path) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        let options = SimpleFileOptions::default();
        writer.add_directory("webapp/", options).unwrap();
        writer.start_file("webapp/index.html", options).unwrap();
        writer.write_all(b"<html/>").unwrap();
        writer.start_file("config-example.properties", options).unwrap();
        writer.write_all(b"graph.flag_encoders=car").unwrap();
        writer.start_file("graphhopper-web-0.9.0-with-dep.jar", options).unwrap();
        writer.write_all(b"PK").unwrap();
        writer.start_file("../outside.txt", options).unwrap();
        writer.write_all(b"nope").unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_unpack_skips_entries_outside_dest() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("gh.zip");
        bundle(&archive);
        let dest = dir.path().join("out");
        std::fs::create_dir(&dest).unwrap();

        let files = unpack_zip(&archive, &dest).unwrap();

        assert_eq!(files, 3);
        assert!(dest.join("webapp/index.html").is_file());
        assert!(!dir.path().join("outside.txt").exists());
    }

    #[tokio::test]
    async fn test_bundle_install_makes_jar_locatable() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("gh.zip");
        bundle(&archive);
        let artifact = EngineArtifact::Bundle {
            url: "https://example.org/gh.zip".to_string(),
            dir: dir.path().join("graphhopper"),
        };
        assert!(!artifact.is_installed());

        install_bundle(&archive, artifact.location()).await.unwrap();

        assert_eq!(
            artifact.locate_jar(),
            Some(dir.path().join("graphhopper/graphhopper-web-0.9.0-with-dep.jar"))
        );
        // only the archive and the install directory remain
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_bundle_install_refuses_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("gh.zip");
        bundle(&archive);
        let install = dir.path().join("graphhopper");
        std::fs::create_dir(&install).unwrap();
        std::fs::write(install.join("notes.txt"), b"keep").unwrap();

        assert!(install_bundle(&archive, &install).await.is_err());
        assert!(install.join("notes.txt").is_file());
    }

    #[test]
    fn test_parent_of_bare_file_name() {
        assert_eq!(parent_dir(Path::new("otp.jar")), PathBuf::from("."));
        assert_eq!(parent_dir(Path::new("engines/otp.jar")), PathBuf::from("engines"));
    }
}
