use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

mod build_api;
mod cache;
mod fetcher;

pub use build_api::{AndroidBuildApi, BuildApi, BuildApiError, BuildApiFactory};
pub use cache::BundleCache;
pub use fetcher::{
    download_artifact_to_file, ArtifactsFetcher, ArtifactsFetcherFactory,
    CombinedArtifactsFetcher, ExtraCvdOptions,
};

#[cfg(test)]
pub(crate) use fetcher::tests::FakeBuildApi;

pub const KERNEL_IMAGE: &str = "bzImage";
pub const INITRAMFS_IMAGE: &str = "initramfs.img";
pub const BOOTLOADER_IMAGE: &str = "u-boot.rom";

/// Written once every file of a multi-file bundle is in place.
const BUNDLE_COMPLETE_MARKER: &str = ".complete";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ArtifactsError {
    #[error("failed fetching artifacts {key}: {reason}")]
    FetchFailed { key: String, reason: String },
}

/// Downloads build bundles into per-bundle directories under `root_dir`,
/// at most once per bundle for the lifetime of the process.
pub struct Manager {
    root_dir: PathBuf,
    cache: BundleCache<PathBuf>,
}

impl Manager {
    pub fn new(root_dir: &Path) -> Self {
        Manager {
            root_dir: root_dir.to_path_buf(),
            cache: BundleCache::default(),
        }
    }

    /// Full device bundle. Bundles with a substituted system image are never
    /// shared, so they get a directory of their own.
    pub async fn get_cvd_bundle(
        &self,
        build_id: &str,
        target: &str,
        extra: Option<&ExtraCvdOptions>,
        fetcher: &dyn ArtifactsFetcher,
    ) -> Result<PathBuf, ArtifactsError> {
        let key = match extra {
            None => format!("{build_id}_{target}__cvd"),
            Some(_) => Uuid::new_v4().to_string(),
        };
        let out_dir = self.root_dir.join(&key);

        self.cache
            .get_or_fetch(&key, || fetch_cvd_bundle(out_dir, build_id, target, extra, fetcher))
            .await
    }

    /// Kernel image plus the initramfs, if the build has one.
    pub async fn get_kernel_bundle(
        &self,
        build_id: &str,
        target: &str,
        fetcher: &dyn ArtifactsFetcher,
    ) -> Result<PathBuf, ArtifactsError> {
        let key = format!("{build_id}_{target}__kernel");
        let out_dir = self.root_dir.join(&key);

        self.cache
            .get_or_fetch(&key, || fetch_kernel_bundle(out_dir, build_id, target, fetcher))
            .await
    }

    pub async fn get_bootloader_bundle(
        &self,
        build_id: &str,
        target: &str,
        fetcher: &dyn ArtifactsFetcher,
    ) -> Result<PathBuf, ArtifactsError> {
        let key = format!("{build_id}_{target}__bootloader");
        let out_dir = self.root_dir.join(&key);

        self.cache
            .get_or_fetch(&key, || fetch_bootloader_bundle(out_dir, build_id, target, fetcher))
            .await
    }
}

async fn fetch_cvd_bundle(
    out_dir: PathBuf,
    build_id: &str,
    target: &str,
    extra: Option<&ExtraCvdOptions>,
    fetcher: &dyn ArtifactsFetcher,
) -> eyre::Result<PathBuf> {
    fetcher.fetch_cvd(&out_dir, build_id, target, extra).await?;
    Ok(out_dir)
}

async fn fetch_kernel_bundle(
    out_dir: PathBuf,
    build_id: &str,
    target: &str,
    fetcher: &dyn ArtifactsFetcher,
) -> eyre::Result<PathBuf> {
    tokio::fs::create_dir_all(&out_dir).await?;
    // Left over by a previous run of the service.
    if tokio::fs::try_exists(out_dir.join(BUNDLE_COMPLETE_MARKER)).await? {
        return Ok(out_dir);
    }
    for name in [KERNEL_IMAGE, INITRAMFS_IMAGE] {
        remove_if_exists(&out_dir.join(name)).await?;
    }

    fetcher
        .fetch_artifacts(&out_dir, build_id, target, &[KERNEL_IMAGE])
        .await?;
    if let Err(err) = fetcher
        .fetch_artifacts(&out_dir, build_id, target, &[INITRAMFS_IMAGE])
        .await
    {
        match err.downcast_ref::<BuildApiError>() {
            Some(api_err) if api_err.is_not_found() => {
                tracing::debug!("build {build_id}/{target} has no {INITRAMFS_IMAGE}");
            }
            _ => return Err(err),
        }
    }
    tokio::fs::write(out_dir.join(BUNDLE_COMPLETE_MARKER), b"").await?;

    Ok(out_dir)
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

async fn fetch_bootloader_bundle(
    out_dir: PathBuf,
    build_id: &str,
    target: &str,
    fetcher: &dyn ArtifactsFetcher,
) -> eyre::Result<PathBuf> {
    tokio::fs::create_dir_all(&out_dir).await?;
    if !tokio::fs::try_exists(out_dir.join(BOOTLOADER_IMAGE)).await? {
        fetcher
            .fetch_artifacts(&out_dir, build_id, target, &[BOOTLOADER_IMAGE])
            .await?;
    }
    Ok(out_dir)
}
