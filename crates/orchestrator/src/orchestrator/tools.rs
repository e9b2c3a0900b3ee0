use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use eyre::{Result, WrapErr};
use tokio::sync::Mutex;

use crate::{artifacts::BuildApi, types::AndroidBuild};

/// Downloads the `cvd` and `fetch_cvd` host tools once.
pub struct CvdToolsDownloader {
    build: AndroidBuild,
    cvd_bin: PathBuf,
    fetch_cvd_bin: PathBuf,
    build_api: Arc<dyn BuildApi>,
    lock: Mutex<()>,
}

impl CvdToolsDownloader {
    pub fn new(
        build: AndroidBuild,
        cvd_bin: &Path,
        fetch_cvd_bin: &Path,
        build_api: Arc<dyn BuildApi>,
    ) -> Self {
        CvdToolsDownloader {
            build,
            cvd_bin: cvd_bin.to_path_buf(),
            fetch_cvd_bin: fetch_cvd_bin.to_path_buf(),
            build_api,
            lock: Mutex::new(()),
        }
    }

    pub async fn download(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.download_file(&self.cvd_bin)
            .await
            .wrap_err("failed downloading cvd file")?;
        self.download_file(&self.fetch_cvd_bin)
            .await
            .wrap_err("failed downloading fetch_cvd file")?;
        Ok(())
    }

    async fn download_file(&self, path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            return Ok(());
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| eyre::eyre!("invalid tool path {path:?}"))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::info!("downloading {name} from build {}", self.build);
        let res = self.fetch_tool(name, path).await;
        if res.is_err() && tokio::fs::try_exists(path).await.unwrap_or(false) {
            if let Err(err) = tokio::fs::remove_file(path).await {
                tracing::error!("failed removing {path:?}: {err}");
            }
        }
        res
    }

    async fn fetch_tool(&self, name: &str, path: &Path) -> Result<()> {
        self.build_api
            .download_artifact(name, &self.build.id, &self.build.target, path)
            .await?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o750)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::FakeBuildApi;

    fn tools_build() -> AndroidBuild {
        AndroidBuild {
            id: "100".to_string(),
            target: "aosp_cf_x86_64_phone-trunk_staging-userdebug".to_string(),
        }
    }

    #[tokio::test]
    async fn test_download_tools_once() {
        let tmp_dir = tempfile::tempdir().expect("tempdir");
        let cvd_bin = tmp_dir.path().join("cvd_tools").join("cvd");
        let fetch_cvd_bin = tmp_dir.path().join("cvd_tools").join("fetch_cvd");
        let build_api = Arc::new(FakeBuildApi::with_artifacts(&["cvd", "fetch_cvd"]));
        let downloader =
            CvdToolsDownloader::new(tools_build(), &cvd_bin, &fetch_cvd_bin, build_api.clone());

        downloader.download().await.expect("download");
        downloader.download().await.expect("download");

        assert_eq!(build_api.downloads.lock().unwrap().len(), 2);
        let mode = std::fs::metadata(&cvd_bin).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
        assert!(fetch_cvd_bin.exists());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_nothing_behind() {
        let tmp_dir = tempfile::tempdir().expect("tempdir");
        let cvd_bin = tmp_dir.path().join("cvd");
        let fetch_cvd_bin = tmp_dir.path().join("fetch_cvd");
        let build_api = Arc::new(FakeBuildApi::with_artifacts(&["cvd"]));
        let downloader = CvdToolsDownloader::new(tools_build(), &cvd_bin, &fetch_cvd_bin, build_api);

        let err = downloader.download().await.unwrap_err();

        assert_eq!(err.to_string(), "failed downloading fetch_cvd file");
        assert!(cvd_bin.exists());
        assert!(!fetch_cvd_bin.exists());
    }
}
