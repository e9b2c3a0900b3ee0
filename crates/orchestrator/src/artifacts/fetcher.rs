use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use tempfile::NamedTempFile;

use super::build_api::BuildApi;
use crate::{
    cvd::{cmd_output_log_message, run_command, ExecContext},
    types::MultiError,
};

/// Substitutes the system image of a cvd bundle with one from another build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtraCvdOptions {
    pub system_img_build_id: String,
    pub system_img_target: String,
}

#[async_trait]
pub trait ArtifactsFetcher: Send + Sync {
    /// Fetches the full device bundle of a build into `out_dir`.
    async fn fetch_cvd(
        &self,
        out_dir: &Path,
        build_id: &str,
        target: &str,
        extra: Option<&ExtraCvdOptions>,
    ) -> Result<()>;

    /// Downloads the named artifacts of a build into `out_dir`.
    async fn fetch_artifacts(
        &self,
        out_dir: &Path,
        build_id: &str,
        target: &str,
        names: &[&str],
    ) -> Result<()>;
}

/// Creates an `ArtifactsFetcher` for the given credentials.
pub type ArtifactsFetcherFactory = Arc<dyn Fn(&str) -> Arc<dyn ArtifactsFetcher> + Send + Sync>;

/// Uses `fetch_cvd` for device bundles and the Build API for single artifacts.
pub struct CombinedArtifactsFetcher {
    exec: ExecContext,
    fetch_cvd_bin: PathBuf,
    build_api: Arc<dyn BuildApi>,
    credentials: String,
    timeout: Duration,
}

impl CombinedArtifactsFetcher {
    pub fn new(
        exec: ExecContext,
        fetch_cvd_bin: &Path,
        build_api: Arc<dyn BuildApi>,
        timeout: Duration,
    ) -> Self {
        CombinedArtifactsFetcher {
            exec,
            fetch_cvd_bin: fetch_cvd_bin.to_path_buf(),
            build_api,
            credentials: String::new(),
            timeout,
        }
    }

    /// Build API credentials handed to `fetch_cvd`.
    pub fn with_credentials(mut self, credentials: &str) -> Self {
        self.credentials = credentials.to_string();
        self
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<()> {
        let cmd = (self.exec)(program, args);
        let output = run_command(cmd, self.timeout, true).await?;
        if output.timed_out || !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            tracing::error!(
                "`{program} {}`, combined stdout and stderr:\n{}",
                args.join(" "),
                cmd_output_log_message(&combined)
            );

            if output.timed_out {
                return Err(eyre!("`{program}` timed out after {:?}", self.timeout));
            }
            return Err(eyre!("`{program}` failed: {}", output.status));
        }

        Ok(())
    }
}

#[async_trait]
impl ArtifactsFetcher for CombinedArtifactsFetcher {
    // `fetch_cvd` creates `out_dir` itself.
    async fn fetch_cvd(
        &self,
        out_dir: &Path,
        build_id: &str,
        target: &str,
        extra: Option<&ExtraCvdOptions>,
    ) -> Result<()> {
        let mut args = vec![
            format!("--directory={}", out_dir.display()),
            format!("--default_build={build_id}/{target}"),
        ];
        if let Some(extra) = extra {
            args.push(format!(
                "--system_build={}/{}",
                extra.system_img_build_id, extra.system_img_target
            ));
        }
        // Lives until `fetch_cvd` exits; dropping it removes the file.
        let credentials_file = if self.credentials.is_empty() {
            None
        } else {
            Some(write_credentials_file(&self.credentials)?)
        };
        if let Some(file) = &credentials_file {
            args.push(format!("--credential_source={}", file.path().display()));
        }

        let fetch_cvd_bin = self.fetch_cvd_bin.display().to_string();
        self.run(&fetch_cvd_bin, &args).await?;

        // Devices can't boot from read-only artifacts.
        let chmod_args = vec![
            "-R".to_string(),
            "g+rw".to_string(),
            out_dir.display().to_string(),
        ];
        self.run("chmod", &chmod_args).await
    }

    async fn fetch_artifacts(
        &self,
        out_dir: &Path,
        build_id: &str,
        target: &str,
        names: &[&str],
    ) -> Result<()> {
        let handles: Vec<_> = names
            .iter()
            .map(|name| {
                let build_api = self.build_api.clone();
                let dst = out_dir.join(name);
                let (name, build_id, target) =
                    (name.to_string(), build_id.to_string(), target.to_string());
                tokio::spawn(async move {
                    download_artifact_to_file(build_api.as_ref(), &dst, &name, &build_id, &target)
                        .await
                })
            })
            .collect();

        let mut errors = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(err) => errors.push(eyre!("download task failed: {err}")),
            }
        }

        // A single error is passed through untouched so callers can inspect it.
        if errors.len() == 1 {
            return Err(errors.remove(0));
        }
        let mut merr = MultiError::default();
        for err in errors {
            merr.push(err);
        }
        Ok(merr.into_result()?)
    }
}

// Only the owner can read it (0600).
fn write_credentials_file(credentials: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("fetch_cvd_credentials")
        .tempfile()
        .wrap_err("failed creating credentials file")?;
    file.write_all(credentials.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Downloads an artifact into `dst`, failing if `dst` already exists.
pub async fn download_artifact_to_file(
    build_api: &dyn BuildApi,
    dst: &Path,
    name: &str,
    build_id: &str,
    target: &str,
) -> Result<()> {
    if tokio::fs::try_exists(dst).await? {
        return Err(eyre!("download artifact {dst:?} failed: file already exists"));
    }

    build_api
        .download_artifact(name, build_id, target, dst)
        .await
}
