use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use eyre::{eyre, Result};
use reqwest::Url;
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Max time to wait for the next chunk of a download.
const CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BuildApiError {
    #[error("request to {url} failed with status {status}: {message}")]
    Status {
        url: String,
        status: u16,
        message: String,
    },
    #[error("no green build found for branch {branch} and target {target}")]
    NoGreenBuild { branch: String, target: String },
}

impl BuildApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BuildApiError::Status { status: 404, .. })
    }
}

/// Source of Android CI build artifacts.
#[async_trait]
pub trait BuildApi: Send + Sync {
    async fn get_latest_green_build_id(&self, branch: &str, target: &str) -> Result<String>;

    /// Downloads artifact `name` into `dst`. `dst` only appears once the
    /// whole artifact has been written.
    async fn download_artifact(
        &self,
        name: &str,
        build_id: &str,
        target: &str,
        dst: &Path,
    ) -> Result<()>;
}

/// Builds a `BuildApi` client for the given credentials.
pub type BuildApiFactory = Arc<dyn Fn(&str) -> Arc<dyn BuildApi> + Send + Sync>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildsResponse {
    #[serde(default)]
    builds: Vec<BuildEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildEntry {
    build_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedUrlResponse {
    signed_url: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Android Build API (v3) client.
pub struct AndroidBuildApi {
    base_url: Url,
    credentials: Option<String>,
    http_client: reqwest::Client,
}

impl AndroidBuildApi {
    pub fn new(base_url: &str, credentials: &str, http_client: reqwest::Client) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(eyre!("invalid Android Build API URL: {base_url}"));
        }

        let credentials = if credentials.is_empty() {
            None
        } else {
            Some(credentials.to_string())
        };

        Ok(AndroidBuildApi {
            base_url,
            credentials,
            http_client,
        })
    }

    /// Same endpoint and connection pool, different caller credentials.
    pub fn with_credentials(&self, credentials: &str) -> Self {
        AndroidBuildApi {
            base_url: self.base_url.clone(),
            credentials: (!credentials.is_empty()).then(|| credentials.to_string()),
            http_client: self.http_client.clone(),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| eyre!("invalid Android Build API URL: {}", self.base_url))?
            .pop_if_empty()
            .extend(["android", "internal", "build", "v3"])
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let mut req = self.http_client.get(url.clone());
        if let Some(credentials) = &self.credentials {
            req = req.bearer_auth(credentials);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .json::<ErrorResponse>()
                .await
                .map(|body| body.error.message)
                .unwrap_or_default();
            return Err(BuildApiError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                message,
            }
            .into());
        }

        Ok(resp.json::<T>().await?)
    }

    async fn download_to_file(&self, url: &str, file_path: &Path) -> Result<()> {
        let mut resp = self.http_client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BuildApiError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or_default().to_string(),
            }
            .into());
        }

        let fd = tokio::fs::File::create(file_path).await?;
        let mut fd = tokio::io::BufWriter::new(fd);
        loop {
            match tokio::time::timeout(CHUNK_TIMEOUT, resp.chunk()).await {
                Ok(Ok(Some(chunk))) => fd.write_all(&chunk).await?,
                Ok(Ok(None)) => break,
                Ok(Err(err)) => return Err(eyre!("download of {url} failed: {err}")),
                Err(_) => return Err(eyre!("download of {url} timed out")),
            }
        }
        fd.flush().await?;

        Ok(())
    }
}

#[async_trait]
impl BuildApi for AndroidBuildApi {
    async fn get_latest_green_build_id(&self, branch: &str, target: &str) -> Result<String> {
        let mut url = self.endpoint(&["builds"])?;
        url.query_pairs_mut()
            .append_pair("branch", branch)
            .append_pair("buildAttemptStatus", "complete")
            .append_pair("buildType", "submitted")
            .append_pair("maxResults", "1")
            .append_pair("successful", "true")
            .append_pair("target", target);

        let resp: BuildsResponse = self.get_json(url).await?;
        match resp.builds.into_iter().next() {
            Some(build) => Ok(build.build_id),
            None => Err(BuildApiError::NoGreenBuild {
                branch: branch.to_string(),
                target: target.to_string(),
            }
            .into()),
        }
    }

    async fn download_artifact(
        &self,
        name: &str,
        build_id: &str,
        target: &str,
        dst: &Path,
    ) -> Result<()> {
        let mut url = self.endpoint(&[
            "builds", build_id, target, "attempts", "latest", "artifacts", name, "url",
        ])?;
        url.query_pairs_mut().append_pair("redirect", "false");
        let signed: SignedUrlResponse = self.get_json(url).await?;

        tracing::info!("downloading artifact {name} of build {build_id}/{target} to {dst:?}");

        // Incomplete downloads never show up under the final name.
        let tmp_path = tmp_file_path(dst);
        if let Err(err) = self.download_to_file(&signed.signed_url, &tmp_path).await {
            if let Err(rm_err) = tokio::fs::remove_file(&tmp_path).await {
                tracing::debug!("failed to remove {tmp_path:?}: {rm_err}");
            }
            return Err(err);
        }
        tokio::fs::rename(&tmp_path, dst).await?;

        Ok(())
    }
}

fn tmp_file_path(dst: &Path) -> PathBuf {
    let mut tmp = dst.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;

    const BUILDS_PATH: &str = "/android/internal/build/v3/builds";

    fn artifact_url_path(build_id: &str, target: &str, name: &str) -> String {
        format!("{BUILDS_PATH}/{build_id}/{target}/attempts/latest/artifacts/{name}/url")
    }

    #[tokio::test]
    async fn test_latest_green_build_id() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(BUILDS_PATH)
                    .query_param("branch", "aosp-main")
                    .query_param("target", "aosp_cf_x86_64_phone-userdebug")
                    .query_param("successful", "true")
                    .query_param("maxResults", "1")
                    .header("authorization", "Bearer token");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"builds":[{"buildId":"1234"}]}"#);
            })
            .await;

        let api = AndroidBuildApi::new(&server.base_url(), "token", reqwest::Client::new())
            .expect("build api");
        let id = api
            .get_latest_green_build_id("aosp-main", "aosp_cf_x86_64_phone-userdebug")
            .await
            .expect("latest green build");

        assert_eq!(id, "1234");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_credentials_are_swapped() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(BUILDS_PATH)
                    .header("authorization", "Bearer other");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"builds":[{"buildId":"1"}]}"#);
            })
            .await;

        let api = AndroidBuildApi::new(&server.base_url(), "token", reqwest::Client::new())
            .expect("build api")
            .with_credentials("other");
        api.get_latest_green_build_id("aosp-main", "foo")
            .await
            .expect("latest green build");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_latest_green_build_id_without_builds() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(BUILDS_PATH);
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"builds":[]}"#);
            })
            .await;

        let api = AndroidBuildApi::new(&server.base_url(), "", reqwest::Client::new())
            .expect("build api");
        let err = api
            .get_latest_green_build_id("aosp-main", "foo")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildApiError>(),
            Some(BuildApiError::NoGreenBuild { .. })
        ));
    }

    #[tokio::test]
    async fn test_download_artifact() {
        let server = MockServer::start_async().await;
        let signed_url = server.url("/signed/bzImage");
        let url_mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(artifact_url_path("1234", "foo", "bzImage"))
                    .query_param("redirect", "false");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(format!(r#"{{"signedUrl":"{signed_url}"}}"#));
            })
            .await;
        let download_mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/signed/bzImage");
                then.status(200).body("kernel bytes");
            })
            .await;

        let tmp_dir = tempfile::tempdir().expect("tempdir");
        let dst = tmp_dir.path().join("bzImage");
        let api = AndroidBuildApi::new(&server.base_url(), "", reqwest::Client::new())
            .expect("build api");
        api.download_artifact("bzImage", "1234", "foo", &dst)
            .await
            .expect("download");

        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "kernel bytes");
        assert!(!tmp_file_path(&dst).exists());
        url_mock.assert_async().await;
        download_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_download_missing_artifact_is_not_found() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(artifact_url_path("1234", "foo", "initramfs.img"));
                then.status(404)
                    .header("content-type", "application/json")
                    .body(r#"{"error":{"message":"not found"}}"#);
            })
            .await;

        let tmp_dir = tempfile::tempdir().expect("tempdir");
        let dst = tmp_dir.path().join("initramfs.img");
        let api = AndroidBuildApi::new(&server.base_url(), "", reqwest::Client::new())
            .expect("build api");
        let err = api
            .download_artifact("initramfs.img", "1234", "foo", &dst)
            .await
            .unwrap_err();

        let api_err = err.downcast_ref::<BuildApiError>().expect("build api error");
        assert!(api_err.is_not_found());
        assert!(api_err.to_string().contains("not found"));
        assert!(!dst.exists());
    }
}
