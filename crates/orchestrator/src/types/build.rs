use serde::{Deserialize, Serialize};
use std::fmt;

/// Build descriptor of the `cvd` host tools themselves.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AndroidBuild {
    pub id: String,
    pub target: String,
}

impl fmt::Display for AndroidBuild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.target)
    }
}

/// Build hosted in Android CI. An empty `build_id` means "latest green build
/// of `branch`".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AndroidCiBuild {
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub build_id: String,
    #[serde(default)]
    pub target: String,
}

impl AndroidCiBuild {
    pub fn new(branch: &str, target: &str) -> Self {
        AndroidCiBuild {
            branch: branch.to_string(),
            build_id: String::new(),
            target: target.to_string(),
        }
    }
}

impl fmt::Display for AndroidCiBuild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.branch, self.build_id, self.target)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AndroidCiBuildSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_build: Option<AndroidCiBuild>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_build: Option<AndroidCiBuild>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootloader_build: Option<AndroidCiBuild>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_image_build: Option<AndroidCiBuild>,
    // OAuth access token forwarded to the Android Build API.
    #[serde(default, skip_serializing)]
    pub credentials: String,
}

/// Artifacts previously uploaded by the user. `artifacts_dir` is relative to
/// the user artifacts root directory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBuildSource {
    #[serde(default)]
    pub artifacts_dir: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub android_ci_build_source: Option<AndroidCiBuildSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_build_source: Option<UserBuildSource>,
}

impl BuildSource {
    pub fn android_ci(source: AndroidCiBuildSource) -> Self {
        BuildSource {
            android_ci_build_source: Some(source),
            user_build_source: None,
        }
    }

    pub fn user(artifacts_dir: &str) -> Self {
        BuildSource {
            android_ci_build_source: None,
            user_build_source: Some(UserBuildSource {
                artifacts_dir: artifacts_dir.to_string(),
            }),
        }
    }
}
