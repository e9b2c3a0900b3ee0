use super::build::BuildSource;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cvd {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_source: Option<BuildSource>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub displays: Vec<String>,
    #[serde(default)]
    pub webrtc_device_id: String,
    #[serde(default)]
    pub adb_serial: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCvdRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cvd: Option<Cvd>,
    // Number of instances to launch on top of the first one.
    #[serde(default)]
    pub additional_instances_num: u32,
}

impl CreateCvdRequest {
    pub fn new(build_source: BuildSource) -> Self {
        CreateCvdRequest {
            cvd: Some(Cvd {
                build_source: Some(build_source),
                ..Default::default()
            }),
            additional_instances_num: 0,
        }
    }

    pub fn build_source(&self) -> Option<&BuildSource> {
        self.cvd.as_ref().and_then(|cvd| cvd.build_source.as_ref())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCvdResponse {
    pub cvds: Vec<Cvd>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListCvdsResponse {
    pub cvds: Vec<Cvd>,
}
