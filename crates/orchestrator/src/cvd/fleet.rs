use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;

use super::{cmd_output_log_message, CvdCommandOpts, CvdRunner};
use crate::types::Cvd;

/// `cvd fleet` output.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Fleet {
    #[serde(default)]
    pub groups: Vec<Group>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub instances: Vec<Instance>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Instance {
    pub instance_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub displays: Vec<String>,
    #[serde(default)]
    pub instance_dir: String,
    #[serde(default)]
    pub webrtc_device_id: String,
    #[serde(default)]
    pub adb_serial: String,
}

impl Fleet {
    // Only one instance group is managed per host.
    pub fn group(&self) -> Option<&Group> {
        self.groups.first()
    }

    pub fn instances(&self) -> &[Instance] {
        self.group().map(|g| g.instances.as_slice()).unwrap_or(&[])
    }

    pub fn find(&self, name: &str) -> Option<&Instance> {
        self.instances().iter().find(|ins| ins.instance_name == name)
    }

    pub fn to_cvds(&self, instances: &[&Instance]) -> Vec<Cvd> {
        let group = self.group().map(|g| g.group_name.as_str()).unwrap_or("");
        instances.iter().map(|ins| ins.to_cvd(group)).collect()
    }
}

impl Instance {
    /// Instance number; names are either `N` or `cvd-N`.
    pub fn number(&self) -> Result<u32> {
        let name = &self.instance_name;
        name.strip_prefix("cvd-")
            .unwrap_or(name)
            .parse::<u32>()
            .wrap_err_with(|| format!("failed parsing instance name {name:?}"))
    }

    pub fn to_cvd(&self, group: &str) -> Cvd {
        Cvd {
            group: group.to_string(),
            name: self.instance_name.clone(),
            // Fleet output carries no build information.
            build_source: None,
            status: self.status.clone(),
            displays: self.displays.clone(),
            webrtc_device_id: self.webrtc_device_id.clone(),
            adb_serial: self.adb_serial.clone(),
        }
    }
}

pub fn parse(output: &[u8]) -> Result<Fleet> {
    serde_json::from_slice(output).map_err(|err| {
        tracing::error!(
            "failed parsing `cvd fleet` output. Output:\n{}",
            cmd_output_log_message(&String::from_utf8_lossy(output))
        );
        eyre!("failed parsing `cvd fleet` output: {err}")
    })
}

impl CvdRunner {
    pub async fn fleet(&self) -> Result<Fleet> {
        let opts = CvdCommandOpts {
            capture_stdout: true,
            ..Default::default()
        };
        let stdout = self.run(&["fleet".to_string()], &opts).await?;
        parse(&stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLEET: &str = r#"{
        "groups": [
            {
                "group_name": "cvd",
                "instances": [
                    {
                        "instance_name": "1",
                        "status": "Running",
                        "displays": ["720 x 1280 ( 320 )"],
                        "instance_dir": "/var/lib/cuttlefish-common/runtimes/cvd-1",
                        "webrtc_device_id": "cvd-1",
                        "adb_serial": "0.0.0.0:6520"
                    },
                    {
                        "instance_name": "cvd-2",
                        "status": "Starting"
                    }
                ]
            },
            {
                "group_name": "other",
                "instances": [{"instance_name": "9"}]
            }
        ]
    }"#;

    #[test]
    fn test_parse_fleet() {
        let fleet = parse(FLEET.as_bytes()).expect("parse");

        assert_eq!(fleet.instances().len(), 2);
        let first = &fleet.instances()[0];
        assert_eq!(first.number().unwrap(), 1);
        assert_eq!(fleet.instances()[1].number().unwrap(), 2);
        assert!(fleet.find("9").is_none());

        let cvds = fleet.to_cvds(&[first]);
        assert_eq!(cvds[0].group, "cvd");
        assert_eq!(cvds[0].name, "1");
        assert_eq!(cvds[0].status, "Running");
        assert_eq!(cvds[0].displays, vec!["720 x 1280 ( 320 )".to_string()]);
        assert_eq!(cvds[0].adb_serial, "0.0.0.0:6520");
    }

    #[test]
    fn test_parse_empty_fleet() {
        let fleet = parse(b"{}").expect("parse");
        assert!(fleet.instances().is_empty());
        assert!(fleet.to_cvds(&[]).is_empty());
    }

    #[test]
    fn test_parse_invalid_output() {
        let err = parse(b"not json").unwrap_err();
        assert!(err.to_string().starts_with("failed parsing `cvd fleet` output"));
    }

    #[test]
    fn test_invalid_instance_name() {
        let instance = Instance {
            instance_name: "cvd-x".to_string(),
            ..Default::default()
        };
        let err = instance.number().unwrap_err();
        assert_eq!(err.to_string(), r#"failed parsing instance name "cvd-x""#);
    }
}
