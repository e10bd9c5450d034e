use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::MegaRaidConfig;
use crate::error::{CollectionError, ExecutionError, ParseError};
use crate::runner;
use crate::types::{CollectionResult, Label, MetricSample, MetricSpec};
use super::Collector;

const TOOL: &str = "storcli";
const ID: &str = "mega_raid";

/// Virtual drives in this state count as ready.
const READY_VD_STATE: &str = "Optl";

/// One controller's extracted report from `storcli /cALL show all J`.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerInfo {
    pub id: String,
    pub virtual_drives: Vec<VirtualDrive>,
    pub physical_drives: Vec<PhysicalDrive>,
    pub enclosures: Vec<Enclosure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualDrive {
    pub drive_group: String,
    pub virtual_drive_group: String,
    pub state: String,
    pub raid_level: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalDrive {
    pub enclosure_id: String,
    pub slot_id: String,
    pub state: String,
    pub drive_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enclosure {
    pub id: String,
    pub num_slots: String,
    pub state: String,
}

/// Render a JSON scalar as a label value. storcli mixes strings and numbers
/// for the same logical field across tool versions.
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn field(record: &Value, key: &str) -> Option<String> {
    scalar(record.get(key)?)
}

/// Parse the storcli JSON document into per-controller reports.
///
/// Individual records with unexpected shapes are skipped with a debug log;
/// only a document without the `Controllers` array is a hard error.
pub fn parse_controllers(raw: &str) -> Result<Vec<ControllerInfo>, ParseError> {
    let document: Value = serde_json::from_str(raw)?;
    let controllers = document
        .get("Controllers")
        .and_then(Value::as_array)
        .ok_or(ParseError::MalformedStructure {
            what: "storcli output",
            detail: "missing Controllers array".into(),
        })?;

    let mut parsed = Vec::new();
    for controller in controllers {
        let response = match controller.get("Response Data") {
            Some(response) => response,
            None => {
                tracing::debug!("Controller entry without Response Data, skipping");
                continue;
            }
        };
        let id = match response
            .get("Basics")
            .and_then(|basics| basics.get("Controller"))
            .and_then(scalar)
        {
            Some(id) => id,
            None => {
                tracing::debug!("Controller entry without an id, skipping");
                continue;
            }
        };

        parsed.push(ControllerInfo {
            id,
            virtual_drives: extract_virtual_drives(response),
            physical_drives: extract_physical_drives(response),
            enclosures: extract_enclosures(response),
        });
    }
    Ok(parsed)
}

fn extract_virtual_drives(response: &Value) -> Vec<VirtualDrive> {
    let records = match response.get("VD LIST").and_then(Value::as_array) {
        Some(records) => records,
        None => {
            tracing::debug!("No VD LIST in controller response");
            return Vec::new();
        }
    };

    records
        .iter()
        .filter_map(|record| {
            let dg_vd = field(record, "DG/VD")?;
            let (drive_group, virtual_drive_group) = dg_vd.split_once('/')?;
            Some(VirtualDrive {
                drive_group: drive_group.to_string(),
                virtual_drive_group: virtual_drive_group.to_string(),
                state: field(record, "State")?,
                raid_level: field(record, "TYPE").unwrap_or_default(),
                name: field(record, "Name").unwrap_or_default(),
            })
        })
        .collect()
}

fn extract_physical_drives(response: &Value) -> Vec<PhysicalDrive> {
    let records = match response.get("PD LIST").and_then(Value::as_array) {
        Some(records) => records,
        None => {
            tracing::debug!("No PD LIST in controller response");
            return Vec::new();
        }
    };

    records
        .iter()
        .filter_map(|record| {
            let eid_slt = field(record, "EID:Slt")?;
            let (enclosure_id, slot_id) = eid_slt.split_once(':')?;
            Some(PhysicalDrive {
                enclosure_id: enclosure_id.to_string(),
                slot_id: slot_id.to_string(),
                state: field(record, "State")?,
                drive_type: field(record, "Med").unwrap_or_default(),
            })
        })
        .collect()
}

fn extract_enclosures(response: &Value) -> Vec<Enclosure> {
    let records = match response.get("Enclosure LIST").and_then(Value::as_array) {
        Some(records) => records,
        None => {
            tracing::debug!("No Enclosure LIST in controller response");
            return Vec::new();
        }
    };

    records
        .iter()
        .filter_map(|record| {
            Some(Enclosure {
                id: field(record, "EID")?,
                num_slots: field(record, "Slots").unwrap_or_default(),
                state: field(record, "State").unwrap_or_default(),
            })
        })
        .collect()
}

/// Map controller reports to metric samples.
pub fn controller_samples(controllers: &[ControllerInfo]) -> Vec<MetricSample> {
    let mut samples = vec![
        MetricSample::gauge("megaraid_controllers", controllers.len() as f64, []),
        MetricSample::gauge("storcli_command_success", 1.0, []),
    ];

    for controller in controllers {
        let ctrl = Label::new("controller_id", controller.id.clone());

        let ready = controller
            .virtual_drives
            .iter()
            .filter(|vd| vd.state == READY_VD_STATE)
            .count();
        let total = controller.virtual_drives.len();
        samples.push(MetricSample::gauge(
            "megaraid_virtual_drives",
            total as f64,
            [ctrl.clone()],
        ));
        samples.push(MetricSample::gauge(
            "megaraid_ready_virtual_drives",
            ready as f64,
            [ctrl.clone()],
        ));
        samples.push(MetricSample::gauge(
            "megaraid_unready_virtual_drives",
            (total - ready) as f64,
            [ctrl.clone()],
        ));
        for vd in &controller.virtual_drives {
            samples.push(MetricSample::info(
                "megaraid_virtual_drive_info",
                [
                    ctrl.clone(),
                    Label::new("drive_group", vd.drive_group.clone()),
                    Label::new("virtual_drive_group", vd.virtual_drive_group.clone()),
                    Label::new("state", vd.state.clone()),
                    Label::new("raid_level", vd.raid_level.clone()),
                    Label::new("name", vd.name.clone()),
                ],
            ));
        }

        samples.push(MetricSample::gauge(
            "megaraid_physical_drives",
            controller.physical_drives.len() as f64,
            [ctrl.clone()],
        ));
        for pd in &controller.physical_drives {
            samples.push(MetricSample::info(
                "megaraid_physical_drive_info",
                [
                    ctrl.clone(),
                    Label::new("enclosure_id", pd.enclosure_id.clone()),
                    Label::new("slot_id", pd.slot_id.clone()),
                    Label::new("state", pd.state.clone()),
                    Label::new("drive_type", pd.drive_type.clone()),
                ],
            ));
        }

        for enclosure in &controller.enclosures {
            samples.push(MetricSample::info(
                "megaraid_enclosure_info",
                [
                    ctrl.clone(),
                    Label::new("enclosure_id", enclosure.id.clone()),
                    Label::new("num_slots", enclosure.num_slots.clone()),
                    Label::new("state", enclosure.state.clone()),
                ],
            ));
        }
    }
    samples
}

/// Collects MegaRAID controller health via Broadcom's `storcli`.
pub struct MegaRaidCollector {
    timeout: Duration,
    tool_path: Option<String>,
    missing_logged: AtomicBool,
}

impl MegaRaidCollector {
    pub fn new(config: &MegaRaidConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            tool_path: config.tool_path.clone(),
            missing_logged: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Collector for MegaRaidCollector {
    fn name(&self) -> &'static str {
        ID
    }

    fn specifications(&self) -> Vec<MetricSpec> {
        vec![
            MetricSpec::gauge("megaraid_controllers", "Number of MegaRAID controllers"),
            MetricSpec::gauge("megaraid_virtual_drives", "Number of virtual drives"),
            MetricSpec::gauge(
                "megaraid_ready_virtual_drives",
                "Number of ready virtual drives",
            ),
            MetricSpec::gauge(
                "megaraid_unready_virtual_drives",
                "Number of unready virtual drives",
            ),
            MetricSpec::gauge(
                "megaraid_virtual_drive_info",
                "Shows the information about the virtual drive",
            ),
            MetricSpec::gauge("megaraid_physical_drives", "Number of physical drives"),
            MetricSpec::gauge(
                "megaraid_physical_drive_info",
                "Shows the information about the physical drive",
            ),
            MetricSpec::gauge(
                "megaraid_enclosure_info",
                "Show the information about the enclosure",
            ),
            MetricSpec::gauge(
                "storcli_command_success",
                "Indicates if the command is successful or not",
            ),
        ]
    }

    async fn perform(&self) -> CollectionResult {
        let path = match runner::resolve_tool(TOOL, self.tool_path.as_deref()) {
            Some(path) => path,
            None => {
                if !self.missing_logged.swap(true, Ordering::Relaxed) {
                    tracing::warn!(tool = TOOL, "Tool not installed, collector is inactive");
                }
                return CollectionResult::unavailable(ID, format!("{TOOL} not installed"));
            }
        };

        let output = match runner::run(&path, &["/cALL", "show", "all", "J"], self.timeout).await {
            Ok(output) => output,
            Err(err) => {
                return CollectionResult::degraded(
                    ID,
                    vec![MetricSample::gauge("storcli_command_success", 0.0, [])],
                    err.into(),
                );
            }
        };

        // storcli exits non-zero on benign partial conditions while still
        // printing a full report; parse first, judge the exit code after.
        let controllers = match parse_controllers(&output.stdout) {
            Ok(controllers) => controllers,
            Err(err) => {
                return CollectionResult::degraded(
                    ID,
                    vec![MetricSample::gauge("storcli_command_success", 0.0, [])],
                    CollectionError::from(err),
                );
            }
        };

        let samples = controller_samples(&controllers);
        if !output.success() {
            let err = ExecutionError::Failed {
                tool: TOOL.into(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            };
            return CollectionResult::degraded(ID, samples, err.into());
        }
        CollectionResult::success(ID, samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STORCLI_SAMPLE_OUTPUT: &str = r#"{
  "Controllers": [
    {
      "Command Status": { "Controller": 0, "Status": "Success" },
      "Response Data": {
        "Basics": { "Controller": 0, "Model": "PERC H740P Mini" },
        "VD LIST": [
          { "DG/VD": "0/239", "TYPE": "RAID1", "State": "Optl", "Cache": "RWBD", "Name": "os" },
          { "DG/VD": "1/240", "TYPE": "RAID5", "State": "Dgrd", "Cache": "RWBD", "Name": "data" }
        ],
        "PD LIST": [
          { "EID:Slt": "64:0", "State": "Onln", "DG": 0, "Size": "446.625 GB", "Med": "SSD" },
          { "EID:Slt": "64:1", "State": "UGood", "DG": 0, "Size": "446.625 GB", "Med": "HDD" }
        ],
        "Enclosure LIST": [
          { "EID": 64, "State": "OK", "Slots": 8, "PD": 2 }
        ]
      }
    }
  ]
}"#;

    #[test]
    fn parses_controllers() {
        let controllers = parse_controllers(STORCLI_SAMPLE_OUTPUT).unwrap();
        assert_eq!(controllers.len(), 1);
        let ctrl = &controllers[0];
        assert_eq!(ctrl.id, "0");
        assert_eq!(ctrl.virtual_drives.len(), 2);
        assert_eq!(ctrl.virtual_drives[0].drive_group, "0");
        assert_eq!(ctrl.virtual_drives[0].virtual_drive_group, "239");
        assert_eq!(ctrl.physical_drives[1].slot_id, "1");
        assert_eq!(ctrl.enclosures[0].id, "64");
        assert_eq!(ctrl.enclosures[0].num_slots, "8");
    }

    #[test]
    fn parsing_is_idempotent() {
        assert_eq!(
            parse_controllers(STORCLI_SAMPLE_OUTPUT).unwrap(),
            parse_controllers(STORCLI_SAMPLE_OUTPUT).unwrap()
        );
    }

    #[test]
    fn invalid_json_is_a_hard_error() {
        assert!(matches!(
            parse_controllers("Controller = 0, Status = Failure"),
            Err(ParseError::Json(_))
        ));
    }

    #[test]
    fn missing_controllers_array_is_a_hard_error() {
        assert!(matches!(
            parse_controllers(r#"{"Version": 7}"#),
            Err(ParseError::MalformedStructure { .. })
        ));
    }

    #[test]
    fn malformed_records_are_skipped_per_record() {
        let raw = r#"{
  "Controllers": [
    {
      "Response Data": {
        "Basics": { "Controller": 0 },
        "VD LIST": [
          { "TYPE": "RAID1", "State": "Optl" },
          { "DG/VD": "0/1", "TYPE": "RAID1", "State": "Optl" }
        ]
      }
    }
  ]
}"#;
        let controllers = parse_controllers(raw).unwrap();
        assert_eq!(controllers[0].virtual_drives.len(), 1);
    }

    #[test]
    fn counts_ready_and_unready_virtual_drives() {
        let controllers = parse_controllers(STORCLI_SAMPLE_OUTPUT).unwrap();
        let samples = controller_samples(&controllers);

        let find = |name: &str| samples.iter().find(|s| s.name == name).unwrap();
        assert_eq!(find("megaraid_controllers").value, 1.0);
        assert_eq!(find("megaraid_virtual_drives").value, 2.0);
        assert_eq!(find("megaraid_ready_virtual_drives").value, 1.0);
        assert_eq!(find("megaraid_unready_virtual_drives").value, 1.0);
        assert_eq!(find("megaraid_physical_drives").value, 2.0);

        let infos: Vec<_> = samples
            .iter()
            .filter(|s| s.name == "megaraid_virtual_drive_info")
            .collect();
        assert_eq!(infos.len(), 2);
        assert!(infos.iter().all(|s| s.value == 1.0));
    }

    #[test]
    fn no_controllers_reports_zero() {
        let samples = controller_samples(&[]);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].name, "megaraid_controllers");
        assert_eq!(samples[0].value, 0.0);
        assert_eq!(samples[1].value, 1.0);
    }

    #[tokio::test]
    async fn nonzero_exit_with_valid_output_is_partial_success() {
        use std::os::unix::fs::PermissionsExt;

        use crate::types::CollectionStatus;

        // Stand-in tool that prints a full report but exits non-zero, as
        // storcli does on benign partial conditions.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("storcli");
        std::fs::write(
            &script,
            format!("#!/bin/sh\ncat <<'EOF'\n{STORCLI_SAMPLE_OUTPUT}\nEOF\nexit 59\n"),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = crate::config::MegaRaidConfig {
            enabled: true,
            timeout_secs: 5,
            tool_path: Some(script.to_str().unwrap().into()),
        };
        let collector = MegaRaidCollector::new(&config);

        let result = collector.collect().await;
        assert_eq!(result.status(), CollectionStatus::PartialFailure);
        assert!(result
            .samples
            .iter()
            .any(|s| s.name == "megaraid_controllers" && s.value == 1.0));
    }
}
