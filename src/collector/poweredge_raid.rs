use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::PowerEdgeRaidConfig;
use crate::error::{CollectionError, ExecutionError, ParseError};
use crate::runner;
use crate::types::{CollectionResult, Label, MetricSample, MetricSpec};
use super::Collector;

const TOOL: &str = "perccli";
const ID: &str = "poweredge_raid";

/// One controller's report from `perccli /call show j`.
#[derive(Debug, Clone, PartialEq)]
pub struct PercController {
    pub id: String,
    pub command_ok: bool,
    pub virtual_drives: Vec<PercVirtualDrive>,
    pub physical_devices: Vec<PercPhysicalDevice>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PercVirtualDrive {
    pub device_group: String,
    pub virtual_drive: String,
    pub state: String,
    pub cache: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PercPhysicalDevice {
    pub enclosure_id: String,
    pub slot: String,
    pub state: String,
    pub device_group: String,
    pub size: String,
    pub media_type: String,
}

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

/// Detect the "no controller installed" document, which perccli reports as a
/// command failure even though it is a benign condition on RAID-less hosts.
pub fn no_controller_found(document: &Value) -> bool {
    let Some(status) = document
        .get("Controllers")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("Command Status"))
    else {
        return false;
    };
    status.get("Status").and_then(Value::as_str) == Some("Failure")
        && status.get("Description").and_then(Value::as_str) == Some("No Controller found")
}

/// Parse the perccli JSON document into per-controller reports.
pub fn parse_controllers(raw: &str) -> Result<Vec<PercController>, ParseError> {
    let document: Value = serde_json::from_str(raw)?;
    if no_controller_found(&document) {
        return Ok(Vec::new());
    }

    let controllers = document
        .get("Controllers")
        .and_then(Value::as_array)
        .ok_or(ParseError::MalformedStructure {
            what: "perccli output",
            detail: "missing Controllers array".into(),
        })?;

    let mut parsed = Vec::new();
    let null = Value::Null;
    for controller in controllers {
        let status = controller.get("Command Status");
        let id = match status
            .and_then(|s| s.get("Controller"))
            .and_then(scalar)
        {
            Some(id) => id,
            None => {
                tracing::debug!("Controller entry without an id, skipping");
                continue;
            }
        };
        let command_ok = status
            .and_then(|s| s.get("Status"))
            .and_then(Value::as_str)
            == Some("Success");

        let response = controller.get("Response Data").unwrap_or(&null);
        parsed.push(PercController {
            id,
            command_ok,
            virtual_drives: extract_virtual_drives(response),
            physical_devices: extract_physical_devices(response),
        });
    }
    Ok(parsed)
}

fn extract_virtual_drives(response: &Value) -> Vec<PercVirtualDrive> {
    response
        .get("VD LIST")
        .and_then(Value::as_array)
        .map(|records| {
            records
                .iter()
                .filter_map(|record| {
                    let dg_vd = field(record, "DG/VD")?;
                    let (device_group, virtual_drive) = dg_vd.split_once('/')?;
                    Some(PercVirtualDrive {
                        device_group: device_group.to_string(),
                        virtual_drive: virtual_drive.to_string(),
                        state: field(record, "State")?,
                        cache: field(record, "Cache").unwrap_or_default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn extract_physical_devices(response: &Value) -> Vec<PercPhysicalDevice> {
    response
        .get("PD LIST")
        .and_then(Value::as_array)
        .map(|records| {
            records
                .iter()
                .filter_map(|record| {
                    let eid_slt = field(record, "EID:Slt")?;
                    let (enclosure_id, slot) = eid_slt.split_once(':')?;
                    Some(PercPhysicalDevice {
                        enclosure_id: enclosure_id.to_string(),
                        slot: slot.to_string(),
                        state: field(record, "State")?,
                        device_group: field(record, "DG").unwrap_or_default(),
                        size: field(record, "Size").unwrap_or_default(),
                        media_type: field(record, "Med").unwrap_or_default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Map controller reports to metric samples.
pub fn controller_samples(controllers: &[PercController]) -> Vec<MetricSample> {
    let mut samples = vec![
        MetricSample::gauge("perccli_command_success", 1.0, []),
        MetricSample::gauge("poweredgeraid_controllers", controllers.len() as f64, []),
    ];

    for controller in controllers {
        let ctrl = Label::new("controller_id", controller.id.clone());
        samples.push(MetricSample::gauge(
            "perccli_command_ctrl_success",
            if controller.command_ok { 1.0 } else { 0.0 },
            [ctrl.clone()],
        ));
        if !controller.command_ok {
            continue;
        }

        samples.push(MetricSample::gauge(
            "poweredgeraid_virtual_drives",
            controller.virtual_drives.len() as f64,
            [ctrl.clone()],
        ));
        for vd in &controller.virtual_drives {
            samples.push(MetricSample::info(
                "poweredgeraid_virtual_drive_info",
                [
                    ctrl.clone(),
                    Label::new("device_group", vd.device_group.clone()),
                    Label::new("virtual_drive_id", vd.virtual_drive.clone()),
                    Label::new("state", vd.state.clone()),
                    Label::new("cache_policy", vd.cache.clone()),
                ],
            ));
        }

        samples.push(MetricSample::gauge(
            "poweredgeraid_physical_devices",
            controller.physical_devices.len() as f64,
            [ctrl.clone()],
        ));
        for pd in &controller.physical_devices {
            samples.push(MetricSample::info(
                "poweredgeraid_physical_device_info",
                [
                    ctrl.clone(),
                    Label::new("enclosure_device_id", pd.enclosure_id.clone()),
                    Label::new("slot", pd.slot.clone()),
                    Label::new("state", pd.state.clone()),
                    Label::new("device_group", pd.device_group.clone()),
                    Label::new("size", pd.size.clone()),
                    Label::new("media_type", pd.media_type.clone()),
                ],
            ));
        }
    }
    samples
}

/// Collects Dell PowerEdge RAID controller health via `perccli`.
pub struct PowerEdgeRaidCollector {
    timeout: Duration,
    tool_path: Option<String>,
    missing_logged: AtomicBool,
}

impl PowerEdgeRaidCollector {
    pub fn new(config: &PowerEdgeRaidConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            tool_path: config.tool_path.clone(),
            missing_logged: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Collector for PowerEdgeRaidCollector {
    fn name(&self) -> &'static str {
        ID
    }

    fn specifications(&self) -> Vec<MetricSpec> {
        vec![
            MetricSpec::gauge(
                "perccli_command_success",
                "Indicates if the command is successful or not",
            ),
            MetricSpec::gauge(
                "perccli_command_ctrl_success",
                "Indicates if the command for each controller is successful or not",
            ),
            MetricSpec::gauge("poweredgeraid_controllers", "Total number of controllers"),
            MetricSpec::gauge("poweredgeraid_virtual_drives", "Number of virtual drives"),
            MetricSpec::gauge(
                "poweredgeraid_virtual_drive_info",
                "Indicates the state of virtual drive",
            ),
            MetricSpec::gauge(
                "poweredgeraid_physical_devices",
                "Number of physical devices",
            ),
            MetricSpec::gauge(
                "poweredgeraid_physical_device_info",
                "Indicates the state of physical devices",
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

        let output = match runner::run(&path, &["/call", "show", "j"], self.timeout).await {
            Ok(output) => output,
            Err(err) => {
                return CollectionResult::degraded(
                    ID,
                    vec![MetricSample::gauge("perccli_command_success", 0.0, [])],
                    err.into(),
                );
            }
        };

        let controllers = match parse_controllers(&output.stdout) {
            Ok(controllers) => controllers,
            Err(err) => {
                return CollectionResult::degraded(
                    ID,
                    vec![MetricSample::gauge("perccli_command_success", 0.0, [])],
                    CollectionError::from(err),
                );
            }
        };

        let samples = controller_samples(&controllers);
        if !output.success() && !controllers.is_empty() {
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
