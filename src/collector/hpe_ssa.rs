use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::config::HpeSsaConfig;
use crate::error::{CollectionError, ExecutionError};
use crate::runner;
use crate::types::{CollectionResult, Label, MetricSample, MetricSpec};
use super::Collector;

const TOOL: &str = "ssacli";
const ID: &str = "hpe_ssa";

fn innocuous_ld_error() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Error: The specified (device|controller) does not have any logical").unwrap()
    })
}

fn innocuous_pd_error() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Error: The specified (device|controller) does not have any physical").unwrap()
    })
}

/// Status report for one controller slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlotStatus {
    /// Part name ("Controller Status", "Cache Status", ...) to status.
    pub controller: Vec<(String, String)>,
    /// Logical drive id to status.
    pub logical_drives: Vec<(String, String)>,
    /// Physical drive id to status.
    pub physical_drives: Vec<(String, String)>,
}

/// Extract controller slot numbers from `ssacli ctrl all show`.
pub fn parse_slots(raw: &str) -> Vec<String> {
    let mut slots = Vec::new();
    for line in raw.lines() {
        if !line.contains("in Slot") {
            continue;
        }
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "Slot" {
                if let Some(slot) = tokens.next() {
                    slots.push(slot.to_string());
                }
                break;
            }
        }
    }
    slots
}

/// Extract per-part status from `ssacli ctrl slot=N show status`.
pub fn parse_controller_status(raw: &str) -> Vec<(String, String)> {
    let mut status = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty()
            || line.starts_with("Smart Array")
            || line.starts_with("Smart HBA")
            || line.starts_with("HPE Smart Array")
        {
            continue;
        }
        let Some((part, state)) = line.split_once(':') else {
            tracing::debug!(line, "Unrecognised controller status line");
            continue;
        };
        status.push((part.trim().to_string(), state.trim().to_uppercase()));
    }
    status
}

/// Extract drive statuses from `ld all show status` / `pd all show status`
/// listings. Lines look like:
/// `logicaldrive 1 (931.48 GB, RAID 1): OK`
/// `physicaldrive 2I:0:1 (port 2I:box 0:bay 1, 1 TB): OK`
fn parse_drive_status(raw: &str, marker: &str, innocuous: &Regex) -> Vec<(String, String)> {
    let mut status = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || innocuous.is_match(line) || !line.starts_with(marker) {
            continue;
        }
        let Some(id) = line.split_whitespace().nth(1) else {
            continue;
        };
        let Some((_, state)) = line.split_once("):") else {
            tracing::debug!(line, "Unrecognised drive status line");
            continue;
        };
        status.push((id.to_string(), state.trim().to_uppercase()));
    }
    status
}

pub fn parse_ld_status(raw: &str) -> Vec<(String, String)> {
    parse_drive_status(raw, "logicaldrive", innocuous_ld_error())
}

pub fn parse_pd_status(raw: &str) -> Vec<(String, String)> {
    parse_drive_status(raw, "physicaldrive", innocuous_pd_error())
}

/// Map per-slot status reports to metric samples.
pub fn slot_samples(slots: &[(String, SlotStatus)]) -> Vec<MetricSample> {
    let mut samples = vec![
        MetricSample::gauge("ssacli_command_success", 1.0, []),
        MetricSample::gauge("ssacli_controllers", slots.len() as f64, []),
    ];

    for (slot, status) in slots {
        let slot_label = Label::new("slot", slot.clone());
        for (part, state) in &status.controller {
            samples.push(MetricSample::info(
                "ssacli_controller_info",
                [
                    slot_label.clone(),
                    Label::new("part", part.clone()),
                    Label::new("status", state.clone()),
                ],
            ));
        }

        samples.push(MetricSample::gauge(
            "ssacli_logical_drives",
            status.logical_drives.len() as f64,
            [slot_label.clone()],
        ));
        for (drive_id, state) in &status.logical_drives {
            samples.push(MetricSample::info(
                "ssacli_logical_drive_info",
                [
                    slot_label.clone(),
                    Label::new("drive_id", drive_id.clone()),
                    Label::new("status", state.clone()),
                ],
            ));
        }

        samples.push(MetricSample::gauge(
            "ssacli_physical_drives",
            status.physical_drives.len() as f64,
            [slot_label.clone()],
        ));
        for (drive_id, state) in &status.physical_drives {
            samples.push(MetricSample::info(
                "ssacli_physical_drive_info",
                [
                    slot_label.clone(),
                    Label::new("drive_id", drive_id.clone()),
                    Label::new("status", state.clone()),
                ],
            ));
        }
    }
    samples
}

/// Collects HPE Smart Array controller health via `ssacli`.
pub struct HpeSsaCollector {
    timeout: Duration,
    tool_path: Option<String>,
    missing_logged: AtomicBool,
}

impl HpeSsaCollector {
    pub fn new(config: &HpeSsaConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            tool_path: config.tool_path.clone(),
            missing_logged: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Collector for HpeSsaCollector {
    fn name(&self) -> &'static str {
        ID
    }

    fn specifications(&self) -> Vec<MetricSpec> {
        vec![
            MetricSpec::gauge(
                "ssacli_command_success",
                "Indicates if the command is successful or not",
            ),
            MetricSpec::gauge("ssacli_controllers", "Total number of controllers"),
            MetricSpec::gauge(
                "ssacli_controller_info",
                "Shows the information about controller part",
            ),
            MetricSpec::gauge(
                "ssacli_logical_drives",
                "The number of logical drives in the slot",
            ),
            MetricSpec::gauge(
                "ssacli_physical_drives",
                "The number of physical drives in the slot",
            ),
            MetricSpec::gauge(
                "ssacli_logical_drive_info",
                "Shows the information about logical drive",
            ),
            MetricSpec::gauge(
                "ssacli_physical_drive_info",
                "Shows the information about physical drive",
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

        let all_show = match runner::run(&path, &["ctrl", "all", "show"], self.timeout).await {
            Ok(output) if output.success() => output,
            Ok(output) => {
                let err = ExecutionError::Failed {
                    tool: TOOL.into(),
                    code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                };
                return CollectionResult::degraded(
                    ID,
                    vec![MetricSample::gauge("ssacli_command_success", 0.0, [])],
                    err.into(),
                );
            }
            Err(err) => {
                return CollectionResult::degraded(
                    ID,
                    vec![MetricSample::gauge("ssacli_command_success", 0.0, [])],
                    err.into(),
                );
            }
        };

        let mut slots = Vec::new();
        let mut first_error: Option<CollectionError> = None;
        for slot in parse_slots(&all_show.stdout) {
            let ctrl_arg = format!("slot={slot}");
            let mut status = SlotStatus::default();

            match runner::run(&path, &["ctrl", &ctrl_arg, "show", "status"], self.timeout).await {
                Ok(output) => status.controller = parse_controller_status(&output.stdout),
                Err(err) => {
                    tracing::warn!(slot = %slot, error = %err, "Controller status failed");
                    first_error.get_or_insert(err.into());
                }
            }
            match runner::run(
                &path,
                &["ctrl", &ctrl_arg, "ld", "all", "show", "status"],
                self.timeout,
            )
            .await
            {
                Ok(output) => status.logical_drives = parse_ld_status(&output.stdout),
                Err(err) => {
                    tracing::warn!(slot = %slot, error = %err, "Logical drive status failed");
                    first_error.get_or_insert(err.into());
                }
            }
            match runner::run(
                &path,
                &["ctrl", &ctrl_arg, "pd", "all", "show", "status"],
                self.timeout,
            )
            .await
            {
                Ok(output) => status.physical_drives = parse_pd_status(&output.stdout),
                Err(err) => {
                    tracing::warn!(slot = %slot, error = %err, "Physical drive status failed");
                    first_error.get_or_insert(err.into());
                }
            }

            slots.push((slot, status));
        }

        let samples = slot_samples(&slots);
        match first_error {
            Some(err) => CollectionResult::degraded(ID, samples, err),
            None => CollectionResult::success(ID, samples),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTRL_ALL_SHOW: &str = "
Smart Array P222 in Slot 2                (sn: PDSXH0BRH6G0QU)
Smart HBA P222 in Slot 3                (sn: PDSXH0BRH6G0QU)
HPE Smart Array E208i-a SR Gen10 in Slot 12  (sn: XXXYYYZZZ)
";

    const CTRL_SHOW_STATUS: &str = "
Smart Array P222 in Slot 2
   Random bad output line
   Controller Status: OK
   Cache Status: OK
   Battery/Capacitor Status: OK
";

    const CTRL_LD_ALL_SHOW_STATUS: &str = "
   logicaldrive 1 (931.48 GB, RAID 1): OK
";

    const CTRL_PD_ALL_SHOW_STATUS: &str = "
   physicaldrive 2I:0:1 (port 2I:box 0:bay 1, 1 TB): OK
   physicaldrive 2I:0:2 (port 2I:box 0:bay 2, 1 TB): OK
";

    const CTRL_LD_ABSENT: &str = "
Error: The specified controller does not have any logical drive.
Arbitrary line
";

    #[test]
    fn parses_slots_including_gen10_naming() {
        assert_eq!(parse_slots(CTRL_ALL_SHOW), vec!["2", "3", "12"]);
        assert!(parse_slots("no controllers detected").is_empty());
    }

    #[test]
    fn parses_controller_status_parts() {
        let status = parse_controller_status(CTRL_SHOW_STATUS);
        assert_eq!(
            status,
            vec![
                ("Controller Status".to_string(), "OK".to_string()),
                ("Cache Status".to_string(), "OK".to_string()),
                ("Battery/Capacitor Status".to_string(), "OK".to_string()),
            ]
        );
    }

    #[test]
    fn parses_drive_statuses() {
        let ld = parse_ld_status(CTRL_LD_ALL_SHOW_STATUS);
        assert_eq!(ld, vec![("1".to_string(), "OK".to_string())]);

        let pd = parse_pd_status(CTRL_PD_ALL_SHOW_STATUS);
        assert_eq!(pd.len(), 2);
        assert_eq!(pd[0].0, "2I:0:1");
        assert_eq!(pd[1].1, "OK");
    }

    #[test]
    fn absent_drives_are_benign() {
        assert!(parse_ld_status(CTRL_LD_ABSENT).is_empty());
    }

    #[test]
    fn slot_samples_counts_and_infos() {
        let status = SlotStatus {
            controller: parse_controller_status(CTRL_SHOW_STATUS),
            logical_drives: parse_ld_status(CTRL_LD_ALL_SHOW_STATUS),
            physical_drives: parse_pd_status(CTRL_PD_ALL_SHOW_STATUS),
        };
        let samples = slot_samples(&[("2".into(), status)]);

        let find = |name: &str| samples.iter().find(|s| s.name == name).unwrap();
        assert_eq!(find("ssacli_controllers").value, 1.0);
        assert_eq!(find("ssacli_logical_drives").value, 1.0);
        assert_eq!(find("ssacli_physical_drives").value, 2.0);
        assert_eq!(
            samples
                .iter()
                .filter(|s| s.name == "ssacli_controller_info")
                .count(),
            3
        );
    }
}
