use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;

use crate::config::IpmiDcmiConfig;
use crate::error::{ExecutionError, ParseError};
use crate::runner;
use crate::types::{CollectionResult, Label, MetricSample, MetricSpec};
use super::Collector;

const TOOL: &str = "ipmi-dcmi";
const IPMITOOL: &str = "ipmitool";
const DMIDECODE: &str = "dmidecode";
const ID: &str = "ipmi_dcmi";

fn current_power_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^Current Power\s*:\s*(?P<value>[0-9.]+)\s*Watts").unwrap()
    })
}

fn power_capacity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Max Power Capacity:\s*(\d+)\s*W").unwrap())
}

/// Extract the current power draw in watts from
/// `ipmi-dcmi --get-system-power-statistics` output.
pub fn parse_current_power(raw: &str) -> Result<f64, ParseError> {
    let captures = current_power_regex()
        .captures(raw)
        .ok_or(ParseError::MalformedStructure {
            what: "ipmi-dcmi power statistics",
            detail: "no 'Current Power' line".into(),
        })?;
    captures["value"]
        .parse()
        .map_err(|_| ParseError::UnexpectedRecordShape {
            what: "ipmi-dcmi power statistics",
            detail: format!("unparseable power value: {}", &captures["value"]),
        })
}

/// Extract PSU ratings in watts from `dmidecode -t 39` output.
pub fn parse_power_capacities(raw: &str) -> Vec<f64> {
    power_capacity_regex()
        .captures_iter(raw)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// Determine PSU redundancy from `ipmitool sdr type "Power Supply"` output.
///
/// Returns `None` when no redundancy sensor is present in the listing.
pub fn parse_ps_redundancy(raw: &str) -> Option<bool> {
    let mut saw_redundancy_sensor = false;
    let mut redundant = false;
    for line in raw.lines() {
        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        if fields.len() < 2 || !fields[0].contains("Redundancy") {
            continue;
        }
        saw_redundancy_sensor = true;
        if fields
            .last()
            .is_some_and(|status| status.contains("Fully Redundant"))
        {
            redundant = true;
        }
    }
    saw_redundancy_sensor.then_some(redundant)
}

fn format_capacity(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Collects power consumption via DCMI, combined with PSU redundancy
/// (ipmitool) and PSU capacity (dmidecode) to derive a usage percentage
/// relative to the PSU budget.
pub struct IpmiDcmiCollector {
    timeout: Duration,
    tool_path: Option<String>,
    ipmitool_path: Option<String>,
    dmidecode_path: Option<String>,
    bmc_lock: Arc<Mutex<()>>,
    missing_logged: AtomicBool,
    // PSU ratings won't change over the lifetime of a server
    power_capacities: OnceLock<Vec<f64>>,
}

impl IpmiDcmiCollector {
    pub fn new(config: &IpmiDcmiConfig, bmc_lock: Arc<Mutex<()>>) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            tool_path: config.tool_path.clone(),
            ipmitool_path: config.ipmitool_path.clone(),
            dmidecode_path: config.dmidecode_path.clone(),
            bmc_lock,
            missing_logged: AtomicBool::new(false),
            power_capacities: OnceLock::new(),
        }
    }

    async fn get_ps_redundancy(&self) -> Option<bool> {
        let path = runner::resolve_tool(IPMITOOL, self.ipmitool_path.as_deref())?;
        let output = runner::run(&path, &["sdr", "type", "Power Supply"], self.timeout)
            .await
            .ok()?;
        if !output.success() {
            return None;
        }
        parse_ps_redundancy(&output.stdout)
    }

    async fn get_power_capacities(&self) -> Vec<f64> {
        if let Some(cached) = self.power_capacities.get() {
            return cached.clone();
        }
        let capacities = match runner::resolve_tool(DMIDECODE, self.dmidecode_path.as_deref()) {
            Some(path) => match runner::run(&path, &["-t", "39"], self.timeout).await {
                Ok(output) if output.success() => parse_power_capacities(&output.stdout),
                Ok(output) => {
                    tracing::debug!(code = output.exit_code, "dmidecode failed");
                    Vec::new()
                }
                Err(err) => {
                    tracing::debug!(error = %err, "dmidecode failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        let _ = self.power_capacities.set(capacities.clone());
        capacities
    }
}

#[async_trait]
impl Collector for IpmiDcmiCollector {
    fn name(&self) -> &'static str {
        ID
    }

    fn specifications(&self) -> Vec<MetricSpec> {
        vec![
            MetricSpec::gauge(
                "ipmi_dcmi_power_consumption_watts",
                "Current power consumption in watts",
            ),
            MetricSpec::gauge(
                "ipmi_dcmi_power_consumption_percentage",
                "Current power capacity usage as a percentage of the overall PSU budget",
            ),
            MetricSpec::gauge(
                "ipmi_dcmi_command_success",
                "Indicates if the ipmi dcmi command is successful or not",
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

        let _guard = self.bmc_lock.lock().await;

        let output = match runner::run(&path, &["--get-system-power-statistics"], self.timeout)
            .await
        {
            Ok(output) if output.success() => output,
            Ok(output) => {
                let err = ExecutionError::Failed {
                    tool: TOOL.into(),
                    code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                };
                return CollectionResult::degraded(
                    ID,
                    vec![MetricSample::gauge("ipmi_dcmi_command_success", 0.0, [])],
                    err.into(),
                );
            }
            Err(err) => {
                return CollectionResult::degraded(
                    ID,
                    vec![MetricSample::gauge("ipmi_dcmi_command_success", 0.0, [])],
                    err.into(),
                );
            }
        };

        let current_power = match parse_current_power(&output.stdout) {
            Ok(power) => power,
            Err(err) => {
                return CollectionResult::degraded(
                    ID,
                    vec![MetricSample::gauge("ipmi_dcmi_command_success", 0.0, [])],
                    err.into(),
                );
            }
        };

        // When the redundancy config cannot be read, assume redundancy: that
        // shrinks the denominator, so alerts fire earlier rather than later.
        let redundancy = self.get_ps_redundancy().await;
        let redundancy_known = redundancy.is_some();
        let ps_redundant = redundancy.unwrap_or(true);

        let capacities = self.get_power_capacities().await;
        // With redundant PSUs only one carries the load at a time, so the
        // usable budget is the average rating, not the sum.
        let maximum_power_capacity = if capacities.is_empty() {
            0.0
        } else if ps_redundant {
            capacities.iter().sum::<f64>() / capacities.len() as f64
        } else {
            capacities.iter().sum()
        };
        let percentage = if maximum_power_capacity > 0.0 {
            current_power / maximum_power_capacity
        } else {
            0.0
        };

        let samples = vec![
            MetricSample::gauge("ipmi_dcmi_power_consumption_watts", current_power, []),
            MetricSample::gauge(
                "ipmi_dcmi_power_consumption_percentage",
                percentage,
                [
                    Label::new("ps_redundancy", if ps_redundant { "1" } else { "0" }),
                    Label::new(
                        "get_ps_redundancy_ok",
                        if redundancy_known { "1" } else { "0" },
                    ),
                    Label::new("maximum_power_capacity", format_capacity(maximum_power_capacity)),
                ],
            ),
            MetricSample::gauge("ipmi_dcmi_command_success", 1.0, []),
        ];
        CollectionResult::success(ID, samples)
    }
}
