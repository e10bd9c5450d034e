use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::sync::Mutex;

use crate::config::IpmiSelConfig;
use crate::error::{CollectionError, ExecutionError, ParseError};
use crate::runner;
use crate::types::{CollectionResult, Label, MetricSample, MetricSpec};
use super::Collector;

const TOOL: &str = "ipmi-sel";
const ID: &str = "ipmi_sel";

const SEL_ARGS: &[&str] = &[
    "--sdr-cache-recreate",
    "--output-event-state",
    "--interpret-oem-data",
    "--entity-sensor-names",
];

/// One System Event Log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelEntry {
    pub id: String,
    pub date: String,
    pub time: String,
    pub name: String,
    pub entry_type: String,
    pub state: String,
    pub event: String,
}

impl SelEntry {
    /// Event timestamp, when the entry carries one. Entries logged before
    /// BMC time sync report the `PostInit` pseudo-date and have none.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let joined = format!("{} {}", self.date, self.time);
        NaiveDateTime::parse_from_str(&joined, "%b-%d-%Y %H:%M:%S")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

/// Parse the pipe-separated table printed by `ipmi-sel`.
pub fn parse_sel_table(raw: &str) -> Result<Vec<SelEntry>, ParseError> {
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());

    let header = match lines.next() {
        Some(line) => line,
        None => return Ok(Vec::new()),
    };
    if !header.contains('|') {
        return Err(ParseError::MalformedStructure {
            what: "ipmi-sel output",
            detail: format!("expected a column header, got: {}", header.trim()),
        });
    }

    let mut entries = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        if fields.len() < 7 {
            tracing::debug!(line, "Skipping short SEL row");
            continue;
        }
        entries.push(SelEntry {
            id: fields[0].to_string(),
            date: fields[1].to_string(),
            time: fields[2].to_string(),
            name: fields[3].to_string(),
            entry_type: fields[4].to_string(),
            state: fields[5].to_string(),
            event: fields[6].to_string(),
        });
    }
    Ok(entries)
}

fn state_value(state: &str) -> f64 {
    match state.to_uppercase().as_str() {
        "NOMINAL" => 0.0,
        "WARNING" => 1.0,
        "CRITICAL" => 2.0,
        other => {
            tracing::warn!(state = other, "Unknown SEL state, treating as Nominal");
            0.0
        }
    }
}

/// Reduce SEL entries to one sample per (name, type) identity, keeping the
/// most severe state. Entries older than the lookback window are dropped;
/// timestampless entries are kept.
pub fn sel_samples(entries: &[SelEntry], now: DateTime<Utc>, lookback: Duration) -> Vec<MetricSample> {
    let cutoff = now - chrono::Duration::from_std(lookback).unwrap_or(chrono::Duration::zero());

    let mut states: HashMap<(String, String), f64> = HashMap::new();
    let mut order: Vec<(String, String)> = Vec::new();
    for entry in entries {
        if let Some(ts) = entry.timestamp() {
            if ts < cutoff {
                continue;
            }
        }
        let key = (entry.name.clone(), entry.entry_type.clone());
        let value = state_value(&entry.state);
        match states.get_mut(&key) {
            Some(existing) => {
                if *existing < value {
                    *existing = value;
                }
            }
            None => {
                states.insert(key.clone(), value);
                order.push(key);
            }
        }
    }

    order
        .into_iter()
        .map(|key| {
            let value = states[&key];
            MetricSample::gauge(
                "ipmi_sel_state",
                value,
                [Label::new("name", key.0), Label::new("type", key.1)],
            )
        })
        .collect()
}

/// Collects System Event Log state via FreeIPMI's `ipmi-sel`.
pub struct IpmiSelCollector {
    timeout: Duration,
    lookback: Duration,
    tool_path: Option<String>,
    bmc_lock: Arc<Mutex<()>>,
    missing_logged: AtomicBool,
}

impl IpmiSelCollector {
    pub fn new(config: &IpmiSelConfig, bmc_lock: Arc<Mutex<()>>) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            lookback: Duration::from_secs(config.lookback_secs),
            tool_path: config.tool_path.clone(),
            bmc_lock,
            missing_logged: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Collector for IpmiSelCollector {
    fn name(&self) -> &'static str {
        ID
    }

    fn specifications(&self) -> Vec<MetricSpec> {
        vec![
            MetricSpec::gauge("ipmi_sel_state", "Event state from IPMI SEL entry"),
            MetricSpec::gauge(
                "ipmi_sel_command_success",
                "Indicates if the ipmi sel command succeeded or not",
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

        let output = match runner::run(&path, SEL_ARGS, self.timeout).await {
            Ok(output) => output,
            Err(err) => {
                return CollectionResult::degraded(
                    ID,
                    vec![MetricSample::gauge("ipmi_sel_command_success", 0.0, [])],
                    err.into(),
                );
            }
        };

        if !output.success() {
            let err = ExecutionError::Failed {
                tool: TOOL.into(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            };
            return CollectionResult::degraded(
                ID,
                vec![MetricSample::gauge("ipmi_sel_command_success", 0.0, [])],
                err.into(),
            );
        }

        let entries = match parse_sel_table(&output.stdout) {
            Ok(entries) => entries,
            Err(err) => {
                return CollectionResult::degraded(
                    ID,
                    vec![MetricSample::gauge("ipmi_sel_command_success", 0.0, [])],
                    CollectionError::from(err),
                );
            }
        };

        let mut samples = vec![MetricSample::gauge("ipmi_sel_command_success", 1.0, [])];
        samples.extend(sel_samples(&entries, Utc::now(), self.lookback));
        CollectionResult::success(ID, samples)
    }
}
