use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use smallvec::smallvec;
use tokio::sync::Mutex;

use crate::config::IpmiSensorConfig;
use crate::error::{CollectionError, ExecutionError, ParseError};
use crate::runner;
use crate::types::{CollectionResult, Label, MetricSample, MetricSpec};
use super::Collector;

const TOOL: &str = "ipmimonitoring";
const ID: &str = "ipmi_sensor";

/// One row of `ipmimonitoring` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorReading {
    pub id: String,
    pub name: String,
    pub sensor_type: String,
    pub state: String,
    pub reading: String,
    pub units: String,
    pub event: String,
}

/// Parse the pipe-separated sensor table printed by `ipmimonitoring`.
///
/// The first line is the column header. Rows with fewer columns than the
/// header are skipped individually; an output that does not look like a
/// table at all is a hard parse error.
pub fn parse_sensor_table(raw: &str) -> Result<Vec<SensorReading>, ParseError> {
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());

    let header = match lines.next() {
        Some(line) => line,
        None => return Ok(Vec::new()),
    };
    if !header.contains('|') {
        return Err(ParseError::MalformedStructure {
            what: "ipmimonitoring output",
            detail: format!("expected a column header, got: {}", header.trim()),
        });
    }

    let mut readings = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        if fields.len() < 7 {
            tracing::debug!(line, "Skipping short sensor row");
            continue;
        }
        readings.push(SensorReading {
            id: fields[0].to_string(),
            name: fields[1].to_string(),
            sensor_type: fields[2].to_string(),
            state: fields[3].to_string(),
            reading: fields[4].to_string(),
            units: fields[5].to_string(),
            event: fields[6].to_string(),
        });
    }
    Ok(readings)
}

/// Strip unit decorations down to the symbol used as the `unit` label
/// (e.g. "degrees C" becomes "C").
fn normalize_unit(raw: &str) -> &str {
    match raw.trim() {
        "degrees C" | "Celsius" => "C",
        "degrees F" => "F",
        other => other,
    }
}

/// Extract the numeric magnitude of a reading, tolerating trailing units
/// ("45 degrees C"). Unreadable values ("N/A") become 0.0, matching how
/// absent sensors are conventionally scraped.
fn reading_value(reading: &str) -> f64 {
    let numeric: &str = reading
        .trim()
        .split_whitespace()
        .next()
        .unwrap_or_default();
    numeric.parse().unwrap_or_else(|_| {
        tracing::debug!(reading, "Unparseable sensor reading, using 0.0");
        0.0
    })
}

/// Route one sensor reading to its metric family based on its unit.
fn sample_for(reading: &SensorReading) -> MetricSample {
    let unit = normalize_unit(&reading.units);
    let name = match unit {
        "C" => "ipmi_temperature_celsius",
        "RPM" => "ipmi_fan_speed_rpm",
        "A" => "ipmi_current_amperes",
        "V" => "ipmi_voltage_volts",
        "W" => "ipmi_power_watts",
        "%" if reading.sensor_type == "Fan" => "ipmi_fan_speed_ratio",
        _ => "ipmi_generic_sensor_value",
    };

    let mut labels = smallvec![
        Label::new("name", reading.name.clone()),
        Label::new("state", reading.state.clone()),
        Label::new("unit", unit),
    ];
    if name == "ipmi_generic_sensor_value" {
        labels.push(Label::new("type", reading.sensor_type.clone()));
    }

    MetricSample {
        name: name.into(),
        kind: crate::types::MetricKind::Gauge,
        value: reading_value(&reading.reading),
        labels,
    }
}

/// Collects BMC sensor readings via FreeIPMI's `ipmimonitoring`.
pub struct IpmiSensorCollector {
    timeout: Duration,
    tool_path: Option<String>,
    bmc_lock: Arc<Mutex<()>>,
    missing_logged: AtomicBool,
}

impl IpmiSensorCollector {
    pub fn new(config: &IpmiSensorConfig, bmc_lock: Arc<Mutex<()>>) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            tool_path: config.tool_path.clone(),
            bmc_lock,
            missing_logged: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Collector for IpmiSensorCollector {
    fn name(&self) -> &'static str {
        ID
    }

    fn specifications(&self) -> Vec<MetricSpec> {
        vec![
            MetricSpec::gauge(
                "ipmi_temperature_celsius",
                "Temperature measure from temperature sensors",
            ),
            MetricSpec::gauge("ipmi_power_watts", "Power measure from power sensors"),
            MetricSpec::gauge("ipmi_voltage_volts", "Voltage measure from voltage sensors"),
            MetricSpec::gauge("ipmi_current_amperes", "Current measure from current sensors"),
            MetricSpec::gauge("ipmi_fan_speed_rpm", "Fan speed measure, in rpm"),
            MetricSpec::gauge(
                "ipmi_fan_speed_ratio",
                "Fan speed measure, as a percentage of maximum speed",
            ),
            MetricSpec::gauge(
                "ipmi_generic_sensor_value",
                "Generic sensor value from ipmi sensors",
            ),
            MetricSpec::gauge(
                "ipmimonitoring_command_success",
                "Indicates if the ipmimonitoring command succeeded or not",
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

        // Serialize BMC access across the IPMI collectors.
        let _guard = self.bmc_lock.lock().await;

        // --sdr-cache-recreate keeps sensor data flowing when the SDR cache
        // has gone stale or invalid.
        let output = match runner::run(&path, &["--sdr-cache-recreate"], self.timeout).await {
            Ok(output) => output,
            Err(err) => {
                return CollectionResult::degraded(
                    ID,
                    vec![MetricSample::gauge("ipmimonitoring_command_success", 0.0, [])],
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
                vec![MetricSample::gauge("ipmimonitoring_command_success", 0.0, [])],
                err.into(),
            );
        }

        let readings = match parse_sensor_table(&output.stdout) {
            Ok(readings) => readings,
            Err(err) => {
                return CollectionResult::degraded(
                    ID,
                    vec![MetricSample::gauge("ipmimonitoring_command_success", 0.0, [])],
                    CollectionError::from(err),
                );
            }
        };

        let mut samples = vec![MetricSample::gauge("ipmimonitoring_command_success", 1.0, [])];
        samples.extend(readings.iter().map(sample_for));
        CollectionResult::success(ID, samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_OUTPUT: &str = "\
ID  | Name            | Type            | State    | Reading    | Units | Event
0   | UID             | OEM Reserved    | N/A      | N/A        | N/A   | 'OEM Event = 0001h'
1   | SysHealth_Stat  | Chassis         | Nominal  | N/A        | N/A   | 'transition to OK'
2   | 01-Inlet Ambient | Temperature    | Nominal  | 20.00      | C     | 'OK'
5   | Fan 1           | Fan             | Nominal  | 42.16      | %     | 'transition to Running'
9   | PSU 1 Power     | Power Supply    | Nominal  | 105.00     | W     | 'OK'
";

    #[test]
    fn parses_sensor_rows() {
        let readings = parse_sensor_table(SAMPLE_OUTPUT).unwrap();
        assert_eq!(readings.len(), 5);
        assert_eq!(readings[2].name, "01-Inlet Ambient");
        assert_eq!(readings[2].reading, "20.00");
        assert_eq!(readings[2].units, "C");
    }

    #[test]
    fn parsing_is_idempotent() {
        let first = parse_sensor_table(SAMPLE_OUTPUT).unwrap();
        let second = parse_sensor_table(SAMPLE_OUTPUT).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn short_rows_degrade_per_record() {
        let raw = "ID | Name | Type | State | Reading | Units | Event\ngarbage line\n2 | T | Temperature | Nominal | 45.00 | C | 'OK'\n";
        let readings = parse_sensor_table(raw).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].name, "T");
    }

    #[test]
    fn non_tabular_output_is_a_hard_error() {
        let err = parse_sensor_table("ipmimonitoring: /dev/ipmi0 not found").unwrap_err();
        assert!(matches!(err, ParseError::MalformedStructure { .. }));
    }

    #[test]
    fn empty_output_yields_no_records() {
        assert!(parse_sensor_table("").unwrap().is_empty());
    }

    #[test]
    fn temperature_reading_maps_to_celsius_gauge() {
        let reading = SensorReading {
            id: "2".into(),
            name: "Temp_CPU0".into(),
            sensor_type: "Temperature".into(),
            state: "Nominal".into(),
            reading: "45.00".into(),
            units: "degrees C".into(),
            event: "'OK'".into(),
        };
        let sample = sample_for(&reading);
        assert_eq!(sample.name, "ipmi_temperature_celsius");
        assert_eq!(sample.value, 45.0);
        assert!(sample
            .labels
            .iter()
            .any(|l| l.key == "unit" && l.value == "C"));
        assert!(sample
            .labels
            .iter()
            .any(|l| l.key == "name" && l.value == "Temp_CPU0"));
    }

    #[test]
    fn fan_percentage_maps_to_ratio_not_generic() {
        let reading = SensorReading {
            id: "5".into(),
            name: "Fan 1".into(),
            sensor_type: "Fan".into(),
            state: "Nominal".into(),
            reading: "42.16".into(),
            units: "%".into(),
            event: "''".into(),
        };
        assert_eq!(sample_for(&reading).name, "ipmi_fan_speed_ratio");

        let mut other = reading.clone();
        other.sensor_type = "Other Units Based Sensor".into();
        let sample = sample_for(&other);
        assert_eq!(sample.name, "ipmi_generic_sensor_value");
        assert!(sample.labels.iter().any(|l| l.key == "type"));
    }

    #[test]
    fn unreadable_reading_becomes_zero() {
        assert_eq!(reading_value("N/A"), 0.0);
        assert_eq!(reading_value("45 degrees C"), 45.0);
        assert_eq!(reading_value("105.00"), 105.0);
    }

    #[test]
    fn label_derivation_is_deterministic() {
        let readings = parse_sensor_table(SAMPLE_OUTPUT).unwrap();
        let first: Vec<String> = readings.iter().map(|r| sample_for(r).identity()).collect();
        let second: Vec<String> = readings.iter().map(|r| sample_for(r).identity()).collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn absent_tool_is_unavailable_not_an_error() {
        use crate::types::CollectionStatus;

        let config = IpmiSensorConfig {
            enabled: true,
            timeout_secs: 1,
            tool_path: Some("/nonexistent/ipmimonitoring".into()),
        };
        let collector = IpmiSensorCollector::new(&config, Arc::new(Mutex::new(())));

        let result = collector.collect().await;
        assert!(result.samples.is_empty());
        assert_eq!(result.status(), CollectionStatus::Unavailable);
    }
}
