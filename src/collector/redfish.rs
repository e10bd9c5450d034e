use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::config::RedfishConfig;
use crate::error::CollectionError;
use crate::types::{CollectionResult, Label, MetricSample, MetricSpec};
use super::Collector;

const ID: &str = "redfish";
const SERVICE_ROOT: &str = "/redfish/v1/";

/// Resource paths of a collection's members.
pub fn member_paths(collection: &Value) -> Vec<String> {
    collection
        .get("Members")
        .and_then(Value::as_array)
        .map(|members| {
            members
                .iter()
                .filter_map(|m| m.get("@odata.id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Last path segment, the conventional resource id.
pub fn tail_id(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

fn text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "NA".to_string(),
    }
}

fn status_health(doc: &Value) -> String {
    text(doc.get("Status").and_then(|s| s.get("Health")))
}

fn status_state(doc: &Value) -> String {
    text(doc.get("Status").and_then(|s| s.get("State")))
}

/// Chassis description as an info sample.
pub fn chassis_info_sample(chassis_id: &str, doc: &Value) -> MetricSample {
    MetricSample::info(
        "redfish_chassis_info",
        [
            Label::new("chassis_id", chassis_id),
            Label::new("chassis_type", text(doc.get("ChassisType"))),
            Label::new("manufacturer", text(doc.get("Manufacturer"))),
            Label::new("model", text(doc.get("Model"))),
            Label::new("state", status_state(doc)),
            Label::new("health", status_health(doc)),
        ],
    )
}

/// Temperature and fan readings from a chassis Thermal resource.
pub fn sensor_samples(chassis_id: &str, thermal: &Value) -> Vec<MetricSample> {
    let mut samples = Vec::new();

    for temp in thermal
        .get("Temperatures")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let reading = format!("{}C", text(temp.get("ReadingCelsius")));
        samples.push(MetricSample::info(
            "redfish_sensor_info",
            [
                Label::new("chassis", chassis_id),
                Label::new("sensor", text(temp.get("Name"))),
                Label::new("reading", reading),
                Label::new("health", status_health(temp)),
            ],
        ));
    }

    for fan in thermal
        .get("Fans")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let reading = format!(
            "{}{}",
            text(fan.get("Reading")),
            fan.get("ReadingUnits").and_then(Value::as_str).unwrap_or("")
        );
        samples.push(MetricSample::info(
            "redfish_sensor_info",
            [
                Label::new("chassis", chassis_id),
                Label::new("sensor", text(fan.get("Name"))),
                Label::new("reading", reading),
                Label::new("health", status_health(fan)),
            ],
        ));
    }
    samples
}

pub fn processor_info_sample(system_id: &str, doc: &Value) -> MetricSample {
    MetricSample::info(
        "redfish_processor_info",
        [
            Label::new("system_id", system_id),
            Label::new("processor_id", text(doc.get("Id"))),
            Label::new("model", text(doc.get("Model"))),
            Label::new("health", status_health(doc)),
            Label::new("state", status_state(doc)),
        ],
    )
}

pub fn memory_dimm_info_sample(system_id: &str, doc: &Value) -> MetricSample {
    MetricSample::info(
        "redfish_memory_dimm_info",
        [
            Label::new("system_id", system_id),
            Label::new("memory_id", text(doc.get("Id"))),
            Label::new("health", status_health(doc)),
            Label::new("state", status_state(doc)),
        ],
    )
}

pub fn storage_drive_info_sample(system_id: &str, storage_id: &str, doc: &Value) -> MetricSample {
    MetricSample::info(
        "redfish_storage_drive_info",
        [
            Label::new("system_id", system_id),
            Label::new("storage_id", storage_id),
            Label::new("drive_id", text(doc.get("Id"))),
            Label::new("health", status_health(doc)),
            Label::new("state", status_state(doc)),
        ],
    )
}

/// Collects BMC state over the Redfish HTTP API.
pub struct RedfishCollector {
    host: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

impl RedfishCollector {
    pub fn new(config: &RedfishConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;
        Ok(Self {
            host: config.host.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            client,
        })
    }

    async fn get(&self, path: &str) -> Result<Value, CollectionError> {
        let url = format!("{}{}", self.host, path);
        let mut request = self.client.get(&url);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }
        let response = request.send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    /// Fetch a sub-resource, degrading to `None` with a warning: one missing
    /// endpoint must not discard the rest of the scrape.
    async fn try_get(&self, path: &str) -> Option<Value> {
        match self.get(path).await {
            Ok(doc) => Some(doc),
            Err(err) => {
                tracing::warn!(path, error = %err, "Redfish resource fetch failed");
                None
            }
        }
    }

    async fn gather_chassis(&self, samples: &mut Vec<MetricSample>) -> Result<(), CollectionError> {
        let chassis_collection = self.get("/redfish/v1/Chassis").await?;
        for path in member_paths(&chassis_collection) {
            let chassis_id = tail_id(&path).to_string();
            let Some(doc) = self.try_get(&path).await else {
                continue;
            };
            samples.push(chassis_info_sample(&chassis_id, &doc));

            if let Some(thermal_path) = doc
                .get("Thermal")
                .and_then(|t| t.get("@odata.id"))
                .and_then(Value::as_str)
            {
                if let Some(thermal) = self.try_get(thermal_path).await {
                    samples.extend(sensor_samples(&chassis_id, &thermal));
                }
            }

            if let Some(adapters_path) = doc
                .get("NetworkAdapters")
                .and_then(|n| n.get("@odata.id"))
                .and_then(Value::as_str)
            {
                if let Some(adapters) = self.try_get(adapters_path).await {
                    samples.push(MetricSample::gauge(
                        "redfish_network_adapters",
                        member_paths(&adapters).len() as f64,
                        [Label::new("chassis_id", chassis_id.clone())],
                    ));
                }
            }
        }
        Ok(())
    }

    async fn gather_systems(&self, samples: &mut Vec<MetricSample>) -> Result<(), CollectionError> {
        let systems_collection = self.get("/redfish/v1/Systems").await?;
        for system_path in member_paths(&systems_collection) {
            let system_id = tail_id(&system_path).to_string();
            let sys = Label::new("system_id", system_id.clone());

            if let Some(processors) = self.try_get(&format!("{system_path}/Processors")).await {
                let paths = member_paths(&processors);
                samples.push(MetricSample::gauge(
                    "redfish_processors",
                    paths.len() as f64,
                    [sys.clone()],
                ));
                for path in paths {
                    if let Some(doc) = self.try_get(&path).await {
                        samples.push(processor_info_sample(&system_id, &doc));
                    }
                }
            }

            if let Some(memory) = self.try_get(&format!("{system_path}/Memory")).await {
                let paths = member_paths(&memory);
                samples.push(MetricSample::gauge(
                    "redfish_memory_dimms",
                    paths.len() as f64,
                    [sys.clone()],
                ));
                for path in paths {
                    if let Some(doc) = self.try_get(&path).await {
                        samples.push(memory_dimm_info_sample(&system_id, &doc));
                    }
                }
            }

            if let Some(storage_collection) = self.try_get(&format!("{system_path}/Storage")).await
            {
                let mut drive_count = 0usize;
                for storage_path in member_paths(&storage_collection) {
                    let storage_id = tail_id(&storage_path).to_string();
                    let Some(storage) = self.try_get(&storage_path).await else {
                        continue;
                    };
                    let drives: Vec<String> = storage
                        .get("Drives")
                        .and_then(Value::as_array)
                        .into_iter()
                        .flatten()
                        .filter_map(|d| d.get("@odata.id").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect();
                    drive_count += drives.len();
                    for drive_path in drives {
                        if let Some(doc) = self.try_get(&drive_path).await {
                            samples.push(storage_drive_info_sample(&system_id, &storage_id, &doc));
                        }
                    }
                }
                samples.push(MetricSample::gauge(
                    "redfish_storage_drives",
                    drive_count as f64,
                    [sys.clone()],
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Collector for RedfishCollector {
    fn name(&self) -> &'static str {
        ID
    }

    fn specifications(&self) -> Vec<MetricSpec> {
        vec![
            MetricSpec::gauge(
                "redfish_service_available",
                "Indicates if redfish service is available or not on the system",
            ),
            MetricSpec::gauge(
                "redfish_call_success",
                "Indicates if call to the redfish API succeeded or not",
            ),
            MetricSpec::gauge("redfish_sensor_info", "Sensor information obtained from redfish"),
            MetricSpec::gauge(
                "redfish_processors",
                "Total number of processors obtained from redfish",
            ),
            MetricSpec::gauge(
                "redfish_processor_info",
                "Processor information obtained from redfish",
            ),
            MetricSpec::gauge(
                "redfish_memory_dimms",
                "Total memory DIMMs obtained from redfish",
            ),
            MetricSpec::gauge(
                "redfish_memory_dimm_info",
                "Memory DIMM information obtained from redfish",
            ),
            MetricSpec::gauge(
                "redfish_storage_drives",
                "Total number of storage drives obtained from redfish",
            ),
            MetricSpec::gauge(
                "redfish_storage_drive_info",
                "Storage drive information obtained from redfish",
            ),
            MetricSpec::gauge(
                "redfish_network_adapters",
                "Total number of network adapters obtained from redfish",
            ),
            MetricSpec::gauge("redfish_chassis_info", "Chassis information obtained from redfish"),
        ]
    }

    async fn perform(&self) -> CollectionResult {
        // Service discovery: an unreachable BMC is unavailability, not an
        // error worth waking anyone for.
        if let Err(err) = self.get(SERVICE_ROOT).await {
            tracing::debug!(error = %err, "Redfish service not reachable");
            return CollectionResult::unavailable(ID, format!("redfish service unreachable: {err}"));
        }

        let mut samples = vec![MetricSample::gauge("redfish_service_available", 1.0, [])];

        let chassis = self.gather_chassis(&mut samples).await;
        let systems = self.gather_systems(&mut samples).await;

        match chassis.and(systems) {
            Ok(()) => {
                samples.push(MetricSample::gauge("redfish_call_success", 1.0, []));
                CollectionResult::success(ID, samples)
            }
            Err(err) => {
                samples.push(MetricSample::gauge("redfish_call_success", 0.0, []));
                CollectionResult::degraded(ID, samples, err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn member_paths_from_collection() {
        let collection = json!({
            "Members": [
                { "@odata.id": "/redfish/v1/Systems/1" },
                { "@odata.id": "/redfish/v1/Systems/2" }
            ],
            "Members@odata.count": 2
        });
        assert_eq!(
            member_paths(&collection),
            vec!["/redfish/v1/Systems/1", "/redfish/v1/Systems/2"]
        );
        assert!(member_paths(&json!({})).is_empty());
    }

    #[test]
    fn tail_id_extracts_resource_id() {
        assert_eq!(tail_id("/redfish/v1/Systems/1"), "1");
        assert_eq!(tail_id("/redfish/v1/Chassis/1U/"), "1U");
    }

    #[test]
    fn processor_info_labels() {
        let doc = json!({
            "Id": "CPU1",
            "Model": "AMD EPYC 7763",
            "Status": { "Health": "OK", "State": "Enabled" }
        });
        let sample = processor_info_sample("1", &doc);
        assert_eq!(sample.name, "redfish_processor_info");
        assert_eq!(sample.value, 1.0);
        let get = |key: &str| {
            sample
                .labels
                .iter()
                .find(|l| l.key == key)
                .map(|l| l.value.clone())
                .unwrap()
        };
        assert_eq!(get("processor_id"), "CPU1");
        assert_eq!(get("model"), "AMD EPYC 7763");
        assert_eq!(get("health"), "OK");
        assert_eq!(get("state"), "Enabled");
    }

    #[test]
    fn missing_fields_become_na() {
        let sample = processor_info_sample("1", &json!({ "Id": "CPU2", "Model": null }));
        assert!(sample
            .labels
            .iter()
            .any(|l| l.key == "model" && l.value == "NA"));
        assert!(sample
            .labels
            .iter()
            .any(|l| l.key == "health" && l.value == "NA"));
    }

    #[test]
    fn thermal_sensors_combine_reading_and_units() {
        let thermal = json!({
            "Temperatures": [
                { "Name": "CPU1 Temp", "ReadingCelsius": 45, "Status": { "Health": "OK" } }
            ],
            "Fans": [
                { "Name": "Fan1", "Reading": 4800, "ReadingUnits": "RPM", "Status": { "Health": "OK" } }
            ]
        });
        let samples = sensor_samples("1", &thermal);
        assert_eq!(samples.len(), 2);
        assert!(samples[0]
            .labels
            .iter()
            .any(|l| l.key == "reading" && l.value == "45C"));
        assert!(samples[1]
            .labels
            .iter()
            .any(|l| l.key == "reading" && l.value == "4800RPM"));
    }

    #[test]
    fn chassis_info_labels() {
        let doc = json!({
            "ChassisType": "RackMount",
            "Manufacturer": "Dell Inc.",
            "Model": "PowerEdge R640",
            "Status": { "Health": "OK", "State": "Enabled" }
        });
        let sample = chassis_info_sample("System.Embedded.1", &doc);
        assert!(sample
            .labels
            .iter()
            .any(|l| l.key == "model" && l.value == "PowerEdge R640"));
    }
}
