use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::LsiSasConfig;
use crate::error::{CollectionError, ParseError};
use crate::runner;
use crate::types::{CollectionResult, Label, MetricSample, MetricSpec};
use super::Collector;

const ID_SAS2: &str = "lsi_sas_2";
const ID_SAS3: &str = "lsi_sas_3";

/// IR volumes in this state count as ready.
const READY_VOLUME_STATE: &str = "Okay (OKY)";
/// Physical devices in these states count as ready.
const READY_DISK_STATES: [&str; 2] = ["Ready (RDY)", "Optimal (OPT)"];

/// One adapter row from `sasNircu list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adapter {
    pub index: String,
    pub adapter_type: String,
    pub pci_address: String,
}

/// Parsed `sasNircu <n> DISPLAY` report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControllerDisplay {
    pub ir_volumes: Vec<IrVolume>,
    pub physical_disks: Vec<PhysicalDisk>,
    pub enclosures: Vec<EnclosureInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrVolume {
    pub volume_id: String,
    pub status: String,
    pub raid_level: String,
    pub size_mb: String,
    pub boot: String,
    /// Member disks as "enclosure:slot" pairs, in PHY order.
    pub disks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDisk {
    pub enclosure_id: String,
    pub slot_id: String,
    pub state: String,
    pub size: String,
    pub drive_type: String,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclosureInfo {
    pub id: String,
    pub num_slots: String,
    pub start_slot: String,
}

/// Keys never contain a colon, so the first one separates key from value.
fn split_kv(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}

/// Parse the adapter table printed by `sasNircu list`.
pub fn parse_adapters(raw: &str) -> Result<Vec<Adapter>, ParseError> {
    if !raw.contains("Utility Completed Successfully") {
        return Err(ParseError::MalformedStructure {
            what: "sasircu list output",
            detail: "utility did not complete".into(),
        });
    }

    let mut adapters = Vec::new();
    let mut in_table = false;
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("-----") {
            in_table = true;
            continue;
        }
        if !in_table || trimmed.is_empty() {
            continue;
        }
        if trimmed.contains("Utility Completed") {
            break;
        }
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() < 7 || fields[0].parse::<u32>().is_err() {
            tracing::debug!(line, "Skipping unrecognized adapter row");
            continue;
        }
        adapters.push(Adapter {
            index: fields[0].to_string(),
            adapter_type: fields[1].to_string(),
            pci_address: fields[4].to_string(),
        });
    }
    Ok(adapters)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Controller,
    IrVolumes,
    PhysicalDevices,
    Enclosures,
}

/// Parse the four-section `DISPLAY` report.
///
/// Section bodies are free-form enough that each record is extracted
/// defensively: an unrecognized block is skipped, only the complete absence
/// of the section headers is a hard error.
pub fn parse_display(raw: &str) -> Result<ControllerDisplay, ParseError> {
    if !raw.contains("Controller information") {
        return Err(ParseError::MalformedStructure {
            what: "sasircu display output",
            detail: "missing Controller information section".into(),
        });
    }

    let mut section = Section::None;
    let mut display = ControllerDisplay::default();

    // IR volume under construction: kv pairs plus member topology
    let mut volume: Option<(HashMap<String, String>, Vec<String>)> = None;
    // physical disk block under construction
    let mut disk: Option<HashMap<String, String>> = None;
    // accumulated enclosure kv pairs, one map per enclosure
    let mut enclosure: Option<HashMap<String, String>> = None;

    for line in raw.lines() {
        let trimmed = line.trim();
        let new_section = match trimmed {
            "Controller information" => Some(Section::Controller),
            "IR Volume information" => Some(Section::IrVolumes),
            "Physical device information" => Some(Section::PhysicalDevices),
            "Enclosure information" => Some(Section::Enclosures),
            _ => None,
        };
        if let Some(new_section) = new_section {
            flush_volume(&mut volume, &mut display.ir_volumes);
            flush_disk(&mut disk, &mut display.physical_disks);
            flush_enclosure(&mut enclosure, &mut display.enclosures);
            section = new_section;
            continue;
        }
        if trimmed.is_empty() || trimmed.chars().all(|c| c == '-') {
            if section == Section::PhysicalDevices {
                flush_disk(&mut disk, &mut display.physical_disks);
            }
            continue;
        }

        match section {
            Section::IrVolumes => {
                if trimmed.starts_with("IR volume") {
                    flush_volume(&mut volume, &mut display.ir_volumes);
                    volume = Some((HashMap::new(), Vec::new()));
                } else if let Some((kv, topology)) = volume.as_mut() {
                    if let Some((key, value)) = split_kv(trimmed) {
                        if key.starts_with("PHY[") {
                            topology.push(value.to_string());
                        } else if !value.is_empty() {
                            kv.insert(key.to_string(), value.to_string());
                        }
                    }
                }
            }
            Section::PhysicalDevices => {
                if trimmed.starts_with("Device is a") {
                    flush_disk(&mut disk, &mut display.physical_disks);
                    if trimmed == "Device is a Hard disk" {
                        disk = Some(HashMap::new());
                    }
                } else if let Some(kv) = disk.as_mut() {
                    if let Some((key, value)) = split_kv(trimmed) {
                        kv.insert(key.to_string(), value.to_string());
                    }
                }
            }
            Section::Enclosures => {
                if let Some((key, value)) = split_kv(trimmed) {
                    if key == "Enclosure#" {
                        flush_enclosure(&mut enclosure, &mut display.enclosures);
                        enclosure = Some(HashMap::new());
                    }
                    if let Some(kv) = enclosure.as_mut() {
                        kv.insert(key.to_string(), value.to_string());
                    }
                }
            }
            Section::Controller | Section::None => {}
        }
    }
    flush_volume(&mut volume, &mut display.ir_volumes);
    flush_disk(&mut disk, &mut display.physical_disks);
    flush_enclosure(&mut enclosure, &mut display.enclosures);

    Ok(display)
}

fn flush_volume(
    volume: &mut Option<(HashMap<String, String>, Vec<String>)>,
    volumes: &mut Vec<IrVolume>,
) {
    let Some((kv, topology)) = volume.take() else {
        return;
    };
    let Some(volume_id) = kv.get("Volume ID") else {
        tracing::debug!("IR volume block without a Volume ID, skipping");
        return;
    };
    volumes.push(IrVolume {
        volume_id: volume_id.clone(),
        status: kv.get("Status of volume").cloned().unwrap_or_default(),
        raid_level: kv.get("RAID level").cloned().unwrap_or_default(),
        size_mb: kv.get("Size (in MB)").cloned().unwrap_or_default(),
        boot: kv.get("Boot").cloned().unwrap_or_default(),
        disks: topology,
    });
}

fn flush_disk(disk: &mut Option<HashMap<String, String>>, disks: &mut Vec<PhysicalDisk>) {
    let Some(kv) = disk.take() else {
        return;
    };
    let (Some(enclosure_id), Some(slot_id)) = (kv.get("Enclosure #"), kv.get("Slot #")) else {
        tracing::debug!("Disk block without enclosure/slot, skipping");
        return;
    };
    disks.push(PhysicalDisk {
        enclosure_id: enclosure_id.clone(),
        slot_id: slot_id.clone(),
        state: kv.get("State").cloned().unwrap_or_default(),
        size: kv
            .get("Size (in MB)/(in sectors)")
            .cloned()
            .unwrap_or_default(),
        drive_type: kv.get("Drive Type").cloned().unwrap_or_default(),
        protocol: kv.get("Protocol").cloned().unwrap_or_default(),
    });
}

fn flush_enclosure(
    enclosure: &mut Option<HashMap<String, String>>,
    enclosures: &mut Vec<EnclosureInfo>,
) {
    let Some(kv) = enclosure.take() else {
        return;
    };
    let Some(id) = kv.get("Enclosure#") else {
        return;
    };
    enclosures.push(EnclosureInfo {
        id: id.clone(),
        num_slots: kv.get("Numslots").cloned().unwrap_or_default(),
        start_slot: kv.get("StartSlot").cloned().unwrap_or_default(),
    });
}

/// Map adapters and their display reports to metric samples.
pub fn controller_samples(
    version: u8,
    displays: &[(String, ControllerDisplay)],
) -> Vec<MetricSample> {
    let prefix = format!("lsi_sas_{version}");
    let mut samples = vec![
        MetricSample::gauge(format!("{prefix}_controllers"), displays.len() as f64, []),
        MetricSample::gauge(format!("sas{version}ircu_command_success"), 1.0, []),
    ];

    for (index, display) in displays {
        let ctrl = Label::new("controller_id", index.clone());

        let ready = display
            .ir_volumes
            .iter()
            .filter(|v| v.status == READY_VOLUME_STATE)
            .count();
        let total = display.ir_volumes.len();
        samples.push(MetricSample::gauge(
            format!("{prefix}_ir_volumes"),
            total as f64,
            [ctrl.clone()],
        ));
        samples.push(MetricSample::gauge(
            format!("{prefix}_ready_ir_volumes"),
            ready as f64,
            [ctrl.clone()],
        ));
        samples.push(MetricSample::gauge(
            format!("{prefix}_unready_ir_volumes"),
            (total - ready) as f64,
            [ctrl.clone()],
        ));
        for volume in &display.ir_volumes {
            samples.push(MetricSample::info(
                format!("{prefix}_ir_volume_info"),
                [
                    ctrl.clone(),
                    Label::new("volume_id", volume.volume_id.clone()),
                    Label::new("status", volume.status.clone()),
                    Label::new("raid_level", volume.raid_level.clone()),
                    Label::new("size_mb", volume.size_mb.clone()),
                    Label::new("boot", volume.boot.clone()),
                    Label::new("hard_disk", volume.disks.join(",")),
                ],
            ));
        }

        let ready = display
            .physical_disks
            .iter()
            .filter(|d| READY_DISK_STATES.contains(&d.state.as_str()))
            .count();
        let total = display.physical_disks.len();
        samples.push(MetricSample::gauge(
            format!("{prefix}_physical_devices"),
            total as f64,
            [ctrl.clone()],
        ));
        samples.push(MetricSample::gauge(
            format!("{prefix}_ready_physical_devices"),
            ready as f64,
            [ctrl.clone()],
        ));
        samples.push(MetricSample::gauge(
            format!("{prefix}_unready_physical_devices"),
            (total - ready) as f64,
            [ctrl.clone()],
        ));
        for disk in &display.physical_disks {
            samples.push(MetricSample::info(
                format!("{prefix}_physical_device_info"),
                [
                    ctrl.clone(),
                    Label::new("enclosure_id", disk.enclosure_id.clone()),
                    Label::new("slot_id", disk.slot_id.clone()),
                    Label::new("state", disk.state.clone()),
                    Label::new("size_mb_sectors", disk.size.clone()),
                    Label::new("drive_type", disk.drive_type.clone()),
                    Label::new("protocol", disk.protocol.clone()),
                ],
            ));
        }

        for enclosure in &display.enclosures {
            samples.push(MetricSample::info(
                format!("{prefix}_enclosure_info"),
                [
                    ctrl.clone(),
                    Label::new("enclosure_id", enclosure.id.clone()),
                    Label::new("num_slots", enclosure.num_slots.clone()),
                    Label::new("start_slot", enclosure.start_slot.clone()),
                ],
            ));
        }
    }
    samples
}

/// Collects LSI SAS-2/SAS-3 integrated RAID health via `sas2ircu`/`sas3ircu`.
pub struct LsiSasCollector {
    version: u8,
    timeout: Duration,
    tool_path: Option<String>,
    missing_logged: AtomicBool,
}

impl LsiSasCollector {
    pub fn new(config: &LsiSasConfig, version: u8) -> Self {
        Self {
            version,
            timeout: Duration::from_secs(config.timeout_secs),
            tool_path: config.tool_path.clone(),
            missing_logged: AtomicBool::new(false),
        }
    }

    fn tool(&self) -> String {
        format!("sas{}ircu", self.version)
    }
}

#[async_trait]
impl Collector for LsiSasCollector {
    fn name(&self) -> &'static str {
        if self.version == 2 {
            ID_SAS2
        } else {
            ID_SAS3
        }
    }

    fn specifications(&self) -> Vec<MetricSpec> {
        let v = self.version;
        let prefix = format!("lsi_sas_{v}");
        vec![
            MetricSpec::gauge(format!("{prefix}_controllers"), "Number of LSI SAS controllers"),
            MetricSpec::gauge(format!("{prefix}_ir_volumes"), "Number of IR volumes"),
            MetricSpec::gauge(
                format!("{prefix}_ready_ir_volumes"),
                "Number of ready IR volumes",
            ),
            MetricSpec::gauge(
                format!("{prefix}_unready_ir_volumes"),
                "Number of unready IR volumes",
            ),
            MetricSpec::gauge(
                format!("{prefix}_ir_volume_info"),
                "Shows the information about the integrated RAID volume",
            ),
            MetricSpec::gauge(
                format!("{prefix}_physical_devices"),
                "Number of physical devices",
            ),
            MetricSpec::gauge(
                format!("{prefix}_ready_physical_devices"),
                "Number of ready physical devices",
            ),
            MetricSpec::gauge(
                format!("{prefix}_unready_physical_devices"),
                "Number of unready physical devices",
            ),
            MetricSpec::gauge(
                format!("{prefix}_physical_device_info"),
                "Shows the information about the physical device",
            ),
            MetricSpec::gauge(
                format!("{prefix}_enclosure_info"),
                "Show the information about the enclosure",
            ),
            MetricSpec::gauge(
                format!("sas{v}ircu_command_success"),
                "Indicates if the command is successful or not",
            ),
        ]
    }

    async fn perform(&self) -> CollectionResult {
        let id = self.name();
        let tool = self.tool();
        let path = match runner::resolve_tool(&tool, self.tool_path.as_deref()) {
            Some(path) => path,
            None => {
                if !self.missing_logged.swap(true, Ordering::Relaxed) {
                    tracing::warn!(tool = %tool, "Tool not installed, collector is inactive");
                }
                return CollectionResult::unavailable(id, format!("{tool} not installed"));
            }
        };

        let failed = |err: CollectionError| {
            CollectionResult::degraded(
                id,
                vec![MetricSample::gauge(
                    format!("sas{}ircu_command_success", self.version),
                    0.0,
                    [],
                )],
                err,
            )
        };

        let list = match runner::run(&path, &["list"], self.timeout).await {
            Ok(output) => output,
            Err(err) => return failed(err.into()),
        };
        let adapters = match parse_adapters(&list.stdout) {
            Ok(adapters) => adapters,
            Err(err) => return failed(err.into()),
        };

        let mut displays = Vec::new();
        let mut first_error = None;
        for adapter in &adapters {
            let output = match runner::run(&path, &[&adapter.index, "DISPLAY"], self.timeout).await
            {
                Ok(output) => output,
                Err(err) => {
                    tracing::warn!(adapter = %adapter.index, error = %err, "DISPLAY failed");
                    first_error.get_or_insert(CollectionError::from(err));
                    continue;
                }
            };
            match parse_display(&output.stdout) {
                Ok(display) => displays.push((adapter.index.clone(), display)),
                Err(err) => {
                    tracing::warn!(adapter = %adapter.index, error = %err, "DISPLAY unparseable");
                    first_error.get_or_insert(CollectionError::from(err));
                }
            }
        }

        let samples = controller_samples(self.version, &displays);
        match first_error {
            Some(err) => CollectionResult::degraded(id, samples, err),
            None => CollectionResult::success(id, samples),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_SAMPLE_OUTPUT: &str = "\
LSI Corporation SAS2 IR Configuration Utility.
Version 5.00.00.00 (2010.02.09)
Copyright (c) 2009 LSI Corporation. All rights reserved.

         Adapter      Vendor  Device                       SubSys  SubSys
 Index    Type          ID      ID    Pci Address          Ven ID  Dev ID
 -----  ------------  ------  ------  -----------------    ------  ------
   0     SAS2008     1000h    72h   00h:05h:00h:00h      1028h   1f1eh
SAS2IRCU: Utility Completed Successfully.
";

    const DISPLAY_SAMPLE_OUTPUT: &str = "\
LSI Corporation SAS2 IR Configuration Utility.
Version 5.00.00.00 (2010.02.09)

Read configuration has been initiated for controller 0
------------------------------------------------------------------------
Controller information
------------------------------------------------------------------------
  Controller type                         : SAS2008
  BIOS version                            : 7.11.10.00
  Firmware version                        : 7.15.08.00
  Channel description                     : 1 Serial Attached SCSI
------------------------------------------------------------------------
IR Volume information
------------------------------------------------------------------------
IR volume 1
  Volume ID                               : 286
  Status of volume                        : Okay (OKY)
  Volume wwid                             : 0677c0fb06777e7b
  RAID level                              : RAID1
  Size (in MB)                            : 139236
  Boot                                    : Primary
  Physical hard disks                     :
  PHY[0] Enclosure#/Slot#                 : 1:0
  PHY[1] Enclosure#/Slot#                 : 1:1
------------------------------------------------------------------------
Physical device information
------------------------------------------------------------------------
Initiator at ID #0

Device is a Hard disk
  Enclosure #                             : 1
  Slot #                                  : 0
  SAS Address                             : 4433221-1-0300-0000
  State                                   : Optimal (OPT)
  Size (in MB)/(in sectors)               : 140014/286749487
  Manufacturer                            : SEAGATE
  Model Number                            : ST9146803SS
  Firmware Revision                       : B53C
  Serial No                               : 3SD2C2XH
  Protocol                                : SAS
  Drive Type                              : SAS_HDD

Device is a Hard disk
  Enclosure #                             : 1
  Slot #                                  : 1
  SAS Address                             : 4433221-1-0400-0000
  State                                   : Failed (FLD)
  Size (in MB)/(in sectors)               : 140014/286749487
  Manufacturer                            : SEAGATE
  Model Number                            : ST9146803SS
  Firmware Revision                       : B53C
  Serial No                               : 3SD2C2XJ
  Protocol                                : SAS
  Drive Type                              : SAS_HDD
------------------------------------------------------------------------
Enclosure information
------------------------------------------------------------------------
  Enclosure#                              : 1
  Logical ID                              : 5782bcb0:19e35100
  Numslots                                : 8
  StartSlot                               : 0
------------------------------------------------------------------------
SAS2IRCU: Utility Completed Successfully.
";

    #[test]
    fn parses_adapter_list() {
        let adapters = parse_adapters(LIST_SAMPLE_OUTPUT).unwrap();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].index, "0");
        assert_eq!(adapters[0].adapter_type, "SAS2008");
        assert_eq!(adapters[0].pci_address, "00h:05h:00h:00h");
    }

    #[test]
    fn incomplete_list_output_is_a_hard_error() {
        assert!(parse_adapters("SAS2IRCU: MPTLib2 Error 1").is_err());
    }

    #[test]
    fn parses_display_sections() {
        let display = parse_display(DISPLAY_SAMPLE_OUTPUT).unwrap();

        assert_eq!(display.ir_volumes.len(), 1);
        let volume = &display.ir_volumes[0];
        assert_eq!(volume.volume_id, "286");
        assert_eq!(volume.status, "Okay (OKY)");
        assert_eq!(volume.raid_level, "RAID1");
        assert_eq!(volume.disks, vec!["1:0", "1:1"]);

        assert_eq!(display.physical_disks.len(), 2);
        assert_eq!(display.physical_disks[0].slot_id, "0");
        assert_eq!(display.physical_disks[0].state, "Optimal (OPT)");
        assert_eq!(display.physical_disks[1].state, "Failed (FLD)");

        assert_eq!(display.enclosures.len(), 1);
        assert_eq!(display.enclosures[0].num_slots, "8");
    }

    #[test]
    fn parsing_is_idempotent() {
        assert_eq!(
            parse_display(DISPLAY_SAMPLE_OUTPUT).unwrap(),
            parse_display(DISPLAY_SAMPLE_OUTPUT).unwrap()
        );
    }

    #[test]
    fn display_without_sections_is_a_hard_error() {
        assert!(parse_display("SAS2IRCU: MPTLib2 Error 1").is_err());
    }

    #[test]
    fn counts_ready_and_unready_devices() {
        let display = parse_display(DISPLAY_SAMPLE_OUTPUT).unwrap();
        let samples = controller_samples(2, &[("0".into(), display)]);

        let find = |name: &str| samples.iter().find(|s| s.name == name).unwrap();
        assert_eq!(find("lsi_sas_2_controllers").value, 1.0);
        assert_eq!(find("lsi_sas_2_ir_volumes").value, 1.0);
        assert_eq!(find("lsi_sas_2_ready_ir_volumes").value, 1.0);
        assert_eq!(find("lsi_sas_2_physical_devices").value, 2.0);
        assert_eq!(find("lsi_sas_2_ready_physical_devices").value, 1.0);
        assert_eq!(find("lsi_sas_2_unready_physical_devices").value, 1.0);

        let volume_info = find("lsi_sas_2_ir_volume_info");
        assert!(volume_info
            .labels
            .iter()
            .any(|l| l.key == "hard_disk" && l.value == "1:0,1:1"));
    }

    #[test]
    fn version_prefixes_metric_names() {
        let samples = controller_samples(3, &[]);
        assert_eq!(samples[0].name, "lsi_sas_3_controllers");
        assert_eq!(samples[1].name, "sas3ircu_command_success");
    }
}
