pub mod hpe_ssa;
pub mod ipmi_dcmi;
pub mod ipmi_sel;
pub mod ipmi_sensor;
pub mod lsi_sas;
pub mod mega_raid;
pub mod poweredge_raid;
pub mod redfish;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::types::{CollectionResult, MetricSpec};

/// Trait for all hardware collectors.
///
/// Each collector owns one hardware family, knows how to detect whether its
/// tool or endpoint is available, and converts raw tool output into metric
/// samples. A collection pass never raises: every failure mode is carried
/// inside the returned `CollectionResult`.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Stable collector id (e.g. "ipmi_sensor"), used as the config section
    /// name, CLI flag suffix and `collector` label value.
    fn name(&self) -> &'static str;

    /// Metrics this collector may emit; feeds the HELP/TYPE preambles.
    fn specifications(&self) -> Vec<MetricSpec>;

    /// One collection pass, without timing. Implementations return their
    /// result with `duration` unset; `collect` fills it in.
    async fn perform(&self) -> CollectionResult;

    /// Run one timed collection pass. Called concurrently by the registry;
    /// passes are independent and hold no cross-scrape state.
    async fn collect(&self) -> CollectionResult {
        let started = Instant::now();
        let mut result = self.perform().await;
        result.duration = started.elapsed();
        result
    }
}

/// Create all enabled collectors based on configuration.
///
/// The IPMI collectors share one lock so that no two of them talk to the BMC
/// at the same time; concurrent in-band IPMI requests are known to confuse
/// some BMC firmwares.
pub fn create_collectors(config: &Config) -> Result<Vec<Arc<dyn Collector>>> {
    let mut collectors: Vec<Arc<dyn Collector>> = Vec::new();
    let bmc_lock = Arc::new(Mutex::new(()));

    let c = &config.collector;
    if c.ipmi_sensor.enabled {
        collectors.push(Arc::new(ipmi_sensor::IpmiSensorCollector::new(
            &c.ipmi_sensor,
            bmc_lock.clone(),
        )));
    }

    if c.ipmi_sel.enabled {
        collectors.push(Arc::new(ipmi_sel::IpmiSelCollector::new(
            &c.ipmi_sel,
            bmc_lock.clone(),
        )));
    }

    if c.ipmi_dcmi.enabled {
        collectors.push(Arc::new(ipmi_dcmi::IpmiDcmiCollector::new(
            &c.ipmi_dcmi,
            bmc_lock.clone(),
        )));
    }

    if c.mega_raid.enabled {
        collectors.push(Arc::new(mega_raid::MegaRaidCollector::new(&c.mega_raid)));
    }

    if c.poweredge_raid.enabled {
        collectors.push(Arc::new(poweredge_raid::PowerEdgeRaidCollector::new(
            &c.poweredge_raid,
        )));
    }

    if c.lsi_sas_2.enabled {
        collectors.push(Arc::new(lsi_sas::LsiSasCollector::new(&c.lsi_sas_2, 2)));
    }

    if c.lsi_sas_3.enabled {
        collectors.push(Arc::new(lsi_sas::LsiSasCollector::new(&c.lsi_sas_3, 3)));
    }

    if c.hpe_ssa.enabled {
        collectors.push(Arc::new(hpe_ssa::HpeSsaCollector::new(&c.hpe_ssa)));
    }

    if c.redfish.enabled {
        collectors.push(Arc::new(redfish::RedfishCollector::new(&c.redfish)?));
    }

    tracing::info!(count = collectors.len(), "Initialized collectors");
    Ok(collectors)
}
