use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub exporter: ExporterConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExporterConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Overall scrape deadline; collectors still running past it are
    /// excluded from that scrape's response.
    #[serde(default = "default_scrape_timeout")]
    pub scrape_timeout_secs: u64,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            log_level: default_log_level(),
            hostname: default_hostname(),
            scrape_timeout_secs: default_scrape_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CollectorConfig {
    #[serde(default)]
    pub ipmi_sensor: IpmiSensorConfig,
    #[serde(default)]
    pub ipmi_sel: IpmiSelConfig,
    #[serde(default)]
    pub ipmi_dcmi: IpmiDcmiConfig,
    #[serde(default)]
    pub mega_raid: MegaRaidConfig,
    #[serde(default)]
    pub poweredge_raid: PowerEdgeRaidConfig,
    #[serde(default)]
    pub lsi_sas_2: LsiSasConfig,
    #[serde(default)]
    pub lsi_sas_3: LsiSasConfig,
    #[serde(default)]
    pub hpe_ssa: HpeSsaConfig,
    #[serde(default)]
    pub redfish: RedfishConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IpmiSensorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    pub tool_path: Option<String>,
}

impl Default for IpmiSensorConfig {
    fn default() -> Self {
        Self { enabled: false, timeout_secs: 10, tool_path: None }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IpmiSelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    pub tool_path: Option<String>,
    /// SEL entries older than this window are dropped from the scrape.
    #[serde(default = "default_sel_lookback")]
    pub lookback_secs: u64,
}

impl Default for IpmiSelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 10,
            tool_path: None,
            lookback_secs: default_sel_lookback(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IpmiDcmiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    pub tool_path: Option<String>,
    pub ipmitool_path: Option<String>,
    pub dmidecode_path: Option<String>,
}

impl Default for IpmiDcmiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 10,
            tool_path: None,
            ipmitool_path: None,
            dmidecode_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MegaRaidConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_raid_timeout")]
    pub timeout_secs: u64,
    pub tool_path: Option<String>,
}

impl Default for MegaRaidConfig {
    fn default() -> Self {
        Self { enabled: false, timeout_secs: 30, tool_path: None }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PowerEdgeRaidConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_raid_timeout")]
    pub timeout_secs: u64,
    pub tool_path: Option<String>,
}

impl Default for PowerEdgeRaidConfig {
    fn default() -> Self {
        Self { enabled: false, timeout_secs: 30, tool_path: None }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LsiSasConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_raid_timeout")]
    pub timeout_secs: u64,
    pub tool_path: Option<String>,
}

impl Default for LsiSasConfig {
    fn default() -> Self {
        Self { enabled: false, timeout_secs: 30, tool_path: None }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HpeSsaConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_raid_timeout")]
    pub timeout_secs: u64,
    pub tool_path: Option<String>,
}

impl Default for HpeSsaConfig {
    fn default() -> Self {
        Self { enabled: false, timeout_secs: 30, tool_path: None }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedfishConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redfish_host")]
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    #[serde(default = "default_redfish_timeout")]
    pub timeout_secs: u64,
}

impl Default for RedfishConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_redfish_host(),
            username: String::new(),
            password: String::new(),
            verify_tls: true,
            timeout_secs: default_redfish_timeout(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        // Expand environment variables
        let expanded = expand_env_vars(&content);

        let config: Config = toml::from_str(&expanded)
            .with_context(|| "Failed to parse configuration")?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.exporter.bind.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("exporter.bind is not a valid socket address: {}", self.exporter.bind);
        }
        if self.exporter.scrape_timeout_secs == 0 {
            anyhow::bail!("exporter.scrape_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    /// Ids of the collectors enabled in this configuration.
    pub fn enabled_collectors(&self) -> Vec<&'static str> {
        let c = &self.collector;
        let mut enabled = Vec::new();
        if c.ipmi_sensor.enabled { enabled.push("ipmi_sensor"); }
        if c.ipmi_sel.enabled { enabled.push("ipmi_sel"); }
        if c.ipmi_dcmi.enabled { enabled.push("ipmi_dcmi"); }
        if c.mega_raid.enabled { enabled.push("mega_raid"); }
        if c.poweredge_raid.enabled { enabled.push("poweredge_raid"); }
        if c.lsi_sas_2.enabled { enabled.push("lsi_sas_2"); }
        if c.lsi_sas_3.enabled { enabled.push("lsi_sas_3"); }
        if c.hpe_ssa.enabled { enabled.push("hpe_ssa"); }
        if c.redfish.enabled { enabled.push("redfish"); }
        enabled
    }
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .to_string()
}

// Default value functions
fn default_bind() -> String { "0.0.0.0:10000".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
fn default_scrape_timeout() -> u64 { 30 }
fn default_tool_timeout() -> u64 { 10 }
fn default_raid_timeout() -> u64 { 30 }
fn default_sel_lookback() -> u64 { 86_400 }
fn default_redfish_host() -> String { "https://127.0.0.1".to_string() }
fn default_redfish_timeout() -> u64 { 15 }
fn default_true() -> bool { true }

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_disable_every_collector() {
        let config = Config::default();
        assert!(config.enabled_collectors().is_empty());
        assert_eq!(config.exporter.bind, "0.0.0.0:10000");
    }

    #[test]
    fn loads_toml_with_env_expansion() {
        std::env::set_var("HWEXP_TEST_PASSWORD", "s3cret");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[exporter]
bind = "127.0.0.1:9101"
scrape_timeout_secs = 5

[collector.ipmi_sensor]
enabled = true
timeout_secs = 3

[collector.redfish]
enabled = true
host = "https://10.0.0.2"
username = "metrics"
password = "${{HWEXP_TEST_PASSWORD}}"
verify_tls = false
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.exporter.bind, "127.0.0.1:9101");
        assert_eq!(config.collector.ipmi_sensor.timeout_secs, 3);
        assert_eq!(config.collector.redfish.password, "s3cret");
        assert!(!config.collector.redfish.verify_tls);
        assert_eq!(
            config.enabled_collectors(),
            vec!["ipmi_sensor", "redfish"]
        );
    }

    #[test]
    fn rejects_invalid_bind_address() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[exporter]\nbind = \"not-an-address\"\n").unwrap();
        assert!(Config::load(file.path().to_str().unwrap()).is_err());
    }
}
