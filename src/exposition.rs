use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry as PromRegistry, TextEncoder};

use crate::types::{MetricKind, MetricSample, MetricSpec};

/// Render merged samples in the Prometheus text exposition format.
///
/// Samples are grouped into families by metric name; HELP/TYPE preambles
/// come from the collector-declared specifications, falling back to the
/// metric name and the sample's own kind for undeclared metrics. Samples
/// whose label keys disagree with their family are dropped with a warning
/// rather than failing the scrape.
pub fn render(samples: &[MetricSample], specs: &HashMap<String, MetricSpec>) -> Result<String> {
    let registry = PromRegistry::new();

    let mut families: BTreeMap<&str, Vec<&MetricSample>> = BTreeMap::new();
    for sample in samples {
        families.entry(sample.name.as_str()).or_default().push(sample);
    }

    for (name, group) in families {
        let spec = specs.get(name);
        let kind = spec.map(|s| s.kind).unwrap_or(group[0].kind);
        let help = spec.map(|s| s.help).filter(|h| !h.is_empty()).unwrap_or(name);

        let mut keys: Vec<&str> = group[0].labels.iter().map(|l| l.key.as_str()).collect();
        keys.sort_unstable();

        let opts = Opts::new(name, help);
        match kind {
            MetricKind::Gauge => {
                let family = GaugeVec::new(opts, &keys)
                    .with_context(|| format!("invalid gauge family {name}"))?;
                registry
                    .register(Box::new(family.clone()))
                    .with_context(|| format!("failed to register {name}"))?;
                for sample in group {
                    match label_values(sample, &keys) {
                        Some(values) => {
                            let values: Vec<&str> = values.iter().map(String::as_str).collect();
                            family.with_label_values(&values).set(sample.value);
                        }
                        None => warn_label_mismatch(sample, &keys),
                    }
                }
            }
            MetricKind::Counter => {
                let family = CounterVec::new(opts, &keys)
                    .with_context(|| format!("invalid counter family {name}"))?;
                registry
                    .register(Box::new(family.clone()))
                    .with_context(|| format!("failed to register {name}"))?;
                for sample in group {
                    match label_values(sample, &keys) {
                        Some(values) => {
                            let values: Vec<&str> = values.iter().map(String::as_str).collect();
                            family.with_label_values(&values).inc_by(sample.value);
                        }
                        None => warn_label_mismatch(sample, &keys),
                    }
                }
            }
        }
    }

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("failed to encode metrics")?;
    String::from_utf8(buffer).context("metrics output is not valid UTF-8")
}

/// The sample's label values ordered by the family's sorted key list, or
/// `None` when the sample's key set does not match.
fn label_values(sample: &MetricSample, keys: &[&str]) -> Option<Vec<String>> {
    if sample.labels.len() != keys.len() {
        return None;
    }
    keys.iter()
        .map(|key| {
            sample
                .labels
                .iter()
                .find(|l| l.key == *key)
                .map(|l| l.value.clone())
        })
        .collect()
}

fn warn_label_mismatch(sample: &MetricSample, keys: &[&str]) {
    tracing::warn!(
        metric = %sample.name,
        expected = ?keys,
        "Sample label keys disagree with family, dropping sample"
    );
}
