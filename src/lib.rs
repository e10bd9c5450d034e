pub mod collector;
pub mod config;
pub mod error;
pub mod exposition;
pub mod registry;
pub mod runner;

/// Common types used across modules
pub mod types {
    use std::time::Duration;

    use serde::Serialize;
    use smallvec::SmallVec;

    use crate::error::CollectionError;

    /// Prometheus metric kind
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub enum MetricKind {
        Gauge,
        Counter,
    }

    /// A label key-value pair
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
    pub struct Label {
        pub key: String,
        pub value: String,
    }

    impl Label {
        pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
            Self {
                key: key.into(),
                value: value.into(),
            }
        }
    }

    /// A single metric measurement produced by one collection pass
    #[derive(Debug, Clone, Serialize)]
    pub struct MetricSample {
        pub name: String,
        pub kind: MetricKind,
        pub value: f64,
        pub labels: SmallVec<[Label; 4]>,
    }

    impl MetricSample {
        pub fn gauge(
            name: impl Into<String>,
            value: f64,
            labels: impl IntoIterator<Item = Label>,
        ) -> Self {
            Self {
                name: name.into(),
                kind: MetricKind::Gauge,
                value,
                labels: labels.into_iter().collect(),
            }
        }

        pub fn counter(
            name: impl Into<String>,
            value: f64,
            labels: impl IntoIterator<Item = Label>,
        ) -> Self {
            Self {
                name: name.into(),
                kind: MetricKind::Counter,
                value,
                labels: labels.into_iter().collect(),
            }
        }

        /// Info-style metric: constant 1 carrying identifying labels.
        pub fn info(name: impl Into<String>, labels: impl IntoIterator<Item = Label>) -> Self {
            Self::gauge(name, 1.0, labels)
        }

        /// Timeseries identity: metric name plus the full, sorted label set.
        ///
        /// Two samples with equal identity within one scrape are a collection
        /// bug; the registry keeps the first and drops the rest.
        pub fn identity(&self) -> String {
            let mut labels: Vec<&Label> = self.labels.iter().collect();
            labels.sort();
            let mut id = self.name.clone();
            id.push('{');
            for (i, label) in labels.iter().enumerate() {
                if i > 0 {
                    id.push(',');
                }
                id.push_str(&label.key);
                id.push('=');
                id.push_str(&label.value);
            }
            id.push('}');
            id
        }
    }

    /// Declares one metric a collector may emit; feeds HELP/TYPE exposition.
    #[derive(Debug, Clone)]
    pub struct MetricSpec {
        pub name: String,
        pub help: &'static str,
        pub kind: MetricKind,
    }

    impl MetricSpec {
        pub fn gauge(name: impl Into<String>, help: &'static str) -> Self {
            Self {
                name: name.into(),
                help,
                kind: MetricKind::Gauge,
            }
        }

        pub fn counter(name: impl Into<String>, help: &'static str) -> Self {
            Self {
                name: name.into(),
                help,
                kind: MetricKind::Counter,
            }
        }
    }

    /// Terminal state of one collection pass
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum CollectionStatus {
        Success,
        PartialFailure,
        Unavailable,
        Failed,
    }

    /// Outcome of one collector's collection pass.
    ///
    /// Errors live here as data; they never abort the scrape.
    #[derive(Debug)]
    pub struct CollectionResult {
        pub collector: &'static str,
        pub samples: Vec<MetricSample>,
        pub error: Option<CollectionError>,
        pub duration: Duration,
    }

    impl CollectionResult {
        pub fn success(collector: &'static str, samples: Vec<MetricSample>) -> Self {
            Self {
                collector,
                samples,
                error: None,
                duration: Duration::ZERO,
            }
        }

        /// Failure that still carries whatever samples were produced before
        /// the error. Partial success is preferred over all-or-nothing.
        pub fn degraded(
            collector: &'static str,
            samples: Vec<MetricSample>,
            error: CollectionError,
        ) -> Self {
            Self {
                collector,
                samples,
                error: Some(error),
                duration: Duration::ZERO,
            }
        }

        pub fn unavailable(collector: &'static str, reason: impl Into<String>) -> Self {
            Self {
                collector,
                samples: Vec::new(),
                error: Some(CollectionError::unavailable(reason)),
                duration: Duration::ZERO,
            }
        }

        pub fn status(&self) -> CollectionStatus {
            match &self.error {
                None => CollectionStatus::Success,
                Some(CollectionError::Unavailable { .. }) => CollectionStatus::Unavailable,
                Some(_) if !self.samples.is_empty() => CollectionStatus::PartialFailure,
                Some(_) => CollectionStatus::Failed,
            }
        }

        pub fn is_success(&self) -> bool {
            self.error.is_none()
        }
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::error::CollectionError;
    use super::types::*;

    #[test]
    fn identity_is_label_order_independent() {
        let a = MetricSample {
            name: "ipmi_temperature_celsius".into(),
            kind: MetricKind::Gauge,
            value: 45.0,
            labels: smallvec![Label::new("name", "Temp_CPU0"), Label::new("unit", "C")],
        };
        let b = MetricSample {
            name: "ipmi_temperature_celsius".into(),
            kind: MetricKind::Gauge,
            value: 45.0,
            labels: smallvec![Label::new("unit", "C"), Label::new("name", "Temp_CPU0")],
        };
        assert_eq!(a.identity(), b.identity());
        assert_eq!(
            a.identity(),
            "ipmi_temperature_celsius{name=Temp_CPU0,unit=C}"
        );
    }

    #[test]
    fn status_derivation() {
        let ok = CollectionResult::success("ipmi_sensor", vec![]);
        assert_eq!(ok.status(), CollectionStatus::Success);

        let unavail = CollectionResult::unavailable("ipmi_sensor", "not installed");
        assert_eq!(unavail.status(), CollectionStatus::Unavailable);

        let partial = CollectionResult::degraded(
            "mega_raid",
            vec![MetricSample::gauge("megaraid_controllers", 1.0, [])],
            CollectionError::failed("exit code 59"),
        );
        assert_eq!(partial.status(), CollectionStatus::PartialFailure);

        let failed =
            CollectionResult::degraded("mega_raid", vec![], CollectionError::failed("boom"));
        assert_eq!(failed.status(), CollectionStatus::Failed);
    }
}
