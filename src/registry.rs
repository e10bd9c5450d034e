use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::collector::Collector;
use crate::error::CollectionError;
use crate::types::{CollectionResult, CollectionStatus, Label, MetricSample, MetricSpec};

/// Holds the enabled collectors and drives one collection pass per scrape.
///
/// Collectors run concurrently, each in its own task; the registry awaits
/// their results up to the overall scrape deadline, merges samples with
/// first-seen-wins identity dedup, and appends per-collector meta-metrics so
/// failures are themselves observable.
pub struct Registry {
    collectors: Vec<Arc<dyn Collector>>,
    scrape_timeout: Duration,
    /// Unix timestamp of each collector's last successful pass. The only
    /// cross-scrape state in the system.
    last_success: RwLock<HashMap<&'static str, f64>>,
}

impl Registry {
    pub fn new(collectors: Vec<Arc<dyn Collector>>, scrape_timeout: Duration) -> Self {
        Self {
            collectors,
            scrape_timeout,
            last_success: RwLock::new(HashMap::new()),
        }
    }

    /// All metric specifications: collector-declared plus registry meta.
    pub fn specifications(&self) -> Vec<MetricSpec> {
        let mut specs = vec![
            MetricSpec::gauge(
                "collector_success",
                "Whether the collector's last pass in this scrape succeeded",
            ),
            MetricSpec::gauge(
                "collector_duration_seconds",
                "Wall-clock duration of the collector's pass",
            ),
            MetricSpec::gauge(
                "collector_last_success_timestamp_seconds",
                "Unix timestamp of the collector's most recent successful pass",
            ),
        ];
        for collector in &self.collectors {
            specs.extend(collector.specifications());
        }
        specs
    }

    /// Run every enabled collector and merge the results.
    ///
    /// Re-entrant: concurrent scrapes run independent passes. A collector
    /// still running at the deadline is excluded from this scrape (its task
    /// keeps running to completion, the result is discarded).
    pub async fn collect_all(&self) -> Vec<MetricSample> {
        let deadline = Instant::now() + self.scrape_timeout;

        let tasks: Vec<_> = self
            .collectors
            .iter()
            .map(|collector| {
                let collector = collector.clone();
                (
                    collector.name(),
                    tokio::spawn(async move { collector.collect().await }),
                )
            })
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        for (name, handle) in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(result)) => results.push(result),
                // A panic inside one collector degrades that collector only.
                Ok(Err(join_error)) => {
                    tracing::error!(collector = name, error = %join_error, "Collector task died");
                    results.push(CollectionResult::degraded(
                        name,
                        Vec::new(),
                        CollectionError::failed(join_error.to_string()),
                    ));
                }
                Err(_) => {
                    tracing::warn!(
                        collector = name,
                        timeout = ?self.scrape_timeout,
                        "Scrape deadline exceeded, excluding collector from this scrape"
                    );
                    results.push(CollectionResult::degraded(
                        name,
                        Vec::new(),
                        CollectionError::DeadlineExceeded,
                    ));
                }
            }
        }

        self.merge(results)
    }

    fn merge(&self, results: Vec<CollectionResult>) -> Vec<MetricSample> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut merged: Vec<MetricSample> = Vec::new();

        for result in &results {
            match result.status() {
                CollectionStatus::Success => {
                    tracing::debug!(
                        collector = result.collector,
                        samples = result.samples.len(),
                        duration = ?result.duration,
                        "Collection pass finished"
                    );
                }
                CollectionStatus::Unavailable => {
                    // Already logged once by the collector at detection time.
                    tracing::debug!(collector = result.collector, "Collector unavailable");
                }
                CollectionStatus::PartialFailure | CollectionStatus::Failed => {
                    if let Some(error) = &result.error {
                        tracing::warn!(
                            collector = result.collector,
                            kind = error.kind(),
                            error = %error,
                            "Collection pass failed"
                        );
                    }
                }
            }

            for sample in &result.samples {
                let identity = sample.identity();
                if seen.insert(identity.clone()) {
                    merged.push(sample.clone());
                } else {
                    tracing::warn!(
                        collector = result.collector,
                        identity = %identity,
                        "Duplicate sample identity, keeping first seen"
                    );
                }
            }
        }

        let now = Utc::now().timestamp() as f64;
        let mut last_success = self
            .last_success
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for result in &results {
            let labels = [Label::new("collector", result.collector)];
            merged.push(MetricSample::gauge(
                "collector_success",
                if result.is_success() { 1.0 } else { 0.0 },
                labels.clone(),
            ));
            merged.push(MetricSample::gauge(
                "collector_duration_seconds",
                result.duration.as_secs_f64(),
                labels.clone(),
            ));
            if result.is_success() {
                last_success.insert(result.collector, now);
            }
            if let Some(timestamp) = last_success.get(result.collector) {
                merged.push(MetricSample::gauge(
                    "collector_last_success_timestamp_seconds",
                    *timestamp,
                    labels,
                ));
            }
        }

        merged
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::types::MetricKind;

    struct StubCollector {
        name: &'static str,
        samples: Vec<MetricSample>,
        error: Option<fn() -> CollectionError>,
        delay: Duration,
        panic: bool,
    }

    impl StubCollector {
        fn new(name: &'static str, samples: Vec<MetricSample>) -> Self {
            Self {
                name,
                samples,
                error: None,
                delay: Duration::ZERO,
                panic: false,
            }
        }
    }

    #[async_trait]
    impl Collector for StubCollector {
        fn name(&self) -> &'static str {
            self.name
        }

        fn specifications(&self) -> Vec<MetricSpec> {
            Vec::new()
        }

        async fn perform(&self) -> CollectionResult {
            if self.panic {
                panic!("stub collector defect");
            }
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            match self.error {
                Some(make_error) => {
                    CollectionResult::degraded(self.name, self.samples.clone(), make_error())
                }
                None => CollectionResult::success(self.name, self.samples.clone()),
            }
        }
    }

    fn sample(name: &str, value: f64) -> MetricSample {
        MetricSample::gauge(name, value, [])
    }

    fn find<'a>(samples: &'a [MetricSample], name: &str, collector: &str) -> &'a MetricSample {
        samples
            .iter()
            .find(|s| {
                s.name == name
                    && s.labels
                        .iter()
                        .any(|l| l.key == "collector" && l.value == collector)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn merges_samples_and_appends_meta_metrics() {
        let registry = Registry::new(
            vec![
                Arc::new(StubCollector::new("a", vec![sample("metric_a", 1.0)])),
                Arc::new(StubCollector::new("b", vec![sample("metric_b", 2.0)])),
            ],
            Duration::from_secs(5),
        );

        let merged = registry.collect_all().await;
        assert!(merged.iter().any(|s| s.name == "metric_a"));
        assert!(merged.iter().any(|s| s.name == "metric_b"));
        assert_eq!(find(&merged, "collector_success", "a").value, 1.0);
        assert_eq!(find(&merged, "collector_success", "b").value, 1.0);
        assert!(merged
            .iter()
            .any(|s| s.name == "collector_last_success_timestamp_seconds"));
    }

    #[tokio::test]
    async fn one_failure_does_not_affect_others() {
        let mut failing = StubCollector::new("bad", Vec::new());
        failing.error = Some(|| CollectionError::failed("tool exploded"));

        let registry = Registry::new(
            vec![
                Arc::new(StubCollector::new("good", vec![sample("metric_good", 1.0)])),
                Arc::new(failing),
            ],
            Duration::from_secs(5),
        );

        let merged = registry.collect_all().await;
        assert!(merged.iter().any(|s| s.name == "metric_good"));
        assert_eq!(find(&merged, "collector_success", "good").value, 1.0);
        assert_eq!(find(&merged, "collector_success", "bad").value, 0.0);
        assert!(!merged
            .iter()
            .any(|s| s.name == "collector_last_success_timestamp_seconds"
                && s.labels.iter().any(|l| l.value == "bad")));
    }

    #[tokio::test]
    async fn duplicate_identity_keeps_first_seen() {
        let registry = Registry::new(
            vec![
                Arc::new(StubCollector::new("first", vec![sample("dup_metric", 1.0)])),
                Arc::new(StubCollector::new("second", vec![sample("dup_metric", 9.0)])),
            ],
            Duration::from_secs(5),
        );

        let merged = registry.collect_all().await;
        let dups: Vec<_> = merged.iter().filter(|s| s.name == "dup_metric").collect();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].value, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_excludes_slow_collectors() {
        let mut slow = StubCollector::new("slow", vec![sample("slow_metric", 1.0)]);
        slow.delay = Duration::from_secs(10);

        let registry = Registry::new(
            vec![
                Arc::new(StubCollector::new("fast", vec![sample("fast_metric", 1.0)])),
                Arc::new(slow),
            ],
            Duration::from_secs(5),
        );

        let merged = registry.collect_all().await;
        assert!(merged.iter().any(|s| s.name == "fast_metric"));
        assert!(!merged.iter().any(|s| s.name == "slow_metric"));
        assert_eq!(find(&merged, "collector_success", "fast").value, 1.0);
        assert_eq!(find(&merged, "collector_success", "slow").value, 0.0);
    }

    #[tokio::test]
    async fn panic_in_one_collector_is_isolated() {
        let mut panicking = StubCollector::new("panics", Vec::new());
        panicking.panic = true;

        let registry = Registry::new(
            vec![
                Arc::new(panicking),
                Arc::new(StubCollector::new("calm", vec![sample("calm_metric", 1.0)])),
            ],
            Duration::from_secs(5),
        );

        let merged = registry.collect_all().await;
        assert!(merged.iter().any(|s| s.name == "calm_metric"));
        assert_eq!(find(&merged, "collector_success", "panics").value, 0.0);
        assert_eq!(find(&merged, "collector_success", "calm").value, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn merge_is_completion_order_independent() {
        // Same collectors, different relative speeds: the merged identity
        // set must not change.
        let identities = |a_delay: u64, b_delay: u64| async move {
            let mut a = StubCollector::new("a", vec![sample("metric_a", 1.0)]);
            let mut b = StubCollector::new("b", vec![sample("metric_b", 2.0)]);
            a.delay = Duration::from_millis(a_delay);
            b.delay = Duration::from_millis(b_delay);
            let registry =
                Registry::new(vec![Arc::new(a), Arc::new(b)], Duration::from_secs(5));
            let mut ids: Vec<String> = registry
                .collect_all()
                .await
                .iter()
                .filter(|s| s.kind == MetricKind::Gauge)
                .map(MetricSample::identity)
                .collect();
            ids.sort();
            ids
        };

        assert_eq!(identities(100, 1).await, identities(1, 100).await);
    }
}
