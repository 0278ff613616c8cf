//! The metric store is the unit of publication shared between the sample
//! loop (writer) and the exporter (reader).
//!
//! Each metric is declared up front with a [`MetricDesc`] and is seeded with
//! a single zero-valued entry whose label values are all `"none"`, so the
//! exported schema is stable before the first sample lands.

use parking_lot::RwLock;
use serde::Serialize;

use std::collections::BTreeMap;
use std::sync::Arc;

mod exposition;

/// Label value used for "no attributable job / process / device".
pub const NONE: &str = "none";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

/// Static declaration of a metric family.
#[derive(Debug, PartialEq, Eq)]
pub struct MetricDesc {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: MetricKind,
    pub labels: &'static [&'static str],
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum StoreError {
    #[error("metric `{0}` is not registered")]
    UnknownMetric(String),
    #[error("metric `{metric}` expects {expected} label values, got {got}")]
    LabelMismatch {
        metric: String,
        expected: usize,
        got: usize,
    },
}

struct Family {
    desc: &'static MetricDesc,
    series: RwLock<BTreeMap<Vec<String>, f64>>,
}

/// Concurrency-safe map of (metric name, label values) to the latest value.
///
/// Cloning produces another handle onto the same store.
#[derive(Clone, Default)]
pub struct MetricStore {
    families: Arc<RwLock<BTreeMap<&'static str, Arc<Family>>>>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a metric and seeds it with an all-`"none"` zero entry.
    /// Registering an already known name is a no-op.
    pub fn register(&self, desc: &'static MetricDesc) {
        let mut families = self.families.write();

        if families.contains_key(desc.name) {
            return;
        }

        let seed = vec![NONE.to_string(); desc.labels.len()];
        let mut series = BTreeMap::new();
        series.insert(seed, 0.0);

        families.insert(
            desc.name,
            Arc::new(Family {
                desc,
                series: RwLock::new(series),
            }),
        );
    }

    fn family(&self, name: &str, labels: &[&str]) -> Result<Arc<Family>, StoreError> {
        let family = self
            .families
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownMetric(name.to_string()))?;

        if family.desc.labels.len() != labels.len() {
            return Err(StoreError::LabelMismatch {
                metric: name.to_string(),
                expected: family.desc.labels.len(),
                got: labels.len(),
            });
        }

        Ok(family)
    }

    /// Overwrites the value for the given label values unconditionally.
    pub fn set(&self, name: &str, labels: &[&str], value: f64) -> Result<(), StoreError> {
        let family = self.family(name, labels)?;
        let key = labels.iter().map(|l| l.to_string()).collect();

        family.series.write().insert(key, value);

        Ok(())
    }

    pub fn get(&self, name: &str, labels: &[&str]) -> Option<f64> {
        let family = self.family(name, labels).ok()?;
        let key: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        let value = family.series.read().get(&key).copied();
        value
    }

    /// Returns a copy of every entry. Each family is read under its own lock,
    /// so no entry can mix the label values of one write with the value of
    /// another.
    pub fn snapshot(&self) -> Snapshot {
        let families: Vec<Arc<Family>> = self.families.read().values().cloned().collect();

        let families = families
            .iter()
            .map(|family| {
                let samples = family
                    .series
                    .read()
                    .iter()
                    .map(|(labels, value)| Sample {
                        labels: labels.clone(),
                        value: *value,
                    })
                    .collect();

                FamilySnapshot {
                    name: family.desc.name,
                    description: family.desc.description,
                    kind: family.desc.kind,
                    labels: family.desc.labels,
                    samples,
                }
            })
            .collect();

        Snapshot { families }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub families: Vec<FamilySnapshot>,
}

impl Snapshot {
    pub fn family(&self, name: &str) -> Option<&FamilySnapshot> {
        self.families.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FamilySnapshot {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: MetricKind,
    pub labels: &'static [&'static str],
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    pub labels: Vec<String>,
    pub value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    static PAIR: MetricDesc = MetricDesc {
        name: "test_pair",
        description: "Two labels",
        kind: MetricKind::Gauge,
        labels: &["a", "b"],
    };

    static BARE: MetricDesc = MetricDesc {
        name: "test_bare",
        description: "No labels",
        kind: MetricKind::Counter,
        labels: &[],
    };

    #[test]
    fn register_seeds_none_entry() {
        let store = MetricStore::new();
        store.register(&PAIR);
        store.register(&BARE);

        assert_eq!(store.get("test_pair", &["none", "none"]), Some(0.0));
        assert_eq!(store.get("test_bare", &[]), Some(0.0));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.family("test_pair").unwrap().samples.len(), 1);
    }

    #[test]
    fn register_twice_keeps_values() {
        let store = MetricStore::new();
        store.register(&PAIR);
        store.set("test_pair", &["x", "y"], 3.0).unwrap();
        store.register(&PAIR);

        assert_eq!(store.get("test_pair", &["x", "y"]), Some(3.0));
    }

    #[test]
    fn set_overwrites() {
        let store = MetricStore::new();
        store.register(&PAIR);

        store.set("test_pair", &["x", "y"], 1.0).unwrap();
        store.set("test_pair", &["x", "y"], 2.0).unwrap();

        assert_eq!(store.get("test_pair", &["x", "y"]), Some(2.0));
    }

    #[test]
    fn set_rejects_schema_violations() {
        let store = MetricStore::new();
        store.register(&PAIR);

        assert_eq!(
            store.set("missing", &["x"], 1.0),
            Err(StoreError::UnknownMetric("missing".into()))
        );
        assert_eq!(
            store.set("test_pair", &["x"], 1.0),
            Err(StoreError::LabelMismatch {
                metric: "test_pair".into(),
                expected: 2,
                got: 1,
            })
        );

        let family = store.snapshot();
        let family = family.family("test_pair").unwrap();
        assert!(family.samples.iter().all(|s| s.labels.len() == 2));
    }

    #[test]
    fn snapshot_concurrent_with_writers() {
        let store = MetricStore::new();
        store.register(&PAIR);

        let writers: Vec<_> = (0..8)
            .map(|w| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..1_000u32 {
                        let a = w.to_string();
                        let b = (i % 10).to_string();
                        // the value encodes its own labels so torn entries show up
                        let value = (w * 100 + i % 10) as f64;
                        store.set("test_pair", &[a.as_str(), b.as_str()], value).unwrap();
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            let snapshot = store.snapshot();
            for sample in &snapshot.family("test_pair").unwrap().samples {
                if sample.labels[0] == NONE {
                    assert_eq!(sample.value, 0.0);
                    continue;
                }
                let a: u32 = sample.labels[0].parse().unwrap();
                let b: u32 = sample.labels[1].parse().unwrap();
                assert_eq!(sample.value, (a * 100 + b) as f64);
            }
        }

        for writer in writers {
            writer.join().unwrap();
        }

        let snapshot = store.snapshot();
        // 8 writers x 10 label values, plus the seed
        assert_eq!(snapshot.family("test_pair").unwrap().samples.len(), 81);
    }
}
