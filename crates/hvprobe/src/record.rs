//! What the battery hands back: flags, raw data and timing evidence.
//!
//! All three maps are ordered by key so serialized reports are stable.
//! Absence of a key always means "not measured / not applicable", never
//! false or zero.

use alloc::collections::BTreeMap;
use alloc::string::String;

use serde::Serialize;

/// A scalar attached to a flag or a data key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(u64),
    Text(String),
}

impl Value {
    /// Truthiness as used for detections: `true`, or a nonzero count.
    pub fn is_set(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            Self::Text(s) => !s.is_empty(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Self::Int(v as u64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.into())
    }
}

/// Dotted flag name (`vm.hvFlagSet`) to value.
///
/// Flags are independent; setting a flag twice keeps the last value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DetectionRecord(BTreeMap<String, Value>);

impl DetectionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(&mut self, name: &str, value: bool) {
        self.0.insert(name.into(), Value::Bool(value));
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// The flag exists and is truthy.
    pub fn is_set(&self, name: &str) -> bool {
        self.get(name).is_some_and(Value::is_set)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Names of every truthy flag.
    pub fn raised(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|(_, v)| v.is_set())
            .map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Raw per-group data (`smiExpected`, `brand`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DataRecord(BTreeMap<String, Value>);

impl DataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Metric name to measured median.  Only sources that prepared and
/// sampled without faulting appear.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EvidenceRecord(BTreeMap<String, u32>);

impl EvidenceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, metric: &str, value: u32) {
        self.0.insert(metric.into(), value);
    }

    pub fn get(&self, metric: &str) -> Option<u32> {
        self.0.get(metric).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Grouped raw data of one battery run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportData {
    #[serde(skip_serializing_if = "DataRecord::is_empty")]
    pub northbridge: DataRecord,
    #[serde(skip_serializing_if = "DataRecord::is_empty")]
    pub processor: DataRecord,
    /// Operation name (`nop`, `cpuidLong`, ...) to its timing evidence.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub benchmarks: BTreeMap<String, EvidenceRecord>,
}

/// Everything one battery run produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatteryReport {
    pub detections: DetectionRecord,
    pub data: ReportData,
}

impl BatteryReport {
    pub fn new() -> Self {
        Self::default()
    }
}
