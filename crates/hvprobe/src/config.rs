//! Tunables for the measurement protocol and the probe thresholds.
//!
//! Every field has a default matching the values the probes were
//! calibrated with; a JSON file only needs the fields it changes.
//!
//! ```
//! use hvprobe::ProbeConfig;
//!
//! let config: ProbeConfig = serde_json::from_str(r#"{ "fixed_duration_us": 50 }"#).unwrap();
//! assert_eq!(config.iterations, 48);
//! assert_eq!(config.fixed_duration_us, 50);
//! config.validate().unwrap();
//! ```

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::arch::Vector;
use crate::error::{ProbeError, Result};
use crate::metric::MetricSuite;
use crate::sandbox::FaultFilter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    /// Measured rounds per (operation, metric) pair.
    pub iterations: usize,
    /// Discarded rounds before the measured ones.
    pub warmup: usize,
    /// Passes of the cache/TLB warming loop before each round.
    pub warm_passes: usize,
    /// Percentile of the sorted deltas that is reported (0.0..=1.0).
    pub percentile: f64,
    /// Window of the fixed-duration fingerprint variants.
    pub fixed_duration_us: u64,
    /// SMIs triggered by the SMI delivery probe: uniform in min..=max.
    pub smi_min: u32,
    pub smi_max: u32,
    /// A `RDMSR IA32_TSC` further than this from `RDTSC` counts as emulated.
    pub tsc_msr_threshold_cycles: u64,
    pub tsc_msr_samples: usize,
    /// Allowed drift after an `IA32_TSC_ADJUST` warp is undone.
    pub tsc_adjust_tolerance_cycles: u64,
    /// How long the benchmarks wait for the cross-core clock.
    pub timekeeper_deadline_cycles: u64,
    /// How long the HPET source waits for a tick.
    pub hpet_deadline_cycles: u64,
    /// Probe pages used by the TLB residency source.
    pub tlb_probe_pages: usize,
    /// Vectors counted as faults.
    pub fault_vectors: Vec<u8>,
    /// Metric names excluded from every fingerprint.
    pub disabled_metrics: Vec<String>,
    /// RNG seed for probe operands; drawn from the TSC when absent.
    pub seed: Option<u64>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            iterations: 48,
            warmup: 4,
            warm_passes: 16,
            percentile: 0.5,
            fixed_duration_us: 1_000,
            smi_min: 1,
            smi_max: 8,
            tsc_msr_threshold_cycles: 1_500,
            tsc_msr_samples: 16,
            tsc_adjust_tolerance_cycles: 3_000,
            timekeeper_deadline_cycles: 3_000_000_000,
            hpet_deadline_cycles: 30_000_000,
            tlb_probe_pages: 64,
            fault_vectors: (0..=Vector::LAST_EXCEPTION.0)
                .filter(|&v| v != Vector::NMI.0)
                .collect(),
            disabled_metrics: Vec::new(),
            seed: None,
        }
    }
}

/// Upper bound on TLB probe pages; beyond this no TLB keeps them all.
const MAX_TLB_PROBE_PAGES: usize = 4096;

impl ProbeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(ProbeError::InvalidConfig("iterations must be nonzero".into()));
        }
        if !(0.0..=1.0).contains(&self.percentile) {
            return Err(ProbeError::InvalidConfig(format!(
                "percentile {} outside 0.0..=1.0",
                self.percentile
            )));
        }
        if self.smi_min == 0 || self.smi_min > self.smi_max {
            return Err(ProbeError::InvalidConfig(format!(
                "SMI range {}..={} is empty or starts at zero",
                self.smi_min, self.smi_max
            )));
        }
        if self.tsc_msr_samples == 0 {
            return Err(ProbeError::InvalidConfig("tsc_msr_samples must be nonzero".into()));
        }
        if self.tlb_probe_pages == 0 || self.tlb_probe_pages > MAX_TLB_PROBE_PAGES {
            return Err(ProbeError::InvalidConfig(format!(
                "tlb_probe_pages must be in 1..={MAX_TLB_PROBE_PAGES}"
            )));
        }
        self.fault_filter()?;
        if let Some(name) = self
            .disabled_metrics
            .iter()
            .find(|name| !MetricSuite::NAMES.contains(&name.as_str()))
        {
            return Err(ProbeError::UnknownMetric(name.clone()));
        }
        Ok(())
    }

    pub fn fault_filter(&self) -> Result<FaultFilter> {
        FaultFilter::from_vectors(&self.fault_vectors).map_err(ProbeError::VectorOutOfRange)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    #[cfg(feature = "std")]
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ProbeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ProbeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.fault_filter().unwrap(), FaultFilter::DEFAULT);
        assert_eq!(config.fault_vectors.len(), 30);
    }

    #[test]
    fn rejects_bad_values() {
        let bad = [
            ProbeConfig {
                iterations: 0,
                ..Default::default()
            },
            ProbeConfig {
                percentile: 1.5,
                ..Default::default()
            },
            ProbeConfig {
                percentile: f64::NAN,
                ..Default::default()
            },
            ProbeConfig {
                smi_min: 9,
                ..Default::default()
            },
            ProbeConfig {
                tlb_probe_pages: 0,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(ProbeError::InvalidConfig(_))),
                "{config:?}"
            );
        }
    }

    #[test]
    fn rejects_non_exception_vectors() {
        let config = ProbeConfig {
            fault_vectors: alloc::vec![13, 0x20],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ProbeError::VectorOutOfRange(0x20))));
    }

    #[test]
    fn rejects_unknown_metric_names() {
        let config = ProbeConfig {
            disabled_metrics: alloc::vec!["hpet".into(), "sundial".into()],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ProbeError::UnknownMetric(m)) if m == "sundial"));
    }

    #[test]
    fn json_overrides_only_given_fields() {
        let config = ProbeConfig::from_json(r#"{ "iterations": 12, "seed": 7 }"#).unwrap();
        assert_eq!(config.iterations, 12);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.warmup, 4);
    }

    #[test]
    fn json_rejects_unknown_fields() {
        assert!(matches!(
            ProbeConfig::from_json(r#"{ "iteratoins": 12 }"#),
            Err(ProbeError::Json(_))
        ));
    }

    #[cfg(feature = "std")]
    #[test]
    fn load_reports_missing_file() {
        let err = ProbeConfig::load(std::path::Path::new("/nonexistent/hvprobe.json")).unwrap_err();
        assert!(matches!(err, ProbeError::Io { .. }));
    }
}
