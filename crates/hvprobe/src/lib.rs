//! Fault-tolerant privileged probing and timing fingerprints for x86 cores.
//!
//! `hvprobe` decides whether the core it runs on is virtualized by
//! exercising privileged instructions and microarchitectural behaviour
//! that commodity hypervisors get subtly wrong.  Many of those
//! instructions fault on some platforms, so everything executes inside a
//! fault sandbox that records the fault instead of letting it escape.
//!
//! # Components
//!
//! ```text
//!  battery ──────────────┐
//!     │                  │
//!     ▼                  ▼
//!  bench ──▶ metric ──▶ sandbox ──▶ arch::Cpu
//!                │                    ▲
//!                └──▶ clock, mapper   │
//!                                 native (ring 0) / sim
//! ```
//!
//! 1. **[`sandbox`]**: scoped private fault-vector table plus a
//!    fixed-capacity [`sandbox::FaultTrace`] of the vectors that fired.
//! 2. **[`metric`]**: interchangeable counter sources sharing one
//!    prepare / sample / release contract.
//! 3. **[`bench`]**: the warm-up / measure / median protocol that turns
//!    noisy counter deltas into one figure per source.
//! 4. **[`battery`]**: the ordered probe list producing
//!    [`record::DetectionRecord`] flags and numeric evidence.
//!
//! Every privileged operation goes through the [`arch::Cpu`] trait.  The
//! `ring0` feature provides the inline-assembly implementation for
//! x86_64 kernel mode; [`sim`] provides a deterministic software machine
//! (bare metal or one of several hypervisor personalities) used by the
//! test suite and the CLI.
//!
//! # `no_std` support
//!
//! The library is `no_std` + `alloc` without the default `std` feature.
//! `std` adds the thread-backed timekeeper helper, affinity pinning and
//! JSON config loading from disk.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod arch;
pub mod battery;
pub mod bench;
pub mod caps;
pub mod clock;
pub mod config;
pub mod error;
pub mod mapper;
pub mod metric;
pub mod record;
pub mod sandbox;
pub mod sim;

pub use battery::{measure_operation, run_battery, BatteryScope, Platform};
pub use bench::CanonicalOp;
pub use config::ProbeConfig;
pub use error::ProbeError;
pub use record::{BatteryReport, DetectionRecord, EvidenceRecord};
