//! Deterministic software core.
//!
//! [`SimCpu`] implements [`Cpu`](crate::arch::Cpu) and
//! [`PageMapper`](crate::mapper::PageMapper) against a virtual TSC,
//! a small performance-monitoring unit, leaf page tables with an LRU TLB,
//! and an HPET window.  A [`SimProfile`] picks the personality: bare-metal
//! Intel or AMD, or a guest under one of several hypervisors whose
//! emulation gaps are switched on through [`Quirks`].
//!
//! Nothing here is random; the same profile and the same call sequence
//! give the same cycle counts every time.

mod machine;
mod profile;

pub use self::machine::SimCpu;
pub use self::profile::{ClockMsrModel, PmuModel, PtModel, Quirks, SimProfile};
