//! Cross-core software clock.
//!
//! One core spins incrementing a shared counter; any other core can read
//! that counter as a time source that per-core TSC virtualization cannot
//! offset or scale.  The loop stops when the stop flag is raised.
//!
//! Readiness is the only rendezvous: a reader waits, bounded by a cycle
//! deadline, for the loop to publish that it is running.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::arch::Cpu;

/// The shared counter and its two control flags.
#[derive(Debug, Default)]
pub struct Timekeeper {
    ticks: AtomicU64,
    ready: AtomicBool,
    stop: AtomicBool,
}

impl Timekeeper {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        }
    }

    /// Run the counting loop on the calling core until [`stop`](Self::stop).
    ///
    /// A stop raised before the loop started is honoured immediately.
    pub fn run(&self) {
        let mut ticks = self.ticks.load(Ordering::Relaxed);
        self.ready.store(true, Ordering::Release);
        while !self.stop.load(Ordering::Relaxed) {
            ticks = ticks.wrapping_add(1);
            self.ticks.store(ticks, Ordering::Relaxed);
        }
        self.ready.store(false, Ordering::Release);
    }

    #[inline(always)]
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// The loop has started and has ticked at least once.
    pub fn is_running(&self) -> bool {
        self.ready.load(Ordering::Acquire) && self.now() != 0
    }

    /// Spin until the loop runs or `deadline_cycles` TSC cycles pass.
    pub fn wait_ready<C: Cpu + ?Sized>(&self, cpu: &C, deadline_cycles: u64) -> bool {
        let deadline = cpu.rdtsc().saturating_add(deadline_cycles);
        loop {
            if self.is_running() {
                return true;
            }
            if self.stop.load(Ordering::Relaxed) || cpu.rdtsc() > deadline {
                return false;
            }
            cpu.pause();
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Clear the stop flag so the clock can be run again.
    pub fn rearm(&self) {
        self.stop.store(false, Ordering::Release);
    }
}

#[cfg(feature = "std")]
pub use self::thread::{pin_current_thread, TimekeeperThread};

#[cfg(feature = "std")]
mod thread {
    use std::io;
    use std::sync::Arc;
    use std::thread::JoinHandle;

    use log::{debug, warn};

    use super::Timekeeper;
    use crate::error::{ProbeError, Result};

    /// Pin the calling thread to logical core `core`.
    #[cfg(target_os = "linux")]
    pub fn pin_current_thread(core: usize) -> io::Result<()> {
        // SAFETY: cpu_set_t is plain data; zeroed is the empty set.
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        // SAFETY: CPU_SET bounds-checks against the static set size.
        unsafe { libc::CPU_SET(core, &mut set) };
        // SAFETY: calling as documented with a correctly sized set.
        let r = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn pin_current_thread(_core: usize) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "affinity not supported"))
    }

    /// A [`Timekeeper`] running on its own OS thread.  Dropping it stops
    /// the loop and joins the thread.
    pub struct TimekeeperThread {
        clock: Arc<Timekeeper>,
        handle: Option<JoinHandle<()>>,
    }

    impl TimekeeperThread {
        /// Spawn the loop, pinned to `core` when given.  A failed pin is
        /// logged and the loop runs unpinned.
        pub fn spawn(core: Option<usize>) -> Result<Self> {
            let clock = Arc::new(Timekeeper::new());
            let worker = Arc::clone(&clock);
            let handle = std::thread::Builder::new()
                .name("hvprobe-timekeeper".into())
                .spawn(move || {
                    if let Some(core) = core {
                        match pin_current_thread(core) {
                            Ok(()) => debug!("timekeeper pinned to core {core}"),
                            Err(e) => warn!("timekeeper: cannot pin to core {core}: {e}"),
                        }
                    }
                    worker.run();
                })
                .map_err(ProbeError::Thread)?;
            Ok(Self {
                clock,
                handle: Some(handle),
            })
        }

        pub fn clock(&self) -> &Timekeeper {
            &self.clock
        }

        pub fn stop(mut self) {
            self.shutdown();
        }

        fn shutdown(&mut self) {
            self.clock.stop();
            if let Some(handle) = self.handle.take() {
                if handle.join().is_err() {
                    warn!("timekeeper thread panicked");
                }
            }
        }
    }

    impl Drop for TimekeeperThread {
        fn drop(&mut self) {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCpu, SimProfile};

    #[test]
    fn stopped_before_start_returns_immediately() {
        let clock = Timekeeper::new();
        clock.stop();
        clock.run();
        assert!(!clock.is_running());
        assert_eq!(clock.now(), 0);
    }

    #[test]
    fn wait_ready_times_out_without_a_timekeeper() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let clock = Timekeeper::new();
        let start = cpu.rdtsc();
        assert!(!clock.wait_ready(&cpu, 100_000));
        assert!(cpu.rdtsc() - start >= 100_000);
    }

    #[cfg(feature = "std")]
    #[test]
    fn thread_clock_advances_and_stops() {
        let cpu = SimCpu::new(SimProfile::bare_metal_intel());
        let keeper = TimekeeperThread::spawn(None).unwrap();
        assert!(keeper.clock().wait_ready(&cpu, u64::MAX / 2));
        let a = keeper.clock().now();
        while keeper.clock().now() == a {
            std::hint::spin_loop();
        }
        assert!(keeper.clock().now() > a);
        keeper.stop();
    }

    #[cfg(feature = "std")]
    #[test]
    fn rearm_allows_another_run() {
        let clock = std::sync::Arc::new(Timekeeper::new());
        clock.stop();
        clock.run();
        clock.rearm();
        let worker = std::sync::Arc::clone(&clock);
        let handle = std::thread::spawn(move || worker.run());
        while !clock.is_running() {
            std::hint::spin_loop();
        }
        clock.stop();
        handle.join().unwrap();
        assert!(!clock.is_running());
    }
}
