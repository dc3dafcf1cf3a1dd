/// Resource Profiler - phase clock and ceiling enforcement for one execution
///
/// **Core Responsibility:**
/// Track where the driver is (Setup → Call → Tests → Finished), decide when a
/// time or memory ceiling has been crossed, and keep the measurements the
/// driver reports about the entry-point call.
///
/// **Boundary:**
/// - The profiler never touches a process; engines feed it events and samples
///   and act on the breaches it returns
/// - Measurements cover the entry-point call only; interpreter startup and
///   the test suite are bounded but not scored
use crate::config::{Configuration, EngineSettings};
use crate::protocol::{DriverEvent, DriverReport};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Ceilings taken from a validated `Configuration`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub max_time: Duration,
    pub max_memory: u64,
}

impl ResourceLimits {
    pub fn from_config(config: &Configuration) -> Self {
        Self {
            max_time: config.max_time(),
            max_memory: config.max_memory_cost,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Interpreter startup and module-level code
    Setup,
    /// Inside the entry point
    Call,
    /// Embedded test suite
    Tests,
    Finished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Setup => "setup",
            Phase::Call => "call",
            Phase::Tests => "tests",
            Phase::Finished => "finished",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Time,
    Memory,
}

/// A ceiling crossed while the driver was still running
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitBreach {
    pub kind: LimitKind,
    pub phase: Phase,
    /// Time spent in `phase` when the breach was detected
    pub elapsed: Duration,
    /// Sampled resident growth, when any sample was taken
    pub peak_memory: Option<u64>,
}

/// What a supervised run produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub report: Option<DriverReport>,
    pub breach: Option<LimitBreach>,
    pub call_elapsed: Option<Duration>,
    pub call_peak_memory: Option<u64>,
    pub peak_rss_growth: Option<u64>,
}

#[derive(Debug)]
pub struct ResourceProfiler {
    limits: ResourceLimits,
    startup_grace: Duration,
    memory_overhead: u64,
    phase: Phase,
    phase_started: Instant,
    baseline_rss: Option<u64>,
    peak_rss: Option<u64>,
    peak_rss_growth: Option<u64>,
    call_elapsed: Option<Duration>,
    call_peak_memory: Option<u64>,
    report: Option<DriverReport>,
    breach: Option<LimitBreach>,
}

impl ResourceProfiler {
    pub fn start(limits: ResourceLimits, settings: &EngineSettings) -> Self {
        Self::start_at(limits, settings, Instant::now())
    }

    pub fn start_at(limits: ResourceLimits, settings: &EngineSettings, now: Instant) -> Self {
        Self {
            limits,
            startup_grace: settings.startup_grace,
            memory_overhead: settings.memory_overhead,
            phase: Phase::Setup,
            phase_started: now,
            baseline_rss: None,
            peak_rss: None,
            peak_rss_growth: None,
            call_elapsed: None,
            call_peak_memory: None,
            report: None,
            breach: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn breach(&self) -> Option<LimitBreach> {
        self.breach
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Finished || self.breach.is_some()
    }

    fn budget(&self) -> Duration {
        match self.phase {
            Phase::Setup => self.startup_grace + self.limits.max_time,
            Phase::Call | Phase::Tests | Phase::Finished => self.limits.max_time,
        }
    }

    /// Instant at which the current phase runs out of time
    pub fn deadline(&self) -> Instant {
        self.phase_started + self.budget()
    }

    /// Absolute resident ceiling for the whole driver process
    pub fn rss_ceiling(&self) -> u64 {
        self.limits.max_memory.saturating_add(self.memory_overhead)
    }

    /// Advance the phase clock on a driver event
    ///
    /// `rss` is the resident size at the moment the event was read; the value
    /// seen with `ready` becomes the growth baseline. Out-of-order events are
    /// ignored. Returns true once the final report has arrived.
    pub fn observe(&mut self, event: DriverEvent, rss: Option<u64>, now: Instant) -> bool {
        if self.is_done() {
            return self.phase == Phase::Finished;
        }
        match event {
            DriverEvent::Ready {} if self.phase == Phase::Setup => {
                self.phase = Phase::Call;
                self.phase_started = now;
                self.baseline_rss = rss;
            }
            DriverEvent::CallFinished {
                elapsed,
                peak_memory,
            } if self.phase == Phase::Call => {
                self.call_elapsed = Duration::try_from_secs_f64(elapsed.max(0.0)).ok();
                self.call_peak_memory = Some(peak_memory);
                self.phase = Phase::Tests;
                self.phase_started = now;
            }
            DriverEvent::Result(report) => {
                self.report = Some(report);
                self.phase = Phase::Finished;
                self.phase_started = now;
            }
            _ => {}
        }
        self.phase == Phase::Finished
    }

    /// Record a resident-memory sample and check it against the ceiling
    pub fn sample_memory(&mut self, rss: u64, now: Instant) -> Option<LimitBreach> {
        if self.is_done() {
            return None;
        }
        self.peak_rss = Some(self.peak_rss.map_or(rss, |peak| peak.max(rss)));

        let exceeded = match (self.phase, self.baseline_rss) {
            (Phase::Call | Phase::Tests, Some(baseline)) => {
                let growth = rss.saturating_sub(baseline);
                self.peak_rss_growth = Some(self.peak_rss_growth.map_or(growth, |p| p.max(growth)));
                growth > self.limits.max_memory
            }
            _ => rss > self.rss_ceiling(),
        };

        if exceeded {
            return Some(self.record(LimitKind::Memory, now));
        }
        None
    }

    /// Check the current phase deadline
    pub fn time_breach(&mut self, now: Instant) -> Option<LimitBreach> {
        if self.is_done() || now < self.deadline() {
            return None;
        }
        Some(self.record(LimitKind::Time, now))
    }

    /// The isolation layer killed the run for exceeding its memory allotment
    /// (cgroup OOM kill)
    pub fn oom_breach(&mut self, now: Instant) -> LimitBreach {
        if let Some(breach) = self.breach {
            return breach;
        }
        self.record(LimitKind::Memory, now)
    }

    fn record(&mut self, kind: LimitKind, now: Instant) -> LimitBreach {
        let breach = LimitBreach {
            kind,
            phase: self.phase,
            elapsed: now.saturating_duration_since(self.phase_started),
            peak_memory: self.peak_rss_growth.or(self.peak_rss),
        };
        self.breach = Some(breach);
        breach
    }

    pub fn finish(self) -> Profile {
        Profile {
            report: self.report,
            breach: self.breach,
            call_elapsed: self.call_elapsed,
            call_peak_memory: self.call_peak_memory,
            peak_rss_growth: self.peak_rss_growth,
        }
    }
}

/// Resident set size of `pid` in bytes, if the platform exposes it
#[cfg(target_os = "linux")]
pub fn read_rss(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    parse_status_rss(&status)
}

#[cfg(not(target_os = "linux"))]
pub fn read_rss(_pid: u32) -> Option<u64> {
    None
}

/// Extract `VmRSS` from the text of `/proc/<pid>/status`
pub fn parse_status_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let mut fields = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    let scale = match fields.next() {
        Some("kB") | None => 1024,
        Some("mB") => 1024 * 1024,
        Some(_) => return None,
    };
    Some(value * scale)
}
