/// Execution Engine - Abstraction for Running Submissions
///
/// **Core Responsibility:**
/// Run the embedded driver against one submission and hand back what it
/// reported, together with any ceiling the `ResourceProfiler` saw crossed.
///
/// **Architectural Boundary:**
/// - Engine knows HOW to run (local process, Docker container)
/// - Engine does NOT classify errors or compute rewards
/// - `Err` is reserved for infrastructure failures (interpreter missing,
///   daemon unreachable); anything the submission does is `Ok`
///
/// **Why This Exists:**
/// Lets the isolation boundary be swapped without touching scoring.
use crate::config::{Backend, EngineSettings};
use crate::docker::DockerEngine;
use crate::profiler::{read_rss, LimitBreach, Profile, ResourceLimits, ResourceProfiler};
use crate::protocol::{
    parse_line, DriverLimits, DriverReport, DriverRequest, LineBuffer, DRIVER_SOURCE,
};
use crate::runner::TestPlan;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Read size for the driver channel
const CHANNEL_CHUNK_BYTES: usize = 64 * 1024;

/// Tail of the interpreter's stderr kept for diagnostics
pub const MAX_STDERR_BYTES: usize = 64 * 1024;

/// How long a driver that already reported gets to exit on its own
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// How long to wait for a killed process group to be reaped
const KILL_GRACE: Duration = Duration::from_secs(2);

/// One submission, ready to hand to an engine
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Tags protocol lines; fresh for every run
    pub nonce: String,
    pub source: String,
    pub entry_point: String,
    pub tests: Option<TestPlan>,
    pub limits: ResourceLimits,
}

impl ExecutionRequest {
    pub fn new(
        source: impl Into<String>,
        entry_point: impl Into<String>,
        tests: Option<TestPlan>,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            nonce: Uuid::new_v4().simple().to_string(),
            source: source.into(),
            entry_point: entry_point.into(),
            tests,
            limits,
        }
    }

    pub fn driver_request(&self) -> DriverRequest<'_> {
        DriverRequest {
            nonce: &self.nonce,
            source: &self.source,
            entry_point: &self.entry_point,
            tests: self.tests.as_ref(),
            limits: DriverLimits {
                max_time: self.limits.max_time.as_secs_f64(),
                max_memory: self.limits.max_memory,
            },
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.driver_request()).context("Failed to encode driver request")
    }
}

/// Raw result of one engine run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutput {
    /// Final driver report; None if the driver died or was killed first
    pub report: Option<DriverReport>,
    pub breach: Option<LimitBreach>,
    pub call_elapsed: Option<Duration>,
    pub call_peak_memory: Option<u64>,
    pub stderr: String,
    pub exit_code: Option<i64>,
}

impl EngineOutput {
    pub fn from_profile(profile: Profile, stderr: String, exit_code: Option<i64>) -> Self {
        Self {
            report: profile.report,
            breach: profile.breach,
            call_elapsed: profile.call_elapsed,
            call_peak_memory: profile.call_peak_memory,
            stderr,
            exit_code,
        }
    }
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Short backend name, reported in `StepInfo::engine`
    fn name(&self) -> &'static str;

    async fn run(&self, request: &ExecutionRequest) -> Result<EngineOutput>;
}

/// Build the engine selected by `settings`
pub fn build_engine(settings: &EngineSettings) -> Result<Arc<dyn ExecutionEngine>> {
    match settings.backend {
        Backend::Process => Ok(Arc::new(ProcessEngine::new(settings.clone()))),
        Backend::Docker => Ok(Arc::new(DockerEngine::new(settings.clone())?)),
    }
}

/// Runs the driver in a local interpreter
///
/// **Isolation:**
/// - Own process group, killed as a whole when the run ends
/// - `-I` isolated mode: no user site-packages, no PYTHON* environment
/// - RLIMIT_CPU backstop well past every phase deadline, core dumps disabled
/// - Resident memory sampled from /proc every `sample_interval`
///
/// Not a security boundary; use `DockerEngine` for untrusted input.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    settings: EngineSettings,
}

impl ProcessEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// CPU seconds after which the kernel kills the interpreter regardless
    fn cpu_backstop(&self, limits: &ResourceLimits) -> u64 {
        let wall = limits.max_time.as_secs_f64() * 3.0 + self.settings.startup_grace.as_secs_f64();
        wall.ceil() as u64 + 1
    }

    fn command(&self, limits: &ResourceLimits) -> Command {
        let mut command = Command::new(&self.settings.python);
        command
            .args(["-u", "-I", "-c", DRIVER_SOURCE])
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            let cpu_seconds = self.cpu_backstop(limits) as libc::rlim_t;
            command.process_group(0);

            // SAFETY: pre_exec runs between fork() and exec() in the child.
            // setrlimit is async-signal-safe and the closure only captures a
            // Copy value.
            unsafe {
                command.pre_exec(move || {
                    let cpu = libc::rlimit {
                        rlim_cur: cpu_seconds,
                        rlim_max: cpu_seconds,
                    };
                    if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    let core = libc::rlimit {
                        rlim_cur: 0,
                        rlim_max: 0,
                    };
                    libc::setrlimit(libc::RLIMIT_CORE, &core);
                    Ok(())
                });
            }
        }
        #[cfg(not(unix))]
        let _ = limits;

        command
    }

    /// Kill the child's whole process group, then reap it
    async fn terminate(&self, child: &mut Child, pid: u32) -> Option<i64> {
        kill_group(pid);
        match timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(status)) => status.code().map(i64::from),
            Ok(Err(e)) => {
                warn!(pid = pid, error = %e, "Failed to reap interpreter");
                None
            }
            Err(_) => {
                warn!(pid = pid, "Interpreter did not exit after SIGKILL");
                let _ = child.start_kill();
                None
            }
        }
    }
}

#[async_trait]
impl ExecutionEngine for ProcessEngine {
    fn name(&self) -> &'static str {
        "process"
    }

    #[tracing::instrument(skip(self, request), fields(nonce = %request.nonce, entry_point = %request.entry_point))]
    async fn run(&self, request: &ExecutionRequest) -> Result<EngineOutput> {
        let payload = request.to_json()?;

        let mut child = self
            .command(&request.limits)
            .spawn()
            .with_context(|| format!("Failed to spawn Python interpreter '{}'", self.settings.python))?;
        let pid = child.id().context("Spawned interpreter has no pid")?;
        debug!(pid = pid, "Interpreter started");

        let mut stdin = child.stdin.take().context("Interpreter stdin not captured")?;
        let stdout = child.stdout.take().context("Interpreter stdout not captured")?;
        let stderr = child.stderr.take().context("Interpreter stderr not captured")?;

        // The request is written from a separate task so a driver that never
        // reads stdin cannot stall supervision.
        let writer = tokio::spawn(async move {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await
        });
        let stderr_reader = tokio::spawn(read_tail(stderr, MAX_STDERR_BYTES));

        let mut profiler = ResourceProfiler::start(request.limits, &self.settings);
        let mut channel = stdout;
        let mut lines = LineBuffer::new();
        let mut chunk = vec![0u8; CHANNEL_CHUNK_BYTES];
        let mut ticker = tokio::time::interval(self.settings.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        'supervise: loop {
            let deadline = profiler.deadline();
            tokio::select! {
                batch = read_lines(&mut channel, &mut lines, &mut chunk) => match batch {
                    Ok(Some(batch)) => {
                        for line in batch {
                            if let Some(event) = parse_line(&line, &request.nonce) {
                                if profiler.observe(event, read_rss(pid), Instant::now()) {
                                    break 'supervise;
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(pid = pid, phase = %profiler.phase(), "Driver closed its channel");
                        break;
                    }
                    Err(e) => {
                        warn!(pid = pid, error = %e, "Failed to read driver channel");
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(breach) = profiler.time_breach(Instant::now()) {
                        info!(phase = %breach.phase, elapsed_ms = breach.elapsed.as_millis() as u64, "Time limit exceeded");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(rss) = read_rss(pid) {
                        if let Some(breach) = profiler.sample_memory(rss, Instant::now()) {
                            info!(phase = %breach.phase, peak_memory = breach.peak_memory, "Memory limit exceeded");
                            break;
                        }
                    }
                }
            }
        }

        if profiler.breach().is_none() {
            // Let a driver that finished exit cleanly before the group is killed
            let _ = timeout(EXIT_GRACE, child.wait()).await;
        }
        let exit_code = self.terminate(&mut child, pid).await;

        writer.abort();
        let stderr = match timeout(KILL_GRACE, stderr_reader).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(error = %e, "stderr reader failed");
                String::new()
            }
            Err(_) => String::new(),
        };

        let profile = profiler.finish();
        debug!(
            exit_code = exit_code,
            reported = profile.report.is_some(),
            breached = profile.breach.is_some(),
            "Interpreter finished"
        );
        Ok(EngineOutput::from_profile(profile, stderr, exit_code))
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    // SAFETY: plain syscall; a stale pgid only yields ESRCH.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
    if rc != 0 {
        let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// Next batch of complete protocol lines, `None` once the stream is drained
///
/// Lines longer than `MAX_LINE_BYTES` are dropped by the `LineBuffer`, so a
/// newline-free flood never grows past that cap.
pub(crate) async fn read_lines<R>(
    reader: &mut R,
    buffer: &mut LineBuffer,
    chunk: &mut [u8],
) -> std::io::Result<Option<Vec<String>>>
where
    R: AsyncRead + Unpin,
{
    let n = reader.read(chunk).await?;
    if n == 0 {
        return Ok(buffer.finish().map(|line| vec![line]));
    }
    Ok(Some(buffer.push(&chunk[..n])))
}

/// Read `reader` to the end, keeping at most the last `limit` bytes
pub(crate) async fn read_tail<R>(mut reader: R, limit: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut kept: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > limit * 2 {
                    kept.drain(..kept.len() - limit);
                }
            }
        }
    }
    if kept.len() > limit {
        kept.drain(..kept.len() - limit);
    }
    String::from_utf8_lossy(&kept).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            max_time: Duration::from_secs(2),
            max_memory: 1024,
        }
    }

    #[tokio::test]
    async fn test_read_lines_drops_oversized_line() {
        use crate::protocol::MAX_LINE_BYTES;

        let mut stream = vec![b'x'; MAX_LINE_BYTES + 4096];
        stream.extend_from_slice(b"\n{\"event\":\"ready\"}\ntail");
        let mut reader = stream.as_slice();
        let mut buffer = LineBuffer::new();
        let mut chunk = vec![0u8; 8192];

        let mut lines = Vec::new();
        while let Some(batch) = read_lines(&mut reader, &mut buffer, &mut chunk)
            .await
            .unwrap()
        {
            lines.extend(batch);
        }
        assert_eq!(lines, vec!["{\"event\":\"ready\"}", "tail"]);
    }

    #[test]
    fn test_request_nonce_is_unique() {
        let a = ExecutionRequest::new("x = 1", "env_main", None, limits());
        let b = ExecutionRequest::new("x = 1", "env_main", None, limits());
        assert_ne!(a.nonce, b.nonce);
        assert_eq!(a.nonce.len(), 32);
    }

    #[test]
    fn test_request_payload() {
        let request = ExecutionRequest::new("def f(): pass", "f", None, limits());
        let payload: serde_json::Value = serde_json::from_slice(&request.to_json().unwrap()).unwrap();
        assert_eq!(payload["nonce"], request.nonce.as_str());
        assert_eq!(payload["source"], "def f(): pass");
        assert_eq!(payload["entry_point"], "f");
    }

    #[test]
    fn test_cpu_backstop_exceeds_all_deadlines() {
        let engine = ProcessEngine::new(EngineSettings {
            startup_grace: Duration::from_millis(1500),
            ..Default::default()
        });
        // 3 * 2s + 1.5s = 7.5s → 8 + 1
        assert_eq!(engine.cpu_backstop(&limits()), 9);
    }

    #[test]
    fn test_build_process_engine() {
        let engine = build_engine(&EngineSettings::default()).unwrap();
        assert_eq!(engine.name(), "process");
    }

    #[tokio::test]
    async fn test_read_tail_keeps_end() {
        let data: Vec<u8> = (0..100u8).map(|i| b'a' + i % 26).collect();
        let tail = read_tail(&data[..], 10).await;
        assert_eq!(tail.as_bytes(), &data[90..]);

        let short = read_tail(&b"oops"[..], 10).await;
        assert_eq!(short, "oops");
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_engine_error() {
        let engine = ProcessEngine::new(EngineSettings {
            python: "/nonexistent/python-perfenv".to_string(),
            ..Default::default()
        });
        let request = ExecutionRequest::new("def env_main(): return 0", "env_main", None, limits());
        let err = engine.run(&request).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to spawn Python interpreter"));
    }
}
