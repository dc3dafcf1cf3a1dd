use crate::config::EngineSettings;
use crate::engine::{EngineOutput, ExecutionEngine, ExecutionRequest, MAX_STDERR_BYTES};
use crate::profiler::ResourceProfiler;
use crate::protocol::{parse_line, LineBuffer, DRIVER_SOURCE};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Exit status of a container whose init was SIGKILLed (cgroup OOM killer)
const OOM_EXIT_CODE: i64 = 137;

const PIDS_LIMIT: i64 = 256;

const WAIT_GRACE: Duration = Duration::from_secs(5);

/// Container cleanup guard - guarantees container removal on drop
/// This ensures containers are cleaned up even if the step is cancelled
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
        }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        // Best-effort: Drop cannot await
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker
                .remove_container(&container_id, Some(remove_options))
                .await
            {
                warn!(container_id = %container_id, error = %e, "Failed to clean up container");
            }
        });
    }
}

/// Runs the driver inside a throwaway Docker container
///
/// **Container Rules:**
/// - Network disabled
/// - Memory limit `max_memory_cost + memory_overhead`, swap disabled
/// - CPU quota from `PERFENV_DOCKER_CPUS`, pid limit
/// - Request written to the attached stdin, so its size is not bounded by
///   the environment
/// - Exit code 137 without a report is a memory breach
/// - Container force-removed on every path
///
/// Memory is not sampled during the run; the cgroup limit and the driver's
/// tracemalloc peak enforce the ceiling.
pub struct DockerEngine {
    docker: Docker,
    settings: EngineSettings,
}

impl DockerEngine {
    pub fn new(settings: EngineSettings) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker, settings })
    }

    fn memory_limit(&self, max_memory: u64) -> i64 {
        let bytes = max_memory.saturating_add(self.settings.memory_overhead);
        i64::try_from(bytes).unwrap_or(i64::MAX)
    }

    fn nano_cpus(&self) -> i64 {
        (self.settings.docker_cpus * 1_000_000_000.0) as i64
    }

    fn container_config(&self, max_memory: u64) -> Config<String> {
        let memory_limit = self.memory_limit(max_memory);
        Config {
            image: Some(self.settings.docker_image.clone()),
            cmd: Some(vec![
                "python3".to_string(),
                "-u".to_string(),
                "-I".to_string(),
                "-c".to_string(),
                DRIVER_SOURCE.to_string(),
            ]),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(memory_limit),
                memory_swap: Some(memory_limit),
                nano_cpus: Some(self.nano_cpus()),
                pids_limit: Some(PIDS_LIMIT),
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Ensure the image is available locally, pulling it on a cache miss
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = image, "Image cache hit");
            return Ok(());
        }

        warn!(image = image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image = image, "Image pulled");
        Ok(())
    }

    async fn kill(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(container_id = container_id, error = %e, "Failed to kill container");
        }
    }

    /// Exit code of a stopped (or stopping) container
    async fn exit_code(&self, container_id: &str) -> Option<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self.docker.wait_container(container_id, Some(options));
        match timeout(WAIT_GRACE, wait_stream.next()).await {
            Ok(Some(Ok(response))) => Some(response.status_code),
            // bollard reports non-zero exits as an error
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => Some(code),
            Ok(Some(Err(e))) => {
                warn!(container_id = container_id, error = %e, "Failed to wait for container");
                None
            }
            Ok(None) | Err(_) => None,
        }
    }
}

#[async_trait]
impl ExecutionEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[tracing::instrument(skip(self, request), fields(nonce = %request.nonce, image = %self.settings.docker_image))]
    async fn run(&self, request: &ExecutionRequest) -> Result<EngineOutput> {
        let payload = request.to_json()?;

        let image = self.settings.docker_image.clone();
        self.ensure_image(&image)
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", image))?;

        let config = self.container_config(request.limits.max_memory);

        let container_name = format!("perfenv-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("Failed to create Docker container")?;
        let container_id = container.id.clone();
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        // Attach before start so neither the request nor early output is lost
        let attach_options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            detach_keys: None,
        };
        let AttachContainerResults {
            output: mut frames,
            mut input,
        } = self
            .docker
            .attach_container(&container_id, Some(attach_options))
            .await
            .context("Failed to attach to Docker container")?;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        let writer = tokio::spawn(async move {
            input.write_all(&payload).await?;
            input.shutdown().await
        });

        let mut profiler = ResourceProfiler::start(request.limits, &self.settings);
        let mut lines = LineBuffer::new();
        let mut stderr: Vec<u8> = Vec::new();

        loop {
            let deadline = profiler.deadline();
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(LogOutput::StdOut { message })) => {
                        let mut finished = false;
                        for line in lines.push(&message) {
                            if let Some(event) = parse_line(&line, &request.nonce) {
                                finished |= profiler.observe(event, None, Instant::now());
                            }
                        }
                        if finished {
                            break;
                        }
                    }
                    Some(Ok(LogOutput::StdErr { message })) => {
                        stderr.extend_from_slice(&message);
                        if stderr.len() > MAX_STDERR_BYTES * 2 {
                            stderr.drain(..stderr.len() - MAX_STDERR_BYTES);
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(container_id = %container_id, error = %e, "Error reading container output");
                        break;
                    }
                    None => {
                        if let Some(line) = lines.finish() {
                            if let Some(event) = parse_line(&line, &request.nonce) {
                                profiler.observe(event, None, Instant::now());
                            }
                        }
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(breach) = profiler.time_breach(Instant::now()) {
                        info!(phase = %breach.phase, elapsed_ms = breach.elapsed.as_millis() as u64, "Time limit exceeded, killing container");
                        self.kill(&container_id).await;
                        break;
                    }
                }
            }
        }

        writer.abort();
        let exit_code = self.exit_code(&container_id).await;
        if exit_code == Some(OOM_EXIT_CODE) && !profiler.is_done() {
            let breach = profiler.oom_breach(Instant::now());
            info!(phase = %breach.phase, "Container killed by the OOM killer");
        }

        if stderr.len() > MAX_STDERR_BYTES {
            stderr.drain(..stderr.len() - MAX_STDERR_BYTES);
        }
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        debug!(container_id = %container_id, exit_code = exit_code, "Container finished");
        Ok(EngineOutput::from_profile(profiler.finish(), stderr, exit_code))
    }
}
