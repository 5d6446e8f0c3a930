/// Docker Engine - production Sandbox Executor
///
/// **Core Responsibility:**
/// Run one untrusted program to completion or timeout inside a throwaway
/// container and capture its raw outputs.
///
/// **Isolation Rules (never relaxed for speed):**
/// 1. One container per compile and per run, removed on every path
/// 2. No network (`network_mode=none`)
/// 3. Read-only root filesystem; only the scratch dir (bind-mounted at
///    `/sandbox`) and a small `/tmp` tmpfs are writable
/// 4. Unprivileged user, all capabilities dropped, `no-new-privileges`
/// 5. Memory (swap included), CPU and pids ceilings from the runtime spec
/// 6. On timeout the container is killed, which takes down the whole
///    process tree, not just the entrypoint
///
/// **Scratch directories:**
/// `prepare` writes the source into a job-scoped build dir and compiles
/// there once. Every `run` copies the build dir into a fresh scratch dir
/// that no other run ever sees. Both are `TempDir`s, so they are removed
/// on success, crash, timeout and cancellation alike.

use crate::sandbox::{CappedBuffer, ExecutionResult, Prepared, Program, SandboxError, SandboxExecutor};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, KillContainerOptions,
    LogOutput, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerWaitResponse, HostConfig};
use bollard::Docker;
use futures_util::stream::StreamExt;
use kiln_common::runtime::{ExecutionLimits, RuntimeSpec};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// Where the scratch directory appears inside the container
const SANDBOX_MOUNT: &str = "/sandbox";
/// nobody:nogroup
const SANDBOX_USER: &str = "65534:65534";
const TMPFS_OPTIONS: &str = "rw,nosuid,nodev,size=64m";

/// Container cleanup guard - backstop for cancelled futures.
///
/// The normal path calls [`ContainerGuard::release`], which removes the
/// container before returning. If the owning future is dropped first
/// (job ceiling hit, shutdown), `Drop` schedules the removal instead.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
    released: bool,
}

impl ContainerGuard {
    fn new(docker: &Docker, container_id: String) -> Self {
        Self {
            docker: docker.clone(),
            container_id,
            released: false,
        }
    }

    async fn release(mut self) {
        remove_container(&self.docker, &self.container_id).await;
        // Only now: a release cancelled mid-removal must still hit `Drop`.
        self.released = true;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let docker = self.docker.clone();
        let container_id = std::mem::take(&mut self.container_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { remove_container(&docker, &container_id).await });
            }
            Err(_) => warn!(container_id = %container_id, "no runtime to remove abandoned container"),
        }
    }
}

async fn remove_container(docker: &Docker, container_id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    if let Err(e) = docker.remove_container(container_id, Some(options)).await {
        warn!(container_id = %container_id, error = %e, "Failed to remove container");
    }
}

/// Docker-based sandbox executor.
pub struct DockerEngine {
    docker: Docker,
    scratch_root: PathBuf,
    output_limit_bytes: usize,
}

impl DockerEngine {
    pub fn new(scratch_root: impl Into<PathBuf>, output_limit_bytes: usize) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Docker(format!("failed to connect to Docker daemon: {e}")))?;
        let scratch_root = scratch_root.into();
        std::fs::create_dir_all(&scratch_root)?;
        Ok(Self {
            docker,
            scratch_root,
            output_limit_bytes,
        })
    }

    /// Fail fast at startup if the daemon is unreachable.
    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::Docker(e.to_string()))
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| SandboxError::Image {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }

        info!(image, "Image pulled");
        Ok(())
    }

    fn scratch_dir(&self, prefix: &str) -> Result<TempDir, SandboxError> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.scratch_root)?;
        open_for_sandbox_user(dir.path())?;
        Ok(dir)
    }

    fn container_config(&self, image: &str, cmd: Vec<String>, dir: &Path, limits: &ExecutionLimits) -> Config<String> {
        let memory = i64::from(limits.memory_limit_mb) * 1024 * 1024;
        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), TMPFS_OPTIONS.to_string());

        Config {
            image: Some(image.to_string()),
            cmd: Some(cmd),
            working_dir: Some(SANDBOX_MOUNT.to_string()),
            user: Some(SANDBOX_USER.to_string()),
            env: Some(vec![format!("HOME={SANDBOX_MOUNT}"), "LANG=C.UTF-8".to_string()]),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}:rw", dir.display(), SANDBOX_MOUNT)]),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                tmpfs: Some(tmpfs),
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some((limits.cpu_limit * 1_000_000_000.0) as i64),
                pids_limit: Some(limits.pids_limit),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Create, run and always remove one container.
    async fn run_container(
        &self,
        image: &str,
        cmd: Vec<String>,
        dir: &Path,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult, SandboxError> {
        let name = format!("kiln-{}", uuid::Uuid::new_v4());
        let config = self.container_config(image, cmd, dir, limits);
        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::Spawn(format!("create container: {e}")))?;

        let guard = ContainerGuard::new(&self.docker, container.id.clone());
        let outcome = self.drive_container(&container.id, stdin, limits).await;
        guard.release().await;
        outcome
    }

    /// Attach, start, feed stdin, capture, and wait under the hard timeout.
    async fn drive_container(
        &self,
        container_id: &str,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult, SandboxError> {
        // Attach before start so no early output is lost.
        let AttachContainerResults { mut output, mut input } = self
            .docker
            .attach_container(
                container_id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    detach_keys: None,
                }),
            )
            .await
            .map_err(|e| SandboxError::Docker(format!("attach container: {e}")))?;

        let started = Instant::now();
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Spawn(format!("start container: {e}")))?;

        let mut stdout = CappedBuffer::new(limits.output_limit_bytes);
        let mut stderr = CappedBuffer::new(limits.output_limit_bytes);
        let stdin_bytes = stdin.as_bytes().to_vec();

        let execution = async {
            let feed = async move {
                // The program may exit without reading stdin; a broken pipe
                // here is the program's business, not an engine failure.
                if let Err(e) = input.write_all(&stdin_bytes).await {
                    debug!(error = %e, "stdin closed early");
                }
                let _ = input.shutdown().await;
            };
            let capture = async {
                while let Some(chunk) = output.next().await {
                    capture_chunk(chunk, &mut stdout, &mut stderr)?;
                }
                Ok::<(), SandboxError>(())
            };
            let ((), captured) = tokio::join!(feed, capture);
            captured?;
            self.wait_exit_code(container_id).await
        };

        let timeout_result = tokio::time::timeout(limits.timeout, execution).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (exit_code, timed_out) = match timeout_result {
            Ok(Ok(code)) => (Some(code), false),
            Ok(Err(e)) => {
                warn!(error = %e, "Lost track of container, result discarded");
                return Err(e);
            }
            Err(_) => {
                warn!(timeout_ms = limits.timeout.as_millis() as u64, "Execution timed out, killing container");
                if let Err(e) = self
                    .docker
                    .kill_container(container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(error = %e, "Failed to kill timed-out container");
                }
                (None, true)
            }
        };

        let mut stderr_text = stderr.to_string_lossy();
        if !timed_out {
            match exit_code {
                Some(137) => stderr_text.push_str("\n[killed: memory limit exceeded]"),
                Some(139) => stderr_text.push_str("\n[killed: segmentation fault]"),
                _ => {}
            }
        }

        Ok(ExecutionResult {
            stdout: stdout.to_string_lossy(),
            stderr: stderr_text,
            exit_code,
            duration_ms,
            timed_out,
            crashed: !timed_out && exit_code != Some(0),
            stdout_truncated: stdout.is_truncated(),
            stderr_truncated: stderr.is_truncated(),
        })
    }

    async fn wait_exit_code(&self, container_id: &str) -> Result<i64, SandboxError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self.docker.wait_container(container_id, Some(options));
        exit_status(wait_stream.next().await)
    }
}

/// Route one attach-stream chunk into the capture buffers. A broken stream
/// means the output is incomplete, which says nothing about the program.
fn capture_chunk(
    chunk: Result<LogOutput, bollard::errors::Error>,
    stdout: &mut CappedBuffer,
    stderr: &mut CappedBuffer,
) -> Result<(), SandboxError> {
    match chunk {
        Ok(LogOutput::StdOut { message }) => stdout.push(&message),
        Ok(LogOutput::StdErr { message }) => stderr.push(&message),
        Ok(_) => {}
        Err(e) => return Err(SandboxError::Docker(format!("read container output: {e}"))),
    }
    Ok(())
}

fn exit_status(next: Option<Result<ContainerWaitResponse, bollard::errors::Error>>) -> Result<i64, SandboxError> {
    match next {
        Some(Ok(response)) => Ok(response.status_code),
        // bollard reports nonzero exits as an error carrying the code
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(e)) => Err(SandboxError::Docker(format!("wait container: {e}"))),
        None => Err(SandboxError::Docker("wait stream ended without an exit status".to_string())),
    }
}

#[async_trait]
impl SandboxExecutor for DockerEngine {
    #[instrument(skip(self, runtime), fields(language = %runtime.language, image = %runtime.image))]
    async fn ensure_runtime(&self, runtime: &RuntimeSpec) -> Result<(), SandboxError> {
        self.ensure_image(&runtime.image).await
    }

    #[instrument(skip(self, runtime, source), fields(language = %runtime.language, compiled = runtime.is_compiled()))]
    async fn prepare(&self, runtime: &RuntimeSpec, source: &str) -> Result<Prepared, SandboxError> {
        let build_dir = self.scratch_dir("kiln-build-")?;
        tokio::fs::write(build_dir.path().join(runtime.source_file()), source).await?;

        let Some(compile_cmd) = runtime.compile_command() else {
            return Ok(Prepared::Ready(Program::new(runtime.clone(), source, Some(build_dir))));
        };

        let limits = runtime.compile_limits(self.output_limit_bytes);
        let result = self
            .run_container(&runtime.image, compile_cmd, build_dir.path(), "", &limits)
            .await?;

        let artifact_present = runtime
            .compile
            .as_ref()
            .map(|step| build_dir.path().join(&step.artifact).exists())
            .unwrap_or(false);

        if result.succeeded() && artifact_present {
            info!(compilation_time_ms = result.duration_ms, "Compilation succeeded");
            Ok(Prepared::Ready(Program::new(runtime.clone(), source, Some(build_dir))))
        } else {
            warn!(
                compilation_time_ms = result.duration_ms,
                timed_out = result.timed_out,
                error_preview = result.stderr.lines().next().unwrap_or(""),
                "Compilation failed"
            );
            cleanup(build_dir);
            Ok(Prepared::CompileFailed(ExecutionResult {
                crashed: !result.timed_out,
                ..result
            }))
        }
    }

    #[instrument(skip(self, program, stdin, limits), fields(language = %program.runtime().language, timeout_ms = limits.timeout.as_millis() as u64))]
    async fn run(
        &self,
        program: &Program,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult, SandboxError> {
        let scratch = self.scratch_dir("kiln-run-")?;
        if let Some(build_dir) = program.build_dir() {
            copy_dir_contents(build_dir, scratch.path()).await?;
        } else {
            let runtime = program.runtime();
            tokio::fs::write(scratch.path().join(runtime.source_file()), program.source()).await?;
        }

        let runtime = program.runtime();
        let result = self
            .run_container(&runtime.image, runtime.run_command(), scratch.path(), stdin, limits)
            .await;
        cleanup(scratch);

        if let Ok(ref r) = result {
            debug!(
                execution_time_ms = r.duration_ms,
                exit_code = ?r.exit_code,
                timed_out = r.timed_out,
                "Run finished"
            );
        }
        result
    }
}

fn cleanup(dir: TempDir) {
    let path = dir.path().display().to_string();
    if let Err(e) = dir.close() {
        warn!(path, error = %e, "Failed to remove scratch directory");
    }
}

/// The container user is not the worker's user; let it write the mount.
fn open_for_sandbox_user(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

async fn copy_dir_contents(from: &Path, to: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(from).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::copy(entry.path(), to.join(entry.file_name())).await?;
        }
    }
    Ok(())
}
