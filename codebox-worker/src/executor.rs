//! Container lifecycle supervision.
//!
//! The executor builds a structured argv for the container runtime and never
//! passes user input through a host shell; user commands run inside the
//! container behind `/bin/sh -c`. Cleanup (container removal, workspace
//! removal, permit release) happens on every exit path.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use codebox_common::job::{JobRequest, StreamKind, Submission};
use codebox_common::runtime::RuntimeCatalog;

use crate::admission::AdmissionPermit;
use crate::error::ExecutorError;
use crate::logmux::LogMultiplexer;
use crate::workspace::WorkspaceManager;

#[derive(Clone)]
pub struct ExecutorSettings {
    /// The container runtime CLI. Anything OCI-compatible with `run`, `kill`
    /// and `rm` subcommands works; tests substitute a stub.
    pub runtime_bin: String,
    pub name_prefix: String,
    pub network_host: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Success,
    Timeout,
    Killed,
    Error,
}

/// The outcome of one container run. Failures of the workload itself land
/// here; only supervision failures surface as `ExecutorError`.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

pub struct ContainerExecutor {
    settings: ExecutorSettings,
    catalog: RuntimeCatalog,
    workspaces: WorkspaceManager,
    logs: Arc<LogMultiplexer>,
}

impl ContainerExecutor {
    pub fn new(
        settings: ExecutorSettings,
        catalog: RuntimeCatalog,
        workspaces: WorkspaceManager,
        logs: Arc<LogMultiplexer>,
    ) -> Self {
        Self {
            settings,
            catalog,
            workspaces,
            logs,
        }
    }

    /// Stable container name for a job. At most one container with this name
    /// exists at any time; queue claim exclusivity guarantees it.
    pub fn container_name(&self, job_id: Uuid) -> String {
        format!("{}-{}", self.settings.name_prefix, job_id)
    }

    /// Run one admitted job to completion. The permit is released when this
    /// returns, whatever the path out.
    pub async fn execute(
        &self,
        job_id: Uuid,
        request: &JobRequest,
        permit: AdmissionPermit,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport, ExecutorError> {
        let workspace = self
            .workspaces
            .allocate(job_id)
            .await
            .map_err(ExecutorError::WorkspaceSetup)?;

        let result = self
            .run_container(job_id, request, &workspace, cancel)
            .await;

        self.remove_container(&self.container_name(job_id)).await;
        self.workspaces.remove(job_id).await;
        drop(permit);

        result
    }

    async fn run_container(
        &self,
        job_id: Uuid,
        request: &JobRequest,
        workspace: &Path,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport, ExecutorError> {
        self.stage_workspace(request, workspace)
            .await
            .map_err(ExecutorError::SourceWrite)?;

        let argv = self.invocation(job_id, request, workspace);
        debug!(job_id = %job_id, "starting container: {}", argv.join(" "));

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecutorError::Spawn)?;

        let stdout_task = self.stream(job_id, StreamKind::Stdout, child.stdout.take());
        let stderr_task = self.stream(job_id, StreamKind::Stderr, child.stderr.take());

        let timeout = std::time::Duration::from_millis(request.timeout_ms);
        let container_name = self.container_name(job_id);

        enum WaitOutcome {
            Exited(std::io::Result<std::process::ExitStatus>),
            TimedOut,
            Cancelled,
        }

        // Decide first, act after: the wait future's borrow of the child ends
        // with the select, freeing it for the kill path.
        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status),
            _ = tokio::time::sleep(timeout) => WaitOutcome::TimedOut,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };

        let report = match outcome {
            WaitOutcome::Exited(status) => {
                let status = status.map_err(ExecutorError::Wait)?;
                match status.code() {
                    Some(0) => ExecutionReport {
                        status: ExecStatus::Success,
                        exit_code: Some(0),
                        error: None,
                    },
                    Some(code) => ExecutionReport {
                        status: ExecStatus::Error,
                        exit_code: Some(code),
                        error: Some(format!("container exited with code {code}")),
                    },
                    None => ExecutionReport {
                        status: ExecStatus::Error,
                        exit_code: None,
                        error: Some("container terminated by signal".to_owned()),
                    },
                }
            }
            WaitOutcome::TimedOut => {
                // Kill both the named container and the child: the child may
                // be a CLI wrapper that outlives a runtime-side kill.
                self.kill_container(&container_name).await;
                let _kill_result = child.start_kill();
                let _wait_result = child.wait().await;
                ExecutionReport {
                    status: ExecStatus::Timeout,
                    exit_code: None,
                    error: Some("timeout".to_owned()),
                }
            }
            WaitOutcome::Cancelled => {
                self.kill_container(&container_name).await;
                let _kill_result = child.start_kill();
                let _wait_result = child.wait().await;
                ExecutionReport {
                    status: ExecStatus::Killed,
                    exit_code: None,
                    error: Some("cancelled".to_owned()),
                }
            }
        };

        // The pipes close once the child is gone; wait so the multiplexer has
        // every chunk before the caller flushes.
        if let Some(task) = stdout_task {
            task.await.ok();
        }
        if let Some(task) = stderr_task {
            task.await.ok();
        }

        Ok(report)
    }

    fn stream<R>(
        &self,
        job_id: Uuid,
        kind: StreamKind,
        source: Option<R>,
    ) -> Option<tokio::task::JoinHandle<()>>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let source = source?;
        let logs = Arc::clone(&self.logs);
        Some(tokio::spawn(async move {
            let mut lines = BufReader::new(source).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                logs.append(job_id, kind, &line).await;
            }
        }))
    }

    /// Write source files into the workspace before the container starts.
    async fn stage_workspace(
        &self,
        request: &JobRequest,
        workspace: &Path,
    ) -> std::io::Result<()> {
        let Submission::RawCode { raw_code } = &request.submission else {
            return Ok(());
        };

        let profile = self.catalog.resolve(&request.runtime);
        tokio::fs::write(workspace.join(profile.file_name), raw_code).await?;

        if request.runtime.eq_ignore_ascii_case("nodejs") && !request.dependencies.is_empty() {
            let manifest = serde_json::json!({
                "name": "codebox-job",
                "version": "1.0.0",
                "dependencies": request
                    .dependencies
                    .iter()
                    .map(|dep| (dep.clone(), serde_json::Value::from("*")))
                    .collect::<serde_json::Map<String, serde_json::Value>>(),
            });
            tokio::fs::write(
                workspace.join("package.json"),
                serde_json::to_string_pretty(&manifest).unwrap_or_default(),
            )
            .await?;
        }

        Ok(())
    }

    /// The full argv for this job, runtime binary first. Pure so tests can
    /// assert the exact command without a runtime installed.
    pub fn invocation(&self, job_id: Uuid, request: &JobRequest, workspace: &Path) -> Vec<String> {
        let mut argv = vec![
            self.settings.runtime_bin.clone(),
            "run".to_owned(),
            "--rm".to_owned(),
            "--name".to_owned(),
            self.container_name(job_id),
            format!("--memory={}m", request.memory_limit.megabytes()),
        ];
        if self.settings.network_host {
            argv.push("--network=host".to_owned());
        }
        argv.push("--workdir=/app".to_owned());
        argv.push("-v".to_owned());
        argv.push(format!("{}:/app", workspace.display()));

        let mut env: Vec<_> = request.env.iter().collect();
        env.sort();
        for (name, value) in env {
            argv.push("-e".to_owned());
            argv.push(format!("{name}={value}"));
        }

        let image = match &request.submission {
            Submission::CustomImage { docker_image } => docker_image.clone(),
            _ => self.catalog.resolve(&request.runtime).image.to_owned(),
        };
        argv.push(image);

        if let Some(script) = self.shell_script(request) {
            argv.push("/bin/sh".to_owned());
            argv.push("-c".to_owned());
            argv.push(script);
        }

        argv
    }

    /// The in-container command sequence, or `None` to use the image
    /// entrypoint.
    fn shell_script(&self, request: &JobRequest) -> Option<String> {
        let profile = self.catalog.resolve(&request.runtime);
        let build_cmd = request
            .build_cmd
            .clone()
            .filter(|cmd| !cmd.trim().is_empty());

        let mut parts: Vec<String> = Vec::new();
        match &request.submission {
            Submission::GitRepo { git_link } => {
                parts.push(format!("git clone {git_link} ."));
                if let Some(dir) = request
                    .start_directory
                    .as_ref()
                    .filter(|dir| !dir.trim().is_empty())
                {
                    parts.push(format!("cd {dir}"));
                }
                parts.extend(request.initial_cmds.iter().cloned());
                parts.push(build_cmd.unwrap_or_else(|| profile.default_build_cmd.to_owned()));
            }
            Submission::RawCode { .. } => {
                parts.extend(request.initial_cmds.iter().cloned());
                if let Some(install) = profile.install_command(&request.dependencies) {
                    parts.push(install);
                }
                parts.push(build_cmd.unwrap_or_else(|| profile.default_build_cmd.to_owned()));
            }
            Submission::CustomImage { .. } => {
                // Only an explicit build command overrides the entrypoint.
                parts.extend(build_cmd.into_iter());
            }
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" && "))
        }
    }

    async fn kill_container(&self, name: &str) {
        self.runtime_command(&["kill", name]).await;
    }

    async fn remove_container(&self, name: &str) {
        self.runtime_command(&["rm", "-f", name]).await;
    }

    /// Best-effort runtime maintenance command. Failures (usually "no such
    /// container") are logged and swallowed.
    async fn runtime_command(&self, args: &[&str]) {
        match Command::new(&self.settings.runtime_bin)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => debug!(
                "container runtime {} {:?} exited with {}",
                self.settings.runtime_bin, args, status
            ),
            Err(err) => warn!(
                "failed to run container runtime {} {:?}: {}",
                self.settings.runtime_bin, args, err
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{ResourceGovernor, ResourceLimits};
    use std::path::PathBuf;
    use chrono::Utc;
    use codebox_common::job::MemoryLimit;
    use codebox_common::pubsub::MockPubSub;
    use codebox_common::store::MemoryJobStore;
    use std::collections::HashMap;

    fn request(submission: Submission, runtime: &str) -> JobRequest {
        JobRequest {
            submission,
            runtime: runtime.to_owned(),
            dependencies: vec![],
            start_directory: None,
            initial_cmds: vec![],
            build_cmd: None,
            env: HashMap::new(),
            memory_limit: MemoryLimit::from_megabytes(256),
            timeout_ms: 60_000,
            max_attempts: None,
            submitted_at: Utc::now(),
        }
    }

    fn raw_code(runtime: &str) -> JobRequest {
        request(
            Submission::RawCode {
                raw_code: "print('hi')".to_owned(),
            },
            runtime,
        )
    }

    struct Harness {
        executor: ContainerExecutor,
        store: MemoryJobStore,
        workspaces: WorkspaceManager,
    }

    fn harness(runtime_bin: &str) -> Harness {
        let store = MemoryJobStore::new();
        let pubsub = MockPubSub::new();
        let logs = Arc::new(LogMultiplexer::new(
            Arc::new(store.clone()),
            Arc::new(pubsub),
            1000,
        ));
        let workspaces = WorkspaceManager::new(
            std::env::temp_dir().join(format!("codebox-exec-test-{}", Uuid::now_v7())),
        );
        let executor = ContainerExecutor::new(
            ExecutorSettings {
                runtime_bin: runtime_bin.to_owned(),
                name_prefix: "codebox".to_owned(),
                network_host: false,
            },
            RuntimeCatalog::default(),
            workspaces.clone(),
            logs,
        );
        Harness {
            executor,
            store,
            workspaces,
        }
    }

    /// A stand-in for the container runtime: `run` executes any trailing
    /// `/bin/sh -c` script locally, `kill`/`rm` succeed silently.
    async fn fake_runtime() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("codebox-fake-runtime-{}", Uuid::now_v7()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("fake-docker");
        let script = concat!(
            "#!/bin/sh\n",
            "cmd=\"$1\"\n",
            "shift\n",
            "if [ \"$cmd\" != run ]; then exit 0; fi\n",
            "script=\"\"\n",
            "while [ \"$#\" -gt 0 ]; do\n",
            "    if [ \"$1\" = -c ]; then shift; script=\"$1\"; fi\n",
            "    shift\n",
            "done\n",
            "if [ -n \"$script\" ]; then exec /bin/sh -c \"$script\"; fi\n",
            "exit 0\n",
        );
        tokio::fs::write(&path, script).await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    fn permit(governor: &std::sync::Arc<ResourceGovernor>) -> AdmissionPermit {
        governor.try_admit().expect("admission denied in test")
    }

    fn governor() -> std::sync::Arc<ResourceGovernor> {
        ResourceGovernor::new(ResourceLimits {
            max_concurrent: 2,
            memory_per_container_mb: 256,
            total_memory_mb: 8192,
            memory_threshold: 0.8,
        })
    }

    #[test]
    fn test_invocation_for_raw_code() {
        let h = harness("docker");
        let job_id = Uuid::now_v7();
        let mut request = raw_code("python");
        request.env.insert("B_VAR".to_owned(), "2".to_owned());
        request.env.insert("A_VAR".to_owned(), "1".to_owned());

        let argv = h
            .executor
            .invocation(job_id, &request, Path::new("/tmp/ws"));

        assert_eq!(
            &argv[..6],
            &[
                "docker".to_owned(),
                "run".to_owned(),
                "--rm".to_owned(),
                "--name".to_owned(),
                format!("codebox-{job_id}"),
                "--memory=256m".to_owned(),
            ]
        );
        assert!(argv.contains(&"--workdir=/app".to_owned()));
        assert!(argv.contains(&"/tmp/ws:/app".to_owned()));

        // Env flags are passed individually and sorted by name.
        let a_pos = argv.iter().position(|a| a == "A_VAR=1").unwrap();
        let b_pos = argv.iter().position(|a| a == "B_VAR=2").unwrap();
        assert!(a_pos < b_pos);
        assert_eq!(argv[a_pos - 1], "-e");

        assert!(argv.contains(&"python:3.11-slim".to_owned()));
        assert_eq!(argv[argv.len() - 3], "/bin/sh");
        assert_eq!(argv[argv.len() - 2], "-c");
        assert_eq!(argv[argv.len() - 1], "python main.py");
    }

    #[test]
    fn test_invocation_for_git_repo_chains_commands() {
        let h = harness("docker");
        let mut request = request(
            Submission::GitRepo {
                git_link: "https://example.com/repo.git".to_owned(),
            },
            "nodejs",
        );
        request.start_directory = Some("service".to_owned());
        request.initial_cmds = vec!["npm ci".to_owned()];
        request.build_cmd = Some("npm start".to_owned());

        let argv = h
            .executor
            .invocation(Uuid::now_v7(), &request, Path::new("/tmp/ws"));
        assert_eq!(
            argv[argv.len() - 1],
            "git clone https://example.com/repo.git . && cd service && npm ci && npm start"
        );
    }

    #[test]
    fn test_invocation_for_custom_image_uses_entrypoint() {
        let h = harness("docker");
        let request = request(
            Submission::CustomImage {
                docker_image: "ghcr.io/acme/batch:v3".to_owned(),
            },
            "nodejs",
        );

        let argv = h
            .executor
            .invocation(Uuid::now_v7(), &request, Path::new("/tmp/ws"));
        // No shell wrapper: the image entrypoint runs as-is.
        assert_eq!(argv[argv.len() - 1], "ghcr.io/acme/batch:v3");
    }

    #[test]
    fn test_raw_code_script_installs_dependencies_first() {
        let h = harness("docker");
        let mut request = raw_code("nodejs");
        request.dependencies = vec!["express".to_owned()];

        let argv = h
            .executor
            .invocation(Uuid::now_v7(), &request, Path::new("/tmp/ws"));
        assert_eq!(
            argv[argv.len() - 1],
            "npm install express && node index.js"
        );
    }

    #[tokio::test]
    async fn test_staging_writes_source_and_manifest() {
        let h = harness("docker");
        let job_id = Uuid::now_v7();
        let mut request = raw_code("nodejs");
        request.dependencies = vec!["express".to_owned()];

        let workspace = h.workspaces.allocate(job_id).await.unwrap();
        h.executor
            .stage_workspace(&request, &workspace)
            .await
            .unwrap();

        let source = tokio::fs::read_to_string(workspace.join("index.js"))
            .await
            .expect("source file missing");
        assert_eq!(source, "print('hi')");

        let manifest = tokio::fs::read_to_string(workspace.join("package.json"))
            .await
            .expect("manifest missing");
        let manifest: serde_json::Value = serde_json::from_str(&manifest).unwrap();
        assert_eq!(manifest["dependencies"]["express"], "*");

        h.workspaces.remove(job_id).await;
    }

    #[tokio::test]
    async fn test_execute_captures_output_and_succeeds() {
        let runtime = fake_runtime().await;
        let h = harness(runtime.to_str().unwrap());
        let governor = governor();
        let job_id = Uuid::now_v7();
        let mut request = raw_code("bash");
        request.build_cmd = Some("echo hi && echo oops 1>&2".to_owned());

        let report = h
            .executor
            .execute(job_id, &request, permit(&governor), CancellationToken::new())
            .await
            .expect("execution failed");

        assert_eq!(report.status, ExecStatus::Success);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(governor.active_containers(), 0);
        assert!(!h.workspaces.path_for(job_id).exists());

        h.executor.logs.flush(job_id).await;
        let logs = h.store.logs();
        assert!(logs
            .iter()
            .any(|r| r.kind == StreamKind::Stdout && r.content == "hi"));
        assert!(logs
            .iter()
            .any(|r| r.kind == StreamKind::Stderr && r.content == "oops"));
    }

    #[tokio::test]
    async fn test_execute_preserves_nonzero_exit_codes() {
        let runtime = fake_runtime().await;
        let h = harness(runtime.to_str().unwrap());
        let governor = governor();
        let mut request = raw_code("bash");
        request.build_cmd = Some("exit 3".to_owned());

        let report = h
            .executor
            .execute(
                Uuid::now_v7(),
                &request,
                permit(&governor),
                CancellationToken::new(),
            )
            .await
            .expect("execution failed");

        assert_eq!(report.status, ExecStatus::Error);
        assert_eq!(report.exit_code, Some(3));
        assert_eq!(governor.active_containers(), 0);
    }

    #[tokio::test]
    async fn test_execute_enforces_the_timeout() {
        let runtime = fake_runtime().await;
        let h = harness(runtime.to_str().unwrap());
        let governor = governor();
        let job_id = Uuid::now_v7();
        let mut request = raw_code("bash");
        request.build_cmd = Some("sleep 30".to_owned());
        request.timeout_ms = 300;

        let started = std::time::Instant::now();
        let report = h
            .executor
            .execute(job_id, &request, permit(&governor), CancellationToken::new())
            .await
            .expect("execution failed");

        assert_eq!(report.status, ExecStatus::Timeout);
        assert_eq!(report.error.as_deref(), Some("timeout"));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert_eq!(governor.active_containers(), 0);
        assert!(!h.workspaces.path_for(job_id).exists());
    }

    #[tokio::test]
    async fn test_execute_honors_cancellation() {
        let runtime = fake_runtime().await;
        let h = harness(runtime.to_str().unwrap());
        let governor = governor();
        let mut request = raw_code("bash");
        request.build_cmd = Some("sleep 30".to_owned());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let report = h
            .executor
            .execute(Uuid::now_v7(), &request, permit(&governor), cancel)
            .await
            .expect("execution failed");

        assert_eq!(report.status, ExecStatus::Killed);
        assert_eq!(report.error.as_deref(), Some("cancelled"));
    }
}
