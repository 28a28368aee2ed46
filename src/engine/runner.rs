//! Running stages as external processes.
//!
//! `StageRunner` is the seam between the orchestrator and the outside world: the
//! production `ProcessRunner` spawns programs through `sh -c`, while `ScriptedRunner`
//! fakes tools in-process for tests.

use std::collections::HashMap;
use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{Signal, killpg};
#[cfg(unix)]
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::logging::LogBroker;
use crate::{PipelineError, PipelineResult};

use super::toolchain::Stage;

/// Exit status the POSIX shell reports when it cannot find or execute a command.
const SHELL_NOT_FOUND: i32 = 127;
const SHELL_NOT_EXECUTABLE: i32 = 126;

/// How much of a failing stage's stderr is kept for the error.
const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// Executes one stage to completion.
pub trait StageRunner: Send + Sync {
    /// Run `stage` in `cwd`, relaying output for `request_id` when given.
    ///
    /// Resolves on exit status 0. Fails with `StageFailure`, `StageTimeout` or
    /// `LaunchFailure` otherwise. Never retries.
    fn run(
        &self,
        stage: &Stage,
        cwd: &Path,
        request_id: Option<&str>,
    ) -> impl Future<Output = PipelineResult<()>> + Send;
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Spawns stages as child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    broker: Arc<LogBroker>,
    search_paths: Vec<PathBuf>,
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(broker: Arc<LogBroker>) -> Self {
        ProcessRunner {
            broker,
            search_paths: Vec::new(),
            timeout: None,
        }
    }

    /// Directories appended to `PATH` for every child.
    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = paths;
        self
    }

    /// Kill a stage that runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn path_env(&self) -> OsString {
        let current = std::env::var_os("PATH").unwrap_or_default();
        let joined = std::env::split_paths(&current).chain(self.search_paths.iter().cloned());
        match std::env::join_paths(joined) {
            Ok(path) => path,
            Err(e) => {
                warn!("ignoring toolchain search paths: {e}");
                current
            }
        }
    }

    fn relay(&self, request_id: Option<&str>, message: impl Into<String>) {
        if let Some(id) = request_id {
            self.broker.relay(id, message);
        }
    }

    fn emit(&self, program: &str, request_id: Option<&str>, stream: Stream, line: &str) {
        match stream {
            Stream::Stdout => {
                info!(program, "stdout: {line}");
                self.relay(request_id, format!("[stdout] {line}"));
            }
            Stream::Stderr => {
                warn!(program, "stderr: {line}");
                self.relay(request_id, format!("[stderr] {line}"));
            }
        }
    }

    async fn run_process(
        &self,
        stage: &Stage,
        cwd: &Path,
        request_id: Option<&str>,
    ) -> PipelineResult<()> {
        let program = stage.display_name();
        let command_line = stage.command_line()?;
        info!(program, cwd = %cwd.display(), "running {command_line}");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("exec {command_line}"))
            .current_dir(cwd)
            .env("PATH", self.path_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            self.relay(request_id, format!("[{program}] error: {e}"));
            PipelineError::LaunchFailure {
                program: program.to_string(),
                reason: e.to_string(),
            }
        })?;
        // Declared after `child` so the group is signalled before the child handle drops.
        let mut group = ProcessGroup::of(child.id());

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(PipelineError::Message(format!(
                "[{program}] output pipes unavailable"
            )));
        };
        let mut out_lines = BufReader::new(stdout).split(b'\n');
        let mut err_lines = BufReader::new(stderr).split(b'\n');
        let mut stderr_log = String::new();

        let capture = async {
            let (mut out_done, mut err_done) = (false, false);
            while !(out_done && err_done) {
                tokio::select! {
                    line = out_lines.next_segment(), if !out_done => match line {
                        Ok(Some(bytes)) => {
                            let line = decode_line(&bytes);
                            self.emit(program, request_id, Stream::Stdout, &line);
                        }
                        Ok(None) => out_done = true,
                        Err(e) => {
                            debug!(program, "stdout closed: {e}");
                            out_done = true;
                        }
                    },
                    line = err_lines.next_segment(), if !err_done => match line {
                        Ok(Some(bytes)) => {
                            let line = decode_line(&bytes);
                            self.emit(program, request_id, Stream::Stderr, &line);
                            keep_tail(&mut stderr_log, &line);
                        }
                        Ok(None) => err_done = true,
                        Err(e) => {
                            debug!(program, "stderr closed: {e}");
                            err_done = true;
                        }
                    },
                }
            }
            child.wait().await
        };

        let waited = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, capture).await,
            None => Ok(capture.await),
        };

        let status = match waited {
            Ok(status) => {
                group.release();
                status?
            }
            Err(_) => {
                group.kill();
                let _ = child.kill().await;
                let limit = self.timeout.unwrap_or_default();
                warn!(program, ?limit, "stage timed out");
                self.relay(request_id, format!("[{program}] timed out after {limit:?}"));
                return Err(PipelineError::StageTimeout {
                    program: program.to_string(),
                    limit,
                });
            }
        };

        if status.success() {
            info!(program, "completed successfully");
            self.relay(request_id, format!("[{program}] Completed successfully"));
            return Ok(());
        }

        let code = status.code().unwrap_or(-1);
        self.relay(request_id, format!("[{program}] Failed with code {code}"));
        if code == SHELL_NOT_FOUND || code == SHELL_NOT_EXECUTABLE {
            return Err(PipelineError::LaunchFailure {
                program: program.to_string(),
                reason: stderr_log.trim().to_string(),
            });
        }
        Err(PipelineError::StageFailure {
            program: program.to_string(),
            code,
            stderr: stderr_log,
        })
    }
}

/// Append a stderr line, keeping only the last `STDERR_TAIL_BYTES` of the log.
fn keep_tail(log: &mut String, line: &str) {
    log.push_str(line);
    log.push('\n');
    if log.len() > STDERR_TAIL_BYTES {
        let mut cut = log.len() - STDERR_TAIL_BYTES;
        while !log.is_char_boundary(cut) {
            cut += 1;
        }
        log.drain(..cut);
    }
}

/// The process group a stage runs in. Every member is killed on drop unless released.
///
/// `sh -c` may fork the tool instead of replacing itself, so signalling only the
/// shell would leave the tool running.
struct ProcessGroup {
    #[cfg(unix)]
    leader: Option<Pid>,
}

impl ProcessGroup {
    #[cfg(unix)]
    fn of(leader: Option<u32>) -> Self {
        ProcessGroup {
            leader: leader
                .and_then(|pid| i32::try_from(pid).ok())
                .map(Pid::from_raw),
        }
    }

    #[cfg(not(unix))]
    fn of(_leader: Option<u32>) -> Self {
        ProcessGroup {}
    }

    /// The leader exited and was reaped; nothing left to signal.
    fn release(&mut self) {
        #[cfg(unix)]
        {
            self.leader = None;
        }
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pgid) = self.leader.take() {
                match killpg(pgid, Signal::SIGKILL) {
                    Ok(()) => debug!(%pgid, "process group killed"),
                    Err(Errno::ESRCH) => {}
                    Err(e) => warn!(%pgid, "failed to kill process group: {e}"),
                }
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end_matches('\r').to_string()
}

impl StageRunner for ProcessRunner {
    async fn run(
        &self,
        stage: &Stage,
        cwd: &Path,
        request_id: Option<&str>,
    ) -> PipelineResult<()> {
        self.run_process(stage, cwd, request_id).await
    }
}

/// Behaviour of a faked stage: inspect the stage and its working directory, write files, or fail.
pub type StageScript = Arc<dyn Fn(&Stage, &Path) -> PipelineResult<()> + Send + Sync>;

/// In-process runner that records invocations and fakes tools by label (`nargo compile`).
///
/// Stages without a script succeed without side effects.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    broker: Option<Arc<LogBroker>>,
    scripts: HashMap<String, StageScript>,
    calls: Arc<Mutex<Vec<Stage>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay completion lines like the process runner does.
    pub fn with_broker(mut self, broker: Arc<LogBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Script the stage with the given label.
    pub fn on<F>(mut self, label: &str, script: F) -> Self
    where
        F: Fn(&Stage, &Path) -> PipelineResult<()> + Send + Sync + 'static,
    {
        self.scripts.insert(label.to_string(), Arc::new(script));
        self
    }

    /// Make the stage with the given label exit with `code`.
    pub fn failing(self, label: &str, code: i32) -> Self {
        self.on(label, move |stage, _| {
            Err(PipelineError::StageFailure {
                program: stage.display_name().to_string(),
                code,
                stderr: format!("{} failed\n", stage.label()),
            })
        })
    }

    /// Fake nargo, bb, noir-profiler and garaga by writing the files they would produce.
    pub fn noir_toolchain() -> Self {
        fn write(root: &Path, rel: &str, contents: &[u8]) -> PipelineResult<()> {
            let path = root.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, contents)?;
            Ok(())
        }
        fn output_arg(stage: &Stage) -> Option<&str> {
            let pos = stage.args.iter().position(|a| a == "--output" || a == "-o")?;
            stage.args.get(pos + 1).map(String::as_str)
        }

        ScriptedRunner::new()
            .on("nargo compile", |_, root| {
                write(root, "target/main.json", br#"{"noir_version":"1.0.0","bytecode":"H4sI"}"#)
            })
            .on("nargo check", |_, root| {
                if root.join("Prover.toml").exists() {
                    return Ok(());
                }
                write(root, "Prover.toml", b"x = \"\"\ny = \"\"\n")
            })
            .on("nargo execute", |_, root| {
                write(root, "target/main.json", br#"{"noir_version":"1.0.0","bytecode":"H4sI"}"#)?;
                write(root, "target/main.gz", &[0x1f, 0x8b, 0x08, 0x00])
            })
            .on("bb prove", |stage, root| {
                let out = output_arg(stage).unwrap_or("target");
                write(root, &format!("{out}/proof"), &[0x00, 0xff, 0x10, 0x80])
            })
            .on("bb write_vk", |stage, root| {
                let out = output_arg(stage).unwrap_or("target");
                write(root, &format!("{out}/vk"), &[0xde, 0xad, 0xbe, 0xef])
            })
            .on("bb write_solidity_verifier", |stage, root| {
                let out = output_arg(stage).unwrap_or("target/Verifier.sol");
                write(root, out, b"// SPDX-License-Identifier: Apache-2.0\ncontract HonkVerifier {}\n")
            })
            .on("garaga gen", |_, root| {
                write(root, "verifier/Scarb.toml", b"[package]\nname = \"verifier\"\n")?;
                write(root, "verifier/src/lib.cairo", b"mod honk_verifier;\n")?;
                write(root, "verifier/src/honk_verifier.cairo", b"// verifier\n")
            })
            .on("noir-profiler opcodes", |stage, root| {
                let out = output_arg(stage).unwrap_or("target/profiler/opcodes");
                write(root, &format!("{out}/main_opcodes.svg"), b"<svg/>")
            })
            .on("noir-profiler gates", |stage, root| {
                let out = output_arg(stage).unwrap_or("target/profiler/gates");
                write(root, &format!("{out}/main_gates.svg"), b"<svg/>")
            })
            .on("noir-profiler execution-opcodes", |stage, root| {
                let out = output_arg(stage).unwrap_or("target/profiler/execution-opcodes");
                write(root, &format!("{out}/main_execution_opcodes.svg"), b"<svg/>")
            })
    }

    /// Stages run so far, in order, with placeholders already resolved.
    pub fn calls(&self) -> Vec<Stage> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Labels of the stages run so far.
    pub fn labels(&self) -> Vec<String> {
        self.calls().iter().map(Stage::label).collect()
    }
}

impl StageRunner for ScriptedRunner {
    async fn run(
        &self,
        stage: &Stage,
        cwd: &Path,
        request_id: Option<&str>,
    ) -> PipelineResult<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(stage.clone());
        }
        let result = match self.scripts.get(&stage.label()) {
            Some(script) => script(stage, cwd),
            None => Ok(()),
        };
        if let (Some(broker), Some(id)) = (&self.broker, request_id) {
            let program = stage.display_name();
            match &result {
                Ok(()) => broker.relay(id, format!("[{program}] Completed successfully")),
                Err(e) => broker.relay(
                    id,
                    format!("[{program}] Failed with code {}", e.exit_code().unwrap_or(-1)),
                ),
            }
        }
        result
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn collect(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn relays_stdout_and_completion() {
        let broker = Arc::new(LogBroker::new());
        let (ch, mut rx) = broker.open_channel();
        broker.bind("req", ch);
        let runner = ProcessRunner::new(broker.clone());
        let dir = tempdir().unwrap();

        runner
            .run(&Stage::new("echo", ["hello world"]), dir.path(), Some("req"))
            .await
            .unwrap();

        let lines = collect(&mut rx);
        assert_eq!(
            lines,
            vec!["[stdout] hello world", "[echo] Completed successfully"]
        );
    }

    #[tokio::test]
    async fn non_zero_exit_reports_code_and_stderr() {
        let broker = Arc::new(LogBroker::new());
        let runner = ProcessRunner::new(broker);
        let dir = tempdir().unwrap();

        let stage = Stage::new("sh", ["-c", "echo boom >&2; exit 3"]);
        let err = runner.run(&stage, dir.path(), None).await.unwrap_err();
        match err {
            PipelineError::StageFailure { program, code, stderr } => {
                assert_eq!(program, "sh");
                assert_eq!(code, 3);
                assert_eq!(stderr, "boom\n");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_failure() {
        let runner = ProcessRunner::new(Arc::new(LogBroker::new()));
        let dir = tempdir().unwrap();
        let err = runner
            .run(&Stage::new("definitely-not-a-real-tool-xyz", ["compile"]), dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::LaunchFailure { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn missing_working_dir_is_a_launch_failure() {
        let runner = ProcessRunner::new(Arc::new(LogBroker::new()));
        let dir = tempdir().unwrap();
        let err = runner
            .run(&Stage::new("true", Vec::<String>::new()), &dir.path().join("gone"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::LaunchFailure { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn runs_in_working_dir() {
        let runner = ProcessRunner::new(Arc::new(LogBroker::new()));
        let dir = tempdir().unwrap();
        runner
            .run(&Stage::new("touch", ["marker"]), dir.path(), None)
            .await
            .unwrap();
        assert!(dir.path().join("marker").exists());
    }

    /// Live and not a zombie.
    #[cfg(target_os = "linux")]
    fn process_alive(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .is_some_and(|(_, rest)| !rest.starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_until_gone(pid: &str) -> bool {
        for _ in 0..40 {
            if !process_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    /// A shell that keeps the tool as a child, the way `sh -c` does for compound commands.
    #[cfg(target_os = "linux")]
    fn forking_stage() -> Stage {
        Stage::new("sh", ["-c", "sleep 47.5 & echo $! > tool.pid; wait"])
    }

    #[cfg(target_os = "linux")]
    async fn tool_pid(dir: &Path) -> String {
        for _ in 0..40 {
            if let Ok(pid) = std::fs::read_to_string(dir.join("tool.pid")) {
                if !pid.trim().is_empty() {
                    return pid.trim().to_string();
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("tool never started");
    }

    #[tokio::test]
    async fn slow_stage_times_out() {
        let broker = Arc::new(LogBroker::new());
        let (ch, mut rx) = broker.open_channel();
        broker.bind("req", ch);
        let runner = ProcessRunner::new(broker.clone())
            .with_timeout(Some(Duration::from_millis(200)));
        let dir = tempdir().unwrap();
        let err = runner
            .run(&Stage::new("sleep", ["5"]), dir.path(), Some("req"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StageTimeout { .. }), "{err:?}");
        assert_eq!(err.to_string(), "[sleep] timed out after 200ms");
        assert!(collect(&mut rx).contains(&"[sleep] timed out after 200ms".to_string()));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_tools_forked_by_the_stage() {
        let runner = ProcessRunner::new(Arc::new(LogBroker::new()))
            .with_timeout(Some(Duration::from_millis(300)));
        let dir = tempdir().unwrap();
        let err = runner
            .run(&forking_stage(), dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StageTimeout { .. }), "{err:?}");

        let pid = tool_pid(dir.path()).await;
        assert!(wait_until_gone(&pid).await, "sleep {pid} outlived the timeout");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropped_stage_kills_its_tools() {
        let runner = ProcessRunner::new(Arc::new(LogBroker::new()));
        let dir = tempdir().unwrap();
        let stage = forking_stage();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(300),
            runner.run(&stage, dir.path(), None),
        )
        .await;
        assert!(cancelled.is_err(), "stage should still be running");

        let pid = tool_pid(dir.path()).await;
        assert!(wait_until_gone(&pid).await, "sleep {pid} outlived its job");
    }

    #[test]
    fn stderr_log_keeps_only_the_tail() {
        let mut log = String::new();
        let line = "é".repeat(1000);
        for _ in 0..100 {
            keep_tail(&mut log, &line);
        }
        assert!(log.len() <= STDERR_TAIL_BYTES);
        assert!(log.len() > STDERR_TAIL_BYTES - 4);
        assert!(log.ends_with(&format!("{line}\n")));
    }

    #[tokio::test]
    async fn search_paths_are_appended() {
        let broker = Arc::new(LogBroker::new());
        let (ch, mut rx) = broker.open_channel();
        broker.bind("req", ch);
        let runner = ProcessRunner::new(broker.clone())
            .with_search_paths(vec![PathBuf::from("/opt/extra-tools/bin")]);
        let dir = tempdir().unwrap();

        runner
            .run(&Stage::new("printenv", ["PATH"]), dir.path(), Some("req"))
            .await
            .unwrap();
        let lines = collect(&mut rx);
        assert!(lines[0].ends_with(":/opt/extra-tools/bin"), "{lines:?}");
    }

    #[tokio::test]
    async fn scripted_runner_records_calls() {
        let runner = ScriptedRunner::new().failing("bb prove", 2);
        let dir = tempdir().unwrap();
        runner
            .run(&Stage::new("nargo", ["execute"]), dir.path(), None)
            .await
            .unwrap();
        let err = runner
            .run(&Stage::new("bb", ["prove"]), dir.path(), None)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(2));
        assert_eq!(runner.labels(), vec!["nargo execute", "bb prove"]);
    }
}
