//! Shared subprocess machinery for external miners.
//!
//! Each instance exclusively owns one child process. Mutation of the
//! process state is serialized by the instance's own lock; nothing here
//! holds that lock across process or network waits.

use crate::history::HashrateHistory;
use crate::logbuf::LogBuffer;
use crate::{MinerError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// SIGTERM grace period before force kill.
pub const GRACE_PERIOD: Duration = Duration::from_secs(3);
/// Stdin write deadline; a blocked pipe means the miner is wedged.
pub const STDIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on awaiting a killed process before giving up on the wait.
const WAIT_FALLBACK: Duration = Duration::from_secs(5 * 60);
/// Exit-waiter poll cadence.
const WAITER_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Host/port the miner's HTTP API listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
    pub enabled: bool,
}

impl Default for ApiEndpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            enabled: false,
        }
    }
}

pub struct ProcState {
    pub state: MinerState,
    pub name: String,
    pub version: Option<String>,
    pub binary_path: Option<PathBuf>,
    pub api: ApiEndpoint,
    pub child: Option<Child>,
}

/// State shared by the subprocess-backed miner variants. The `state`
/// mutex serializes lifecycle mutation; stdin has its own async lock so
/// writes can await without blocking lifecycle readers.
pub struct ProcessCore {
    pub kind: &'static str,
    pub state: Mutex<ProcState>,
    pub stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pub logs: Arc<LogBuffer>,
    pub history: Arc<HashrateHistory>,
    pub echo_console: bool,
}

impl ProcessCore {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            state: Mutex::new(ProcState {
                state: MinerState::Stopped,
                name: String::new(),
                version: None,
                binary_path: None,
                api: ApiEndpoint::default(),
                child: None,
            }),
            stdin: tokio::sync::Mutex::new(None),
            logs: Arc::new(LogBuffer::default()),
            history: Arc::new(HashrateHistory::new()),
            echo_console: false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProcState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.lock().name = name.to_string();
    }

    pub fn version(&self) -> Option<String> {
        self.lock().version.clone()
    }

    pub fn binary_path(&self) -> Option<PathBuf> {
        self.lock().binary_path.clone()
    }

    pub fn api(&self) -> ApiEndpoint {
        self.lock().api.clone()
    }

    pub fn set_api_port(&self, port: u16) {
        self.lock().api.port = port;
    }

    pub fn is_running(&self) -> bool {
        self.lock().state == MinerState::Running
    }

    /// Claim the start transition. Fails when a start or run is in flight.
    pub fn begin_start(&self) -> Result<()> {
        let mut st = self.lock();
        match st.state {
            MinerState::Starting | MinerState::Running => Err(MinerError::AlreadyRunning),
            _ => {
                st.state = MinerState::Starting;
                Ok(())
            }
        }
    }

    pub fn fail_start(&self) {
        self.lock().state = MinerState::Error;
    }

    /// Store the spawned child and flip to running.
    pub async fn commit_start(
        &self,
        child: Child,
        stdin: ChildStdin,
        binary: PathBuf,
        version: Option<String>,
    ) {
        *self.stdin.lock().await = Some(stdin);
        let mut st = self.lock();
        st.child = Some(child);
        st.binary_path = Some(binary);
        if version.is_some() {
            st.version = version;
        }
        st.state = MinerState::Running;
    }

    /// Spawn `binary` with `args`, duplexing stdout and stderr into the log
    /// buffer (and optionally the host console).
    pub fn spawn_logged(&self, binary: &Path, args: &[String]) -> Result<(Child, ChildStdin)> {
        info!("{}: launching {:?} {:?}", self.kind, binary, args);
        let mut cmd = Command::new(binary);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| MinerError::StartFailed(format!("spawn {:?}: {}", binary, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MinerError::StartFailed("no stdin pipe".into()))?;

        if let Some(stdout) = child.stdout.take() {
            pump_output(stdout, self.logs.clone(), self.echo_console);
        }
        if let Some(stderr) = child.stderr.take() {
            pump_output(stderr, self.logs.clone(), self.echo_console);
        }
        Ok((child, stdin))
    }

    /// Watch for the child exiting on its own (crash, external kill) and
    /// clear the running flag under the instance lock when it does.
    pub fn spawn_waiter(self: &Arc<Self>) {
        let core = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(WAITER_POLL).await;
                let mut st = core.lock();
                match st.child.as_mut() {
                    // stop() took ownership of the handle; nothing to watch.
                    None => break,
                    Some(child) => match child.try_wait() {
                        Ok(None) => {}
                        Ok(Some(status)) => {
                            info!("{} '{}' exited with {}", core.kind, st.name, status);
                            st.child = None;
                            st.state = MinerState::Stopped;
                            break;
                        }
                        Err(e) => {
                            warn!("{} '{}': wait failed: {}", core.kind, st.name, e);
                            st.child = None;
                            st.state = MinerState::Error;
                            break;
                        }
                    },
                }
            }
            let mut stdin = core.stdin.lock().await;
            stdin.take();
        });
    }

    /// Stop the child: close stdin, graceful terminate, force kill after the
    /// grace period. The running flag and handle are cleared before the wait
    /// so a concurrent stop observes "not running" instead of racing.
    pub async fn stop(&self) -> Result<()> {
        let child = {
            let mut st = self.lock();
            let child = st.child.take();
            if child.is_none() && st.state != MinerState::Running {
                st.state = MinerState::Stopped;
                return Err(MinerError::NotRunning);
            }
            st.state = MinerState::Stopped;
            child
        };

        // Closing stdin precedes termination; some miners exit on EOF.
        self.stdin.lock().await.take();

        let Some(mut child) = child else {
            return Err(MinerError::NotRunning);
        };

        terminate(&child);
        match timeout(GRACE_PERIOD, child.wait()).await {
            Ok(Ok(status)) => {
                info!("{} stopped gracefully with status: {}", self.kind, status);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("{}: error waiting for exit: {}", self.kind, e);
                Err(MinerError::StopFailed(e.to_string()))
            }
            Err(_) => {
                warn!(
                    "{} did not stop within {:?}, force killing",
                    self.kind, GRACE_PERIOD
                );
                let _ = child.kill().await;
                match timeout(WAIT_FALLBACK, child.wait()).await {
                    Ok(_) => Ok(()),
                    Err(_) => Err(MinerError::StopFailed(
                        "process did not exit after kill".into(),
                    )),
                }
            }
        }
    }

    /// Write one line to the miner's stdin, appending `\n` when missing.
    pub async fn write_stdin(&self, line: &str) -> Result<()> {
        let mut buf = line.to_string();
        if !buf.ends_with('\n') {
            buf.push('\n');
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(MinerError::NotRunning)?;
        let write = async {
            stdin.write_all(buf.as_bytes()).await?;
            stdin.flush().await
        };
        match timeout(STDIN_TIMEOUT, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MinerError::Io(e)),
            Err(_) => Err(MinerError::Unresponsive),
        }
    }
}

fn pump_output<R>(reader: R, logs: Arc<LogBuffer>, echo: bool)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if echo {
                        print!("{}", String::from_utf8_lossy(&buf[..n]));
                    }
                    logs.write_chunk(&buf[..n]);
                }
            }
        }
    });
}

fn terminate(child: &Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            debug!("sending SIGTERM to pid {}", pid);
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child;
    }
}

/// Locate the miner binary: versioned install directories first (highest
/// version wins), then the system PATH. The error names every directory
/// searched.
pub fn find_binary(kind: &str, bin_name: &str, install_base: &Path) -> Result<(PathBuf, Option<String>)> {
    let mut searched: Vec<String> = Vec::new();
    let mut candidates: Vec<(Vec<u64>, PathBuf)> = Vec::new();

    if install_base.is_dir() {
        if let Ok(entries) = std::fs::read_dir(install_base) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let dir_name = entry.file_name().to_string_lossy().into_owned();
                let Some(version) = dir_name.strip_prefix(&format!("{}-", kind)) else {
                    continue;
                };
                searched.push(path.display().to_string());
                let bin = path.join(bin_name);
                if bin.is_file() {
                    candidates.push((parse_version(version), bin));
                }
            }
        }
    } else {
        searched.push(install_base.display().to_string());
    }

    if let Some((version, bin)) = candidates.into_iter().max_by(|a, b| a.0.cmp(&b.0)).map(|c| (c.0, c.1)) {
        let version_str = version
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".");
        return Ok((bin, Some(version_str)));
    }

    // Fall back to PATH.
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let bin = dir.join(bin_name);
            if bin.is_file() {
                return Ok((bin, None));
            }
            searched.push(dir.display().to_string());
        }
    }

    Err(MinerError::NotInstalled {
        kind: kind.to_string(),
        searched,
    })
}

/// Lenient numeric version parse; non-numeric segments become 0 so that
/// "6.21.0" > "6.9.1" and odd tags still order stably.
fn parse_version(raw: &str) -> Vec<u64> {
    raw.trim_start_matches('v')
        .split(['.', '-'])
        .map(|seg| seg.parse::<u64>().unwrap_or(0))
        .collect()
}

/// Default install base: `<data_local>/openminerd/miners`.
pub fn install_base() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("openminerd")
        .join("miners")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering_prefers_highest() {
        assert!(parse_version("6.21.0") > parse_version("6.9.1"));
        assert!(parse_version("v2024.1.0") > parse_version("2023.9.9"));
    }

    #[test]
    fn find_binary_prefers_highest_version_dir() {
        let dir = tempfile::tempdir().unwrap();
        for v in ["6.9.1", "6.21.0"] {
            let d = dir.path().join(format!("xmrig-{}", v));
            std::fs::create_dir_all(&d).unwrap();
            std::fs::write(d.join("xmrig"), b"#!/bin/sh\n").unwrap();
        }
        let (bin, version) = find_binary("xmrig", "xmrig", dir.path()).unwrap();
        assert!(bin.ends_with("xmrig-6.21.0/xmrig"));
        assert_eq!(version.as_deref(), Some("6.21.0"));
    }

    #[test]
    fn find_binary_names_searched_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("xmrig-1.0.0")).unwrap();
        let old_path = std::env::var_os("PATH");
        std::env::set_var("PATH", dir.path());
        let err = find_binary("xmrig", "definitely-not-a-real-binary", dir.path()).unwrap_err();
        if let Some(p) = old_path {
            std::env::set_var("PATH", p);
        }
        match err {
            MinerError::NotInstalled { kind, searched } => {
                assert_eq!(kind, "xmrig");
                assert!(!searched.is_empty());
            }
            other => panic!("expected NotInstalled, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn begin_start_rejects_double_start() {
        let core = ProcessCore::new("xmrig");
        core.begin_start().unwrap();
        assert!(matches!(core.begin_start(), Err(MinerError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn stop_without_child_reports_not_running() {
        let core = ProcessCore::new("xmrig");
        assert!(matches!(core.stop().await, Err(MinerError::NotRunning)));
    }

    #[tokio::test]
    async fn write_stdin_without_pipe_reports_not_running() {
        let core = ProcessCore::new("xmrig");
        assert!(matches!(
            core.write_stdin("pause").await,
            Err(MinerError::NotRunning)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_stop_round_trip_with_real_process() {
        let core = Arc::new(ProcessCore::new("xmrig"));
        core.begin_start().unwrap();
        let (child, stdin) = core
            .spawn_logged(Path::new("/bin/cat"), &[] as &[String])
            .unwrap();
        core.commit_start(child, stdin, PathBuf::from("/bin/cat"), None)
            .await;
        core.spawn_waiter();
        assert!(core.is_running());
        core.write_stdin("hello\n").await.unwrap();
        core.stop().await.unwrap();
        assert!(!core.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn waiter_clears_state_when_process_dies() {
        let core = Arc::new(ProcessCore::new("xmrig"));
        core.begin_start().unwrap();
        let (child, stdin) = core
            .spawn_logged(Path::new("/bin/true"), &[] as &[String])
            .unwrap();
        core.commit_start(child, stdin, PathBuf::from("/bin/true"), None)
            .await;
        core.spawn_waiter();
        // /bin/true exits immediately; the waiter should notice.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!core.is_running());
        // A stop after external exit reports not running.
        assert!(matches!(core.stop().await, Err(MinerError::NotRunning)));
    }
}
