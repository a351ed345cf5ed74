use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use weft_core::{Result, WeftError};

use crate::protocol::{SidecarCommand, SidecarEvent, SidecarState, StartData, StatusData};

/// How the sidecar child is launched and joined to the overlay.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Path to the sidecar executable.
    pub binary: PathBuf,
    /// Hostname to advertise on the overlay (`{prefix}-{type}-{id}`).
    pub hostname: String,
    /// Directory the sidecar owns for its on-disk state.
    pub state_dir: PathBuf,
    pub auth_key: Option<String>,
    pub hostname_prefix: Option<String>,
    pub static_path: Option<PathBuf>,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
}

impl OverlayConfig {
    pub fn new(binary: impl Into<PathBuf>, hostname: impl Into<String>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            hostname: hostname.into(),
            state_dir: state_dir.into(),
            auth_key: None,
            hostname_prefix: None,
            static_path: None,
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Cloneable command channel into the sidecar's stdin.
#[derive(Clone)]
pub struct OverlayHandle {
    cmd_tx: mpsc::Sender<SidecarCommand>,
}

impl OverlayHandle {
    /// Build a detached handle plus the receiving end of its command
    /// channel. Used by harnesses that stand in for a real sidecar.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<SidecarCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        (Self { cmd_tx }, cmd_rx)
    }

    /// Queue a command, waiting for buffer space.
    pub async fn send(&self, cmd: SidecarCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| WeftError::Sidecar("sidecar command channel closed".into()))
    }

    /// Queue a command without waiting. Fails when the outbound buffer is
    /// full; callers on the data path treat that as a congested connection.
    pub fn try_send(&self, cmd: SidecarCommand) -> Result<()> {
        use mpsc::error::TrySendError;
        self.cmd_tx.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => WeftError::Sidecar("send buffer full".into()),
            TrySendError::Closed(_) => WeftError::Sidecar("sidecar command channel closed".into()),
        })
    }
}

/// Client for the overlay sidecar process.
///
/// Spawns the configured binary and speaks line-delimited JSON over its
/// stdin/stdout; stderr is piped into the log. `start()` resolves once the
/// sidecar reports `running`, fails after the startup window, and surfaces
/// partial authentication (`authRequired`) as an event rather than an error.
pub struct OverlayClient {
    config: OverlayConfig,
    child: Option<Child>,
    cmd_tx: Option<mpsc::Sender<SidecarCommand>>,
    status_rx: Option<watch::Receiver<StatusData>>,
    tasks: Vec<JoinHandle<()>>,
}

impl OverlayClient {
    pub fn new(config: OverlayConfig) -> Self {
        Self {
            config,
            child: None,
            cmd_tx: None,
            status_rx: None,
            tasks: Vec::new(),
        }
    }

    /// Spawn the sidecar and join the overlay.
    ///
    /// Returns a command handle and the event stream once the sidecar
    /// reports `running`. Events observed before that (including
    /// `authRequired`) are buffered in the stream for the consumer.
    pub async fn start(&mut self) -> Result<(OverlayHandle, mpsc::Receiver<SidecarEvent>)> {
        info!(binary = %self.config.binary.display(), hostname = %self.config.hostname, "starting overlay sidecar");

        let mut child = Command::new(&self.config.binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WeftError::StartupError(format!("failed to spawn sidecar: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WeftError::StartupError("sidecar stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WeftError::StartupError("sidecar stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WeftError::StartupError("sidecar stderr unavailable".into()))?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<SidecarCommand>(256);
        let (event_tx, event_rx) = mpsc::channel::<SidecarEvent>(256);
        let (status_tx, status_rx) = watch::channel(StatusData::default());

        self.tasks.push(tokio::spawn(write_loop(stdin, cmd_rx)));
        self.tasks
            .push(tokio::spawn(read_loop(stdout, event_tx, status_tx)));
        self.tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "weft::sidecar", "{line}");
            }
        }));

        self.child = Some(child);
        self.cmd_tx = Some(cmd_tx.clone());
        self.status_rx = Some(status_rx.clone());

        let handle = OverlayHandle { cmd_tx };
        handle
            .send(SidecarCommand::Start(StartData {
                hostname: self.config.hostname.clone(),
                state_dir: self.config.state_dir.display().to_string(),
                auth_key: self.config.auth_key.clone(),
                static_path: self
                    .config
                    .static_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
                hostname_prefix: self.config.hostname_prefix.clone(),
            }))
            .await?;

        self.wait_until_running(status_rx).await?;
        info!("overlay sidecar running");
        Ok((handle, event_rx))
    }

    async fn wait_until_running(&self, mut status_rx: watch::Receiver<StatusData>) -> Result<()> {
        let wait = async {
            loop {
                let status = status_rx.borrow().clone();
                match status.state {
                    Some(SidecarState::Running) => return Ok(()),
                    Some(SidecarState::Error) => {
                        return Err(WeftError::StartupError(
                            status.error.unwrap_or_else(|| "unknown sidecar error".into()),
                        ));
                    }
                    // `starting` with a pending login is not a failure; the
                    // authRequired event is surfaced out of band.
                    _ => {}
                }
                if status_rx.changed().await.is_err() {
                    return Err(WeftError::StartupError("sidecar exited during startup".into()));
                }
            }
        };
        match tokio::time::timeout(self.config.start_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(WeftError::StartupTimeout),
        }
    }

    /// Last status reported by the sidecar.
    pub fn current_status(&self) -> StatusData {
        self.status_rx
            .as_ref()
            .map(|rx| rx.borrow().clone())
            .unwrap_or_default()
    }

    /// Leave the overlay: ask the sidecar to stop, then wait for process
    /// exit, force-killing after the stop window.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(cmd_tx) = self.cmd_tx.take() {
            let _ = cmd_tx.send(SidecarCommand::Stop).await;
        }
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(self.config.stop_timeout, child.wait()).await {
                Ok(status) => debug!(?status, "sidecar exited"),
                Err(_) => {
                    warn!("sidecar did not exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.status_rx = None;
        info!("overlay sidecar stopped");
        Ok(())
    }
}

async fn write_loop(
    mut stdin: tokio::process::ChildStdin,
    mut cmd_rx: mpsc::Receiver<SidecarCommand>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        let line = match serde_json::to_string(&cmd) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize sidecar command");
                continue;
            }
        };
        if stdin.write_all(line.as_bytes()).await.is_err()
            || stdin.write_all(b"\n").await.is_err()
            || stdin.flush().await.is_err()
        {
            warn!("sidecar stdin closed, stopping command writer");
            break;
        }
    }
}

async fn read_loop(
    stdout: tokio::process::ChildStdout,
    event_tx: mpsc::Sender<SidecarEvent>,
    status_tx: watch::Sender<StatusData>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let event: SidecarEvent = match serde_json::from_str(line) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(error = %e, "unrecognized sidecar line, skipping");
                        continue;
                    }
                };
                if let SidecarEvent::Status(ref status) = event {
                    status_tx.send_replace(status.clone());
                }
                if event_tx.send(event).await.is_err() {
                    debug!("sidecar event receiver dropped, stopping reader");
                    return;
                }
            }
            Ok(None) => {
                debug!("sidecar stdout closed");
                return;
            }
            Err(e) => {
                warn!(error = %e, "error reading sidecar stdout");
                return;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn fake_sidecar(dir: &std::path::Path, script: &str) -> PathBuf {
        let path = dir.join("fake-sidecar.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{script}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn start_resolves_on_running_status() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_sidecar(
            dir.path(),
            r#"echo '{"event":"tsnet:status","data":{"state":"starting"}}'
echo '{"event":"tsnet:status","data":{"state":"running","hostname":"weft-desktop-a","ip":"100.64.0.1"}}'
cat > /dev/null"#,
        );

        let mut client = OverlayClient::new(OverlayConfig::new(
            bin,
            "weft-desktop-a",
            dir.path().join("state"),
        ));
        let (handle, events) = client.start().await.unwrap();
        assert_eq!(client.current_status().ip.as_deref(), Some("100.64.0.1"));
        // Dropping the handle closes stdin so the sidecar exits promptly.
        drop(handle);
        drop(events);
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_fails_on_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_sidecar(
            dir.path(),
            r#"echo '{"event":"tsnet:status","data":{"state":"error","error":"no network"}}'
cat > /dev/null"#,
        );

        let mut client = OverlayClient::new(OverlayConfig::new(
            bin,
            "weft-desktop-a",
            dir.path().join("state"),
        ));
        match client.start().await {
            Err(WeftError::StartupError(msg)) => assert!(msg.contains("no network")),
            Err(other) => panic!("expected StartupError, got {other:?}"),
            Ok(_) => panic!("expected StartupError, got running sidecar"),
        }
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn events_flow_to_the_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_sidecar(
            dir.path(),
            r#"echo '{"event":"tsnet:status","data":{"state":"running"}}'
echo '{"event":"tsnet:peers","data":{"peers":[{"id":"p1","hostname":"weft-phone-b","online":true}]}}'
cat > /dev/null"#,
        );

        let mut client = OverlayClient::new(OverlayConfig::new(
            bin,
            "weft-desktop-a",
            dir.path().join("state"),
        ));
        let (handle, mut events) = client.start().await.unwrap();
        loop {
            match events.recv().await.expect("event stream ended early") {
                SidecarEvent::Peers { peers } => {
                    assert_eq!(peers[0].hostname, "weft-phone-b");
                    break;
                }
                _ => continue,
            }
        }
        drop(handle);
        drop(events);
        client.stop().await.unwrap();
    }
}
