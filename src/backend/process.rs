//! Backend that spawns and supervises a local SOCKS5 proxy process.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{BalancerError, Result};

use super::endpoint::Endpoint;
use super::{BackendClient, BackendDescriptor};

const DEFAULT_STARTUP_DELAY_MS: u64 = 2000;
const STOP_GRACE: Duration = Duration::from_secs(5);
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Observes each line a subprocess prints; used by the tunnel backend to
/// watch for instability markers.
pub(crate) type LineHook = Arc<dyn Fn(&str) + Send + Sync>;

pub struct ProcessBackend {
    name: String,
    command: String,
    args: Vec<String>,
    working_dir: Option<String>,
    env: Vec<(String, String)>,
    port: u16,
    startup_delay: Duration,
    log_output: bool,
    running: Arc<AtomicBool>,
    child: Mutex<Option<Child>>,
}

impl ProcessBackend {
    pub fn new(descriptor: &BackendDescriptor) -> Result<Self> {
        let command = descriptor.require_str("command")?.to_string();
        let args = descriptor.str_list_param("args")?;
        let working_dir = descriptor.str_param("working_dir").map(str::to_string);
        let env = descriptor.str_map_param("env")?;
        let port = descriptor.require_port("port")?;
        let startup_delay = Duration::from_millis(
            descriptor
                .int_param("startup_delay_ms")
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(DEFAULT_STARTUP_DELAY_MS),
        );
        let log_output = descriptor.bool_param("log_output").unwrap_or(false);

        Ok(Self {
            name: descriptor.name.clone(),
            command,
            args,
            working_dir,
            env,
            port,
            startup_delay,
            log_output,
            running: Arc::new(AtomicBool::new(false)),
            child: Mutex::new(None),
        })
    }

    fn substituted(&self, value: &str) -> String {
        value.replace("{PORT}", &self.port.to_string())
    }

    async fn spawn_child(&self) -> Result<Child> {
        let command = self.substituted(&self.command);
        let args: Vec<String> = self.args.iter().map(|a| self.substituted(a)).collect();
        debug!("Backend {} launching: {} {:?}", self.name, command, args);

        let mut builder = Command::new(&command);
        builder.args(&args);
        if let Some(dir) = &self.working_dir {
            builder.current_dir(dir);
        }
        for (key, value) in &self.env {
            builder.env(key, self.substituted(value));
        }
        let mut child = builder
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BalancerError::Startup(format!("failed to launch {}: {}", command, e))
            })?;

        drain_output(
            self.name.clone(),
            "stdout",
            child.stdout.take(),
            Arc::clone(&self.running),
            None,
            self.log_output,
        );
        drain_output(
            self.name.clone(),
            "stderr",
            child.stderr.take(),
            Arc::clone(&self.running),
            None,
            self.log_output,
        );

        Ok(child)
    }
}

#[async_trait]
impl BackendClient for ProcessBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self) -> Option<Endpoint> {
        Some(Endpoint::new("127.0.0.1", self.port))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_healthy(&self) -> bool {
        self.is_running()
    }

    async fn start(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if self.is_running() {
            warn!("Backend {} is already running", self.name);
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        let mut child = match self.spawn_child().await {
            Ok(child) => child,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        // give the process a moment to bind its listener, then make sure it
        // did not exit immediately
        tokio::time::sleep(self.startup_delay).await;
        if let Ok(Some(status)) = child.try_wait() {
            self.running.store(false, Ordering::SeqCst);
            return Err(BalancerError::Startup(format!(
                "{} exited during startup with {}",
                self.name, status
            )));
        }

        info!(
            "Backend {} started on port {} (pid {:?})",
            self.name,
            self.port,
            child.id()
        );
        *guard = Some(child);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let child = self.child.lock().await.take();
        if let Some(child) = child {
            terminate_child(&self.name, child).await;
        }
    }
}

/// Spawn a task draining one output stream of a subprocess.
///
/// Keeps the pipe from filling up even when nobody cares about the lines.
/// Every line is passed to `hook` when present, and echoed at info level
/// when `verbose`.
pub(crate) fn drain_output<R>(
    name: String,
    source: &'static str,
    stream: Option<R>,
    running: Arc<AtomicBool>,
    hook: Option<LineHook>,
    verbose: bool,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(stream) = stream else {
        return;
    };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(hook) = &hook {
                        hook(&line);
                    }
                    if verbose {
                        info!("[{}/{}] {}", name, source, line);
                    } else {
                        debug!("[{}/{}] {}", name, source, line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    if running.load(Ordering::SeqCst) {
                        warn!("Backend {} {} read error: {}", name, source, e);
                    }
                    break;
                }
            }
        }
        debug!("Backend {} {} closed", name, source);
    });
}

/// Graceful termination: SIGTERM, wait up to 5s, then kill and wait up to
/// 2s more.
pub(crate) async fn terminate_child(name: &str, mut child: Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        match timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                info!("Backend {} exited with {}", name, status);
                return;
            }
            Ok(Err(e)) => {
                error!("Backend {} wait failed: {}", name, e);
                return;
            }
            Err(_) => {
                warn!("Backend {} did not exit after SIGTERM, killing", name);
            }
        }
    }

    if let Err(e) = child.start_kill() {
        error!("Backend {} kill failed: {}", name, e);
        return;
    }
    match timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => info!("Backend {} killed, exited with {}", name, status),
        Ok(Err(e)) => error!("Backend {} wait failed: {}", name, e),
        Err(_) => error!("Backend {} did not exit after kill", name),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("backend.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{}", body).unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn descriptor(command: &str, params: serde_json::Value) -> BackendDescriptor {
        let mut params = params;
        params["command"] = json!(command);
        serde_json::from_value(json!({
            "type": "process",
            "name": "p1",
            "params": params,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_and_stop_long_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(&dir, "sleep 60");
        let backend = ProcessBackend::new(&descriptor(
            &cmd,
            json!({"port": 1080, "startup_delay_ms": 50}),
        ))
        .unwrap();

        backend.start().await.unwrap();
        assert!(backend.is_running());
        assert_eq!(backend.endpoint(), Some(Endpoint::new("127.0.0.1", 1080)));

        backend.stop().await;
        assert!(!backend.is_running());
    }

    #[tokio::test]
    async fn test_start_fails_when_process_exits_early() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(&dir, "exit 1");
        let backend = ProcessBackend::new(&descriptor(
            &cmd,
            json!({"port": 1080, "startup_delay_ms": 100}),
        ))
        .unwrap();

        let err = backend.start().await.unwrap_err();
        assert!(matches!(err, BalancerError::Startup(_)));
        assert!(!backend.is_running());
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_binary() {
        let backend = ProcessBackend::new(&descriptor(
            "/nonexistent/proxy-binary",
            json!({"port": 1080, "startup_delay_ms": 10}),
        ))
        .unwrap();

        let err = backend.start().await.unwrap_err();
        assert!(matches!(err, BalancerError::Startup(_)));
        assert!(!backend.is_running());
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        // out.txt is relative, so finding it in the temp dir proves the
        // working directory took effect
        let cmd = script(&dir, "echo \"$MARKER\" > out.txt\nsleep 60");
        let backend = ProcessBackend::new(&descriptor(
            &cmd,
            json!({
                "port": 1080,
                "startup_delay_ms": 200,
                "working_dir": dir.path().to_str().unwrap(),
                "env": {"MARKER": "m-{PORT}"},
            }),
        ))
        .unwrap();

        backend.start().await.unwrap();
        let out = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(out.trim(), "m-1080");
        backend.stop().await;
    }

    #[tokio::test]
    async fn test_port_placeholder_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("port.txt");
        let cmd = script(
            &dir,
            &format!("echo \"$1\" > {}\nsleep 60", marker.display()),
        );
        let backend = ProcessBackend::new(&descriptor(
            &cmd,
            json!({"port": 4567, "args": ["{PORT}"], "startup_delay_ms": 200}),
        ))
        .unwrap();

        backend.start().await.unwrap();
        let recorded = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(recorded.trim(), "4567");
        backend.stop().await;
    }
}
