//! Sidecar supervisor for long-lived backend servers.
//!
//! Servers are tracked by `(name, port)`. A key is present in the map only
//! after the readiness probe has seen HTTP 200; double-starting the same key
//! is a no-op. Only the supervisor ever kills a server process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::{Error, Result};

const DEFAULT_HEALTH_PATH: &str = "/health";
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// How to launch and health-check one backend server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub bin_path: PathBuf,
    pub args: Vec<String>,
    pub port: u16,
    /// Health endpoint path, `/health` when unset.
    pub health_path: Option<String>,
    pub env: HashMap<String, String>,
    /// Readiness deadline, 10 s when unset.
    pub ready_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn new(name: &str, bin_path: impl Into<PathBuf>, args: Vec<String>, port: u16) -> Self {
        Self {
            name: name.to_string(),
            bin_path: bin_path.into(),
            args,
            port,
            health_path: None,
            env: HashMap::new(),
            ready_timeout: None,
        }
    }
}

/// A supervised child process bound to a local base URL.
struct ServerProcess {
    child: Child,
    #[allow(dead_code)]
    base_url: String,
}

/// Supervises sidecar server processes.
pub struct ServerManager {
    servers: RwLock<HashMap<(String, u16), ServerProcess>>,
    probe: reqwest::Client,
}

impl ServerManager {
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            probe: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .expect("probe client construction cannot fail"),
        }
    }

    /// Start a server and wait until it is ready.
    ///
    /// Idempotent per `(name, port)`: returns success without acting when
    /// the key is already tracked.
    pub async fn start_server(&self, cfg: ServerConfig) -> Result<()> {
        let mut servers = self.servers.write().await;

        let key = (cfg.name.clone(), cfg.port);
        if servers.contains_key(&key) {
            return Ok(());
        }

        match std::fs::metadata(&cfg.bin_path) {
            Ok(meta) if meta.is_dir() => {
                return Err(Error::Execution(format!(
                    "failed to start {} server: {} is a directory",
                    cfg.name,
                    cfg.bin_path.display()
                )))
            }
            Err(e) => {
                return Err(Error::Execution(format!(
                    "failed to start {} server: {e}",
                    cfg.name
                )))
            }
            Ok(_) => {}
        }

        let mut cmd = Command::new(&cfg.bin_path);
        cmd.args(&cfg.args)
            .envs(&cfg.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Execution(format!("failed to start {} server: {e}", cfg.name)))?;

        let base_url = format!("http://localhost:{}", cfg.port);
        let health_path = cfg.health_path.as_deref().unwrap_or(DEFAULT_HEALTH_PATH);
        let ready_timeout = cfg.ready_timeout.unwrap_or(DEFAULT_READY_TIMEOUT);

        let health_url = format!("{base_url}{health_path}");
        if let Err(e) = self
            .wait_for_server(&health_url, ready_timeout, &mut child)
            .await
        {
            let _ = child.kill().await;
            return Err(Error::Execution(format!(
                "{} server did not become ready: {e}",
                cfg.name
            )));
        }

        servers.insert(key, ServerProcess { child, base_url });
        tracing::info!(name = %cfg.name, port = cfg.port, "server started");
        Ok(())
    }

    /// Stop a tracked server, killing the process.
    pub async fn stop_server(&self, name: &str, port: u16) -> Result<()> {
        let mut servers = self.servers.write().await;

        let key = (name.to_string(), port);
        let mut server = servers
            .remove(&key)
            .ok_or_else(|| Error::ServerNotFound(format!("{name}-{port}")))?;

        if let Err(e) = server.child.kill().await {
            tracing::error!(error = %e, "failed to kill server process");
        }

        tracing::info!(name, port, "server stopped");
        Ok(())
    }

    /// Stop every tracked server. Used at shutdown.
    pub async fn stop_all(&self) {
        let mut servers = self.servers.write().await;

        for (_, server) in servers.iter_mut() {
            if let Err(e) = server.child.kill().await {
                tracing::error!(error = %e, "failed to kill server process");
            }
        }
        servers.clear();

        tracing::info!("all servers stopped");
    }

    /// Whether a `(name, port)` key is currently tracked.
    pub async fn is_running(&self, name: &str, port: u16) -> bool {
        let servers = self.servers.read().await;
        servers.contains_key(&(name.to_string(), port))
    }

    async fn wait_for_server(
        &self,
        url: &str,
        timeout: Duration,
        child: &mut Child,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(Error::Execution(format!(
                    "server process exited during startup: {status}"
                )));
            }

            if let Ok(resp) = self.probe.get(url).send().await {
                if resp.status() == StatusCode::OK {
                    return Ok(());
                }
            }

            tokio::time::sleep(PROBE_INTERVAL).await;
        }

        Err(Error::Execution(format!(
            "server failed to respond at {url} within {timeout:?}"
        )))
    }
}

impl Default for ServerManager {
    fn default() -> Self {
        Self::new()
    }
}
