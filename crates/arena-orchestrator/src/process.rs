//! Process signalling and port release checks

use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Send `signal` (e.g. "TERM", "KILL", "0") to `pid` with the `kill` utility
pub async fn signal(pid: u32, signal: &str) -> bool {
    Command::new("kill")
        .arg(format!("-{signal}"))
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

pub async fn is_alive(pid: u32) -> bool {
    signal(pid, "0").await
}

/// Terminate a process we do not own: TERM, wait up to `grace`, then KILL
pub async fn terminate_pid(pid: u32, grace: Duration) {
    if !signal(pid, "TERM").await {
        debug!("pid {} already gone", pid);
        return;
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_alive(pid).await {
            return;
        }
        sleep(POLL_INTERVAL).await;
    }
    warn!("pid {} did not exit within {:?}, killing", pid, grace);
    signal(pid, "KILL").await;
}

/// Stop an owned child: TERM, wait up to `grace`, then KILL
pub async fn stop_child(child: &mut Child, name: &str, grace: Duration) -> Option<ExitStatus> {
    if let Some(pid) = child.id() {
        debug!("Sending TERM to {} (pid {})", name, pid);
        signal(pid, "TERM").await;
    }
    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!("Waiting for {} failed: {}", name, e);
            None
        }
        Err(_) => {
            warn!("{} did not stop within {:?}, killing", name, grace);
            if let Err(e) = child.kill().await {
                warn!("Killing {} failed: {}", name, e);
            }
            child.wait().await.ok()
        }
    }
}

/// Wait until nothing accepts connections on `ports`. Returns the ports still busy on timeout.
pub async fn wait_ports_released(host: &str, ports: &[u16], limit: Duration) -> Result<(), Vec<u16>> {
    let deadline = Instant::now() + limit;
    loop {
        let mut busy = Vec::new();
        for &port in ports {
            let connect = timeout(POLL_INTERVAL, TcpStream::connect((host, port))).await;
            if matches!(connect, Ok(Ok(_))) {
                busy.push(port);
            }
        }
        if busy.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(busy);
        }
        sleep(POLL_INTERVAL).await;
    }
}
