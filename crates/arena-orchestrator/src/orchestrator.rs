//! Job lifecycle: start, supervise, wait, clean up

use futures_util::future::join_all;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::error::{ChildCrash, OrchestratorError};
use crate::job::{ChildSpec, JobSpec};
use crate::logs::{LOG_CHANNEL_DEPTH, LogForwardError, LogLine, LogSink, LogStream, forward};
use crate::process::{is_alive, stop_child, terminate_pid, wait_ports_released};
use crate::registry::{JobRecord, OrchestratorRegistry};
use crate::supervision::{Decision, SupervisionPolicy};

/// How long output forwarders may lag behind a child's exit
const FORWARD_DRAIN: Duration = Duration::from_secs(1);

/// Lines of child output attached to a crash
const CRASH_LOG_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct ChildReport {
    pub name: String,
    /// Exit code of the last run
    pub exit_code: Option<i32>,
    pub success: bool,
    pub restarts: u32,
    /// Stopped by the orchestrator rather than exiting on its own
    pub stopped: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub name: String,
    pub children: Vec<ChildReport>,
    /// Children that were unrecoverable
    pub crashes: Vec<ChildCrash>,
    pub log_forward_errors: usize,
}

impl JobReport {
    pub fn success(&self) -> bool {
        self.crashes.is_empty()
    }

    /// First unrecoverable crash as an error
    pub fn into_result(self) -> Result<JobReport, OrchestratorError> {
        match self.crashes.first() {
            Some(crash) => Err(OrchestratorError::ChildCrash(crash.clone())),
            None => Ok(self),
        }
    }
}

/// A started job
pub struct JobHandle {
    name: String,
    completion: watch::Receiver<bool>,
    stop: Arc<watch::Sender<bool>>,
    record: Arc<Mutex<JobRecord>>,
    logs: LogSink,
    port_release_timeout: Duration,
    stop_grace: Duration,
    monitor: JoinHandle<JobReport>,
}

impl JobHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flips to `true` once every child has exited for good
    pub fn completion(&self) -> watch::Receiver<bool> {
        self.completion.clone()
    }

    pub fn is_complete(&self) -> bool {
        *self.completion.borrow()
    }

    /// Ask every child to stop gracefully
    pub fn stop(&self) {
        info!("Stopping job {}", self.name);
        self.stop.send_replace(true);
    }

    pub fn logs(&self) -> &LogSink {
        &self.logs
    }

    /// Current process bookkeeping
    pub fn record(&self) -> JobRecord {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Everything one child supervisor needs
struct ChildContext {
    spec: ChildSpec,
    env: Vec<(String, String)>,
    policy: SupervisionPolicy,
    stop_grace: Duration,
    record: Arc<Mutex<JobRecord>>,
    registry: OrchestratorRegistry,
    logs: LogSink,
    log_tx: mpsc::Sender<LogLine>,
    stop_rx: watch::Receiver<bool>,
    stop_tx: Arc<watch::Sender<bool>>,
}

struct ChildOutcome {
    report: ChildReport,
    crash: Option<ChildCrash>,
    log_forward_errors: usize,
}

pub struct Orchestrator {
    registry: OrchestratorRegistry,
}

impl Orchestrator {
    pub fn new(registry: OrchestratorRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &OrchestratorRegistry {
        &self.registry
    }

    /// Spawn every child of the job under supervision
    pub async fn start(&self, spec: JobSpec) -> Result<JobHandle, OrchestratorError> {
        spec.validate()?;

        if let Some(existing) = self.registry.load(&spec.name)? {
            for pid in existing.pids() {
                if is_alive(pid).await {
                    return Err(OrchestratorError::AlreadyRunning(spec.name.clone()));
                }
            }
            warn!("Removing stale record for job {}", spec.name);
            self.registry.remove(&spec.name)?;
        }

        let mut record = JobRecord::new(&spec.name, &spec.host, spec.ports.clone());
        for child in &spec.children {
            record.set_pid(&child.name, None);
        }
        self.registry.record(&record)?;
        let record = Arc::new(Mutex::new(record));

        let logs = LogSink::default();
        let (log_tx, log_rx) = mpsc::channel(LOG_CHANNEL_DEPTH);
        let collector = logs.spawn_collector(log_rx);

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let (completion_tx, completion_rx) = watch::channel(false);

        info!(
            "Starting job {} with {} children",
            spec.name,
            spec.children.len()
        );

        let supervisors: Vec<JoinHandle<ChildOutcome>> = spec
            .children
            .iter()
            .map(|child| {
                let ctx = ChildContext {
                    spec: child.clone(),
                    env: spec.env_for(child).into_iter().collect(),
                    policy: spec.supervision,
                    stop_grace: spec.stop_grace,
                    record: record.clone(),
                    registry: self.registry.clone(),
                    logs: logs.clone(),
                    log_tx: log_tx.clone(),
                    stop_rx: stop_rx.clone(),
                    stop_tx: stop_tx.clone(),
                };
                tokio::spawn(supervise(ctx))
            })
            .collect();
        drop(log_tx);

        let job_name = spec.name.clone();
        let child_names: Vec<String> = spec.children.iter().map(|c| c.name.clone()).collect();
        let monitor = tokio::spawn(async move {
            let mut report = JobReport {
                name: job_name.clone(),
                children: Vec::new(),
                crashes: Vec::new(),
                log_forward_errors: 0,
            };
            for (name, joined) in child_names.into_iter().zip(join_all(supervisors).await) {
                match joined {
                    Ok(outcome) => {
                        report.log_forward_errors += outcome.log_forward_errors;
                        report.crashes.extend(outcome.crash);
                        report.children.push(outcome.report);
                    }
                    Err(e) => {
                        error!("Supervisor for {} failed: {}", name, e);
                        report.crashes.push(ChildCrash {
                            child: name.clone(),
                            exit_code: None,
                            restarts: 0,
                            recent_logs: Vec::new(),
                        });
                        report.children.push(ChildReport {
                            name,
                            exit_code: None,
                            success: false,
                            restarts: 0,
                            stopped: false,
                        });
                    }
                }
            }
            // Every sender is gone once the supervisors are
            let _ = collector.await;
            completion_tx.send_replace(true);
            info!(
                "Job {} finished ({} crashes)",
                job_name,
                report.crashes.len()
            );
            report
        });

        Ok(JobHandle {
            name: spec.name,
            completion: completion_rx,
            stop: stop_tx,
            record,
            logs,
            port_release_timeout: spec.port_release_timeout,
            stop_grace: spec.stop_grace,
            monitor,
        })
    }

    /// Wait for every child to exit, then release the job's ports and record
    pub async fn wait(&self, handle: JobHandle) -> Result<JobReport, OrchestratorError> {
        let report = handle
            .monitor
            .await
            .map_err(|e| OrchestratorError::Supervisor(e.to_string()))?;
        self.cleanup(&handle.name, handle.stop_grace, handle.port_release_timeout)
            .await?;
        Ok(report)
    }

    /// Terminate whatever a job record lists, wait for its ports, remove the record.
    /// Returns false when no record exists.
    pub async fn cleanup(
        &self,
        name: &str,
        grace: Duration,
        port_timeout: Duration,
    ) -> Result<bool, OrchestratorError> {
        let Some(record) = self.registry.load(name)? else {
            debug!("No record for job {}", name);
            return Ok(false);
        };

        let pids = record.pids();
        if !pids.is_empty() {
            info!("Terminating {} leftover processes of job {}", pids.len(), name);
        }
        join_all(pids.iter().map(|&pid| terminate_pid(pid, grace))).await;

        if let Err(busy) = wait_ports_released(&record.host, &record.ports, port_timeout).await {
            warn!("Ports of job {} still in use: {:?}", name, busy);
            return Err(OrchestratorError::PortsBusy(busy));
        }

        self.registry.remove(name)?;
        info!("Cleaned up job {}", name);
        Ok(true)
    }
}

fn spawn_child(ctx: &ChildContext) -> Result<Child, OrchestratorError> {
    let mut command = Command::new(&ctx.spec.program);
    command
        .args(&ctx.spec.args)
        .envs(ctx.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &ctx.spec.cwd {
        command.current_dir(dir);
    }
    command.spawn().map_err(|e| OrchestratorError::Spawn {
        child: ctx.spec.name.clone(),
        source: e,
    })
}

fn set_pid(ctx: &ChildContext, pid: Option<u32>) {
    let snapshot = {
        let mut record = ctx.record.lock().unwrap_or_else(PoisonError::into_inner);
        record.set_pid(&ctx.spec.name, pid);
        record.clone()
    };
    if let Err(e) = ctx.registry.record(&snapshot) {
        warn!("Failed to update job record: {}", e);
    }
}

/// Resolves once a stop has been requested
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn forward_output(
    child: &mut Child,
    name: &str,
    tx: &mpsc::Sender<LogLine>,
) -> Vec<JoinHandle<Result<u64, LogForwardError>>> {
    let mut tasks = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        tasks.push(tokio::spawn(forward(
            name.to_string(),
            LogStream::Stdout,
            stdout,
            tx.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        tasks.push(tokio::spawn(forward(
            name.to_string(),
            LogStream::Stderr,
            stderr,
            tx.clone(),
        )));
    }
    tasks
}

/// Returns how many forwarders failed
async fn drain_forwarders(name: &str, tasks: Vec<JoinHandle<Result<u64, LogForwardError>>>) -> usize {
    let mut failures = 0;
    for mut task in tasks {
        match timeout(FORWARD_DRAIN, &mut task).await {
            Ok(Ok(Ok(lines))) => debug!("Forwarded {} lines from {}", lines, name),
            Ok(Ok(Err(e))) => {
                warn!("Log forwarding stopped: {}", e);
                failures += 1;
            }
            Ok(Err(e)) => {
                warn!("Log forwarder for {} failed: {}", name, e);
                failures += 1;
            }
            Err(_) => {
                // A grandchild still holds the pipe open
                debug!("Abandoning log forwarder for {}", name);
                task.abort();
            }
        }
    }
    failures
}

async fn supervise(mut ctx: ChildContext) -> ChildOutcome {
    let name = ctx.spec.name.clone();
    let mut restarts = 0u32;
    let mut log_forward_errors = 0;

    loop {
        let (status, stopped) = match spawn_child(&ctx) {
            Ok(mut child) => {
                let pid = child.id();
                info!("Started {} (pid {:?})", name, pid);
                set_pid(&ctx, pid);
                let forwarders = forward_output(&mut child, &name, &ctx.log_tx);

                let (status, stopped): (Option<ExitStatus>, bool) = tokio::select! {
                    status = child.wait() => (status.ok(), false),
                    _ = stop_requested(&mut ctx.stop_rx) => {
                        (stop_child(&mut child, &name, ctx.stop_grace).await, true)
                    }
                };
                log_forward_errors += drain_forwarders(&name, forwarders).await;
                set_pid(&ctx, None);
                (status, stopped)
            }
            Err(e) => {
                error!("{}", e);
                (None, false)
            }
        };

        let exit_code = status.and_then(|s| s.code());
        let success = status.is_some_and(|s| s.success());
        let report = ChildReport {
            name: name.clone(),
            exit_code,
            success,
            restarts,
            stopped,
        };

        if stopped {
            info!("{} stopped", name);
            return ChildOutcome {
                report,
                crash: None,
                log_forward_errors,
            };
        }

        match ctx.policy.decide(success, restarts) {
            Decision::Exit => {
                info!("{} exited cleanly", name);
                return ChildOutcome {
                    report,
                    crash: None,
                    log_forward_errors,
                };
            }
            Decision::Restart(delay) => {
                restarts += 1;
                warn!(
                    "{} exited with {:?}, restart {} in {:?}",
                    name, exit_code, restarts, delay
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = stop_requested(&mut ctx.stop_rx) => {
                        return ChildOutcome {
                            report: ChildReport { stopped: true, ..report },
                            crash: None,
                            log_forward_errors,
                        };
                    }
                }
            }
            Decision::GiveUp => {
                let crash = ChildCrash {
                    child: name.clone(),
                    exit_code,
                    restarts,
                    recent_logs: ctx.logs.tail(&name, CRASH_LOG_LINES),
                };
                error!("{}", OrchestratorError::ChildCrash(crash.clone()));
                if ctx.policy.fail_fast {
                    warn!("Stopping remaining children after {} failed", name);
                    ctx.stop_tx.send_replace(true);
                }
                return ChildOutcome {
                    report,
                    crash: Some(crash),
                    log_forward_errors,
                };
            }
        }
    }
}
