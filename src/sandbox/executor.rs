use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info, warn};

use crate::backtesting::BacktestResult;
use crate::broker::MarketData;
use crate::error::ExecutionError;
use crate::sandbox::worker::{WorkerRequest, WorkerResponse, RESOURCE_EXIT_CODE};
use crate::sandbox::{precheck, resolve_bars, ExecutionJob, ExecutionReport, Executor, ResourceLimits, RuntimeReport};

const SIGABRT: i32 = 6;
const SIGKILL: i32 = 9;
const SIGSEGV: i32 = 11;
const SIGXCPU: i32 = 24;
const SIGXFSZ: i32 = 25;

const STDERR_TAIL_LINES: usize = 20;

const CHILD_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";
const UNSHARE: [&str; 2] = ["/usr/bin/unshare", "/bin/unshare"];
const DETECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs as root of fresh user, mount and network namespaces. `$0` is the
/// program to run and `$1` the scratch directory that becomes its `/`. Only
/// the system library directories, `/dev/null` and the program itself are
/// visible inside, all read-only except `/dev/null`.
const CONFINE_SCRIPT: &str = r#"set -e
prog=$0
root=$1
for d in /usr /lib /lib64 /bin; do
  [ -d "$d" ] || continue
  mkdir -p "$root$d"
  mount --bind "$d" "$root$d"
  mount -o remount,bind,ro,nosuid,nodev "$root$d"
done
mkdir -p "$root/dev"
: > "$root/dev/null"
mount --bind /dev/null "$root/dev/null"
: > "$root/.worker"
mount --bind "$prog" "$root/.worker"
mount -o remount,bind,ro,nosuid,nodev "$root/.worker"
"#;

/// How a worker process is fenced off from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Own user, mount and network namespaces, chrooted into the scratch
    /// directory. No network interface besides a downed loopback.
    Namespaces,
    /// Resource ceilings only. The worker shares the host filesystem and
    /// network and relies on the interpreter's capability allowlist.
    Rlimits,
}

impl Isolation {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "namespaces" | "namespace" | "ns" => Some(Isolation::Namespaces),
            "rlimits" | "rlimit" | "none" => Some(Isolation::Rlimits),
            _ => None,
        }
    }
}

/// Runs every job in a fresh `sandbox-worker` process: empty environment,
/// a private scratch directory, and on Unix `ulimit`/`nice` ceilings on
/// memory, CPU time, file size and CPU share. Where unprivileged user
/// namespaces work (checked once) the worker also gets no network and sees
/// only its scratch directory plus read-only system libraries.
/// A wall-clock timeout kills the process. Dropping an in-flight execution
/// kills the process too.
pub struct SandboxExecutor {
    worker: PathBuf,
    market: Option<Arc<dyn MarketData>>,
    permits: Arc<Semaphore>,
    isolation: OnceCell<Isolation>,
}

struct Finished {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl SandboxExecutor {
    pub fn new(worker: PathBuf, max_concurrent: usize) -> Self {
        Self {
            worker,
            market: None,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            isolation: OnceCell::new(),
        }
    }

    /// Skip detection and always use `level`. Forcing `Namespaces` on a host
    /// that cannot create them makes every job fail instead of running
    /// unconfined.
    pub fn with_isolation(mut self, level: Isolation) -> Self {
        self.isolation = OnceCell::new_with(Some(level));
        self
    }

    /// The level jobs run under, detected on first use.
    pub async fn isolation(&self) -> Isolation {
        *self
            .isolation
            .get_or_init(|| async {
                if detect_namespaces().await {
                    info!("Sandbox workers run in user, mount and network namespaces");
                    Isolation::Namespaces
                } else {
                    warn!(
                        "Namespace isolation unavailable; sandbox workers fall back to rlimits \
                         only and share the host filesystem and network"
                    );
                    Isolation::Rlimits
                }
            })
            .await
    }

    /// Source of bars for jobs that do not carry their own.
    pub fn with_market_data(mut self, market: Arc<dyn MarketData>) -> Self {
        self.market = Some(market);
        self
    }

    /// `sandbox-worker` next to the running executable.
    pub fn default_worker_path() -> Option<PathBuf> {
        let exe = std::env::current_exe().ok()?;
        let dir = exe.parent()?;
        let name = format!("sandbox-worker{}", std::env::consts::EXE_SUFFIX);
        [dir.join(&name), dir.join("..").join(&name)]
            .into_iter()
            .find(|p| p.is_file())
    }

    pub fn worker_path(&self) -> &Path {
        &self.worker
    }

    #[cfg(unix)]
    fn command(&self, level: Isolation, root: &Path, limits: &ResourceLimits) -> Result<Command, ExecutionError> {
        match level {
            Isolation::Namespaces => {
                let unshare = unshare_binary().ok_or_else(|| ExecutionError::Internal {
                    reason: "namespace isolation requested but unshare(1) is missing".to_string(),
                })?;
                let worker = std::fs::canonicalize(&self.worker).unwrap_or_else(|_| self.worker.clone());
                Ok(confined_command(unshare, &worker, root, limits))
            }
            Isolation::Rlimits => {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c")
                    .arg(format!("{}exec \"$@\" \"$0\"", limit_prelude(limits)))
                    .arg(&self.worker);
                Ok(cmd)
            }
        }
    }

    #[cfg(not(unix))]
    fn command(&self, _level: Isolation, _root: &Path, _limits: &ResourceLimits) -> Result<Command, ExecutionError> {
        Ok(Command::new(&self.worker))
    }

    async fn communicate(child: &mut Child, payload: Vec<u8>) -> std::io::Result<Finished> {
        let mut stdin = child.stdin.take();
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let write = async {
            if let Some(mut pipe) = stdin.take() {
                // A worker that dies early closes its end; that shows up in its status.
                if let Err(e) = pipe.write_all(&payload).await {
                    debug!("Worker stdin closed early: {}", e);
                }
                let _ = pipe.shutdown().await;
            }
            Ok::<(), std::io::Error>(())
        };
        let read_out = async {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout.as_mut() {
                pipe.read_to_end(&mut buf).await?;
            }
            Ok::<Vec<u8>, std::io::Error>(buf)
        };
        let read_err = async {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr.as_mut() {
                pipe.read_to_end(&mut buf).await?;
            }
            Ok::<Vec<u8>, std::io::Error>(buf)
        };

        let (_, stdout, stderr) = tokio::try_join!(write, read_out, read_err)?;
        let status = child.wait().await?;
        Ok(Finished { status, stdout, stderr })
    }

    async fn run_checked(
        &self,
        job: ExecutionJob,
        limits: &ResourceLimits,
        runtime: &mut RuntimeReport,
    ) -> Result<BacktestResult, ExecutionError> {
        precheck(&job, limits)?;
        let bars = resolve_bars(&job, limits, self.market.as_deref()).await?;
        self.run_isolated(job.with_bars(bars), limits, runtime).await
    }

    async fn run_isolated(
        &self,
        job: ExecutionJob,
        limits: &ResourceLimits,
        runtime: &mut RuntimeReport,
    ) -> Result<BacktestResult, ExecutionError> {
        let internal = |what: &str, e: std::io::Error| ExecutionError::Internal {
            reason: format!("{}: {}", what, e),
        };

        let job_id = job.id;
        let payload = serde_json::to_vec(&WorkerRequest {
            job,
            limits: limits.clone(),
        })
        .map_err(|e| ExecutionError::Internal {
            reason: format!("could not encode job: {}", e),
        })?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ExecutionError::Internal {
                reason: "executor is shutting down".to_string(),
            })?;

        let scratch = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir()
            .map_err(|e| internal("scratch directory", e))?;

        let level = self.isolation().await;
        runtime.isolation = Some(level);
        let mut cmd = self.command(level, scratch.path(), limits)?;
        cmd.env_clear()
            .env("PATH", CHILD_PATH)
            .env("RUST_LOG", "warn")
            .current_dir(scratch.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| internal("spawn worker", e))?;
        runtime.pid = child.id();
        debug!("Job {} running in pid {:?}", job_id, runtime.pid);

        let limit = Duration::from_millis(limits.wall_clock_ms);
        let finished = tokio::time::timeout(limit, Self::communicate(&mut child, payload)).await;

        let outcome = match finished {
            Err(_) => {
                warn!("Job {} exceeded {} ms; killing worker", job_id, limits.wall_clock_ms);
                let _ = child.start_kill();
                if let Ok(status) = child.wait().await {
                    record_status(runtime, status);
                }
                Err(ExecutionError::SandboxTimeout {
                    limit_ms: limits.wall_clock_ms,
                })
            }
            Ok(Err(e)) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(internal("worker i/o", e))
            }
            Ok(Ok(done)) => {
                record_status(runtime, done.status);
                runtime.stderr_tail = tail(&done.stderr, STDERR_TAIL_LINES);
                classify(&done)
            }
        };

        drop(child);
        let scratch_path = scratch.path().to_path_buf();
        let removed = scratch.close().is_ok() && !scratch_path.exists();
        runtime.torn_down = removed;
        if !removed {
            warn!("Scratch directory {} was not removed", scratch_path.display());
        }
        outcome
    }
}

/// `ulimit` ceilings plus `nice` for a script that ends by exec'ing the
/// worker. `ulimit -v` is in KiB; `-f` is in 512-byte blocks under POSIX sh.
fn limit_prelude(limits: &ResourceLimits) -> String {
    format!(
        "ulimit -v {}; ulimit -t {}; ulimit -f {}; \
         if command -v nice >/dev/null 2>&1; then set -- nice -n {}; else set --; fi; ",
        limits.memory_mb.saturating_mul(1024),
        limits.cpu_seconds.max(1),
        limits.max_file_mb.saturating_mul(2048),
        limits.cpu_nice
    )
}

fn unshare_binary() -> Option<&'static str> {
    UNSHARE.into_iter().find(|p| Path::new(p).is_file())
}

fn confined_command(unshare: &str, program: &Path, root: &Path, limits: &ResourceLimits) -> Command {
    let script = format!(
        "{}{}exec \"$@\" chroot \"$root\" /.worker\n",
        CONFINE_SCRIPT,
        limit_prelude(limits)
    );
    let mut cmd = Command::new(unshare);
    cmd.args(["--user", "--map-root-user", "--mount", "--net", "--", "/bin/sh", "-c"])
        .arg(script)
        .arg(program)
        .arg(root);
    cmd
}

/// Runs `/bin/true` through the full confinement once.
async fn detect_namespaces() -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }
    let Some(unshare) = unshare_binary() else {
        return false;
    };
    let Some(trivial) = ["/bin/true", "/usr/bin/true"].into_iter().map(Path::new).find(|p| p.is_file()) else {
        return false;
    };
    let Ok(root) = tempfile::Builder::new().prefix("sandbox-check-").tempdir() else {
        return false;
    };

    let mut cmd = confined_command(unshare, trivial, root.path(), &ResourceLimits::default());
    cmd.env_clear()
        .env("PATH", CHILD_PATH)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    match tokio::time::timeout(DETECT_TIMEOUT, cmd.output()).await {
        Ok(Ok(out)) if out.status.success() => true,
        Ok(Ok(out)) => {
            debug!("Namespace check failed: {}", tail(&out.stderr, 3));
            false
        }
        Ok(Err(e)) => {
            debug!("Namespace check could not start: {}", e);
            false
        }
        Err(_) => false,
    }
}

fn record_status(runtime: &mut RuntimeReport, status: ExitStatus) {
    runtime.exit_code = status.code();
    runtime.signal = signal_of(&status);
}

#[cfg(unix)]
fn signal_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &ExitStatus) -> Option<i32> {
    None
}

fn tail(bytes: &[u8], lines: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Map a finished worker to an outcome. A well-formed response wins; a
/// process killed by a limit signal is a resource violation.
fn classify(done: &Finished) -> Result<BacktestResult, ExecutionError> {
    let response = done
        .stdout
        .split(|b| *b == b'\n')
        .rev()
        .find(|line| !line.iter().all(u8::is_ascii_whitespace))
        .and_then(|line| serde_json::from_slice::<WorkerResponse>(line).ok());
    if let Some(response) = response {
        return response.into_outcome();
    }

    match (signal_of(&done.status), done.status.code()) {
        (Some(sig), _) if matches!(sig, SIGKILL | SIGXCPU | SIGXFSZ | SIGABRT | SIGSEGV) => {
            Err(ExecutionError::SandboxResource {
                reason: format!("worker killed by signal {}", sig),
            })
        }
        (_, Some(RESOURCE_EXIT_CODE)) => Err(ExecutionError::SandboxResource {
            reason: "worker stopped at a resource limit".to_string(),
        }),
        (sig, code) => Err(ExecutionError::Internal {
            reason: format!(
                "worker exited without a response (code {:?}, signal {:?}): {}",
                code,
                sig,
                tail(&done.stderr, 3)
            ),
        }),
    }
}

#[async_trait]
impl Executor for SandboxExecutor {
    async fn execute(&self, job: ExecutionJob, limits: &ResourceLimits) -> ExecutionReport {
        let started = Instant::now();
        let job_id = job.id;
        let mut runtime = RuntimeReport {
            isolated: true,
            ..Default::default()
        };

        let outcome = self.run_checked(job, limits, &mut runtime).await;

        // nothing was started, so nothing is left behind
        if runtime.pid.is_none() {
            runtime.torn_down = true;
        }
        runtime.wall_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(r) => info!(
                "Job {} finished in {} ms: {} trades, return {:+.2}%",
                job_id,
                runtime.wall_ms,
                r.metrics.total_trades,
                r.metrics.total_return * 100.0
            ),
            Err(e) => warn!("Job {} failed ({}): {}", job_id, e.kind(), e),
        }

        ExecutionReport {
            job_id,
            outcome,
            runtime,
        }
    }
}
