//! Running jobs outside the controller loop.
//!
//! A worker gets a [`WorkerRequest`], runs the job, and reports back through
//! a stream of [`WorkerMessage`]s: the job's events in order, then exactly
//! one `finished` or `failed`. Process workers speak this protocol as JSON
//! lines on stdout; thread workers send the same messages over a channel.

use crate::config::Config;
use crate::issue::Issue;
use crate::job::{CancelToken, JobContext, JobError, JobSpec, run_job};
use crate::listener::{Event, EventSink};
use crate::process;
use crate::registry::Registry;
use crate::repository::{Repository, open_repository};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Everything a worker needs to run one job.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerRequest {
    pub job_id: u64,
    pub spec: JobSpec,
    /// The effective configuration as TOML.
    pub config: String,
    pub db_uri: String,
    pub db_timeout_ms: u64,
    /// Scratch directory owned by the job.
    pub work_dir: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Event { event: Event },
    /// The job completed; `issues` are the ones new to the repository.
    Finished { issues: Vec<Issue> },
    Failed { message: String },
}

/// Where a worker sends its messages.
pub trait WorkerChannel: Send + Sync {
    fn send(&self, message: WorkerMessage);
}

/// Writes one JSON document per line, flushing after each.
pub struct JsonLines<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLines<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }
}

impl<W: Write + Send> WorkerChannel for JsonLines<W> {
    fn send(&self, message: WorkerMessage) {
        let mut out = self.out.lock().unwrap_or_else(|p| p.into_inner());
        let written = serde_json::to_writer(&mut *out, &message)
            .map_err(io::Error::from)
            .and_then(|_| out.write_all(b"\n"))
            .and_then(|_| out.flush());
        if let Err(e) = written {
            error!(error = %e, "failed to write worker message");
        }
    }
}

/// What the controller receives from its workers.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Message { job_id: u64, message: WorkerMessage },
    /// The worker has ended and nothing more will arrive for `job_id`.
    Closed { job_id: u64 },
}

struct DeliveryChannel {
    job_id: u64,
    sender: Sender<Delivery>,
}

impl WorkerChannel for DeliveryChannel {
    fn send(&self, message: WorkerMessage) {
        // The controller may already be gone during shutdown.
        let _ = self.sender.send(Delivery::Message {
            job_id: self.job_id,
            message,
        });
    }
}

/// Forwards the events of a job as worker messages.
struct ChannelEvents(Arc<dyn WorkerChannel>);

impl EventSink for ChannelEvents {
    fn emit(&self, event: Event) {
        self.0.send(WorkerMessage::Event { event });
    }
}

/// Runs the job of `request` and reports through `channel`.
///
/// Job failures never escape: they are logged, turned into a warning event
/// and a `failed` message.
pub fn run_worker(
    request: &WorkerRequest,
    registry: Arc<Registry>,
    repository: Arc<dyn Repository>,
    channel: Arc<dyn WorkerChannel>,
    cancel: CancelToken,
) {
    let job_id = request.job_id;
    let config = match Config::from_toml_str(&request.config) {
        Ok(config) => config,
        Err(e) => {
            error!(job_id, error = %e, "worker received an invalid configuration");
            channel.send(WorkerMessage::Failed { message: e.to_string() });
            return;
        }
    };
    let ctx = JobContext {
        job_id,
        config: Arc::new(config),
        registry,
        repository,
        events: Arc::new(ChannelEvents(channel.clone())),
        work_dir: request.work_dir.clone(),
        cancel,
    };

    debug!(job_id, kind = request.spec.kind(), "job started");
    let result = run_job(&request.spec, &ctx);
    if let Err(e) = std::fs::remove_dir_all(&request.work_dir)
        && e.kind() != io::ErrorKind::NotFound
    {
        debug!(job_id, error = %e, "failed to remove job directory");
    }
    match result {
        Ok(issues) => channel.send(WorkerMessage::Finished { issues }),
        Err(JobError::Cancelled) => {
            info!(job_id, "job cancelled");
            channel.send(WorkerMessage::Finished { issues: Vec::new() });
        }
        Err(e) => {
            let message = format!("{} job failed: {e}", request.spec.kind());
            error!(job_id, "{message}");
            channel.send(WorkerMessage::Event {
                event: Event::Warning {
                    job_id: Some(job_id),
                    message: message.clone(),
                },
            });
            channel.send(WorkerMessage::Failed { message });
        }
    }
}

/// Entry point of a worker process: reads the request from `input`, writes
/// messages to `output`.
pub fn serve<R: Read, W: Write + Send + 'static>(
    mut input: R,
    output: W,
    registry: Arc<Registry>,
) -> anyhow::Result<()> {
    process::install_interrupt_handler();
    let mut raw = String::new();
    input.read_to_string(&mut raw)?;
    let request: WorkerRequest = serde_json::from_str(&raw)?;
    let repository = open_repository(&request.db_uri, Duration::from_millis(request.db_timeout_ms))?;
    let channel: Arc<dyn WorkerChannel> = Arc::new(JsonLines::new(output));
    run_worker(&request, registry, repository, channel, CancelToken::new());
    Ok(())
}

/// A running worker as seen by the controller.
pub trait WorkerHandle: Send {
    /// Stops the job. The worker still delivers `Closed` afterwards.
    fn kill(&mut self);
}

/// Starts workers.
pub trait Launcher: Send {
    /// Starts a worker for `request`. Everything it reports, and finally a
    /// `Closed`, goes to `deliveries`.
    fn launch(&self, request: WorkerRequest, deliveries: Sender<Delivery>) -> io::Result<Box<dyn WorkerHandle>>;

    /// True if workers share the controller's memory, which an in-memory
    /// repository requires.
    fn in_process(&self) -> bool;
}

/// Runs every job on a thread of the controller process, sharing its
/// repository.
pub struct ThreadLauncher {
    registry: Arc<Registry>,
    repository: Arc<dyn Repository>,
}

impl ThreadLauncher {
    pub fn new(registry: Arc<Registry>, repository: Arc<dyn Repository>) -> Self {
        Self { registry, repository }
    }
}

struct ThreadWorker {
    cancel: CancelToken,
}

impl WorkerHandle for ThreadWorker {
    fn kill(&mut self) {
        self.cancel.cancel();
    }
}

impl Launcher for ThreadLauncher {
    fn launch(&self, request: WorkerRequest, deliveries: Sender<Delivery>) -> io::Result<Box<dyn WorkerHandle>> {
        let cancel = CancelToken::new();
        let registry = self.registry.clone();
        let repository = self.repository.clone();
        let token = cancel.clone();
        std::thread::Builder::new()
            .name(format!("job-{}", request.job_id))
            .spawn(move || {
                let job_id = request.job_id;
                let channel = Arc::new(DeliveryChannel {
                    job_id,
                    sender: deliveries.clone(),
                });
                run_worker(&request, registry, repository, channel, token);
                let _ = deliveries.send(Delivery::Closed { job_id });
            })?;
        Ok(Box::new(ThreadWorker { cancel }))
    }

    fn in_process(&self) -> bool {
        true
    }
}

/// Re-executes a program (normally the running binary with a hidden worker
/// flag) for every job.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

struct ProcessWorker {
    pid: u32,
    exited: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
}

impl WorkerHandle for ProcessWorker {
    fn kill(&mut self) {
        if !self.exited.load(Ordering::SeqCst) {
            self.killed.store(true, Ordering::SeqCst);
            process::kill_process_tree(self.pid, true);
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, request: WorkerRequest, deliveries: Sender<Delivery>) -> io::Result<Box<dyn WorkerHandle>> {
        let payload = serde_json::to_vec(&request)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let pid = child.id();
        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(&payload)
        {
            drop(stdin);
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout is not piped"))?;

        let exited = Arc::new(AtomicBool::new(false));
        let exit_flag = exited.clone();
        let killed = Arc::new(AtomicBool::new(false));
        let kill_flag = killed.clone();
        let job_id = request.job_id;
        std::thread::Builder::new()
            .name(format!("job-{job_id}-reader"))
            .spawn(move || {
                let mut concluded = false;
                for line in BufReader::new(stdout).lines() {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(job_id, error = %e, "failed to read from worker");
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<WorkerMessage>(&line) {
                        Ok(message) => {
                            concluded |= !matches!(message, WorkerMessage::Event { .. });
                            let _ = deliveries.send(Delivery::Message { job_id, message });
                        }
                        Err(e) => warn!(job_id, error = %e, "malformed worker message: {line}"),
                    }
                }
                let status = child.wait();
                exit_flag.store(true, Ordering::SeqCst);
                if kill_flag.load(Ordering::SeqCst) {
                    debug!(job_id, pid, "worker killed");
                } else if !concluded {
                    let message = match status {
                        Ok(status) => format!("Worker of job {job_id} ended unexpectedly ({status})."),
                        Err(e) => format!("Worker of job {job_id} ended unexpectedly: {e}"),
                    };
                    warn!(job_id, pid, "{message}");
                    let _ = deliveries.send(Delivery::Message {
                        job_id,
                        message: WorkerMessage::Event {
                            event: Event::Warning {
                                job_id: Some(job_id),
                                message,
                            },
                        },
                    });
                }
                let _ = deliveries.send(Delivery::Closed { job_id });
            })?;
        Ok(Box::new(ProcessWorker { pid, exited, killed }))
    }

    fn in_process(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue;
    use crate::repository::MemoryRepository;
    use std::sync::mpsc;

    const CONFIG: &str = r#"
[sut.x]
call = "SubprocessCall"

["sut.x.call"]
command = "/bin/sh -c 'test {test} != 2'"

[fuzz.x-ints]
sut = "x"
fuzzer = "RandomInteger"
batch = 1

["fuzz.x-ints.fuzzer"]
min_value = 2
max_value = 2
"#;

    fn request(spec: JobSpec, work_dir: PathBuf) -> WorkerRequest {
        WorkerRequest {
            job_id: 3,
            spec,
            config: CONFIG.to_string(),
            db_uri: "memory:".to_string(),
            db_timeout_ms: 1000,
            work_dir,
        }
    }

    fn collect(receiver: &mpsc::Receiver<Delivery>) -> Vec<Delivery> {
        let mut all = Vec::new();
        while let Ok(delivery) = receiver.recv_timeout(Duration::from_secs(30)) {
            let closed = matches!(delivery, Delivery::Closed { .. });
            all.push(delivery);
            if closed {
                break;
            }
        }
        all
    }

    #[test]
    fn test_thread_worker_reports_then_closes() {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(MemoryRepository::new());
        let launcher = ThreadLauncher::new(Arc::new(Registry::with_builtins()), repository.clone());
        let (sender, receiver) = mpsc::channel();
        let spec = JobSpec::Fuzz {
            fuzzer: "x-ints".into(),
            subconfig: "abcdef012".into(),
        };
        launcher
            .launch(request(spec, dir.path().join("job-3")), sender)
            .unwrap();

        let deliveries = collect(&receiver);
        assert_eq!(deliveries.last(), Some(&Delivery::Closed { job_id: 3 }));
        let finished = deliveries.iter().find_map(|d| match d {
            Delivery::Message {
                message: WorkerMessage::Finished { issues },
                ..
            } => Some(issues.clone()),
            _ => None,
        });
        let issues = finished.expect("job finished");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].test().as_deref(), Some(&b"2"[..]));
        assert_eq!(repository.snapshot().issues.len(), 1);
        assert!(!dir.path().join("job-3").exists(), "Job directory is removed");
    }

    #[test]
    fn test_failing_job_becomes_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, receiver) = mpsc::channel();
        let channel = Arc::new(DeliveryChannel { job_id: 3, sender });
        let spec = JobSpec::Validate {
            issue: Issue::new().with(issue::SUT, "x").with(issue::ID, "no-test"),
        };
        run_worker(
            &request(spec, dir.path().join("job")),
            Arc::new(Registry::with_builtins()),
            Arc::new(MemoryRepository::new()),
            channel,
            CancelToken::new(),
        );
        let messages: Vec<WorkerMessage> = receiver
            .try_iter()
            .map(|d| match d {
                Delivery::Message { message, .. } => message,
                Delivery::Closed { .. } => unreachable!(),
            })
            .collect();
        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[0], WorkerMessage::Event { event: Event::Warning { job_id: Some(3), .. } }));
        assert!(matches!(&messages[1], WorkerMessage::Failed { message } if message.starts_with("validate job failed")));
    }

    fn sh_launcher(script: &str) -> ProcessLauncher {
        ProcessLauncher::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    fn fuzz_request(dir: &tempfile::TempDir) -> WorkerRequest {
        let spec = JobSpec::Fuzz {
            fuzzer: "x-ints".into(),
            subconfig: "abcdef012".into(),
        };
        request(spec, dir.path().join("job-3"))
    }

    #[test]
    fn test_killed_process_worker_closes_without_warning() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, receiver) = mpsc::channel();
        let mut handle = sh_launcher("cat >/dev/null; sleep 30")
            .launch(fuzz_request(&dir), sender)
            .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        handle.kill();
        let deliveries = collect(&receiver);
        assert_eq!(deliveries, vec![Delivery::Closed { job_id: 3 }]);
    }

    #[test]
    fn test_process_worker_dying_silently_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, receiver) = mpsc::channel();
        sh_launcher("cat >/dev/null; exit 3")
            .launch(fuzz_request(&dir), sender)
            .unwrap();
        let deliveries = collect(&receiver);
        assert_eq!(deliveries.len(), 2, "{deliveries:?}");
        assert!(matches!(
            &deliveries[0],
            Delivery::Message {
                message: WorkerMessage::Event { event: Event::Warning { message, .. } },
                ..
            } if message.contains("ended unexpectedly")
        ));
        assert_eq!(deliveries[1], Delivery::Closed { job_id: 3 });
    }

    #[test]
    fn test_unread_request_fails_launch() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, receiver) = mpsc::channel();
        let mut large = fuzz_request(&dir);
        large.config.push_str(&"#".repeat(4 << 20));
        let launched = sh_launcher("exit 0").launch(large, sender);
        assert!(launched.is_err(), "Worker exited before reading its request");
        assert!(receiver.recv_timeout(Duration::from_secs(1)).is_err(), "No reader was started");
    }

    #[test]
    fn test_json_lines_wire_format() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        struct Shared(Arc<Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().write(buf)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let channel = JsonLines::new(Shared(buffer.clone()));
        channel.send(WorkerMessage::Event {
            event: Event::JobProgressed { job_id: 1, progress: 4 },
        });
        channel.send(WorkerMessage::Finished { issues: Vec::new() });
        let text = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                r#"{"type":"event","event":{"event":"job_progressed","job_id":1,"progress":4}}"#,
                r#"{"type":"finished","issues":[]}"#,
            ]
        );
        for line in lines {
            serde_json::from_str::<WorkerMessage>(line).unwrap();
        }
    }
}
