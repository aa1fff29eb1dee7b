//! Child process plumbing shared by the subprocess calls, the debugger
//! decorators and the controller: non-blocking stream monitoring, process
//! tree termination, command splitting and the SIGINT flag.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ChildStderr, ChildStdout, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Poll interval of the stream monitor loop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
const READ_CHUNK: usize = 512;
const KILL_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn name(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }

    pub fn from_name(name: &str) -> Option<Stream> {
        match name {
            "stdout" => Some(Stream::Stdout),
            "stderr" => Some(Stream::Stderr),
            _ => None,
        }
    }
}

/// Puts a file descriptor into non-blocking mode.
pub fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: fcntl on a descriptor we own; errors are reported via the return value.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: same descriptor, only adds O_NONBLOCK to the existing flags.
    let rc = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

struct Pipe<R> {
    reader: Option<R>,
    data: Vec<u8>,
    // Start of the not yet line-split tail of `data`.
    line_start: usize,
}

impl<R: Read + AsRawFd> Pipe<R> {
    fn new(reader: Option<R>) -> io::Result<Self> {
        if let Some(r) = &reader {
            set_nonblocking(r)?;
        }
        Ok(Self {
            reader,
            data: Vec::new(),
            line_start: 0,
        })
    }

    fn raw_fd(&self) -> Option<i32> {
        self.reader.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Reads until the pipe would block. Closes the pipe on EOF.
    fn drain(&mut self) -> io::Result<()> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(());
        };
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    self.reader = None;
                    return Ok(());
                }
                Ok(n) => self.data.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn next_line(&mut self) -> Option<String> {
        let tail = &self.data[self.line_start..];
        let pos = tail.iter().position(|&b| b == b'\n')?;
        let line = String::from_utf8_lossy(&tail[..pos])
            .trim_end_matches('\r')
            .to_string();
        self.line_start += pos + 1;
        Some(line)
    }

    fn take_fragment(&mut self) -> Option<String> {
        if self.line_start >= self.data.len() {
            return None;
        }
        let fragment = String::from_utf8_lossy(&self.data[self.line_start..]).to_string();
        self.line_start = self.data.len();
        Some(fragment)
    }
}

/// Line-splitting reader over a child's stdout and stderr.
///
/// Both pipes are switched to non-blocking mode and polled together. Partial
/// lines are retained between polls and only handed out once complete (or
/// when explicitly flushed).
pub struct StreamMonitor {
    stdout: Pipe<ChildStdout>,
    stderr: Pipe<ChildStderr>,
}

impl StreamMonitor {
    pub fn new(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) -> io::Result<Self> {
        Ok(Self {
            stdout: Pipe::new(stdout)?,
            stderr: Pipe::new(stderr)?,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.stdout.reader.is_none() && self.stderr.reader.is_none()
    }

    /// Waits up to `timeout` for output, reads what is available and passes
    /// every completed line to `on_line`. Returns `true` as soon as `on_line`
    /// asks to stop.
    pub fn poll(
        &mut self,
        timeout: Duration,
        on_line: &mut dyn FnMut(Stream, &str) -> bool,
    ) -> io::Result<bool> {
        let mut fds: Vec<libc::pollfd> = [self.stdout.raw_fd(), self.stderr.raw_fd()]
            .into_iter()
            .flatten()
            .map(|fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        if fds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(false);
        }

        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        // SAFETY: `fds` is a valid, initialized slice for the duration of the call.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }

        self.read_available(on_line)
    }

    /// Reads without waiting and dispatches completed lines.
    pub fn read_available(&mut self, on_line: &mut dyn FnMut(Stream, &str) -> bool) -> io::Result<bool> {
        self.stdout.drain()?;
        self.stderr.drain()?;
        Ok(self.dispatch_lines(on_line))
    }

    fn dispatch_lines(&mut self, on_line: &mut dyn FnMut(Stream, &str) -> bool) -> bool {
        while let Some(line) = self.stdout.next_line() {
            if on_line(Stream::Stdout, &line) {
                return true;
            }
        }
        while let Some(line) = self.stderr.next_line() {
            if on_line(Stream::Stderr, &line) {
                return true;
            }
        }
        false
    }

    /// Hands out the trailing unterminated line of each stream, if any.
    pub fn flush(&mut self, on_line: &mut dyn FnMut(Stream, &str) -> bool) -> bool {
        if let Some(fragment) = self.stdout.take_fragment() {
            if on_line(Stream::Stdout, &fragment) {
                return true;
            }
        }
        if let Some(fragment) = self.stderr.take_fragment() {
            if on_line(Stream::Stderr, &fragment) {
                return true;
            }
        }
        false
    }

    pub fn output(&self, stream: Stream) -> String {
        let data = match stream {
            Stream::Stdout => &self.stdout.data,
            Stream::Stderr => &self.stderr.data,
        };
        String::from_utf8_lossy(data).to_string()
    }

    /// Forgets everything read so far (used between calls of a long-lived child).
    pub fn reset(&mut self) {
        self.stdout.data.clear();
        self.stdout.line_start = 0;
        self.stderr.data.clear();
        self.stderr.line_start = 0;
    }
}

/// What happened to a monitored child.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    pub stopped: bool,
    pub timed_out: bool,
}

/// Monitors `child` until it exits, `on_line` asks to stop, or `timeout`
/// expires. The child's process tree is always killed and the child reaped
/// before returning.
pub fn monitor_child(
    child: &mut Child,
    timeout: Option<Duration>,
    on_line: &mut dyn FnMut(Stream, &str) -> bool,
) -> io::Result<Captured> {
    let start = Instant::now();
    let mut monitor = StreamMonitor::new(child.stdout.take(), child.stderr.take())?;
    let mut captured = Captured::default();

    let result = watch(child, &mut monitor, start, timeout, on_line, &mut captured);

    captured.elapsed = start.elapsed();
    kill_process_tree(child.id(), true);
    let status = child.wait();
    result?;

    captured.exit_code = Some(exit_code(&status?));
    captured.stdout = monitor.output(Stream::Stdout);
    captured.stderr = monitor.output(Stream::Stderr);
    Ok(captured)
}

fn watch(
    child: &mut Child,
    monitor: &mut StreamMonitor,
    start: Instant,
    timeout: Option<Duration>,
    on_line: &mut dyn FnMut(Stream, &str) -> bool,
    captured: &mut Captured,
) -> io::Result<()> {
    loop {
        let wait = match timeout {
            Some(t) => POLL_INTERVAL.min(t.saturating_sub(start.elapsed())),
            None => POLL_INTERVAL,
        };
        if monitor.poll(wait, on_line)? {
            captured.stopped = true;
            return Ok(());
        }
        if child.try_wait()?.is_some() {
            if monitor.read_available(on_line)? || monitor.flush(on_line) {
                captured.stopped = true;
            }
            return Ok(());
        }
        if timeout.is_some_and(|t| start.elapsed() >= t) {
            debug!(pid = child.id(), "child timed out");
            captured.timed_out = true;
            return Ok(());
        }
    }
}

/// Exit code of a finished process; termination by signal `N` maps to `-N`.
pub fn exit_code(status: &ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => -1,
    }
}

#[cfg(target_os = "linux")]
fn parent_map() -> HashMap<u32, Vec<u32>> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return children;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if let Some((ppid, _)) = read_stat(pid) {
            children.entry(ppid).or_default().push(pid);
        }
    }
    children
}

#[cfg(not(target_os = "linux"))]
fn parent_map() -> HashMap<u32, Vec<u32>> {
    HashMap::new()
}

/// Parent pid and state letter from `/proc/<pid>/stat`.
fn read_stat(pid: u32) -> Option<(u32, char)> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces and parentheses; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((ppid, state))
}

/// All transitive children of `pid`, parents before their children.
pub fn descendants(pid: u32) -> Vec<u32> {
    let map = parent_map();
    let mut result = Vec::new();
    let mut queue = VecDeque::from([pid]);
    while let Some(current) = queue.pop_front() {
        if let Some(children) = map.get(&current) {
            for &child in children {
                if child != pid && !result.contains(&child) {
                    result.push(child);
                    queue.push_back(child);
                }
            }
        }
    }
    result
}

fn is_alive(pid: u32) -> bool {
    if let Some((_, state)) = read_stat(pid) {
        return state != 'Z' && state != 'X';
    }
    // SAFETY: signal 0 only performs the existence and permission check.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn signal(pid: u32, sig: libc::c_int) {
    // SAFETY: kill(2) with a plain pid; ESRCH for vanished processes is expected.
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, sig, error = %err, "failed to signal process");
        }
    }
}

/// Terminates `pid`'s descendants (and `pid` itself when `include_root`):
/// SIGTERM to all, up to one second of grace, then SIGKILL to survivors.
///
/// Processes that disappear in the meantime are ignored. Zombies count as
/// dead; reaping them is up to their parent.
pub fn kill_process_tree(pid: u32, include_root: bool) {
    let mut targets = descendants(pid);
    if include_root {
        targets.push(pid);
    }
    if targets.is_empty() {
        return;
    }

    for &target in &targets {
        signal(target, libc::SIGTERM);
    }

    let deadline = Instant::now() + KILL_GRACE;
    let mut alive: Vec<u32> = targets.clone();
    while Instant::now() < deadline {
        alive.retain(|&p| is_alive(p));
        if alive.is_empty() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    for target in alive {
        debug!(pid = target, "process survived SIGTERM, sending SIGKILL");
        signal(target, libc::SIGKILL);
    }
}

/// Splits a command line into arguments the way a POSIX shell would for
/// plain words, single quotes, double quotes and backslash escapes.
pub fn split_command(command: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(format!("Unterminated single quote in: {command}")),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => current.push(ch),
                            Some('\n') => {}
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(format!("Unterminated double quote in: {command}")),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(format!("Unterminated double quote in: {command}")),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some('\n') | None => {}
                    Some(ch) => current.push(ch),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Installs a SIGINT handler that only records the interrupt.
pub fn install_interrupt_handler() {
    let handler: extern "C" fn(libc::c_int) = on_sigint;
    // SAFETY: the handler only performs an atomic store, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn_sh(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_split_command_handles_quotes_and_escapes() {
        assert_eq!(
            split_command(r#"prog -x 'a b' "c \"d\"" e\ f"#).unwrap(),
            vec!["prog", "-x", "a b", "c \"d\"", "e f"]
        );
        assert_eq!(split_command("  ").unwrap(), Vec::<String>::new());
        assert_eq!(split_command("''").unwrap(), vec![""]);
        assert!(split_command("'oops").is_err());
    }

    #[test]
    fn test_exit_code_for_signal_is_negative() {
        let mut child = spawn_sh("kill -9 $$");
        let status = child.wait().unwrap();
        assert_eq!(exit_code(&status), -9);
    }

    #[test]
    fn test_monitor_collects_lines_and_trailing_fragment() {
        let mut child = spawn_sh("printf 'one\\ntwo\\n'; printf 'err' >&2; exit 3");
        let mut seen = Vec::new();
        let captured = monitor_child(&mut child, Some(Duration::from_secs(10)), &mut |s, l| {
            seen.push((s, l.to_string()));
            false
        })
        .unwrap();
        assert_eq!(captured.exit_code, Some(3));
        assert_eq!(captured.stdout, "one\ntwo\n");
        assert_eq!(captured.stderr, "err");
        assert!(seen.contains(&(Stream::Stdout, "one".to_string())));
        assert!(
            seen.contains(&(Stream::Stderr, "err".to_string())),
            "Unterminated last line must still be delivered, got {seen:?}"
        );
        assert!(!captured.stopped && !captured.timed_out);
    }

    #[test]
    fn test_monitor_stop_kills_long_running_tree() {
        let mut child = spawn_sh("echo ready; sleep 3600 & wait");
        let start = Instant::now();
        let captured = monitor_child(&mut child, None, &mut |_, line| line == "ready").unwrap();
        assert!(captured.stopped);
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "Stop request should kill the child promptly"
        );
        assert!(captured.exit_code.is_some_and(|c| c < 0), "Child should be signaled");
    }

    #[test]
    fn test_monitor_timeout() {
        let mut child = spawn_sh("sleep 3600");
        let captured =
            monitor_child(&mut child, Some(Duration::from_millis(300)), &mut |_, _| false).unwrap();
        assert!(captured.timed_out);
        assert!(captured.elapsed < Duration::from_secs(3));
    }

    #[test]
    fn test_kill_process_tree_tolerates_missing_pid() {
        // Pid numbers this large are never allocated on Linux (pid_max <= 2^22).
        kill_process_tree(99_999_999, true);
    }

    #[test]
    fn test_descendants_finds_grandchildren() {
        let mut child = spawn_sh("sleep 3600 & sleep 3600 & wait");
        std::thread::sleep(Duration::from_millis(300));
        let found = descendants(child.id());
        assert!(found.len() >= 2, "Expected two sleeping grandchildren, got {found:?}");
        kill_process_tree(child.id(), true);
        let _ = child.wait();
        assert!(found.iter().all(|&p| !is_alive(p)));
    }
}
