//! Background command execution.
//!
//! An [`AsyncProcess`] runs one command on its own thread, multiplexing the
//! child's stdout and stderr with `poll(2)` and collecting them line by line.
//! The owning thread is the only writer. `done` and the exit code are read
//! without locking; the captured lines sit behind a mutex that is held only
//! to append one line or to clone a snapshot.
//!
//! Each command leads its own process group so the watchdog can kill
//! everything it spawned, not just the wrapping shell.
use std::{
    io::{self, ErrorKind, Read},
    os::{
        fd::{AsFd, BorrowedFd},
        unix::process::{CommandExt, ExitStatusExt},
    },
    panic::{self, AssertUnwindSafe},
    process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio},
    sync::{
        Arc, Condvar, Mutex, OnceLock, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tracing::{debug, error, warn};

use crate::{error::JobError, status::Status};

/// Upper bound for a single readiness wait.
const POLL_INTERVAL_MS: u16 = 100;

const READ_CHUNK: usize = 4096;

/// How a command is launched.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Run through `sh -c` instead of splitting on whitespace.
    pub shell: bool,
    /// Kill the command once it has run this long.
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            shell: true,
            timeout: None,
        }
    }
}

/// One in-flight (or finished) external command.
#[derive(Debug)]
pub struct AsyncProcess {
    status: Option<Status>,
    command: String,
    shell: bool,
    done: AtomicBool,
    timed_out: AtomicBool,
    retcode: OnceLock<Option<i32>>,
    stdout: Mutex<Vec<String>>,
    stderr: Mutex<Vec<String>>,
    completion: (Mutex<bool>, Condvar),
}

impl AsyncProcess {
    /// Spawns `command` and returns as soon as the child exists.
    ///
    /// `status` is the provisional status reported for the target service
    /// while the command runs. Spawn failures are returned to the caller;
    /// exit codes are never errors.
    pub fn start(
        status: Option<Status>,
        command: impl Into<String>,
        options: RunOptions,
    ) -> Result<Arc<Self>, JobError> {
        let command = command.into();
        debug!("call [sh:{}]: {}", options.shell, command);

        let mut cmd = build_command(&command, options.shell)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let child = cmd.spawn().map_err(|source| JobError::Spawn {
            command: command.clone(),
            source,
        })?;

        let process = Arc::new(Self {
            status,
            command,
            shell: options.shell,
            done: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            retcode: OnceLock::new(),
            stdout: Mutex::new(Vec::new()),
            stderr: Mutex::new(Vec::new()),
            completion: (Mutex::new(false), Condvar::new()),
        });

        let worker = Arc::clone(&process);
        let timeout = options.timeout;
        thread::Builder::new()
            .name(format!("cmd-{}", child.id()))
            .spawn(move || worker.supervise(child, timeout))
            .map_err(|source| JobError::Spawn {
                command: process.command.clone(),
                source,
            })?;

        Ok(process)
    }

    /// Runs `command` and blocks until it has finished.
    pub fn run(command: impl Into<String>, options: RunOptions) -> Result<Arc<Self>, JobError> {
        let process = Self::start(None, command, options)?;
        process.join();
        Ok(process)
    }

    /// Blocks the calling thread until the command has completed.
    pub fn join(&self) {
        let (lock, cvar) = &self.completion;
        let mut finished = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*finished {
            finished = cvar.wait(finished).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Provisional status this command represents while it runs.
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Whether the watchdog killed the command.
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    /// Exit code once finished. Signals are reported as their negated
    /// number; `None` while running or after a timeout.
    pub fn retcode(&self) -> Option<i32> {
        self.retcode.get().copied().flatten()
    }

    pub fn succeeded(&self) -> bool {
        self.retcode() == Some(0)
    }

    /// Snapshot of the stdout lines captured so far.
    pub fn stdout(&self) -> Vec<String> {
        self.stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of the stderr lines captured so far.
    pub fn stderr(&self) -> Vec<String> {
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn supervise(&self, mut child: Child, timeout: Option<Duration>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.pump(&mut child, timeout)));
        let retcode = match outcome {
            Ok(Ok(retcode)) => retcode,
            Ok(Err(err)) => {
                error!("lost track of `{}`: {}", self.command, err);
                reap(&mut child, &self.command);
                None
            }
            Err(_) => {
                error!("output collector for `{}` panicked", self.command);
                reap(&mut child, &self.command);
                None
            }
        };
        self.finish(retcode);
    }

    /// Collects output until the child exits, then drains what is left.
    fn pump(&self, child: &mut Child, timeout: Option<Duration>) -> io::Result<Option<i32>> {
        let mut out = LineStream::new(child.stdout.take());
        let mut err = LineStream::new(child.stderr.take());
        let deadline = timeout.map(|limit| Instant::now() + limit);

        let status = loop {
            let (out_ready, err_ready) =
                wait_readable(&out, &err, POLL_INTERVAL_MS)?;
            self.collect(&mut out, &mut err, out_ready, err_ready)?;

            if let Some(status) = child.try_wait()? {
                break status;
            }

            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                warn!(
                    "`{}` timed out after {:?}; terminating it",
                    self.command,
                    timeout.unwrap_or_default()
                );
                self.timed_out.store(true, Ordering::Release);
                kill_group(child, &self.command);
                break child.wait()?;
            }
        };

        // Output written between the last readiness check and exit.
        loop {
            let (out_ready, err_ready) = wait_readable(&out, &err, 0)?;
            if !out_ready && !err_ready {
                break;
            }
            self.collect(&mut out, &mut err, out_ready, err_ready)?;
        }
        for line in out.finish() {
            self.record_stdout(line);
        }
        for line in err.finish() {
            self.record_stderr(line);
        }

        if self.timed_out() {
            return Ok(None);
        }
        Ok(exit_code(status))
    }

    fn collect(
        &self,
        out: &mut LineStream<ChildStdout>,
        err: &mut LineStream<ChildStderr>,
        out_ready: bool,
        err_ready: bool,
    ) -> io::Result<()> {
        if out_ready {
            for line in out.read_available()? {
                self.record_stdout(line);
            }
        }
        if err_ready {
            for line in err.read_available()? {
                self.record_stderr(line);
            }
        }
        Ok(())
    }

    fn record_stdout(&self, line: String) {
        debug!("{}", line.trim_end());
        self.stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    fn record_stderr(&self, line: String) {
        warn!("{}", line.trim_end());
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    fn finish(&self, retcode: Option<i32>) {
        debug!("done [sh:{}]: {} -> {:?}", self.shell, self.command, retcode);
        let _ = self.retcode.set(retcode);
        self.done.store(true, Ordering::Release);

        let (lock, cvar) = &self.completion;
        let mut finished = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *finished = true;
        cvar.notify_all();
    }
}

fn build_command(command: &str, shell: bool) -> Result<Command, JobError> {
    if shell {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        return Ok(cmd);
    }

    let invalid = |reason: String| JobError::Spawn {
        command: command.to_string(),
        source: io::Error::new(ErrorKind::InvalidInput, reason),
    };
    let words = shell_words::split(command).map_err(|err| invalid(err.to_string()))?;
    let (program, args) = words
        .split_first()
        .ok_or_else(|| invalid("empty command".to_string()))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code().or_else(|| status.signal().map(|signal| -signal))
}

/// Sends SIGKILL to the child's whole process group.
fn kill_group(child: &mut Child, command: &str) {
    let group = Pid::from_raw(child.id() as i32);
    if let Err(errno) = killpg(group, Signal::SIGKILL) {
        error!("failed to kill process group of `{}`: {}", command, errno);
        let _ = child.kill();
    }
}

fn reap(child: &mut Child, command: &str) {
    if let Ok(None) = child.try_wait() {
        kill_group(child, command);
    }
    let _ = child.wait();
}

/// Waits until either pipe is readable, hung up, or `wait_ms` elapses.
fn wait_readable(
    out: &LineStream<ChildStdout>,
    err: &LineStream<ChildStderr>,
    wait_ms: u16,
) -> io::Result<(bool, bool)> {
    let mut fds = Vec::with_capacity(2);
    let mut slots = [None, None];
    if let Some(fd) = out.fd() {
        slots[0] = Some(fds.len());
        fds.push(PollFd::new(fd, PollFlags::POLLIN));
    }
    if let Some(fd) = err.fd() {
        slots[1] = Some(fds.len());
        fds.push(PollFd::new(fd, PollFlags::POLLIN));
    }

    if fds.is_empty() {
        thread::sleep(Duration::from_millis(u64::from(wait_ms)));
        return Ok((false, false));
    }

    match poll(&mut fds, PollTimeout::from(wait_ms)) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok((false, false)),
        Err(errno) => return Err(io::Error::from(errno)),
    }

    let wanted = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    let ready = |slot: Option<usize>| {
        slot.and_then(|index| fds[index].revents())
            .is_some_and(|revents| revents.intersects(wanted))
    };
    Ok((ready(slots[0]), ready(slots[1])))
}

/// Splits a pipe into lines as data becomes available.
struct LineStream<R> {
    pipe: Option<R>,
    pending: Vec<u8>,
}

impl<R: Read + AsFd> LineStream<R> {
    fn new(pipe: Option<R>) -> Self {
        Self {
            pipe,
            pending: Vec::new(),
        }
    }

    fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.pipe.as_ref().map(AsFd::as_fd)
    }

    /// Performs a single read and returns every line it completed.
    fn read_available(&mut self) -> io::Result<Vec<String>> {
        let Some(pipe) = self.pipe.as_mut() else {
            return Ok(Vec::new());
        };

        let mut buf = [0u8; READ_CHUNK];
        match pipe.read(&mut buf) {
            Ok(0) => {
                self.pipe = None;
                Ok(self.take_partial().into_iter().collect())
            }
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                Ok(self.take_lines())
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(Vec::new()),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    fn take_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    fn take_partial(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }

    /// Returns any unterminated trailing line.
    fn finish(&mut self) -> Option<String> {
        self.pipe = None;
        self.take_partial()
    }
}

/// Strips carriage returns and decodes permissively.
pub(crate) fn decode_line(raw: &[u8]) -> String {
    let filtered: Vec<u8> = raw.iter().copied().filter(|&b| b != b'\r').collect();
    String::from_utf8_lossy(&filtered).into_owned()
}
