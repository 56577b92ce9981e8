//! Running one installer step at a time.
//!
//! A step goes `NotStarted -> Skipped` when the [`StepPolicy`] excludes it,
//! or `NotStarted -> Running -> Succeeded | Failed` otherwise. Both output
//! pipes are multiplexed with `poll(2)` on the calling thread; each complete
//! line is classified and handed to the [`LineSink`]. A failed step ends the
//! program through the [`Terminator`].

use crate::classify::{LogLine, Stream, classify};
use crate::error::{Error, Result};
use crate::policy::{StepPolicy, sanitized_env_path};
use chrono::{DateTime, TimeDelta, Utc};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, ChildStdin, Command, Stdio};

/// Log target used for relayed child output.
pub const STEP_TARGET: &str = "forge::step";

/// How long `poll` waits before checking whether the child has exited.
/// Needed when a grandchild keeps the pipes open after the child is gone.
const POLL_TIMEOUT_MS: libc::c_int = 1000;

const READ_CHUNK: usize = 8192;

/// Receives classified output lines.
pub trait LineSink {
    fn emit(&self, step: &str, line: &LogLine);
}

/// Forwards lines to the `log` facade under [`STEP_TARGET`].
pub struct LogSink;

impl LineSink for LogSink {
    fn emit(&self, _step: &str, line: &LogLine) {
        log::log!(target: STEP_TARGET, line.level, "{}", line.message);
    }
}

/// Ends the program after a failed step.
pub trait Terminator {
    fn terminate(&self, code: i32) -> !;
}

/// Exits the process.
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn terminate(&self, code: i32) -> ! {
        std::process::exit(code)
    }
}

/// Lifecycle of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    NotStarted,
    Skipped,
    Running,
    Succeeded,
    Failed,
}

/// Record of one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessRun {
    pub name: String,
    pub command: Vec<String>,
    pub process_group_id: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Number of `y` answers written to the child.
    pub prompts_answered: u32,
    pub state: RunState,
}

impl ProcessRun {
    fn new(name: &str, command: &[String]) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_vec(),
            ..Self::default()
        }
    }

    pub fn skipped(&self) -> bool {
        self.state == RunState::Skipped
    }

    pub fn duration(&self) -> Option<TimeDelta> {
        Some(self.ended_at? - self.started_at?)
    }

    fn duration_secs(&self) -> f64 {
        self.duration()
            .map_or(0.0, |d| d.num_milliseconds() as f64 / 1000.0)
    }
}

struct Active {
    run: ProcessRun,
    child: Child,
}

/// One output pipe and its unterminated tail.
struct Channel {
    stream: Stream,
    pipe: Option<File>,
    pending: Vec<u8>,
}

impl Channel {
    fn new(stream: Stream, pipe: Option<impl Into<OwnedFd>>) -> Self {
        Self {
            stream,
            pipe: pipe.map(|p| File::from(p.into())),
            pending: Vec::new(),
        }
    }
}

/// Per-observe state shared by both channels.
struct LineHandler<'a> {
    step: &'a str,
    sink: &'a dyn LineSink,
    prompt: Option<&'a str>,
    stdin: Option<ChildStdin>,
    answered: u32,
}

impl LineHandler<'_> {
    fn handle(&mut self, stream: Stream, raw: &[u8]) {
        let raw = String::from_utf8_lossy(raw);
        let raw = raw.trim_end_matches(['\r', '\n']);
        if raw.trim().is_empty() {
            return;
        }
        self.sink.emit(self.step, &classify(raw, stream));

        if self.prompt.is_some_and(|p| raw.contains(p)) {
            self.answer();
        }
    }

    fn answer(&mut self) {
        log::debug!("Prompt in line, sending yes");
        let Some(stdin) = self.stdin.as_mut() else {
            log::warn!("Prompt detected but stdin is closed");
            return;
        };
        match stdin.write_all(b"y\n").and_then(|()| stdin.flush()) {
            Ok(()) => self.answered += 1,
            Err(e) => log::warn!("Failed to answer prompt: {e}"),
        }
    }

    fn prompt_in(&self, bytes: &[u8]) -> bool {
        self.prompt
            .is_some_and(|p| String::from_utf8_lossy(bytes).contains(p))
    }

    /// Read what is available on `channel`, emitting every complete line.
    fn pump(&mut self, channel: &mut Channel) -> io::Result<()> {
        let Some(pipe) = channel.pipe.as_mut() else {
            return Ok(());
        };
        let mut buf = [0u8; READ_CHUNK];
        let n = match pipe.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        };

        if n == 0 {
            channel.pipe = None;
            self.flush(channel);
            return Ok(());
        }

        channel.pending.extend_from_slice(&buf[..n]);
        while let Some(pos) = channel.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = channel.pending.drain(..=pos).collect();
            self.handle(channel.stream, &line);
        }

        // Prompts usually wait for input without a trailing newline.
        if !channel.pending.is_empty() && self.prompt_in(&channel.pending) {
            self.flush(channel);
        }
        Ok(())
    }

    fn flush(&mut self, channel: &mut Channel) {
        if !channel.pending.is_empty() {
            let line = std::mem::take(&mut channel.pending);
            self.handle(channel.stream, &line);
        }
    }
}

/// Runs installer steps, one at a time.
pub struct Supervisor {
    policy: StepPolicy,
    path_marker: Option<String>,
    sink: Box<dyn LineSink>,
    terminator: Box<dyn Terminator>,
    active: Option<Active>,
    last: Option<ProcessRun>,
}

impl Supervisor {
    pub fn new(policy: StepPolicy) -> Self {
        Self {
            policy,
            path_marker: None,
            sink: Box::new(LogSink),
            terminator: Box::new(ProcessExit),
            active: None,
            last: None,
        }
    }

    /// Remove `PATH` entries containing `marker` from the child environment.
    pub fn with_path_marker(mut self, marker: impl Into<String>) -> Self {
        self.path_marker = Some(marker.into());
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn LineSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_terminator(mut self, terminator: Box<dyn Terminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// The most recently finished or skipped step.
    pub fn last_run(&self) -> Option<&ProcessRun> {
        self.last.as_ref()
    }

    /// Start `command` as step `name`.
    ///
    /// Returns `Ok(false)` without spawning when the policy excludes the
    /// step. The child gets its own process group and piped stdio.
    pub fn start(&mut self, command: &[String], name: &str) -> Result<bool> {
        if let Some(active) = &self.active {
            return Err(Error::AlreadyRunning(active.run.name.clone()));
        }

        let mut run = ProcessRun::new(name, command);
        if !self.policy.allows(name) {
            log::info!("Skipping step {name}");
            run.state = RunState::Skipped;
            self.last = Some(run);
            return Ok(false);
        }

        let Some((program, args)) = command.split_first() else {
            return Err(Error::EmptyCommand {
                step: name.to_string(),
            });
        };

        log::info!("Starting step {name}");
        log::debug!("Command: {program} ({} arguments)", args.len());

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(path) = self.path_marker.as_deref().and_then(sanitized_env_path) {
            cmd.env("PATH", path);
        }

        let child = cmd.spawn().map_err(|source| Error::Spawn {
            command: program.clone(),
            source,
        })?;

        run.started_at = Some(Utc::now());
        run.process_group_id = process_group_of(child.id());
        run.state = RunState::Running;
        log::debug!(
            "Step started with process group {}",
            run.process_group_id.unwrap_or_default()
        );

        self.active = Some(Active { run, child });
        Ok(true)
    }

    /// Relay the running step's output until it exits.
    ///
    /// Every line containing `prompt` gets one `y` answer on stdin. Returns
    /// the finished run on exit code 0; any other exit ends the program.
    pub fn observe(&mut self, prompt: Option<&str>) -> Result<ProcessRun> {
        let Active { mut run, mut child } = self.active.take().ok_or(Error::NotRunning)?;

        let mut channels = [
            Channel::new(Stream::Stdout, child.stdout.take()),
            Channel::new(Stream::Stderr, child.stderr.take()),
        ];
        let mut handler = LineHandler {
            step: &run.name,
            sink: self.sink.as_ref(),
            prompt,
            stdin: child.stdin.take(),
            answered: 0,
        };

        if let Err(err) = relay(&mut child, &mut channels, &mut handler) {
            abandon(&mut child, run.process_group_id);
            return Err(err);
        }

        for channel in &mut channels {
            handler.flush(channel);
        }
        let answered = handler.answered;
        drop(handler);

        let status = match child.wait() {
            Ok(status) => status,
            Err(err) => {
                abandon(&mut child, run.process_group_id);
                return Err(err.into());
            }
        };
        run.ended_at = Some(Utc::now());
        run.exit_code = status.code();
        run.prompts_answered = answered;
        let secs = run.duration_secs();

        if status.success() {
            log::info!("Step {} completed successfully in {secs:.0} seconds", run.name);
            run.state = RunState::Succeeded;
            self.last = Some(run.clone());
            return Ok(run);
        }

        match (status.code(), status.signal()) {
            (Some(code), _) => log::error!(
                "Step {} failed with return code {code} in {secs:.0} seconds",
                run.name
            ),
            (None, Some(signal)) => log::error!(
                "Step {} killed by signal {signal} after {secs:.0} seconds",
                run.name
            ),
            (None, None) => log::error!("Step {} failed after {secs:.0} seconds", run.name),
        }
        run.state = RunState::Failed;
        self.last = Some(run);
        self.terminator.terminate(1)
    }

    /// [`start`](Self::start) then [`observe`](Self::observe). Returns
    /// `None` for a skipped step.
    pub fn run_step(
        &mut self,
        command: &[String],
        name: &str,
        prompt: Option<&str>,
    ) -> Result<Option<ProcessRun>> {
        if !self.start(command, name)? {
            return Ok(None);
        }
        self.observe(prompt).map(Some)
    }
}

/// Pump both pipes until they close, or until the child has exited and
/// nothing is left to read.
fn relay(
    child: &mut Child,
    channels: &mut [Channel],
    handler: &mut LineHandler<'_>,
) -> Result<()> {
    loop {
        let Some(ready) = poll_open(channels, POLL_TIMEOUT_MS)? else {
            return Ok(());
        };
        if ready.is_empty() {
            if child.try_wait()?.is_some() {
                // A grandchild may hold the pipes open; take what is buffered.
                return drain(channels, handler);
            }
            continue;
        }
        for index in ready {
            handler.pump(&mut channels[index])?;
        }
    }
}

/// Read everything already buffered in the open pipes without blocking.
fn drain(channels: &mut [Channel], handler: &mut LineHandler<'_>) -> Result<()> {
    while let Some(ready) = poll_open(channels, 0)? {
        if ready.is_empty() {
            break;
        }
        for index in ready {
            handler.pump(&mut channels[index])?;
        }
    }
    Ok(())
}

/// Indices of readable (or hung up) channels, `None` once all are closed.
fn poll_open(channels: &[Channel], timeout_ms: libc::c_int) -> io::Result<Option<Vec<usize>>> {
    let open: Vec<usize> = (0..channels.len())
        .filter(|i| channels[*i].pipe.is_some())
        .collect();
    if open.is_empty() {
        return Ok(None);
    }

    let mut fds: Vec<libc::pollfd> = open
        .iter()
        .filter_map(|i| channels[*i].pipe.as_ref())
        .map(|pipe| libc::pollfd {
            fd: pipe.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    loop {
        // SAFETY: `fds` is a valid, exclusively borrowed array of pollfd
        // whose descriptors stay open for the duration of the call.
        let ready =
            unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ready >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    let readable = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
    Ok(Some(
        fds.iter()
            .zip(open)
            .filter(|(pollfd, _)| pollfd.revents & readable != 0)
            .map(|(_, index)| index)
            .collect(),
    ))
}

/// Kill the step's process group and reap the child after a relay error.
fn abandon(child: &mut Child, process_group_id: Option<i32>) {
    match process_group_id {
        // SAFETY: killpg only sends a signal; the group was created for this step.
        Some(pgid) => unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        },
        None => {
            if let Err(e) = child.kill() {
                log::warn!("Could not kill step process: {e}");
            }
        }
    }
    if let Err(e) = child.wait() {
        log::warn!("Could not reap step process: {e}");
    }
}

fn process_group_of(pid: u32) -> Option<i32> {
    let pid = libc::pid_t::try_from(pid).ok()?;
    // SAFETY: getpgid only reads kernel state for the given pid.
    let pgid = unsafe { libc::getpgid(pid) };
    (pgid >= 0).then_some(pgid)
}
