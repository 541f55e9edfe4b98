//! Concurrent child processes (traffic generators, profilers) behind a
//! uniform start/interrupt/wait/collect interface.
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        source: std::io::Error,
    },
    #[error("unknown process handle: {0:?}")]
    UnknownHandle(ProcHandle),
    #[error("failed to signal `{cmd}`: {reason}")]
    Signal { cmd: String, reason: String },
    #[error("failed to wait for `{cmd}`: {source}")]
    Wait {
        cmd: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// A command line plus extra environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: &str) -> Self {
        Invocation {
            program: program.to_owned(),
            ..Default::default()
        }
    }

    pub fn arg<S: ToString>(mut self, arg: S) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_owned(), value.to_owned()));
        self
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.envs.iter().map(|(k, v)| (k, v)));
        cmd
    }
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (k, v) in &self.envs {
            write!(f, "{}={} ", k, v)?;
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcHandle(pub usize);

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Code(i32),
    Signal(i32),
}

impl Exit {
    #[inline]
    pub fn success(&self) -> bool {
        *self == Exit::Code(0)
    }
}

impl From<ExitStatus> for Exit {
    fn from(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match status.code() {
            Some(code) => Exit::Code(code),
            None => Exit::Signal(status.signal().unwrap_or_default()),
        }
    }
}

impl std::fmt::Display for Exit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exit::Code(code) => write!(f, "exited with code: {}", code),
            Exit::Signal(sig) => write!(f, "terminated by signal: {}", sig),
        }
    }
}

/// Starts and tracks child processes.
///
/// `start` never blocks; `wait` blocks for exactly one process and never
/// touches its siblings.
pub trait Launcher {
    fn start(&mut self, inv: &Invocation) -> Result<ProcHandle>;
    /// Ask the process to stop gracefully (SIGINT).
    fn interrupt(&mut self, handle: ProcHandle) -> Result<()>;
    fn wait(&mut self, handle: ProcHandle) -> Result<Exit>;
    /// Combined stdout/stderr lines captured so far.
    fn collect_output(&mut self, handle: ProcHandle) -> Vec<String>;
}

/// Wait every handle in order. A failure of one never skips the rest.
pub fn wait_all<L: Launcher + ?Sized>(launcher: &mut L, handles: &[ProcHandle]) -> Vec<Result<Exit>> {
    handles.iter().map(|&h| launcher.wait(h)).collect()
}

/// Run `inv` to completion and return its output.
pub fn run_to_end<L: Launcher + ?Sized>(launcher: &mut L, inv: &Invocation) -> Result<(Exit, Vec<String>)> {
    let handle = launcher.start(inv)?;
    let exit = launcher.wait(handle)?;
    Ok((exit, launcher.collect_output(handle)))
}

type Lines = Arc<Mutex<Vec<String>>>;

struct Slot {
    cmd: String,
    child: Child,
    lines: Lines,
    readers: Vec<JoinHandle<()>>,
    exit: Option<Exit>,
}

fn spawn_reader<R: Read + Send + 'static>(stream: R, lines: Lines) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(&['\n', '\r'][..]).to_owned();
                    lines.lock().unwrap_or_else(PoisonError::into_inner).push(line);
                }
                Err(e) => {
                    log::warn!("output reader stopped: {}", e);
                    break;
                }
            }
        }
    })
}

/// OS-backed [`Launcher`].
#[derive(Default)]
pub struct ProcessPool {
    slots: Vec<Slot>,
}

impl ProcessPool {
    pub fn new() -> Self {
        Default::default()
    }

    fn slot_mut(&mut self, handle: ProcHandle) -> Result<&mut Slot> {
        self.slots
            .get_mut(handle.0)
            .ok_or(ProcessError::UnknownHandle(handle))
    }

    /// Number of started processes that have not been waited yet.
    pub fn running(&self) -> usize {
        self.slots.iter().filter(|s| s.exit.is_none()).count()
    }
}

impl Launcher for ProcessPool {
    fn start(&mut self, inv: &Invocation) -> Result<ProcHandle> {
        let cmd_str = inv.to_string();
        log::debug!("+ {}", cmd_str);

        let mut cmd = inv.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            cmd: cmd_str.clone(),
            source,
        })?;

        let lines: Lines = Default::default();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Arc::clone(&lines)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Arc::clone(&lines)));
        }

        self.slots.push(Slot {
            cmd: cmd_str,
            child,
            lines,
            readers,
            exit: None,
        });
        Ok(ProcHandle(self.slots.len() - 1))
    }

    fn interrupt(&mut self, handle: ProcHandle) -> Result<()> {
        let slot = self.slot_mut(handle)?;
        if slot.exit.is_some() {
            return Ok(());
        }
        log::debug!("interrupting: {}", slot.cmd);
        let pid = Pid::from_raw(slot.child.id() as i32);
        match signal::kill(pid, Signal::SIGINT) {
            Ok(()) => Ok(()),
            // exited on its own but not reaped yet
            Err(nix::Error::Sys(nix::errno::Errno::ESRCH)) => Ok(()),
            Err(e) => Err(ProcessError::Signal {
                cmd: slot.cmd.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn wait(&mut self, handle: ProcHandle) -> Result<Exit> {
        let slot = self.slot_mut(handle)?;
        if let Some(exit) = slot.exit {
            return Ok(exit);
        }
        let status = slot.child.wait().map_err(|source| ProcessError::Wait {
            cmd: slot.cmd.clone(),
            source,
        })?;
        for reader in slot.readers.drain(..) {
            if reader.join().is_err() {
                log::warn!("output reader of `{}` panicked", slot.cmd);
            }
        }
        let exit = Exit::from(status);
        if !exit.success() {
            log::warn!("{}, cmd: {}", exit, slot.cmd);
        }
        slot.exit = Some(exit);
        Ok(exit)
    }

    fn collect_output(&mut self, handle: ProcHandle) -> Vec<String> {
        match self.slots.get(handle.0) {
            Some(slot) => slot
                .lines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            None => Vec::new(),
        }
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut().filter(|s| s.exit.is_none()) {
            log::warn!("killing the child process: {}", slot.cmd);
            let _ = slot.child.kill();
            let _ = slot.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> Invocation {
        Invocation::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn captures_stdout_and_stderr() {
        logging::init_test_log();
        let mut pool = ProcessPool::new();
        let (exit, lines) = run_to_end(&mut pool, &sh("echo out; echo err >&2")).unwrap();
        assert!(exit.success());
        let mut sorted = lines.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["err", "out"]);
    }

    #[test]
    fn start_does_not_block_and_processes_overlap() {
        let mut pool = ProcessPool::new();
        let begin = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|i| pool.start(&sh(&format!("sleep 0.3; echo {}", i))).unwrap())
            .collect();
        assert!(begin.elapsed() < Duration::from_millis(250));
        assert_eq!(pool.running(), 4);

        let exits = wait_all(&mut pool, &handles);
        assert!(exits.iter().all(|e| e.as_ref().unwrap().success()));
        // four sequential sleeps would take 1.2s
        assert!(begin.elapsed() < Duration::from_millis(1000));
        for (i, &h) in handles.iter().enumerate() {
            assert_eq!(pool.collect_output(h), vec![i.to_string()]);
        }
    }

    #[test]
    fn failure_is_recorded_and_siblings_keep_running() {
        let mut pool = ProcessPool::new();
        let bad = pool.start(&sh("exit 3")).unwrap();
        let good = pool.start(&sh("sleep 0.2; echo done")).unwrap();
        assert_eq!(pool.wait(bad).unwrap(), Exit::Code(3));
        assert!(pool.wait(good).unwrap().success());
        assert_eq!(pool.collect_output(good), vec!["done"]);
        // waiting again returns the recorded status
        assert_eq!(pool.wait(bad).unwrap(), Exit::Code(3));
    }

    #[test]
    fn interrupt_stops_open_ended_process() {
        let mut pool = ProcessPool::new();
        let h = pool
            .start(&sh("trap 'echo stopped; exit 0' INT; echo started; while true; do sleep 0.05; done"))
            .unwrap();
        // give the shell time to install its trap
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.collect_output(h).is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        pool.interrupt(h).unwrap();
        assert!(pool.wait(h).unwrap().success());
        assert_eq!(pool.collect_output(h), vec!["started", "stopped"]);
        // interrupting a finished process is harmless
        pool.interrupt(h).unwrap();
    }

    #[test]
    fn spawn_failure_and_unknown_handle() {
        let mut pool = ProcessPool::new();
        assert!(matches!(
            pool.start(&Invocation::new("/nonexistent/iperf")),
            Err(ProcessError::Spawn { .. })
        ));
        assert!(matches!(
            pool.wait(ProcHandle(42)),
            Err(ProcessError::UnknownHandle(ProcHandle(42)))
        ));
        assert!(pool.collect_output(ProcHandle(42)).is_empty());
    }

    #[test]
    fn environment_is_passed() {
        let mut pool = ProcessPool::new();
        let inv = sh("echo $PERF_PAGER").env("PERF_PAGER", "cat");
        assert_eq!(inv.to_string(), "PERF_PAGER=cat sh -c 'echo $PERF_PAGER'");
        let (_, lines) = run_to_end(&mut pool, &inv).unwrap();
        assert_eq!(lines, vec!["cat"]);
    }
}
