//! Process-backed session collaborator.
//!
//! Spawns session binaries with piped stdout, marks the pipes
//! non-blocking, and registers them with a [`mio::Poll`] so the
//! controller's single blocking wait can multiplex line output from any
//! number of children against a timer-derived timeout. Stop requests are
//! delivered as SIGTERM; a child that already exited is not an error.
//!
//! Pipes stay registered after a stop request until EOF, so output the
//! process flushes while shutting down is still observed, then the child
//! is reaped.

use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind, Read};
use std::os::fd::AsRawFd;
use std::process::{Child, ChildStdout, Command, Stdio};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use rustix::fs::OFlags;
use rustix::process::{Pid, Signal};

use crate::session::{
    OutputLine, OutputWait, SessionDescriptor, SessionError, SessionId, SessionLifecycle,
};
use crate::timing::Delta;
use crate::trace::{debug, warn};

/// Readiness events drained per poll call.
const EVENTS_CAPACITY: usize = 256;

/// Read chunk size for draining a ready pipe.
const READ_CHUNK: usize = 4096;

struct Proc {
    id: SessionId,
    child: Child,
    stdout: ChildStdout,
    /// Bytes read but not yet terminated by a newline.
    partial: Vec<u8>,
}

/// Pool of monitored session processes implementing both collaborator
/// seams.
pub struct ProcessPool {
    poll: Poll,
    events: Events,
    procs: HashMap<Token, Proc>,
    /// Latest token per session (a respawn supersedes the old mapping;
    /// the superseded pipe is still drained until EOF).
    by_session: HashMap<SessionId, Token>,
    next_token: usize,
    /// Complete lines parsed but not yet handed out.
    pending: VecDeque<OutputLine>,
}

impl ProcessPool {
    /// Creates an empty pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the poll instance cannot be created.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            procs: HashMap::new(),
            by_session: HashMap::new(),
            next_token: 0,
            pending: VecDeque::new(),
        })
    }

    /// Number of processes currently monitored.
    #[must_use]
    pub fn monitored(&self) -> usize {
        self.procs.len()
    }

    /// Sends SIGTERM to every monitored process and reaps them.
    /// Called once at the end of a run; the substrate's own teardown
    /// handles anything beyond the session processes.
    pub fn shutdown(&mut self) {
        for (_token, mut proc) in self.procs.drain() {
            let fd = proc.stdout.as_raw_fd();
            if let Err(_e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                warn!(session = %proc.id, error = %_e, "deregister failed during shutdown");
            }
            if let Err(_e) = signal_term(&proc.child) {
                debug!(session = %proc.id, error = %_e, "SIGTERM during shutdown failed");
            }
            if let Err(_e) = proc.child.wait() {
                warn!(session = %proc.id, error = %_e, "failed to reap child");
            }
        }
        self.by_session.clear();
    }

    /// Drains a ready pipe, splitting complete lines into the pending
    /// queue. Returns `true` when the pipe reached EOF.
    fn drain_pipe(proc: &mut Proc, pending: &mut VecDeque<OutputLine>) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match proc.stdout.read(&mut chunk) {
                Ok(0) => {
                    // EOF: flush any unterminated tail as a final line.
                    if !proc.partial.is_empty() {
                        let text = String::from_utf8_lossy(&proc.partial).into_owned();
                        proc.partial.clear();
                        pending.push_back(OutputLine {
                            session: proc.id.clone(),
                            text,
                        });
                    }
                    return Ok(true);
                }
                Ok(n) => {
                    proc.partial.extend_from_slice(&chunk[..n]);
                    while let Some(pos) = proc.partial.iter().position(|&b| b == b'\n') {
                        let rest = proc.partial.split_off(pos + 1);
                        proc.partial.pop(); // trailing newline
                        let text = String::from_utf8_lossy(&proc.partial).into_owned();
                        proc.partial = rest;
                        pending.push_back(OutputLine {
                            session: proc.id.clone(),
                            text,
                        });
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Handles readiness on one token; removes the entry on EOF.
    fn service_token(&mut self, token: Token) -> io::Result<()> {
        let eof = match self.procs.get_mut(&token) {
            Some(proc) => Self::drain_pipe(proc, &mut self.pending)?,
            None => return Ok(()),
        };
        if !eof {
            return Ok(());
        }
        if let Some(mut proc) = self.procs.remove(&token) {
            let fd = proc.stdout.as_raw_fd();
            self.poll.registry().deregister(&mut SourceFd(&fd))?;
            if let Err(_e) = proc.child.wait() {
                warn!(session = %proc.id, error = %_e, "failed to reap child");
            }
            if self.by_session.get(&proc.id) == Some(&token) {
                self.by_session.remove(&proc.id);
            }
            debug!(session = %proc.id, "session process exited");
        }
        Ok(())
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SessionLifecycle for ProcessPool {
    fn spawn(
        &mut self,
        id: &SessionId,
        descriptor: &SessionDescriptor,
    ) -> Result<(), SessionError> {
        let mut child = Command::new(&descriptor.program)
            .args(&descriptor.args)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| SessionError::Spawn {
                id: id.clone(),
                source,
            })?;
        let stdout = child.stdout.take().ok_or_else(|| SessionError::Spawn {
            id: id.clone(),
            source: io::Error::other("stdout not captured"),
        })?;

        set_nonblocking(&stdout).map_err(|source| SessionError::Spawn {
            id: id.clone(),
            source,
        })?;

        let token = Token(self.next_token);
        self.next_token += 1;
        let fd = stdout.as_raw_fd();
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
            .map_err(|source| SessionError::Spawn {
                id: id.clone(),
                source,
            })?;

        debug!(session = %id, program = %descriptor.program, pid = child.id(), "spawned");
        self.procs.insert(
            token,
            Proc {
                id: id.clone(),
                child,
                stdout,
                partial: Vec::new(),
            },
        );
        self.by_session.insert(id.clone(), token);
        Ok(())
    }

    fn send_stop(&mut self, id: &SessionId) -> Result<(), SessionError> {
        // A session whose process exited on its own was already reaped
        // at EOF; the stop it was asked for has de facto happened.
        let Some(token) = self.by_session.get(id) else {
            debug!(session = %id, "stop for an already-reaped session");
            return Ok(());
        };
        let Some(proc) = self.procs.get(token) else {
            return Ok(());
        };
        signal_term(&proc.child).map_err(|source| SessionError::Signal {
            id: id.clone(),
            source,
        })
    }
}

impl OutputWait for ProcessPool {
    fn wait_output(&mut self, timeout: Delta) -> Result<Option<OutputLine>, SessionError> {
        if let Some(line) = self.pending.pop_front() {
            return Ok(Some(line));
        }

        match self.poll.poll(&mut self.events, Some(timeout.clamped_std())) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let ready: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
        for token in ready {
            self.service_token(token)?;
        }
        Ok(self.pending.pop_front())
    }
}

/// Marks a pipe non-blocking so a ready pipe can be drained until
/// `WouldBlock` instead of stalling the loop.
fn set_nonblocking(stdout: &ChildStdout) -> io::Result<()> {
    let flags = rustix::fs::fcntl_getfl(stdout)?;
    rustix::fs::fcntl_setfl(stdout, flags | OFlags::NONBLOCK)?;
    Ok(())
}

/// Delivers SIGTERM. A process that already exited (ESRCH) counts as
/// stopped.
fn signal_term(child: &Child) -> io::Result<()> {
    let Some(pid) = Pid::from_raw(child.id() as i32) else {
        return Err(io::Error::other("child has pid 0"));
    };
    match rustix::process::kill_process(pid, Signal::Term) {
        Ok(()) | Err(rustix::io::Errno::SRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(shell: &str) -> SessionDescriptor {
        SessionDescriptor {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), shell.to_string()],
        }
    }

    #[test]
    fn lines_are_attributed_and_delivered() {
        let mut pool = ProcessPool::new().unwrap();
        let id = SessionId::new("h1");
        pool.spawn(&id, &descriptor("printf 'one\\ntwo\\n'")).unwrap();

        let mut seen = Vec::new();
        for _ in 0..50 {
            if let Some(line) = pool.wait_output(Delta::from_millis(100)).unwrap() {
                seen.push(line);
            }
            if seen.len() == 2 {
                break;
            }
        }
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|l| l.session == id));
        assert_eq!(seen[0].text, "one");
        assert_eq!(seen[1].text, "two");
    }

    #[test]
    fn timeout_with_silent_child_returns_none() {
        let mut pool = ProcessPool::new().unwrap();
        let id = SessionId::new("h1");
        pool.spawn(&id, &descriptor("sleep 5")).unwrap();

        let out = pool.wait_output(Delta::from_millis(10)).unwrap();
        assert!(out.is_none());
        pool.shutdown();
        assert_eq!(pool.monitored(), 0);
    }

    #[test]
    fn stop_then_eof_unregisters_the_session() {
        let mut pool = ProcessPool::new().unwrap();
        let id = SessionId::new("h1");
        pool.spawn(&id, &descriptor("sleep 30")).unwrap();
        pool.send_stop(&id).unwrap();

        for _ in 0..50 {
            let _ = pool.wait_output(Delta::from_millis(100)).unwrap();
            if pool.monitored() == 0 {
                break;
            }
        }
        assert_eq!(pool.monitored(), 0);
        // A second stop finds nothing to signal, which is fine.
        pool.send_stop(&id).unwrap();
    }

    #[test]
    fn stop_after_natural_exit_is_not_an_error() {
        let mut pool = ProcessPool::new().unwrap();
        let id = SessionId::new("h1");
        pool.spawn(&id, &descriptor("true")).unwrap();
        // The child exits on its own; SIGTERM to the dead pid is fine
        // as long as the pool still tracks it.
        std::thread::sleep(std::time::Duration::from_millis(50));
        pool.send_stop(&id).unwrap();
        pool.shutdown();
    }

    // A short-lived session must survive its departure timer: the child
    // exits, EOF reaps it, and the stop the scheduler sends later still
    // succeeds so the session can be recycled.
    #[test]
    fn stop_after_self_exit_and_reap_succeeds() {
        let mut pool = ProcessPool::new().unwrap();
        let id = SessionId::new("h1");
        pool.spawn(&id, &descriptor("true")).unwrap();

        for _ in 0..50 {
            let _ = pool.wait_output(Delta::from_millis(100)).unwrap();
            if pool.monitored() == 0 {
                break;
            }
        }
        assert_eq!(pool.monitored(), 0);
        pool.send_stop(&id).unwrap();
    }
}
