//! Session model and the collaborator seams the controller drives.
//!
//! A session is an opaque handle to one external client or server
//! process. The controller never touches OS processes directly: it
//! spawns and stops sessions through [`SessionLifecycle`] and observes
//! their output through the single blocking [`OutputWait`] primitive.
//! The production implementation of both is [`crate::process::ProcessPool`];
//! tests substitute fakes.

use std::fmt;
use std::io;

use thiserror::Error;

/// Errors from the session collaborators.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The external process could not be started.
    #[error("failed to spawn session {id}: {source}")]
    Spawn {
        id: SessionId,
        #[source]
        source: io::Error,
    },
    /// A stop signal could not be delivered to a live process.
    #[error("failed to signal session {id}: {source}")]
    Signal {
        id: SessionId,
        #[source]
        source: io::Error,
    },
    /// I/O failure in the multiplexed wait.
    #[error("output wait failed: {0}")]
    Wait(#[from] io::Error),
}

/// Identifier of one session under simulation, e.g. `h17` or `srv1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Creates an identifier from a leaf name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The leaf name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Command line for one session process, produced by expanding a
/// command template against the session's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    /// Program to execute.
    pub program: String,
    /// Arguments, already expanded.
    pub args: Vec<String>,
}

impl SessionDescriptor {
    /// Expands a whitespace-separated command template.
    ///
    /// Placeholders: `{name}` (leaf name), `{station}` (leaf name
    /// uppercased — the station address the client registers under),
    /// `{iface}` (`{name}-eth0`, the interface the substrate attaches
    /// the process to) and `{index}` (zero-based position in the pool).
    ///
    /// Returns `None` for an empty template.
    #[must_use]
    pub fn from_template(template: &str, id: &SessionId, index: usize) -> Option<Self> {
        let expand = |part: &str| {
            part.replace("{name}", id.name())
                .replace("{station}", &id.name().to_uppercase())
                .replace("{iface}", &format!("{}-eth0", id.name()))
                .replace("{index}", &index.to_string())
        };
        let mut parts = template.split_whitespace();
        let program = expand(parts.next()?);
        let args = parts.map(expand).collect();
        Some(Self { program, args })
    }
}

/// One line of output observed from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub session: SessionId,
    pub text: String,
}

/// Starts and stops external session processes.
///
/// Process supervision is out of scope: the controller assumes both
/// operations succeed and has no retry logic. A stop request to a
/// process that already exited on its own counts as success.
pub trait SessionLifecycle {
    /// Starts the session's external process.
    fn spawn(&mut self, id: &SessionId, descriptor: &SessionDescriptor)
        -> Result<(), SessionError>;

    /// Requests a graceful stop; no further output is expected from the
    /// session afterwards.
    fn send_stop(&mut self, id: &SessionId) -> Result<(), SessionError>;
}

/// The single blocking multiplex primitive of the event loop.
pub trait OutputWait {
    /// Blocks until one monitored session has produced a line or
    /// `timeout` has elapsed, whichever comes first. `Ok(None)` means
    /// the wait timed out. Negative timeouts are treated as zero.
    fn wait_output(
        &mut self,
        timeout: crate::timing::Delta,
    ) -> Result<Option<OutputLine>, SessionError>;
}
