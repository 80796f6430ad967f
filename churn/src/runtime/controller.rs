//! Event-driven controller.
//!
//! Responsibilities:
//! - Own the experiment timeline: one delta timer queue plus the
//!   idle-pool / active-set bookkeeping for every session.
//! - Drive the stochastic arrival and departure processes.
//! - Multiplex timer expiry against session output with a single
//!   blocking wait per loop iteration, its timeout recomputed from the
//!   queue every time.
//! - Relay observed `(session, line)` pairs to the output sink.
//!
//! Single-threaded and cooperative: all timer mutation and event
//! dispatch happen strictly between wakeups. The only state shared
//! across a concurrency boundary is the external stop flag, polled once
//! per iteration.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::config::HarnessConfig;
use crate::session::{OutputWait, SessionDescriptor, SessionError, SessionId, SessionLifecycle};
use crate::sink::RelaySink;
use crate::timing::{Clock, Delta, DeltaTimerQueue, MonoClock};
use crate::trace::{debug, info, warn};

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("output sink failed: {0}")]
    Sink(#[from] io::Error),
    #[error("no descriptor for session {0}")]
    MissingDescriptor(SessionId),
}

/// Scheduled event payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TimerEvent {
    /// A new session wants to join; recurring.
    Arrival,
    /// The given active session leaves; one-shot.
    Departure(SessionId),
    /// Finite run duration elapsed.
    Finish,
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Arrival events fired (the arrival clock ticks even when the idle
    /// pool is exhausted).
    pub arrival_events: u64,
    /// Sessions actually spawned.
    pub spawns: u64,
    /// Departure events fired.
    pub departures: u64,
    /// Peak concurrently active sessions.
    pub peak_active: usize,
}

/// The orchestrator: owns the timer queue, the session bookkeeping and
/// the main loop.
///
/// `D` is the session collaborator (process pool in production, fakes in
/// tests); `C` is the clock the timer queue runs on.
pub struct Controller<D, C: Clock = MonoClock> {
    timers: DeltaTimerQueue<TimerEvent, C>,
    sessions: D,
    sink: RelaySink,
    /// Sessions not currently running, reusable by the next arrival.
    idle: VecDeque<SessionId>,
    /// Sessions with a live process and a pending departure.
    active: HashSet<SessionId>,
    descriptors: HashMap<SessionId, SessionDescriptor>,
    /// Server sessions spawned up-front and monitored for the whole run.
    servers: Vec<SessionId>,
    arrival_rate: f64,
    departure_rate: f64,
    run_limit: Option<Delta>,
    rng: ChaCha8Rng,
    /// External interrupt token; an operator-requested stop sets this
    /// from another thread.
    stop: Arc<AtomicBool>,
    /// Set by the finish event; checked at the top of each iteration.
    finalize: bool,
    stats: RunStats,
}

impl<D: SessionLifecycle + OutputWait> Controller<D> {
    /// Creates a controller on the monotonic clock.
    pub fn new(
        config: &HarnessConfig,
        servers: Vec<(SessionId, SessionDescriptor)>,
        clients: Vec<(SessionId, SessionDescriptor)>,
        sessions: D,
        sink: RelaySink,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self::with_clock(config, servers, clients, sessions, sink, stop, MonoClock::new())
    }
}

impl<D: SessionLifecycle + OutputWait, C: Clock> Controller<D, C> {
    /// Creates a controller on an explicit clock (tests drive a manual
    /// one to run schedules in virtual time).
    pub fn with_clock(
        config: &HarnessConfig,
        servers: Vec<(SessionId, SessionDescriptor)>,
        clients: Vec<(SessionId, SessionDescriptor)>,
        sessions: D,
        sink: RelaySink,
        stop: Arc<AtomicBool>,
        clock: C,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let mut descriptors = HashMap::new();
        let mut server_ids = Vec::with_capacity(servers.len());
        for (id, descriptor) in servers {
            descriptors.insert(id.clone(), descriptor);
            server_ids.push(id);
        }
        let mut idle = VecDeque::with_capacity(clients.len());
        for (id, descriptor) in clients {
            descriptors.insert(id.clone(), descriptor);
            idle.push_back(id);
        }
        Self {
            timers: DeltaTimerQueue::with_clock(clock),
            sessions,
            sink,
            idle,
            active: HashSet::new(),
            descriptors,
            servers: server_ids,
            arrival_rate: config.arrival_rate,
            departure_rate: config.departure_rate,
            run_limit: config.run_secs.map(Delta::from_secs_f64),
            rng,
            stop,
            finalize: false,
            stats: RunStats::default(),
        }
    }

    /// Sessions currently active.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Sessions waiting in the idle pool.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Runs the experiment to completion.
    ///
    /// Spawns the configured servers, seeds the arrival process (and the
    /// finish event when a finite duration is configured), then loops:
    /// drain due timers, one multiplexed output wait with the remaining
    /// time to the next timer as its timeout. Exits when the finish
    /// event or the external stop flag is seen.
    ///
    /// # Errors
    ///
    /// Returns an error when a spawn, stop signal, wait, or sink write
    /// fails. Partially written output is preserved.
    pub fn run(&mut self) -> Result<RunStats, HarnessError> {
        for id in self.servers.clone() {
            let descriptor = self
                .descriptors
                .get(&id)
                .cloned()
                .ok_or_else(|| HarnessError::MissingDescriptor(id.clone()))?;
            self.sessions.spawn(&id, &descriptor)?;
            info!(session = %id, "server started");
        }

        // The recurring arrival keeps the queue non-empty for the whole
        // run, which next_deadline() relies on.
        let first_arrival = self.exp_delay(self.arrival_rate);
        self.timers.insert(first_arrival, TimerEvent::Arrival);
        if let Some(limit) = self.run_limit {
            self.timers.insert(limit, TimerEvent::Finish);
        }

        while !self.finalize && !self.stop.load(Ordering::Relaxed) {
            while let Some((event, overshoot)) = self.timers.pop_due() {
                self.dispatch(event, overshoot)?;
                if self.finalize {
                    break;
                }
            }
            if self.finalize || self.stop.load(Ordering::Relaxed) {
                break;
            }

            let budget = self.timers.next_deadline();
            if let Some(line) = self.sessions.wait_output(budget)? {
                self.sink.relay(&line.session, &line.text)?;
            }
        }

        self.sink.flush().map_err(HarnessError::Sink)?;
        info!(
            arrivals = self.stats.arrival_events,
            spawns = self.stats.spawns,
            departures = self.stats.departures,
            peak_active = self.stats.peak_active,
            "run complete"
        );
        Ok(self.stats)
    }

    fn dispatch(&mut self, event: TimerEvent, overshoot: Delta) -> Result<(), HarnessError> {
        match event {
            TimerEvent::Arrival => self.on_arrival(overshoot),
            TimerEvent::Departure(id) => self.on_departure(id, overshoot),
            TimerEvent::Finish => {
                info!("run duration elapsed, finalizing");
                self.finalize = true;
                Ok(())
            }
        }
    }

    /// Spawns an idle session if one is available and, regardless,
    /// reschedules the next arrival — an exhausted pool skips the spawn
    /// but the arrival clock keeps ticking.
    fn on_arrival(&mut self, _overshoot: Delta) -> Result<(), HarnessError> {
        self.stats.arrival_events += 1;
        if let Some(id) = self.idle.pop_front() {
            let descriptor = self
                .descriptors
                .get(&id)
                .cloned()
                .ok_or_else(|| HarnessError::MissingDescriptor(id.clone()))?;
            self.sessions.spawn(&id, &descriptor)?;
            self.active.insert(id.clone());
            self.stats.spawns += 1;
            self.stats.peak_active = self.stats.peak_active.max(self.active.len());

            let lifetime = self.exp_delay(self.departure_rate);
            debug!(session = %id, lifetime = %lifetime, overshoot = %_overshoot, "session arrived");
            self.timers.insert(lifetime, TimerEvent::Departure(id));
        } else {
            debug!(overshoot = %_overshoot, "arrival with exhausted pool, skipping spawn");
        }

        let next = self.exp_delay(self.arrival_rate);
        self.timers.insert(next, TimerEvent::Arrival);
        Ok(())
    }

    /// Sends a graceful stop and returns the session to the idle pool.
    /// One-shot: departures never reschedule themselves.
    fn on_departure(&mut self, id: SessionId, _overshoot: Delta) -> Result<(), HarnessError> {
        self.stats.departures += 1;
        self.sessions.send_stop(&id)?;
        if !self.active.remove(&id) {
            warn!(session = %id, "departure for a session not marked active");
        }
        debug!(session = %id, overshoot = %_overshoot, "session departed");
        self.idle.push_back(id);
        Ok(())
    }

    /// Draws an exponentially distributed delay with the given rate.
    /// A non-positive rate is a scheduling-invariant violation (caught
    /// at config validation; asserted here).
    fn exp_delay(&mut self, rate: f64) -> Delta {
        assert!(
            rate > 0.0 && rate.is_finite(),
            "stochastic rate must be positive and finite, got {rate}"
        );
        let u: f64 = self.rng.gen();
        Delta::from_secs_f64(-(1.0 - u).ln() / rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeSessions {
        spawned: Vec<SessionId>,
        stopped: Vec<SessionId>,
    }

    impl SessionLifecycle for FakeSessions {
        fn spawn(
            &mut self,
            id: &SessionId,
            _descriptor: &SessionDescriptor,
        ) -> Result<(), SessionError> {
            self.spawned.push(id.clone());
            Ok(())
        }

        fn send_stop(&mut self, id: &SessionId) -> Result<(), SessionError> {
            self.stopped.push(id.clone());
            Ok(())
        }
    }

    impl OutputWait for FakeSessions {
        fn wait_output(
            &mut self,
            _timeout: Delta,
        ) -> Result<Option<crate::session::OutputLine>, SessionError> {
            Ok(None)
        }
    }

    fn null_sink() -> RelaySink {
        RelaySink::new(Box::new(io::sink())).unwrap()
    }

    fn client(n: usize) -> (SessionId, SessionDescriptor) {
        let id = SessionId::new(format!("h{n}"));
        let descriptor =
            SessionDescriptor::from_template("client -i {iface}", &id, n - 1).unwrap();
        (id, descriptor)
    }

    fn controller(clients: usize) -> Controller<FakeSessions> {
        let config = HarnessConfig {
            clients,
            servers: 0,
            seed: Some(7),
            ..Default::default()
        };
        Controller::new(
            &config,
            Vec::new(),
            (1..=clients).map(client).collect(),
            FakeSessions::default(),
            null_sink(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn arrival_spawns_and_schedules_departure() {
        let mut c = controller(2);
        c.dispatch(TimerEvent::Arrival, Delta::ZERO).unwrap();

        assert_eq!(c.sessions.spawned, vec![SessionId::new("h1")]);
        assert_eq!(c.active_count(), 1);
        assert_eq!(c.idle_count(), 1);
        assert_eq!(c.stats.spawns, 1);
        // Departure for h1 plus the rescheduled arrival.
        assert_eq!(c.timers.len(), 2);
    }

    #[test]
    fn arrival_with_exhausted_pool_still_ticks() {
        let mut c = controller(0);
        c.dispatch(TimerEvent::Arrival, Delta::ZERO).unwrap();

        assert!(c.sessions.spawned.is_empty());
        assert_eq!(c.stats.arrival_events, 1);
        assert_eq!(c.stats.spawns, 0);
        // The arrival clock keeps ticking.
        assert_eq!(c.timers.len(), 1);
    }

    #[test]
    fn departure_recycles_the_session() {
        let mut c = controller(1);
        c.dispatch(TimerEvent::Arrival, Delta::ZERO).unwrap();
        let id = SessionId::new("h1");
        c.dispatch(TimerEvent::Departure(id.clone()), Delta::ZERO)
            .unwrap();

        assert_eq!(c.sessions.stopped, vec![id.clone()]);
        assert_eq!(c.active_count(), 0);
        assert_eq!(c.idle_count(), 1);
        // The recycled session is eligible for the next arrival.
        c.dispatch(TimerEvent::Arrival, Delta::ZERO).unwrap();
        assert_eq!(c.sessions.spawned, vec![id.clone(), id]);
    }

    #[test]
    fn external_stop_flag_exits_immediately() {
        let config = HarnessConfig {
            clients: 0,
            servers: 0,
            seed: Some(1),
            ..Default::default()
        };
        let stop = Arc::new(AtomicBool::new(true));
        let mut c = Controller::new(
            &config,
            Vec::new(),
            Vec::new(),
            FakeSessions::default(),
            null_sink(),
            stop,
        );
        let stats = c.run().unwrap();
        assert_eq!(stats, RunStats::default());
    }

    #[test]
    fn servers_spawn_at_run_start() {
        let config = HarnessConfig {
            clients: 0,
            servers: 1,
            seed: Some(1),
            ..Default::default()
        };
        let stop = Arc::new(AtomicBool::new(false));
        let srv = SessionId::new("srv1");
        let descriptor =
            SessionDescriptor::from_template("server -i {iface}", &srv, 0).unwrap();
        let mut c = Controller::new(
            &config,
            vec![(srv.clone(), descriptor)],
            Vec::new(),
            FakeSessions::default(),
            null_sink(),
            stop.clone(),
        );
        // Stop right after startup work: flag set before the first wait.
        stop.store(true, Ordering::Relaxed);
        c.run().unwrap();
        assert_eq!(c.sessions.spawned, vec![srv]);
    }

    #[test]
    #[should_panic(expected = "stochastic rate must be positive")]
    fn zero_rate_draw_aborts() {
        let mut c = controller(0);
        let _ = c.exp_delay(0.0);
    }
}
