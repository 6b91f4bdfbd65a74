//! Virtual-time replay of switch recordings

use crate::recording::{Recording, Transition};
use crate::Result;
use plunger_core::{Runtime, Time};
use tracing::{debug, info, warn};

/// State of the replayer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    /// Not started
    Idle,
    /// Some transitions fed
    Playing,
    /// Every transition fed
    Finished,
}

/// What to do with a transition for a switch the machine does not know
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownSwitch {
    /// Stop the replay with an error
    #[default]
    Fail,
    /// Log and skip the transition
    Skip,
}

/// Counters of a finished replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaySummary {
    /// Transitions that changed a switch
    pub applied: usize,
    /// Transitions that repeated the current switch state
    pub repeated: usize,
    /// Transitions for unknown switches that were skipped
    pub skipped: usize,
    /// Machine time when the replay stopped
    pub end_time: Time,
}

/// Feeds a recording into a virtual-time runtime
///
/// Time is advanced to each transition's timestamp (firing every timer due on
/// the way) before the transition is fed, and the runtime settles after every
/// step, so a replay is deterministic.
pub struct Replayer<'a> {
    recording: &'a Recording,
    position: usize,
    state: ReplayState,
    unknown: UnknownSwitch,
    tail: Time,
    summary: ReplaySummary,
}

impl<'a> Replayer<'a> {
    pub fn new(recording: &'a Recording) -> Self {
        Self {
            recording,
            position: 0,
            state: ReplayState::Idle,
            unknown: UnknownSwitch::default(),
            tail: 0,
            summary: ReplaySummary::default(),
        }
    }

    pub fn on_unknown_switch(mut self, policy: UnknownSwitch) -> Self {
        self.unknown = policy;
        self
    }

    /// Keep running this long after the last transition
    pub fn with_tail(mut self, ms: Time) -> Self {
        self.tail = ms;
        self
    }

    pub fn state(&self) -> ReplayState {
        self.state
    }

    /// Index of the next transition
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn summary(&self) -> ReplaySummary {
        self.summary
    }

    /// The transition `step` would feed next
    pub fn peek(&self) -> Option<&'a Transition> {
        self.recording.transitions().get(self.position)
    }

    /// Feed the next transition. Returns false once the recording is exhausted.
    pub fn step(&mut self, runtime: &mut Runtime) -> Result<bool> {
        let Some(transition) = self.peek() else {
            self.state = ReplayState::Finished;
            return Ok(false);
        };
        self.state = ReplayState::Playing;
        runtime.advance_to(transition.at.max(runtime.now()))?;
        match runtime.feed_switch(&transition.switch, transition.closed) {
            Ok(true) => self.summary.applied += 1,
            Ok(false) => self.summary.repeated += 1,
            Err(plunger_core::Error::UnknownSwitch(id)) if self.unknown == UnknownSwitch::Skip => {
                warn!(switch = %id, at = transition.at, "unknown switch skipped");
                self.summary.skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
        debug!(position = self.position, %transition, "transition replayed");
        self.position += 1;
        self.summary.end_time = runtime.now();
        Ok(true)
    }

    /// Feed every transition with a timestamp at or before `t`, then move the clock to `t`
    pub fn run_to(&mut self, runtime: &mut Runtime, t: Time) -> Result<()> {
        while self.peek().is_some_and(|next| next.at <= t) {
            self.step(runtime)?;
        }
        runtime.advance_to(t.max(runtime.now()))?;
        self.summary.end_time = runtime.now();
        if self.peek().is_none() {
            self.state = ReplayState::Finished;
        }
        Ok(())
    }

    /// Feed the whole recording, then run the tail
    pub fn run(&mut self, runtime: &mut Runtime) -> Result<ReplaySummary> {
        while self.step(runtime)? {}
        let end = runtime.now().max(self.recording.end_time()) + self.tail;
        runtime.advance_to(end)?;
        self.summary.end_time = runtime.now();
        info!(
            applied = self.summary.applied,
            repeated = self.summary.repeated,
            skipped = self.summary.skipped,
            end = self.summary.end_time,
            "replay finished"
        );
        Ok(self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use plunger_core::{MachineConfig, NullTransport, SwitchConfig, SwitchId};

    fn runtime() -> Runtime {
        let config = MachineConfig::default()
            .with_switch(SwitchConfig::new("start", "Start Button"))
            .with_switch(SwitchConfig::new("tilt", "Tilt Bob"));
        Runtime::virtual_time(config, NullTransport)
    }

    #[test]
    fn test_run_feeds_everything_in_time() {
        let recording = Recording::parse("10 start 1\n10 start 1\n50 start 0\n").unwrap();
        let mut rt = runtime();
        let mut replayer = Replayer::new(&recording).with_tail(100);
        let summary = replayer.run(&mut rt).unwrap();
        assert_eq!(summary.applied, 2);
        assert_eq!(summary.repeated, 1);
        assert_eq!(summary.end_time, 150);
        assert_eq!(replayer.state(), ReplayState::Finished);
        rt.with(|m| assert_eq!(m.last_change(&SwitchId::new("start")), Some(50)));
    }

    #[test]
    fn test_run_to_stops_at_time() {
        let recording = Recording::parse("10 start 1\n50 tilt 1\n").unwrap();
        let mut rt = runtime();
        let mut replayer = Replayer::new(&recording);
        replayer.run_to(&mut rt, 30).unwrap();
        assert_eq!(replayer.position(), 1);
        assert_eq!(rt.now(), 30);
        assert_eq!(replayer.state(), ReplayState::Playing);
        rt.with(|m| assert!(!m.is_closed(&SwitchId::new("tilt"))));
    }

    #[test]
    fn test_unknown_switch_policy() {
        let recording = Recording::parse("10 outhole 1\n20 start 1\n").unwrap();
        let mut rt = runtime();
        let err = Replayer::new(&recording).run(&mut rt).unwrap_err();
        assert!(matches!(err, Error::Replay(plunger_core::Error::UnknownSwitch(_))));

        let mut rt = runtime();
        let summary = Replayer::new(&recording)
            .on_unknown_switch(UnknownSwitch::Skip)
            .run(&mut rt)
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.applied, 1);
    }
}
