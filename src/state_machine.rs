//! Idle / recording / cooldown gating of motion segments.
//!
//! The machine is pure: it consumes one smoothed detector decision per
//! evaluated frame together with that frame's monotonic capture instant and
//! reports the transitions it made. Opening and closing writers is the
//! recorder's job.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionState {
    #[default]
    Idle,
    Recording,
    Cooldown,
}

impl fmt::Display for MotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionState::Idle => write!(f, "idle"),
            MotionState::Recording => write!(f, "recording"),
            MotionState::Cooldown => write!(f, "cooldown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Entered `Recording`. `resumed` is true when coming back from cooldown,
    /// which continues the current event instead of starting a new one.
    Opened { resumed: bool },
    /// Post-roll elapsed: `Recording` -> `Cooldown`.
    Closed,
    /// Cooldown elapsed: `Cooldown` -> `Idle`.
    Settled,
}

#[derive(Debug, Clone, Copy)]
pub struct StateTimings {
    pub min_motion_duration: Duration,
    pub post_roll: Duration,
    pub cooldown: Duration,
}

pub struct RecordingStateMachine {
    timings: StateTimings,
    state: MotionState,
    /// Start of the current uninterrupted run of motion while idle.
    motion_run_start: Option<Instant>,
    last_motion_at: Option<Instant>,
    cooldown_started: Option<Instant>,
    first_motion_at: Option<Instant>,
    frames_since_motion: u64,
}

impl RecordingStateMachine {
    pub fn new(timings: StateTimings) -> Self {
        Self {
            timings,
            state: MotionState::Idle,
            motion_run_start: None,
            last_motion_at: None,
            cooldown_started: None,
            first_motion_at: None,
            frames_since_motion: 0,
        }
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn frames_since_motion(&self) -> u64 {
        self.frames_since_motion
    }

    /// First motion instant of the current event, while one is in progress.
    pub fn first_motion_at(&self) -> Option<Instant> {
        self.first_motion_at
    }

    pub fn step(&mut self, motion: bool, at: Instant) -> Option<Transition> {
        if motion {
            self.frames_since_motion = 0;
        } else {
            self.frames_since_motion = self.frames_since_motion.saturating_add(1);
        }

        match self.state {
            MotionState::Idle => {
                if !motion {
                    self.motion_run_start = None;
                    return None;
                }
                let run_start = *self.motion_run_start.get_or_insert(at);
                if at.saturating_duration_since(run_start) < self.timings.min_motion_duration {
                    return None;
                }
                self.state = MotionState::Recording;
                self.first_motion_at = Some(run_start);
                self.last_motion_at = Some(at);
                self.motion_run_start = None;
                Some(Transition::Opened { resumed: false })
            }
            MotionState::Recording => {
                if motion {
                    self.last_motion_at = Some(at);
                    return None;
                }
                let last = self.last_motion_at.unwrap_or(at);
                if at.saturating_duration_since(last) < self.timings.post_roll {
                    return None;
                }
                self.state = MotionState::Cooldown;
                self.cooldown_started = Some(at);
                Some(Transition::Closed)
            }
            MotionState::Cooldown => {
                if motion {
                    self.state = MotionState::Recording;
                    self.last_motion_at = Some(at);
                    self.cooldown_started = None;
                    return Some(Transition::Opened { resumed: true });
                }
                let started = self.cooldown_started.unwrap_or(at);
                if at.saturating_duration_since(started) < self.timings.cooldown {
                    return None;
                }
                self.state = MotionState::Idle;
                self.cooldown_started = None;
                self.first_motion_at = None;
                self.last_motion_at = None;
                Some(Transition::Settled)
            }
        }
    }

    /// Forget everything, e.g. when the worker stops mid-event.
    pub fn reset(&mut self) {
        *self = Self::new(self.timings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn timings(min: f64, post: f64, cooldown: f64) -> StateTimings {
        StateTimings {
            min_motion_duration: Duration::from_secs_f64(min),
            post_roll: Duration::from_secs_f64(post),
            cooldown: Duration::from_secs_f64(cooldown),
        }
    }

    fn frame_at(t0: Instant, index: u64, fps: u64) -> Instant {
        t0 + Duration::from_nanos(index * 1_000_000_000 / fps)
    }

    #[test]
    fn thirty_fps_burst_opens_closes_and_settles_on_exact_frames() {
        let t0 = Instant::now();
        let mut machine = RecordingStateMachine::new(timings(1.0, 2.0, 1.0));
        let mut transitions = Vec::new();
        for i in 0..400u64 {
            let motion = (100..=160).contains(&i);
            if let Some(t) = machine.step(motion, frame_at(t0, i, 30)) {
                transitions.push((i, t));
            }
        }
        assert_eq!(
            transitions,
            vec![
                (130, Transition::Opened { resumed: false }),
                (220, Transition::Closed),
                (250, Transition::Settled),
            ]
        );
        assert_eq!(machine.state(), MotionState::Idle);
    }

    #[test]
    fn short_burst_never_records() {
        let t0 = Instant::now();
        let mut machine = RecordingStateMachine::new(timings(1.0, 2.0, 1.0));
        for i in 0..200u64 {
            // 29 frames at 30 fps is just under one second.
            let motion = (50..79).contains(&i);
            assert_eq!(machine.step(motion, frame_at(t0, i, 30)), None);
            assert_eq!(machine.state(), MotionState::Idle);
        }
    }

    #[test]
    fn interrupted_run_restarts_the_clock() {
        let t0 = Instant::now();
        let mut machine = RecordingStateMachine::new(timings(1.0, 2.0, 1.0));
        for i in 0..60u64 {
            let motion = i != 20;
            let t = machine.step(motion, frame_at(t0, i, 30));
            if i < 51 {
                assert_eq!(t, None, "opened early at frame {}", i);
            } else if i == 51 {
                assert_eq!(t, Some(Transition::Opened { resumed: false }));
            }
        }
    }

    #[test]
    fn motion_during_cooldown_resumes_same_event() {
        let t0 = Instant::now();
        let mut machine = RecordingStateMachine::new(timings(0.0, 1.0, 2.0));
        assert_eq!(machine.step(true, t0), Some(Transition::Opened { resumed: false }));
        let first = machine.first_motion_at();
        assert_eq!(
            machine.step(false, t0 + Duration::from_secs(1)),
            Some(Transition::Closed)
        );
        assert_eq!(
            machine.step(true, t0 + Duration::from_millis(1500)),
            Some(Transition::Opened { resumed: true })
        );
        assert_eq!(machine.first_motion_at(), first);
        assert_eq!(machine.state(), MotionState::Recording);
    }

    #[test]
    fn post_roll_bridges_short_gaps() {
        let t0 = Instant::now();
        let mut machine = RecordingStateMachine::new(timings(0.0, 2.0, 1.0));
        machine.step(true, t0);
        for i in 1..=10u64 {
            let motion = i % 5 == 0;
            assert_eq!(machine.step(motion, t0 + Duration::from_millis(i * 300)), None);
        }
        assert_eq!(machine.frames_since_motion(), 0);
    }

    #[test]
    fn random_sequences_only_make_legal_transitions() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let t0 = Instant::now();
            let mut machine = RecordingStateMachine::new(timings(0.25, 1.0, 0.5));
            let mut open = false;
            let mut events = 0;
            let mut motion = false;
            for i in 0..600u64 {
                let before = machine.state();
                if rng.gen_bool(0.08) {
                    motion = !motion;
                }
                match machine.step(motion, frame_at(t0, i, 20)) {
                    Some(Transition::Opened { resumed }) => {
                        assert!(!open, "second writer opened");
                        open = true;
                        if resumed {
                            assert_eq!(before, MotionState::Cooldown);
                        } else {
                            assert_eq!(before, MotionState::Idle);
                            events += 1;
                        }
                    }
                    Some(Transition::Closed) => {
                        assert!(open);
                        assert_eq!(before, MotionState::Recording);
                        open = false;
                    }
                    Some(Transition::Settled) => assert_eq!(before, MotionState::Cooldown),
                    None => assert_eq!(before, machine.state()),
                }
                assert_eq!(open, machine.state() == MotionState::Recording);
            }
            assert!(events >= 1);
        }
    }
}
