//! Per-session nudge bookkeeping.
//!
//! Process-local to the manager; the single-threaded tick loop is the only
//! writer, so a plain map suffices. Everything here is wall-clock driven and
//! takes `now` as an argument for testability.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::session::AgentState;

#[derive(Debug, Clone, Copy)]
pub struct SessionTrack {
    pub last_state: AgentState,
    pub last_state_change: Instant,
    pub last_nudge: Option<Instant>,
}

#[derive(Default)]
pub struct SessionTracker {
    sessions: HashMap<String, SessionTrack>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the state observed this tick. The state-change clock restarts
    /// only when the state actually changed.
    pub fn observe(&mut self, session: &str, state: AgentState, now: Instant) {
        match self.sessions.get_mut(session) {
            Some(track) if track.last_state == state => {}
            Some(track) => {
                track.last_state = state;
                track.last_state_change = now;
            }
            None => {
                self.sessions.insert(
                    session.to_string(),
                    SessionTrack {
                        last_state: state,
                        last_state_change: now,
                        last_nudge: None,
                    },
                );
            }
        }
    }

    /// Whether the session has sat in its current state long enough to be
    /// nudged, respecting the per-session cooldown.
    pub fn should_nudge(
        &self,
        session: &str,
        now: Instant,
        stuck_threshold: Duration,
        cooldown: Duration,
    ) -> bool {
        let Some(track) = self.sessions.get(session) else {
            return false;
        };
        if now.duration_since(track.last_state_change) < stuck_threshold {
            return false;
        }
        match track.last_nudge {
            Some(last) => now.duration_since(last) >= cooldown,
            None => true,
        }
    }

    pub fn record_nudge(&mut self, session: &str, now: Instant) {
        if let Some(track) = self.sessions.get_mut(session) {
            track.last_nudge = Some(now);
        }
    }

    /// Drop tracking for sessions that no longer exist.
    pub fn retain_sessions(&mut self, live: &std::collections::HashSet<String>) {
        self.sessions.retain(|name, _| live.contains(name));
    }

    #[cfg(test)]
    pub fn track(&self, session: &str) -> Option<&SessionTrack> {
        self.sessions.get(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STUCK: Duration = Duration::from_secs(120);
    const COOLDOWN: Duration = Duration::from_secs(300);

    #[test]
    fn test_nudge_requires_stuck_threshold() {
        let mut tracker = SessionTracker::new();
        let start = Instant::now();
        tracker.observe("s", AgentState::IdleAtPrompt, start);

        assert!(!tracker.should_nudge("s", start + Duration::from_secs(30), STUCK, COOLDOWN));
        assert!(tracker.should_nudge("s", start + Duration::from_secs(121), STUCK, COOLDOWN));
    }

    #[test]
    fn test_state_change_resets_clock() {
        let mut tracker = SessionTracker::new();
        let start = Instant::now();
        tracker.observe("s", AgentState::IdleAtPrompt, start);
        tracker.observe("s", AgentState::ActivelyWorking, start + Duration::from_secs(100));
        tracker.observe("s", AgentState::IdleAtPrompt, start + Duration::from_secs(200));

        // Only 60s in the new idle stretch.
        assert!(!tracker.should_nudge("s", start + Duration::from_secs(260), STUCK, COOLDOWN));
        assert!(tracker.should_nudge("s", start + Duration::from_secs(321), STUCK, COOLDOWN));
    }

    #[test]
    fn test_same_state_does_not_reset_clock() {
        let mut tracker = SessionTracker::new();
        let start = Instant::now();
        tracker.observe("s", AgentState::IdleAtPrompt, start);
        tracker.observe("s", AgentState::IdleAtPrompt, start + Duration::from_secs(110));

        assert!(tracker.should_nudge("s", start + Duration::from_secs(125), STUCK, COOLDOWN));
    }

    #[test]
    fn test_cooldown_blocks_back_to_back_nudges() {
        let mut tracker = SessionTracker::new();
        let start = Instant::now();
        tracker.observe("s", AgentState::IdleAtPrompt, start);

        let first_nudge_at = start + Duration::from_secs(130);
        assert!(tracker.should_nudge("s", first_nudge_at, STUCK, COOLDOWN));
        tracker.record_nudge("s", first_nudge_at);

        // 30 seconds later: stuck, but inside cooldown.
        assert!(!tracker.should_nudge("s", first_nudge_at + Duration::from_secs(30), STUCK, COOLDOWN));
        // Past cooldown with state unchanged: nudge again.
        assert!(tracker.should_nudge("s", first_nudge_at + Duration::from_secs(301), STUCK, COOLDOWN));
    }

    #[test]
    fn test_retain_drops_dead_sessions() {
        let mut tracker = SessionTracker::new();
        let now = Instant::now();
        tracker.observe("alive", AgentState::IdleAtPrompt, now);
        tracker.observe("dead", AgentState::IdleAtPrompt, now);

        let live = std::collections::HashSet::from(["alive".to_string()]);
        tracker.retain_sessions(&live);
        assert!(tracker.track("alive").is_some());
        assert!(tracker.track("dead").is_none());
    }
}
