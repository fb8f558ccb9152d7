//! Turn Scheduler Aggregate - Whose turn it is, and until when
//!
//! A pure state machine: every transition takes the current instant as an
//! argument and returns the notices to announce, so it can be replayed and
//! tested without a runtime or a clock.
//!
//! ```text
//! Idle --activate--> Waiting --start_turn--> TurnActive <--pause/resume--> TurnPaused
//!                       ^                        |
//!                       +---- halt / order empty-+
//! any --end--> Ended
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::entities::{AdvanceReason, SystemNotice};
use crate::domain::value_objects::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
    #[error("No turn is active")]
    NoActiveTurn,
    #[error("Turn is not paused")]
    NotPaused,
    #[error("A turn sequence is already running")]
    TurnInProgress,
    #[error("Session has ended")]
    SessionEnded,
    #[error("Session is not active yet")]
    SessionNotActive,
    #[error("Turn order is empty")]
    EmptyTurnOrder,
    #[error("Participant {0} appears more than once in the turn order")]
    DuplicateInTurnOrder(UserId),
    #[error("{0} is not a participant of this session")]
    UnknownParticipant(UserId),
    #[error("{0} is not in the turn order")]
    NotInTurnOrder(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    /// Session not started yet
    Idle,
    /// Session active, no turn in progress
    Waiting,
    TurnActive,
    TurnPaused,
    Ended,
}

/// Read model of the scheduler, shared with clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnState {
    pub phase: TurnPhase,
    pub current: Option<UserId>,
    /// Starts at 1 for each turn sequence and only grows within it
    pub round: u32,
    pub turn_started_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub paused: bool,
    /// Time left on the clock while paused
    pub remaining_ms: Option<i64>,
    pub order: Vec<UserId>,
    pub turn_duration_ms: i64,
    /// Bumped on every transition; expiry checks compare against it
    pub turn_seq: u64,
}

/// The turn state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnScheduler {
    state: TurnState,
    current_index: Option<usize>,
}

impl TurnScheduler {
    /// Create a scheduler for a session that has not started yet
    pub fn new(turn_duration: Duration) -> Self {
        Self {
            state: TurnState {
                phase: TurnPhase::Idle,
                current: None,
                round: 0,
                turn_started_at: None,
                deadline: None,
                paused: false,
                remaining_ms: None,
                order: Vec::new(),
                turn_duration_ms: turn_duration.num_milliseconds().max(1),
                turn_seq: 0,
            },
            current_index: None,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> &TurnState {
        &self.state
    }

    pub fn phase(&self) -> TurnPhase {
        self.state.phase
    }

    pub fn turn_seq(&self) -> u64 {
        self.state.turn_seq
    }

    pub fn turn_duration(&self) -> Duration {
        Duration::milliseconds(self.state.turn_duration_ms)
    }

    /// Deadline the expiry timer should be armed for, with the sequence it was armed at
    pub fn armed_deadline(&self) -> Option<(DateTime<Utc>, u64)> {
        match (self.state.phase, self.state.deadline) {
            (TurnPhase::TurnActive, Some(deadline)) => Some((deadline, self.state.turn_seq)),
            _ => None,
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Idle -> Waiting when the session goes live
    pub fn activate(&mut self) -> Result<(), TurnError> {
        match self.state.phase {
            TurnPhase::Idle => {
                self.state.phase = TurnPhase::Waiting;
                self.bump();
                Ok(())
            }
            TurnPhase::Ended => Err(TurnError::SessionEnded),
            _ => Ok(()),
        }
    }

    /// Begin a turn sequence with the given order. The first entry goes first.
    pub fn start_turn(
        &mut self,
        order: Vec<UserId>,
        is_participant: impl Fn(&UserId) -> bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<SystemNotice>, TurnError> {
        match self.state.phase {
            TurnPhase::Idle => return Err(TurnError::SessionNotActive),
            TurnPhase::Ended => return Err(TurnError::SessionEnded),
            TurnPhase::TurnActive | TurnPhase::TurnPaused => return Err(TurnError::TurnInProgress),
            TurnPhase::Waiting => {}
        }

        let Some(first) = order.first().cloned() else {
            return Err(TurnError::EmptyTurnOrder);
        };
        for (i, user) in order.iter().enumerate() {
            if !is_participant(user) {
                return Err(TurnError::UnknownParticipant(user.clone()));
            }
            if order[..i].contains(user) {
                return Err(TurnError::DuplicateInTurnOrder(user.clone()));
            }
        }

        self.state.order = order;
        self.state.round = 1;
        self.state.phase = TurnPhase::TurnActive;
        self.set_current(0, now);

        Ok(vec![SystemNotice::TurnStarted {
            order: self.state.order.clone(),
            current: first,
            round: self.state.round,
            deadline: self.deadline_or(now),
        }])
    }

    /// Hand the turn to the next participant, wrapping into a new round
    pub fn advance(&mut self, now: DateTime<Utc>) -> Result<Vec<SystemNotice>, TurnError> {
        self.require_active()?;
        Ok(vec![self.advance_from_current(now, AdvanceReason::Manual)])
    }

    /// Freeze the deadline, keeping the time that was left
    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<Vec<SystemNotice>, TurnError> {
        self.require_active()?;

        let remaining = self
            .state
            .deadline
            .map(|deadline| (deadline - now).num_milliseconds().max(0))
            .unwrap_or(0);

        self.state.phase = TurnPhase::TurnPaused;
        self.state.paused = true;
        self.state.remaining_ms = Some(remaining);
        self.state.deadline = None;
        self.bump();

        Ok(vec![SystemNotice::TurnPaused {
            remaining_ms: remaining,
        }])
    }

    /// Resume with the remaining budget measured from `now`
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<Vec<SystemNotice>, TurnError> {
        match self.state.phase {
            TurnPhase::TurnPaused => {}
            TurnPhase::Ended => return Err(TurnError::SessionEnded),
            TurnPhase::TurnActive => return Err(TurnError::NotPaused),
            _ => return Err(TurnError::NoActiveTurn),
        }

        let remaining = self.state.remaining_ms.take().unwrap_or(0);
        let deadline = now + Duration::milliseconds(remaining);

        self.state.phase = TurnPhase::TurnActive;
        self.state.paused = false;
        self.state.deadline = Some(deadline);
        self.bump();

        Ok(vec![SystemNotice::TurnResumed { deadline }])
    }

    /// Drop a participant from the order. If it was their turn, the next
    /// participant gets a fresh turn (a pause belonged to the skipped turn).
    pub fn skip(&mut self, user: &UserId, now: DateTime<Utc>) -> Result<Vec<SystemNotice>, TurnError> {
        match self.state.phase {
            TurnPhase::TurnActive | TurnPhase::TurnPaused => {}
            TurnPhase::Ended => return Err(TurnError::SessionEnded),
            _ => return Err(TurnError::NoActiveTurn),
        }

        let removed = self
            .state
            .order
            .iter()
            .position(|u| u == user)
            .ok_or_else(|| TurnError::NotInTurnOrder(user.clone()))?;
        let current = self.current_index.unwrap_or(0);

        self.state.order.remove(removed);
        let mut notices = vec![SystemNotice::ParticipantSkipped {
            user_id: user.clone(),
        }];

        if self.state.order.is_empty() {
            notices.extend(self.halt());
            return Ok(notices);
        }

        if removed < current {
            self.current_index = Some(current - 1);
            self.bump();
        } else if removed == current {
            // The slot now holds whoever came after the skipped participant
            let next = if removed >= self.state.order.len() {
                self.state.round = self.state.round.saturating_add(1);
                0
            } else {
                removed
            };
            self.state.phase = TurnPhase::TurnActive;
            self.state.paused = false;
            self.state.remaining_ms = None;
            self.set_current(next, now);
            notices.push(self.advanced_notice(now, AdvanceReason::Skipped));
        } else {
            self.bump();
        }

        Ok(notices)
    }

    /// Auto-advance if the armed deadline has passed.
    ///
    /// Returns `None` (no-op) when the turn already moved on since the timer
    /// was armed, when the turn is not active, or when the deadline is still
    /// ahead. A duplicate check after an advance therefore never double-advances.
    pub fn expire(&mut self, now: DateTime<Utc>, armed_seq: u64) -> Option<Vec<SystemNotice>> {
        if self.state.phase != TurnPhase::TurnActive || self.state.turn_seq != armed_seq {
            return None;
        }
        match self.state.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return None,
        }

        if self.state.order.is_empty() {
            return Some(self.halt());
        }
        Some(vec![self.advance_from_current(now, AdvanceReason::Expired)])
    }

    /// Stop the running turn sequence and go back to waiting
    pub fn stop(&mut self) -> Result<Vec<SystemNotice>, TurnError> {
        match self.state.phase {
            TurnPhase::TurnActive | TurnPhase::TurnPaused => Ok(self.halt()),
            TurnPhase::Ended => Err(TurnError::SessionEnded),
            _ => Err(TurnError::NoActiveTurn),
        }
    }

    /// Terminal; nothing transitions out of Ended
    pub fn end(&mut self) {
        self.state.phase = TurnPhase::Ended;
        self.state.current = None;
        self.current_index = None;
        self.state.deadline = None;
        self.state.turn_started_at = None;
        self.state.paused = false;
        self.state.remaining_ms = None;
        self.bump();
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn require_active(&self) -> Result<(), TurnError> {
        match self.state.phase {
            TurnPhase::TurnActive => Ok(()),
            TurnPhase::Ended => Err(TurnError::SessionEnded),
            _ => Err(TurnError::NoActiveTurn),
        }
    }

    fn advance_from_current(&mut self, now: DateTime<Utc>, reason: AdvanceReason) -> SystemNotice {
        let len = self.state.order.len();
        let mut next = self.current_index.map(|i| i + 1).unwrap_or(0);
        if next >= len {
            next = 0;
            self.state.round = self.state.round.saturating_add(1);
        }
        self.set_current(next, now);
        self.advanced_notice(now, reason)
    }

    fn advanced_notice(&self, now: DateTime<Utc>, reason: AdvanceReason) -> SystemNotice {
        SystemNotice::TurnAdvanced {
            current: self.state.current.clone().unwrap_or_else(|| UserId::new("")),
            round: self.state.round,
            deadline: self.deadline_or(now),
            reason,
        }
    }

    fn set_current(&mut self, index: usize, now: DateTime<Utc>) {
        self.current_index = Some(index);
        self.state.current = self.state.order.get(index).cloned();
        self.state.turn_started_at = Some(now);
        self.state.deadline = Some(now + self.turn_duration());
        self.bump();
    }

    fn halt(&mut self) -> Vec<SystemNotice> {
        self.state.phase = TurnPhase::Waiting;
        self.state.current = None;
        self.current_index = None;
        self.state.order.clear();
        self.state.deadline = None;
        self.state.turn_started_at = None;
        self.state.paused = false;
        self.state.remaining_ms = None;
        self.bump();
        vec![SystemNotice::TurnsHalted]
    }

    fn deadline_or(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.state.deadline.unwrap_or(now)
    }

    fn bump(&mut self) {
        self.state.turn_seq += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn users(ids: &[&str]) -> Vec<UserId> {
        ids.iter().map(|id| UserId::from(*id)).collect()
    }

    fn active_scheduler(order: &[&str]) -> TurnScheduler {
        let mut scheduler = TurnScheduler::new(Duration::seconds(60));
        scheduler.activate().unwrap();
        scheduler.start_turn(users(order), |_| true, t(0)).unwrap();
        scheduler
    }

    fn current(scheduler: &TurnScheduler) -> &str {
        scheduler.state().current.as_ref().map(|u| u.as_str()).unwrap_or("")
    }

    fn expire_now(scheduler: &mut TurnScheduler, at: DateTime<Utc>) -> bool {
        let seq = scheduler.turn_seq();
        scheduler.expire(at, seq).is_some()
    }

    #[test]
    fn test_start_turn_sets_first_and_round_one() {
        let scheduler = active_scheduler(&["p1", "p2", "p3"]);
        let state = scheduler.state();
        assert_eq!(state.phase, TurnPhase::TurnActive);
        assert_eq!(current(&scheduler), "p1");
        assert_eq!(state.round, 1);
        assert_eq!(state.turn_started_at, Some(t(0)));
        assert_eq!(state.deadline, Some(t(60)));
    }

    #[test]
    fn test_start_turn_requires_active_session() {
        let mut scheduler = TurnScheduler::new(Duration::seconds(60));
        let result = scheduler.start_turn(users(&["p1"]), |_| true, t(0));
        assert_eq!(result, Err(TurnError::SessionNotActive));
    }

    #[test]
    fn test_start_turn_validates_order() {
        let mut scheduler = TurnScheduler::new(Duration::seconds(60));
        scheduler.activate().unwrap();

        assert_eq!(
            scheduler.start_turn(vec![], |_| true, t(0)),
            Err(TurnError::EmptyTurnOrder)
        );
        assert_eq!(
            scheduler.start_turn(users(&["p1", "p1"]), |_| true, t(0)),
            Err(TurnError::DuplicateInTurnOrder("p1".into()))
        );
        assert_eq!(
            scheduler.start_turn(users(&["p1", "ghost"]), |u| u.as_str() != "ghost", t(0)),
            Err(TurnError::UnknownParticipant("ghost".into()))
        );
        assert_eq!(scheduler.phase(), TurnPhase::Waiting);
    }

    #[test]
    fn test_start_turn_rejected_while_running() {
        let mut scheduler = active_scheduler(&["p1"]);
        assert_eq!(
            scheduler.start_turn(users(&["p1"]), |_| true, t(1)),
            Err(TurnError::TurnInProgress)
        );
    }

    #[test]
    fn test_advance_wraps_and_increments_round_once() {
        let mut scheduler = active_scheduler(&["p1", "p2", "p3"]);
        let mut rounds = vec![scheduler.state().round];

        for step in 1..=7 {
            scheduler.advance(t(step)).unwrap();
            rounds.push(scheduler.state().round);
            assert!(scheduler.state().order.contains(scheduler.state().current.as_ref().unwrap()));
        }

        assert_eq!(rounds, vec![1, 1, 1, 2, 2, 2, 3, 3]);
        assert_eq!(current(&scheduler), "p2");
    }

    #[test]
    fn test_manual_advance_announces_new_holder() {
        let mut scheduler = active_scheduler(&["p1", "p2"]);
        let notices = scheduler.advance(t(5)).unwrap();
        assert_eq!(
            notices,
            vec![SystemNotice::TurnAdvanced {
                current: "p2".into(),
                round: 1,
                deadline: t(65),
                reason: AdvanceReason::Manual,
            }]
        );
    }

    #[test]
    fn test_advance_outside_active_turn_fails() {
        let mut scheduler = TurnScheduler::new(Duration::seconds(60));
        scheduler.activate().unwrap();
        assert_eq!(scheduler.advance(t(0)), Err(TurnError::NoActiveTurn));

        let mut paused = active_scheduler(&["p1", "p2"]);
        paused.pause(t(10)).unwrap();
        assert_eq!(paused.advance(t(11)), Err(TurnError::NoActiveTurn));
    }

    #[test]
    fn test_pause_resume_preserves_remaining_time() {
        let mut scheduler = active_scheduler(&["p1", "p2"]);

        // 45s left at t=15, paused for 100s
        let notices = scheduler.pause(t(15)).unwrap();
        assert_eq!(notices, vec![SystemNotice::TurnPaused { remaining_ms: 45_000 }]);
        assert!(scheduler.state().paused);
        assert_eq!(scheduler.state().deadline, None);

        scheduler.resume(t(115)).unwrap();
        let state = scheduler.state();
        assert_eq!(state.phase, TurnPhase::TurnActive);
        assert_eq!(state.deadline, Some(t(160)));
        assert!(state.deadline.unwrap() >= state.turn_started_at.unwrap());
        assert_eq!(current(&scheduler), "p1");
    }

    #[test]
    fn test_repeated_pausing_does_not_inflate_turn_time() {
        let mut scheduler = active_scheduler(&["p1"]);
        let mut now = 0;
        for _ in 0..5 {
            now += 10;
            scheduler.pause(t(now)).unwrap();
            now += 1000;
            scheduler.resume(t(now)).unwrap();
        }
        // 50s spent active in total, 10s left
        assert_eq!(scheduler.state().deadline, Some(t(now + 10)));
    }

    #[test]
    fn test_resume_when_not_paused() {
        let mut scheduler = active_scheduler(&["p1"]);
        assert_eq!(scheduler.resume(t(1)), Err(TurnError::NotPaused));
    }

    #[test]
    fn test_expiry_is_idempotent() {
        let mut scheduler = active_scheduler(&["p1", "p2"]);
        let armed = scheduler.turn_seq();

        assert!(scheduler.expire(t(59), armed).is_none(), "not yet due");
        assert!(scheduler.expire(t(61), armed).is_some());
        assert_eq!(current(&scheduler), "p2");

        // Late duplicate of the same timer
        assert!(scheduler.expire(t(62), armed).is_none());
        assert_eq!(current(&scheduler), "p2");
    }

    #[test]
    fn test_manual_advance_beats_racing_expiry() {
        let mut scheduler = active_scheduler(&["p1", "p2", "p3"]);
        let armed = scheduler.turn_seq();

        scheduler.advance(t(60)).unwrap();
        assert!(scheduler.expire(t(60), armed).is_none());
        assert_eq!(current(&scheduler), "p2");
    }

    #[test]
    fn test_expiry_ignored_while_paused() {
        let mut scheduler = active_scheduler(&["p1", "p2"]);
        scheduler.pause(t(10)).unwrap();
        assert!(!expire_now(&mut scheduler, t(500)));
        assert_eq!(current(&scheduler), "p1");
    }

    #[test]
    fn test_scenario_expiry_and_manual_advance() {
        let mut scheduler = active_scheduler(&["P1", "P2", "P3"]);
        assert_eq!(current(&scheduler), "P1");
        assert_eq!(scheduler.state().round, 1);

        assert!(expire_now(&mut scheduler, t(61)));
        assert_eq!(current(&scheduler), "P2");
        assert_eq!(scheduler.state().round, 1);

        scheduler.advance(t(65)).unwrap();
        assert_eq!(current(&scheduler), "P3");

        assert!(expire_now(&mut scheduler, t(126)));
        assert_eq!(current(&scheduler), "P1");
        assert_eq!(scheduler.state().round, 2);
    }

    #[test]
    fn test_skip_current_behaves_like_advance() {
        let mut scheduler = active_scheduler(&["p1", "p2", "p3"]);
        let notices = scheduler.skip(&"p1".into(), t(5)).unwrap();

        assert_eq!(current(&scheduler), "p2");
        assert_eq!(scheduler.state().order, users(&["p2", "p3"]));
        assert_eq!(scheduler.state().round, 1);
        assert_eq!(scheduler.state().deadline, Some(t(65)));
        assert!(matches!(
            notices.last(),
            Some(SystemNotice::TurnAdvanced { reason: AdvanceReason::Skipped, .. })
        ));
    }

    #[test]
    fn test_skip_last_in_order_wraps_round() {
        let mut scheduler = active_scheduler(&["p1", "p2"]);
        scheduler.advance(t(1)).unwrap();
        scheduler.skip(&"p2".into(), t(2)).unwrap();

        assert_eq!(current(&scheduler), "p1");
        assert_eq!(scheduler.state().round, 2);
    }

    #[test]
    fn test_skip_before_current_keeps_current() {
        let mut scheduler = active_scheduler(&["p1", "p2", "p3"]);
        scheduler.advance(t(1)).unwrap();
        let deadline = scheduler.state().deadline;

        scheduler.skip(&"p1".into(), t(2)).unwrap();
        assert_eq!(current(&scheduler), "p2");
        assert_eq!(scheduler.state().deadline, deadline);

        scheduler.advance(t(3)).unwrap();
        assert_eq!(current(&scheduler), "p3");
    }

    #[test]
    fn test_skip_last_member_degrades_to_waiting() {
        let mut scheduler = active_scheduler(&["p1"]);
        let notices = scheduler.skip(&"p1".into(), t(1)).unwrap();

        assert_eq!(scheduler.phase(), TurnPhase::Waiting);
        assert!(scheduler.state().current.is_none());
        assert_eq!(notices.last(), Some(&SystemNotice::TurnsHalted));
        assert!(scheduler.armed_deadline().is_none());
    }

    #[test]
    fn test_skip_unknown_participant() {
        let mut scheduler = active_scheduler(&["p1"]);
        assert_eq!(
            scheduler.skip(&"p9".into(), t(1)),
            Err(TurnError::NotInTurnOrder("p9".into()))
        );
    }

    #[test]
    fn test_end_is_terminal() {
        let mut scheduler = active_scheduler(&["p1", "p2"]);
        scheduler.end();

        assert_eq!(scheduler.phase(), TurnPhase::Ended);
        assert!(scheduler.state().current.is_none());
        assert_eq!(scheduler.advance(t(1)), Err(TurnError::SessionEnded));
        assert_eq!(scheduler.pause(t(1)), Err(TurnError::SessionEnded));
        assert_eq!(
            scheduler.start_turn(users(&["p1"]), |_| true, t(1)),
            Err(TurnError::SessionEnded)
        );
        assert_eq!(scheduler.activate(), Err(TurnError::SessionEnded));
    }

    #[test]
    fn test_stop_returns_to_waiting() {
        let mut scheduler = active_scheduler(&["p1", "p2"]);
        scheduler.stop().unwrap();
        assert_eq!(scheduler.phase(), TurnPhase::Waiting);
        assert!(scheduler.state().order.is_empty());

        scheduler.start_turn(users(&["p2"]), |_| true, t(5)).unwrap();
        assert_eq!(current(&scheduler), "p2");
        assert_eq!(scheduler.state().round, 1);
    }
}
