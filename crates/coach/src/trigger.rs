use runsync_transport::GoalId;
use tokio::sync::mpsc;

use super::error::SessionResult;
use super::events::SessionEvent;
use super::session::{CoachSession, TurnOutcome};

/// Handle for one offered auto message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerToken(pub u64);

/// Where an offered trigger stands. Acknowledged triggers are forgotten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerPhase {
    /// Offered, not sent yet.
    Pending,
    /// Fed into the session; waiting for the owner to acknowledge.
    Delivered,
}

#[derive(Debug, Clone)]
struct TriggerEntry {
    token: TriggerToken,
    goal_id: GoalId,
    value: String,
    phase: TriggerPhase,
}

/// Feeds externally supplied auto messages into a session at most once per goal and value.
///
/// Owners may offer the same pair on every render; only the first offer is kept until the
/// owner acknowledges the consumed event. A delivered pair is never fired again, even when
/// its send failed. Triggers only fire while the session is bound to their goal.
pub struct AutoTriggerGate {
    events: mpsc::UnboundedSender<SessionEvent>,
    entries: Vec<TriggerEntry>,
    next_token: u64,
}

impl AutoTriggerGate {
    pub fn new(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            events,
            entries: Vec::new(),
            next_token: 0,
        }
    }

    /// Registers a trigger for `goal_id`; returns a token only while the pair is unknown.
    pub fn offer(&mut self, goal_id: GoalId, value: impl Into<String>) -> Option<TriggerToken> {
        let value = value.into().trim().to_string();
        if value.is_empty()
            || self
                .entries
                .iter()
                .any(|entry| entry.goal_id == goal_id && entry.value == value)
        {
            return None;
        }

        self.next_token = self.next_token.saturating_add(1);
        let token = TriggerToken(self.next_token);
        self.entries.push(TriggerEntry {
            token,
            goal_id,
            value,
            phase: TriggerPhase::Pending,
        });
        Some(token)
    }

    /// Oldest value still waiting to be delivered for `goal_id`.
    pub fn pending(&self, goal_id: GoalId) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.goal_id == goal_id && entry.phase == TriggerPhase::Pending)
            .map(|entry| entry.value.as_str())
    }

    pub fn phase(&self, token: TriggerToken) -> Option<TriggerPhase> {
        self.entries
            .iter()
            .find(|entry| entry.token == token)
            .map(|entry| entry.phase)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Delivers the oldest pending trigger of the session's goal if the session is idle.
    ///
    /// Returns `None` when nothing was fired. A send refused by the session's guard
    /// leaves the trigger pending; any other outcome marks it delivered and notifies
    /// the owner.
    pub async fn pump<S>(&mut self, session: &S) -> Option<SessionResult<TurnOutcome>>
    where
        S: CoachSession + ?Sized,
    {
        let goal_id = session.goal()?;
        if !session.state().is_idle() {
            return None;
        }

        let index = self.entries.iter().position(|entry| {
            entry.goal_id == goal_id && entry.phase == TriggerPhase::Pending
        })?;
        self.entries[index].phase = TriggerPhase::Delivered;
        let TriggerEntry { token, value, .. } = self.entries[index].clone();

        let result = session.send(&value).await;
        if let Err(error) = &result
            && error.is_rejection()
        {
            tracing::debug!(token = token.0, goal_id = %goal_id, error = %error, "auto message refused, keeping it pending");
            if let Some(entry) = self.entries.iter_mut().find(|entry| entry.token == token) {
                entry.phase = TriggerPhase::Pending;
            }
            return Some(result);
        }

        tracing::info!(token = token.0, goal_id = %goal_id, "auto message consumed");
        if self
            .events
            .send(SessionEvent::AutoMessageConsumed {
                token,
                goal_id,
                value,
            })
            .is_err()
        {
            tracing::debug!("session event receiver dropped");
        }
        Some(result)
    }

    /// Forgets a delivered trigger once its owner cleared it; false unless it was delivered.
    pub fn acknowledge(&mut self, token: TriggerToken) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|entry| !(entry.token == token && entry.phase == TriggerPhase::Delivered));
        self.entries.len() != before
    }
}
