use std::sync::Arc;

use runsync_transport::{CoachTransport, GoalId, Thread, ThreadId, ThreadInit};
use snafu::ResultExt;

use super::error::{SessionResult, ThreadCreationFailedSnafu, ThreadResolutionFailedSnafu};

/// Finds or founds the active coaching thread of a goal.
#[derive(Clone)]
pub struct ThreadResolver {
    transport: Arc<dyn CoachTransport>,
}

impl ThreadResolver {
    pub fn new(transport: Arc<dyn CoachTransport>) -> Self {
        Self { transport }
    }

    /// Returns the goal's active thread with its full history, or `None` when the goal
    /// has no thread yet.
    pub async fn resolve(&self, goal_id: GoalId) -> SessionResult<Option<Thread>> {
        let threads = self
            .transport
            .list_threads(goal_id)
            .await
            .context(ThreadResolutionFailedSnafu {
                stage: "list-goal-threads",
                goal_id,
            })?;

        let Some(active) = select_active_thread(&threads) else {
            tracing::debug!(goal_id = %goal_id, "goal has no coaching thread yet");
            return Ok(None);
        };

        let thread = self.load(goal_id, active.id).await?;
        tracing::info!(
            goal_id = %goal_id,
            thread_id = %thread.id,
            messages = thread.messages.len(),
            "resolved active coaching thread"
        );
        Ok(Some(thread))
    }

    /// Reads one thread with its messages.
    pub async fn load(&self, goal_id: GoalId, thread_id: ThreadId) -> SessionResult<Thread> {
        self.transport
            .get_thread(thread_id)
            .await
            .context(ThreadResolutionFailedSnafu {
                stage: "load-thread",
                goal_id,
            })
    }

    /// Archived threads of a goal, most recently created first.
    pub async fn archived(&self, goal_id: GoalId) -> SessionResult<Vec<Thread>> {
        let mut threads = self
            .transport
            .list_all_threads(goal_id)
            .await
            .context(ThreadResolutionFailedSnafu {
                stage: "list-archived-threads",
                goal_id,
            })?;
        threads.retain(|thread| thread.is_archived);
        threads.sort_by_key(|thread| std::cmp::Reverse((thread.created_at, thread.id)));
        Ok(threads)
    }

    /// Creates a thread whose founding message is `initial_message`, then re-reads it so
    /// the caller gets the canonical history.
    pub async fn found(&self, goal_id: GoalId, initial_message: &str) -> SessionResult<Thread> {
        let created = self
            .transport
            .create_thread(goal_id, ThreadInit::with_initial_message(initial_message))
            .await
            .context(ThreadCreationFailedSnafu {
                stage: "create-thread",
                goal_id,
            })?;

        match self.transport.get_thread(created.id).await {
            Ok(thread) => Ok(thread),
            Err(error) => {
                tracing::warn!(
                    goal_id = %goal_id,
                    thread_id = %created.id,
                    error = %error,
                    "failed to re-read new thread, keeping the creation response"
                );
                Ok(created)
            }
        }
    }
}

/// Picks the most recently created thread that is not archived.
///
/// Listings are not guaranteed to be chronological, so creation time decides and the
/// server identifier breaks ties.
pub fn select_active_thread(threads: &[Thread]) -> Option<&Thread> {
    threads
        .iter()
        .filter(|thread| !thread.is_archived)
        .max_by_key(|thread| (thread.created_at, thread.id))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn thread(id: i64, minute: u32, archived: bool) -> Thread {
        Thread {
            id: ThreadId::new(id),
            goal_id: GoalId::new(1),
            title: None,
            description: None,
            is_archived: archived,
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 8, minute, 0).unwrap(),
            messages: Vec::new(),
        }
    }

    #[test]
    fn picks_latest_created_thread_regardless_of_order() {
        let threads = vec![thread(7, 30, false), thread(3, 10, false), thread(5, 20, false)];
        assert_eq!(
            select_active_thread(&threads).map(|thread| thread.id),
            Some(ThreadId::new(7))
        );
    }

    #[test]
    fn skips_archived_threads() {
        let threads = vec![thread(1, 10, false), thread(2, 20, true)];
        assert_eq!(
            select_active_thread(&threads).map(|thread| thread.id),
            Some(ThreadId::new(1))
        );
        assert!(select_active_thread(&[thread(2, 20, true)]).is_none());
    }

    #[test]
    fn identifier_breaks_creation_ties() {
        let threads = vec![thread(4, 10, false), thread(9, 10, false)];
        assert_eq!(
            select_active_thread(&threads).map(|thread| thread.id),
            Some(ThreadId::new(9))
        );
    }
}
