use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::ids::{GoalId, MessageId, ThreadId};

/// Speaker role as reported by the coaching backend.
///
/// The backend stores coach replies under `"coach"`; both spellings map to `Assistant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    #[serde(alias = "coach")]
    Assistant,
}

/// Opaque reference to a training-plan session touched by a coach reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionRef(pub serde_json::Value);

/// One persisted message inside a coaching thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, alias = "sessionsAffected")]
    pub sessions_affected: Option<Vec<SessionRef>>,
}

/// A coaching thread, optionally with its full message history.
///
/// Thread listings omit `messages`; `get_thread` and `create_thread` include them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    #[serde(alias = "race_goal_id", alias = "goalId")]
    pub goal_id: GoalId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<ServerMessage>,
}

/// Payload used to found a thread; the first outbound message travels here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThreadInit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_message: Option<String>,
}

impl ThreadInit {
    pub fn with_initial_message(content: impl Into<String>) -> Self {
        Self {
            initial_message: Some(content.into()),
            ..Self::default()
        }
    }
}

/// Result of a non-streaming send: both confirmed messages of the turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    #[serde(alias = "userMessage")]
    pub user_message: ServerMessage,
    #[serde(alias = "coachResponse", alias = "coach_message")]
    pub coach_response: ServerMessage,
    #[serde(default, alias = "sessionsAffected", alias = "sessions_affected")]
    pub sessions_modified: Option<Vec<SessionRef>>,
}

impl SendMessageResponse {
    /// Returns true when the turn modified at least one planned session.
    pub fn touches_plan(&self) -> bool {
        let non_empty = |sessions: &Option<Vec<SessionRef>>| {
            sessions.as_ref().is_some_and(|sessions| !sessions.is_empty())
        };
        non_empty(&self.sessions_modified) || non_empty(&self.coach_response.sessions_affected)
    }
}

/// Activity categories understood by the classification endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityClass {
    Workout,
    Commute,
    Recovery,
    Race,
}

impl ActivityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workout => "workout",
            Self::Commute => "commute",
            Self::Recovery => "recovery",
            Self::Race => "race",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityClassification {
    pub classification: ActivityClass,
    pub confidence: f64,
    pub reasoning: String,
    pub include_in_training_load: bool,
}

/// Accepts RFC 3339 timestamps and the backend's naive ISO-8601 form (treated as UTC).
pub(crate) fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| {
        serde::de::Error::custom(format!("unrecognized timestamp format: {raw}"))
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_with_messages_decodes_backend_shape() {
        let payload = serde_json::json!({
            "id": 3,
            "race_goal_id": 9,
            "title": "Discussion avec le coach",
            "description": null,
            "is_archived": false,
            "created_at": "2025-03-01T08:15:00.123456",
            "updated_at": "2025-03-01T08:16:00",
            "messages": [
                {
                    "id": 10,
                    "role": "user",
                    "content": "Can I run tomorrow?",
                    "created_at": "2025-03-01T08:15:01"
                },
                {
                    "id": 11,
                    "role": "coach",
                    "content": "Easy 40 minutes.",
                    "created_at": "2025-03-01T08:15:04Z",
                    "sessions_affected": [{"id": 1, "action": "modified"}]
                }
            ]
        });

        let thread: Thread = serde_json::from_value(payload).expect("decode thread");
        assert_eq!(thread.goal_id, GoalId::new(9));
        assert_eq!(thread.messages.len(), 2);
        assert_eq!(thread.messages[1].role, Role::Assistant);
        assert_eq!(
            thread.messages[1]
                .sessions_affected
                .as_ref()
                .map(|sessions| sessions.len()),
            Some(1)
        );
    }

    #[test]
    fn thread_listing_defaults_missing_messages() {
        let payload = serde_json::json!([{
            "id": 1,
            "race_goal_id": 2,
            "created_at": "2025-01-01T00:00:00+01:00",
            "message_count": 4
        }]);

        let threads: Vec<Thread> = serde_json::from_value(payload).expect("decode listing");
        assert!(threads[0].messages.is_empty());
        assert_eq!(
            threads[0].created_at,
            "2024-12-31T23:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn send_response_reports_plan_changes_from_either_field() {
        let base = serde_json::json!({
            "user_message": {"id": 1, "role": "user", "content": "hi", "created_at": "2025-01-01T00:00:00"},
            "coach_response": {"id": 2, "role": "coach", "content": "hello", "created_at": "2025-01-01T00:00:01"}
        });
        let plain: SendMessageResponse = serde_json::from_value(base.clone()).unwrap();
        assert!(!plain.touches_plan());

        let mut with_sessions = base;
        with_sessions["sessions_modified"] = serde_json::json!([{"id": 5, "action": "created"}]);
        let modified: SendMessageResponse = serde_json::from_value(with_sessions).unwrap();
        assert!(modified.touches_plan());
    }

    #[test]
    fn empty_top_level_list_does_not_hide_coach_sessions() {
        let payload = serde_json::json!({
            "user_message": {"id": 1, "role": "user", "content": "hi", "created_at": "2025-01-01T00:00:00"},
            "coach_response": {
                "id": 2, "role": "coach", "content": "moved it",
                "created_at": "2025-01-01T00:00:01",
                "sessions_affected": [{"id": 3}]
            },
            "sessions_modified": []
        });
        let response: SendMessageResponse = serde_json::from_value(payload).unwrap();
        assert!(response.touches_plan());
    }

    #[test]
    fn thread_init_only_serializes_present_fields() {
        let init = ThreadInit::with_initial_message("first question");
        let json = serde_json::to_value(&init).unwrap();
        assert_eq!(json, serde_json::json!({"initial_message": "first question"}));
    }

    #[test]
    fn rejects_unparseable_timestamps() {
        let payload = serde_json::json!({
            "id": 1, "role": "user", "content": "x", "created_at": "yesterday"
        });
        assert!(serde_json::from_value::<ServerMessage>(payload).is_err());
    }
}
