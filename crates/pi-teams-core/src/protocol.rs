//! Typed message envelopes flowing through mailboxes and RPC.
//!
//! Envelopes travel JSON-encoded inside `MailboxMessage.text`. Parsing is
//! total: unknown or malformed input yields `None`, never an error.

use serde::{Deserialize, Serialize};

/// All envelope kinds, discriminated by `type`. Field casing matches the
/// wire format. Uses `#[serde(other)]` so foreign envelope kinds degrade
/// to [`Envelope::Unknown`] instead of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Leader → worker: a task was assigned.
    #[serde(rename_all = "camelCase")]
    TaskAssignment {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assigned_by: Option<String>,
    },
    /// Leader → worker: please wind down and confirm.
    #[serde(rename_all = "camelCase")]
    ShutdownRequest {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    /// Leader → worker: the proposed plan was approved.
    #[serde(rename_all = "camelCase")]
    PlanApproved {
        request_id: String,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
    },
    /// Leader → worker: the proposed plan was rejected.
    #[serde(rename_all = "camelCase")]
    PlanRejected {
        request_id: String,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
    },
    /// Leader → worker: abort current work.
    #[serde(rename_all = "camelCase")]
    AbortRequest {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Leader → worker: adopt this session name.
    SetSessionName { name: String },
    /// Worker → leader: the worker went idle, possibly after finishing a task.
    #[serde(rename_all = "camelCase")]
    IdleNotification {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completed_task_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completed_status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_reason: Option<String>,
    },
    /// Worker → leader: shutdown confirmed.
    #[serde(rename_all = "camelCase")]
    ShutdownApproved {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Worker → leader: shutdown declined.
    #[serde(rename_all = "camelCase")]
    ShutdownRejected {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Worker → leader: a plan awaits approval.
    #[serde(rename_all = "camelCase")]
    PlanApprovalRequest {
        request_id: String,
        from: String,
        plan: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    /// Worker → leader: notification that a peer DM was sent.
    #[serde(rename_all = "camelCase")]
    PeerDmSent {
        from: String,
        to: String,
        summary: String,
    },
    /// Catch-all for foreign envelope kinds.
    #[serde(other)]
    Unknown,
}

impl Envelope {
    /// The protocol `requestId`, for receiver-side deduplication.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Envelope::ShutdownRequest { request_id, .. }
            | Envelope::PlanApproved { request_id, .. }
            | Envelope::PlanRejected { request_id, .. }
            | Envelope::AbortRequest { request_id, .. }
            | Envelope::ShutdownApproved { request_id, .. }
            | Envelope::ShutdownRejected { request_id, .. }
            | Envelope::PlanApprovalRequest { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

/// Parse an envelope from mailbox text. Total: malformed JSON, non-object
/// input, and unknown kinds all return `None`.
pub fn parse_envelope(text: &str) -> Option<Envelope> {
    serde_json::from_str::<Envelope>(text)
        .ok()
        .filter(|e| !matches!(e, Envelope::Unknown))
}

/// Encode an envelope as the JSON string carried in `MailboxMessage.text`.
pub fn encode_envelope(envelope: &Envelope) -> String {
    serde_json::to_string(envelope).expect("envelope serialization should not fail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_assignment_roundtrip() {
        let env = Envelope::TaskAssignment {
            task_id: "7".into(),
            subject: Some("Fix flaky test".into()),
            description: None,
            assigned_by: Some("lead".into()),
        };
        let json = encode_envelope(&env);
        assert!(json.contains("\"type\":\"task_assignment\""));
        assert!(json.contains("\"taskId\":\"7\""));
        assert!(!json.contains("description"));
        assert_eq!(parse_envelope(&json), Some(env));
    }

    #[test]
    fn idle_notification_roundtrip() {
        let json = r#"{"type":"idle_notification","from":"w1","completedTaskId":"3","completedStatus":"completed"}"#;
        match parse_envelope(json) {
            Some(Envelope::IdleNotification {
                from,
                completed_task_id,
                completed_status,
                failure_reason,
            }) => {
                assert_eq!(from, "w1");
                assert_eq!(completed_task_id.as_deref(), Some("3"));
                assert_eq!(completed_status.as_deref(), Some("completed"));
                assert!(failure_reason.is_none());
            }
            other => panic!("expected IdleNotification, got {other:?}"),
        }
    }

    #[test]
    fn plan_approval_request_requires_plan() {
        let json = r#"{"type":"plan_approval_request","requestId":"r1","from":"w1"}"#;
        assert!(parse_envelope(json).is_none());

        let json = r#"{"type":"plan_approval_request","requestId":"r1","from":"w1","plan":"1. do it"}"#;
        assert!(matches!(
            parse_envelope(json),
            Some(Envelope::PlanApprovalRequest { .. })
        ));
    }

    #[test]
    fn unknown_kind_returns_none() {
        assert!(parse_envelope(r#"{"type":"future_thing","x":1}"#).is_none());
    }

    #[test]
    fn malformed_input_returns_none() {
        assert!(parse_envelope("not json").is_none());
        assert!(parse_envelope("").is_none());
        assert!(parse_envelope("[1,2,3]").is_none());
        assert!(parse_envelope(r#"{"no_type":true}"#).is_none());
    }

    #[test]
    fn request_id_extraction() {
        let env = Envelope::ShutdownRequest {
            request_id: "r-9".into(),
            from: None,
            reason: None,
            timestamp: None,
        };
        assert_eq!(env.request_id(), Some("r-9"));

        let env = Envelope::PeerDmSent {
            from: "w1".into(),
            to: "w2".into(),
            summary: "sync".into(),
        };
        assert!(env.request_id().is_none());
    }

    #[test]
    fn set_session_name_roundtrip() {
        let env = Envelope::SetSessionName { name: "agent3".into() };
        let json = encode_envelope(&env);
        assert!(json.contains("\"type\":\"set_session_name\""));
        assert_eq!(parse_envelope(&json), Some(env));
    }
}
