//! Quality-gate remediation: reopen failed work and spawn follow-ups.
//!
//! When a worker reports a task completed and a post-completion hook
//! fails, the team's hook policy decides what happens next. Reopens are
//! bounded per task; at the bound the action degrades to a warning.

use anyhow::Result;
use pi_teams_core::protocol::{encode_envelope, Envelope};
use pi_teams_core::{
    task_meta, FailureAction, FollowupOwner, HookPolicy, MailboxMessage, Task, TaskStatus,
};
use pi_teams_store::mailbox::write_to_mailbox;
use pi_teams_store::tasks::{NewTask, TaskStore};
use pi_teams_store::{now_rfc3339, TeamPaths};
use serde_json::Value;

/// Sentinel phrase workers key on to self-remediate without waiting for
/// the user.
pub const REMEDIATION_NUDGE: &str =
    "Please remediate automatically and continue without waiting for user intervention.";

/// What the policy decided for one failed task. Pure output of
/// [`plan_remediation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemediationPlan {
    pub reopen: bool,
    pub followup: bool,
}

/// Decide reopen/follow-up from the policy and the task's reopen count.
pub fn plan_remediation(policy: &HookPolicy, reopen_count: u32) -> RemediationPlan {
    let reopen_allowed = reopen_count < policy.max_reopens_per_task;
    match policy.failure_action {
        FailureAction::Warn => RemediationPlan {
            reopen: false,
            followup: false,
        },
        FailureAction::Followup => RemediationPlan {
            reopen: false,
            followup: true,
        },
        FailureAction::Reopen => RemediationPlan {
            reopen: reopen_allowed,
            followup: false,
        },
        FailureAction::ReopenFollowup => RemediationPlan {
            reopen: reopen_allowed,
            followup: true,
        },
    }
}

/// Follow-up subject: the original subject truncated to 80 chars.
pub fn followup_subject(original_subject: &str, original_id: &str) -> String {
    let head: String = original_subject.chars().take(80).collect();
    format!("Quality gate failed: {head} (task #{original_id})")
}

#[derive(Debug, Clone)]
pub struct RemediationReport {
    pub task_id: String,
    pub reopened: bool,
    pub followup_id: Option<String>,
    /// Worker whose mailbox received the assignment + nudge.
    pub notified: Option<String>,
}

/// Apply the remediation plan to a task whose hooks failed.
///
/// Always stamps `qualityGateStatus: failed`. A reopen sends the task
/// back to `pending` and bumps the monotonic reopen counter. A follow-up
/// task is blocked by the original; its owner (per `followupOwner`) gets
/// a `task_assignment` envelope plus the plaintext nudge in the task
/// mailbox.
#[allow(clippy::too_many_arguments)]
pub fn apply_remediation(
    store: &TaskStore,
    paths: &TeamPaths,
    task_list_id: &str,
    lead_name: &str,
    policy: &HookPolicy,
    task: &Task,
    worker: &str,
    hook_detail: Option<&str>,
) -> Result<RemediationReport> {
    let plan = plan_remediation(policy, task.reopen_count());

    store.update_task(&task.id, |mut t| {
        t.metadata.insert(
            task_meta::QUALITY_GATE_STATUS.into(),
            Value::String("failed".into()),
        );
        if plan.reopen {
            let count = t
                .metadata
                .get(task_meta::REOPENED_BY_QUALITY_GATE_COUNT)
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            t.metadata.insert(
                task_meta::REOPENED_BY_QUALITY_GATE_COUNT.into(),
                Value::from(count + 1),
            );
        }
        t
    })?;

    let mut reopened = false;
    if plan.reopen {
        let current = store.get_task(&task.id);
        if current.map(|t| t.status) == Some(TaskStatus::Completed) {
            store.set_status(&task.id, TaskStatus::Pending)?;
            reopened = true;
        }
    }

    let mut followup_id = None;
    let mut notified = None;
    if plan.followup {
        let owner = match policy.followup_owner {
            FollowupOwner::Member => task.owner.clone().or_else(|| Some(worker.to_string())),
            FollowupOwner::Lead => Some(lead_name.to_string()),
            FollowupOwner::None => None,
        };

        let subject = followup_subject(&task.subject, &task.id);
        let mut description = format!(
            "{subject}\n\nPost-completion hooks failed for task #{} ({}).",
            task.id, task.subject
        );
        if let Some(detail) = hook_detail {
            description.push_str("\n\nDiagnostic:\n");
            description.push_str(detail);
        }

        let followup = store.create_task(NewTask {
            subject: Some(subject),
            description,
            owner: owner.clone(),
        })?;
        store.add_dependency(&followup.id, &task.id)?;
        followup_id = Some(followup.id.clone());

        if let Some(owner) = owner {
            let now = now_rfc3339();
            let assignment = Envelope::TaskAssignment {
                task_id: followup.id.clone(),
                subject: Some(followup.subject.clone()),
                description: Some(followup.description.clone()),
                assigned_by: Some(lead_name.to_string()),
            };
            write_to_mailbox(
                paths,
                task_list_id,
                &owner,
                MailboxMessage::new(lead_name, &encode_envelope(&assignment), &now),
            )?;
            write_to_mailbox(
                paths,
                task_list_id,
                &owner,
                MailboxMessage::new(
                    lead_name,
                    &format!(
                        "Task #{} failed its quality gate. {REMEDIATION_NUDGE}",
                        task.id
                    ),
                    &now,
                ),
            )?;
            notified = Some(owner);
        }
    }

    Ok(RemediationReport {
        task_id: task.id.clone(),
        reopened,
        followup_id,
        notified,
    })
}
