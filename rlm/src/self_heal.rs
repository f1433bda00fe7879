//! Self-heal reporting.
//!
//! Unrecoverable step failures are recorded in the self-heal log and, when
//! enabled, handed to the orchestrator for a patch proposal. Patches that do
//! not require human approval are applied immediately. Reporting never fails.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::io::audit::AuditLog;
use crate::io::orchestrator::{ApplyRequest, Orchestrator, PatchRequest};

/// Component name attached to every report from the loop.
pub const LOOP_COMPONENT: &str = "reasoning_loop";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelfHealOutcome {
    /// Logged only; remote self-heal is off.
    Recorded,
    /// A patch was proposed and waits for a human.
    AwaitingApproval { patch_id: String },
    Applied {
        patch_id: String,
        commit_reference: String,
    },
    /// The orchestrator declined to apply an auto-approved patch.
    NotApplied { patch_id: String },
    RemoteFailed { detail: String },
}

pub struct SelfHealReporter {
    log: AuditLog,
    remote: Option<Arc<dyn Orchestrator>>,
}

impl SelfHealReporter {
    /// `remote` is set only when self-heal via the orchestrator is enabled.
    pub fn new(log: AuditLog, remote: Option<Arc<dyn Orchestrator>>) -> Self {
        Self { log, remote }
    }

    #[instrument(skip_all, fields(component = %component))]
    pub fn report(&self, error_trace: &str, component: &str) -> SelfHealOutcome {
        self.log.append("Self-heal reported");
        self.log.append(&format!("[{component}] {error_trace}"));

        let Some(remote) = &self.remote else {
            return SelfHealOutcome::Recorded;
        };

        let proposal = match remote.propose_patch(&PatchRequest {
            error_trace: error_trace.to_string(),
            component: component.to_string(),
        }) {
            Ok(proposal) => proposal,
            Err(err) => {
                let detail = format!("{err:#}");
                warn!(%detail, "propose patch failed");
                self.log.append(&format!("SELF_HEAL: propose failed: {detail}"));
                return SelfHealOutcome::RemoteFailed { detail };
            }
        };
        info!(
            patch_id = %proposal.patch_id,
            requires_hitl = proposal.requires_hitl,
            "patch proposed"
        );

        if proposal.requires_hitl {
            self.log.append(&format!(
                "SELF_HEAL: patch {} awaiting approval",
                proposal.patch_id
            ));
            return SelfHealOutcome::AwaitingApproval {
                patch_id: proposal.patch_id,
            };
        }

        match remote.apply_patch(&ApplyRequest {
            patch_id: proposal.patch_id.clone(),
            approved: true,
            component: component.to_string(),
            requires_hitl: proposal.requires_hitl,
        }) {
            Ok(applied) if applied.applied => {
                self.log.append(&format!(
                    "SELF_HEAL: patch {} applied commit={}",
                    proposal.patch_id, applied.commit_reference
                ));
                SelfHealOutcome::Applied {
                    patch_id: proposal.patch_id,
                    commit_reference: applied.commit_reference,
                }
            }
            Ok(_) => {
                self.log.append(&format!(
                    "SELF_HEAL: patch {} not applied",
                    proposal.patch_id
                ));
                SelfHealOutcome::NotApplied {
                    patch_id: proposal.patch_id,
                }
            }
            Err(err) => {
                let detail = format!("{err:#}");
                warn!(%detail, "apply patch failed");
                self.log.append(&format!("SELF_HEAL: apply failed: {detail}"));
                SelfHealOutcome::RemoteFailed { detail }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FailingOrchestrator, ScriptedOrchestrator};
    use std::fs;

    fn reporter_with(
        remote: Option<Arc<dyn Orchestrator>>,
    ) -> (tempfile::TempDir, SelfHealReporter) {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::open(&temp.path().join("self_heal.log")).expect("open");
        (temp, SelfHealReporter::new(log, remote))
    }

    fn log_lines(temp: &tempfile::TempDir) -> Vec<String> {
        fs::read_to_string(temp.path().join("self_heal.log"))
            .expect("read")
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn records_locally_without_remote() {
        let (temp, reporter) = reporter_with(None);
        let outcome = reporter.report("boom", LOOP_COMPONENT);
        assert_eq!(outcome, SelfHealOutcome::Recorded);
        assert_eq!(
            log_lines(&temp),
            vec!["Self-heal reported", "[reasoning_loop] boom"]
        );
    }

    #[test]
    fn applies_patch_without_hitl() {
        let remote = Arc::new(ScriptedOrchestrator::default().with_patch("p-1", false));
        let (_temp, reporter) = reporter_with(Some(remote.clone()));
        let outcome = reporter.report("boom", LOOP_COMPONENT);
        assert_eq!(
            outcome,
            SelfHealOutcome::Applied {
                patch_id: "p-1".to_string(),
                commit_reference: "commit-p-1".to_string()
            }
        );
        let applied = remote.apply_requests();
        assert_eq!(applied.len(), 1);
        assert!(applied[0].approved);
        assert_eq!(applied[0].component, LOOP_COMPONENT);
    }

    #[test]
    fn waits_for_approval_when_hitl_required() {
        let remote = Arc::new(ScriptedOrchestrator::default().with_patch("p-2", true));
        let (_temp, reporter) = reporter_with(Some(remote.clone()));
        assert_eq!(
            reporter.report("boom", LOOP_COMPONENT),
            SelfHealOutcome::AwaitingApproval {
                patch_id: "p-2".to_string()
            }
        );
        assert!(remote.apply_requests().is_empty());
    }

    #[test]
    fn remote_failure_is_swallowed() {
        let (temp, reporter) = reporter_with(Some(Arc::new(FailingOrchestrator)));
        let outcome = reporter.report("boom", LOOP_COMPONENT);
        assert!(matches!(outcome, SelfHealOutcome::RemoteFailed { .. }));
        let lines = log_lines(&temp);
        assert_eq!(lines[0], "Self-heal reported");
        assert!(lines[2].starts_with("SELF_HEAL: propose failed"));
    }
}
