//! Administrator review of a draft before it becomes a registration.
//!
//! The ledger is not used: a site administrator decides directly. Approval
//! hands off to the next sanction in the chain instead of ending the workflow.
use chrono::Utc;
use tracing::{info, warn};

use super::{
    Cascade, Embargo, HookEnv, HookOutcome, Notice, RegistrationApproval, SanctionKind,
    SanctionVariant, UrlTemplates, Variant, audit_params, log_once, once,
};
use crate::collaborators::{AuditEvent, NotificationContext, Permissions, TemplateId};
use crate::error::{SanctionError, SanctionResult};
use crate::sanction::{ApprovalMode, Sanction, SanctionCore};
use crate::types::{ArtifactId, TimeStamp};
use crate::utils::new_sanction_id;

/// Deferred decision on how the registration is released once the draft is approved
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub enum RegistrationChoice {
    #[n(0)]
    Immediate,
    #[n(1)]
    Embargo {
        #[n(0)]
        end_date: TimeStamp<Utc>,
    },
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct DraftRegistrationApproval {
    #[n(0)]
    pub meta: Option<RegistrationChoice>,
    #[n(1)]
    pub registration: Option<ArtifactId>, // set once the draft has been materialized
}

impl DraftRegistrationApproval {
    pub fn new(choice: RegistrationChoice) -> Self {
        Self {
            meta: Some(choice),
            registration: None,
        }
    }
}

impl SanctionVariant for DraftRegistrationApproval {
    fn kind(&self) -> SanctionKind {
        SanctionKind::DraftRegistrationApproval
    }

    fn mode(&self) -> ApprovalMode {
        ApprovalMode::Any
    }

    fn auto_activates(&self) -> bool {
        false
    }

    fn bypasses_ledger(&self) -> bool {
        true
    }

    fn is_eligible(
        &self,
        _authorizer: &str,
        _artifact_ref: &str,
        _perms: &dyn Permissions,
    ) -> bool {
        false
    }

    fn url_templates(&self) -> UrlTemplates {
        UrlTemplates {
            approve: "{base_url}/admin/drafts/{artifact_id}/approve/",
            reject: "{base_url}/admin/drafts/{artifact_id}/reject/",
        }
    }

    fn on_complete(
        &mut self,
        core: &SanctionCore,
        env: &HookEnv<'_>,
    ) -> SanctionResult<HookOutcome> {
        let Some(choice) = self.meta.clone() else {
            return Err(SanctionError::ArtifactState {
                artifact_id: core.artifact_id().to_string(),
                reason: "draft has no registration choice recorded".into(),
            });
        };

        log_once(
            env,
            core.id(),
            "draft_approved",
            core.artifact_id(),
            AuditEvent::DraftApproved,
            &audit_params(core, core.artifact_id()),
            None,
        )?;

        // the registration and the follow-on id survive a failed attempt, so a
        // retry re-stages the same sanction against the same registration
        let registration = match &self.registration {
            Some(id) => id.clone(),
            None => once(env, core.id(), "materialized", || {
                Ok(env
                    .tree
                    .materialize_draft(core.artifact_id(), core.initiated_by())?)
            })?,
        };
        self.registration = Some(registration.clone());
        let next_id = once(env, core.id(), "next_sanction", || Ok(new_sanction_id()?))?;

        let authorizers = env.tree.admins(&registration).unwrap_or_else(|e| {
            warn!(
                registration = %registration,
                error = %e,
                "could not list admins; follow-on sanction starts without authorizers"
            );
            vec![]
        });

        let variant = match choice {
            RegistrationChoice::Immediate => {
                Variant::RegistrationApproval(RegistrationApproval::new())
            }
            RegistrationChoice::Embargo { end_date } => {
                Variant::Embargo(Embargo::new(end_date, false))
            }
        };
        let next = Sanction::new(
            next_id,
            registration.clone(),
            variant,
            core.initiated_by().map(str::to_string),
            env.now.clone(),
            env.approval_window,
        );

        info!(
            sanction_id = %core.id(),
            registration = %registration,
            next = %next.kind(),
            "draft approved, handing off"
        );
        Ok(HookOutcome {
            cascades: vec![Cascade::Start {
                sanction: Box::new(next),
                authorizers,
            }],
            notices: vec![],
        })
    }

    fn on_reject(
        &mut self,
        core: &SanctionCore,
        env: &HookEnv<'_>,
    ) -> SanctionResult<HookOutcome> {
        self.meta = None;
        log_once(
            env,
            core.id(),
            "draft_rejected",
            core.artifact_id(),
            AuditEvent::DraftRejected,
            &audit_params(core, core.artifact_id()),
            None,
        )?;

        let mut notices = vec![];
        if let Some(initiator) = core.initiated_by() {
            let mut context = NotificationContext::new();
            context.insert("sanction_id".into(), core.id().to_string());
            context.insert("draft_id".into(), core.artifact_id().to_string());
            notices.push(Notice {
                to: initiator.to_string(),
                template: TemplateId::DraftRejected,
                context,
            });
        }
        Ok(HookOutcome {
            cascades: vec![],
            notices,
        })
    }
}
