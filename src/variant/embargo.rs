//! Keeps a registration private until `embargo_end_date`.
//!
//! Approval does not complete an embargo: it becomes *active* (approved and
//! settled) and only completes when released, either at the end date or early
//! through an approved [`super::EmbargoTerminationApproval`].
use chrono::Utc;
use tracing::info;

use super::{
    HookEnv, HookOutcome, SanctionKind, SanctionVariant, UrlTemplates, audit_params, guard_spam,
    initiator_notice, log_once, publish_subtree, reindex_all, require_artifact, stamp_once,
};
use crate::collaborators::{AuditEvent, NotificationContext};
use crate::error::SanctionResult;
use crate::sanction::SanctionCore;
use crate::types::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Embargo {
    #[n(0)]
    pub embargo_end_date: TimeStamp<Utc>,
    #[n(1)]
    pub for_existing_registration: bool, // false when the registration was created for this embargo
    #[n(2)]
    pub released_at: Option<TimeStamp<Utc>>,
}

impl Embargo {
    pub fn new(embargo_end_date: TimeStamp<Utc>, for_existing_registration: bool) -> Self {
        Self {
            embargo_end_date,
            for_existing_registration,
            released_at: None,
        }
    }

    pub fn is_due(&self, now: &TimeStamp<Utc>) -> bool {
        self.released_at.is_none() && self.embargo_end_date <= *now
    }

    pub(crate) fn release(
        &mut self,
        core: &SanctionCore,
        env: &HookEnv<'_>,
    ) -> SanctionResult<HookOutcome> {
        let registration = require_artifact(env, core.artifact_id())?;
        let nodes = publish_subtree(env, &registration, None)?;

        log_once(
            env,
            core.id(),
            "embargo_completed",
            registration.log_target(),
            AuditEvent::EmbargoCompleted,
            &audit_params(core, &registration.id),
            None,
        )?;
        reindex_all(env, &nodes);
        self.released_at = Some(stamp_once(env, core.id(), "released_at")?);

        info!(sanction_id = %core.id(), registration = %registration.id, "embargo lifted");
        Ok(HookOutcome::default())
    }
}

impl SanctionVariant for Embargo {
    fn kind(&self) -> SanctionKind {
        SanctionKind::Embargo
    }

    fn completes_on_approval(&self) -> bool {
        false
    }

    fn url_templates(&self) -> UrlTemplates {
        UrlTemplates {
            approve: "{base_url}/token/embargo/approve/{artifact_id}/?token={token}",
            reject: "{base_url}/token/embargo/reject/{artifact_id}/?token={token}",
        }
    }

    fn extend_context(&self, ctx: &mut NotificationContext) {
        ctx.insert(
            "embargo_end_date".into(),
            self.embargo_end_date.to_datetime_utc().to_rfc3339(),
        );
    }

    fn on_complete(
        &mut self,
        core: &SanctionCore,
        env: &HookEnv<'_>,
    ) -> SanctionResult<HookOutcome> {
        let registration = require_artifact(env, core.artifact_id())?;
        guard_spam(&registration)?;

        let mut params = audit_params(core, &registration.id);
        params.insert(
            "embargo_end_date".into(),
            self.embargo_end_date.to_datetime_utc().to_rfc3339(),
        );
        log_once(
            env,
            core.id(),
            "embargo_approved",
            registration.log_target(),
            AuditEvent::EmbargoApproved,
            &params,
            core.initiated_by(),
        )?;

        Ok(HookOutcome {
            cascades: vec![],
            notices: initiator_notice(core, self.kind(), env).into_iter().collect(),
        })
    }

    fn on_reject(
        &mut self,
        core: &SanctionCore,
        env: &HookEnv<'_>,
    ) -> SanctionResult<HookOutcome> {
        // on a retry the registration may already be gone
        if let Some(registration) = env.tree.get(core.artifact_id())? {
            log_once(
                env,
                core.id(),
                "embargo_cancelled",
                registration.log_target(),
                AuditEvent::EmbargoCancelled,
                &audit_params(core, &registration.id),
                core.initiated_by(),
            )?;
        }

        if !self.for_existing_registration {
            env.tree
                .set_sanction_ref(core.artifact_id(), SanctionKind::Embargo, None)?;
            env.tree.delete_subtree(core.artifact_id())?;
            info!(
                sanction_id = %core.id(),
                registration = %core.artifact_id(),
                "embargoed registration discarded"
            );
        }
        Ok(HookOutcome::default())
    }
}
