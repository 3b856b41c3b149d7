//! Gates a new registration going public.
use chrono::Utc;
use tracing::info;

use super::{
    HookEnv, HookOutcome, SanctionKind, SanctionVariant, UrlTemplates, audit_params, guard_spam,
    initiator_notice, log_once, publish_subtree, reindex_all, require_artifact, stamp_once,
};
use crate::collaborators::AuditEvent;
use crate::error::SanctionResult;
use crate::sanction::SanctionCore;
use crate::types::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq)]
pub struct RegistrationApproval {
    #[n(0)]
    pub registered_at: Option<TimeStamp<Utc>>,
}

impl RegistrationApproval {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SanctionVariant for RegistrationApproval {
    fn kind(&self) -> SanctionKind {
        SanctionKind::RegistrationApproval
    }

    fn url_templates(&self) -> UrlTemplates {
        UrlTemplates {
            approve: "{base_url}/token/registration/approve/{artifact_id}/?token={token}",
            reject: "{base_url}/token/registration/reject/{artifact_id}/?token={token}",
        }
    }

    fn on_complete(
        &mut self,
        core: &SanctionCore,
        env: &HookEnv<'_>,
    ) -> SanctionResult<HookOutcome> {
        let registration = require_artifact(env, core.artifact_id())?;
        guard_spam(&registration)?;

        let nodes = publish_subtree(env, &registration, core.initiated_by())?;

        // one "registered" entry per node, each on the project it was registered from
        for node in &nodes {
            log_once(
                env,
                core.id(),
                &format!("registered:{}", node.id),
                node.log_target(),
                AuditEvent::ProjectRegistered,
                &audit_params(core, &node.id),
                core.initiated_by(),
            )?;
        }
        reindex_all(env, &nodes);
        self.registered_at = Some(stamp_once(env, core.id(), "registered_at")?);

        info!(
            sanction_id = %core.id(),
            registration = %registration.id,
            nodes = nodes.len(),
            "registration approved"
        );
        Ok(HookOutcome {
            cascades: vec![],
            notices: initiator_notice(core, self.kind(), env).into_iter().collect(),
        })
    }

    // rejection discards the registration entirely
    fn on_reject(
        &mut self,
        core: &SanctionCore,
        env: &HookEnv<'_>,
    ) -> SanctionResult<HookOutcome> {
        if let Some(registration) = env.tree.get(core.artifact_id())? {
            log_once(
                env,
                core.id(),
                "registration_cancelled",
                registration.log_target(),
                AuditEvent::RegistrationCancelled,
                &audit_params(core, &registration.id),
                core.initiated_by(),
            )?;
        }
        env.tree
            .set_sanction_ref(core.artifact_id(), SanctionKind::RegistrationApproval, None)?;
        env.tree.delete_subtree(core.artifact_id())?;

        info!(
            sanction_id = %core.id(),
            registration = %core.artifact_id(),
            "unapproved registration discarded"
        );
        Ok(HookOutcome::default())
    }
}
