//! Ends an active embargo ahead of its end date.
use tracing::info;

use super::{
    Cascade, HookEnv, HookOutcome, SanctionKind, SanctionVariant, UrlTemplates, audit_params,
    log_once, require_artifact,
};
use crate::collaborators::{AuditEvent, NotificationContext};
use crate::error::SanctionResult;
use crate::sanction::SanctionCore;
use crate::types::SanctionId;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct EmbargoTerminationApproval {
    #[n(0)]
    pub embargo_id: SanctionId,
}

impl EmbargoTerminationApproval {
    pub fn new(embargo_id: SanctionId) -> Self {
        Self { embargo_id }
    }
}

impl SanctionVariant for EmbargoTerminationApproval {
    fn kind(&self) -> SanctionKind {
        SanctionKind::EmbargoTerminationApproval
    }

    fn url_templates(&self) -> UrlTemplates {
        UrlTemplates {
            approve: "{base_url}/token/embargo-termination/approve/{artifact_id}/?token={token}",
            reject: "{base_url}/token/embargo-termination/reject/{artifact_id}/?token={token}",
        }
    }

    fn extend_context(&self, ctx: &mut NotificationContext) {
        ctx.insert("embargo_id".into(), self.embargo_id.clone());
    }

    fn on_complete(
        &mut self,
        core: &SanctionCore,
        env: &HookEnv<'_>,
    ) -> SanctionResult<HookOutcome> {
        let registration = require_artifact(env, core.artifact_id())?;

        let mut params = audit_params(core, &registration.id);
        params.insert("embargo_id".into(), self.embargo_id.clone());
        log_once(
            env,
            core.id(),
            "embargo_terminated",
            registration.log_target(),
            AuditEvent::EmbargoTerminated,
            &params,
            core.initiated_by(),
        )?;

        info!(
            sanction_id = %core.id(),
            embargo_id = %self.embargo_id,
            "early embargo termination approved"
        );
        Ok(HookOutcome {
            cascades: vec![Cascade::Release(self.embargo_id.clone())],
            notices: vec![],
        })
    }

    // the embargo itself stays as it was
    fn on_reject(
        &mut self,
        core: &SanctionCore,
        env: &HookEnv<'_>,
    ) -> SanctionResult<HookOutcome> {
        env.tree.set_sanction_ref(
            core.artifact_id(),
            SanctionKind::EmbargoTerminationApproval,
            None,
        )?;
        Ok(HookOutcome::default())
    }
}
