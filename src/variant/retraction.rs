//! Withdraws a public registration.
use chrono::Utc;
use tracing::info;

use super::{
    Cascade, HookEnv, HookOutcome, SanctionKind, SanctionVariant, UrlTemplates, audit_params,
    log_once, publish_subtree, reindex_all, require_artifact, stamp_once,
};
use crate::collaborators::{AuditEvent, NotificationContext};
use crate::error::SanctionResult;
use crate::sanction::SanctionCore;
use crate::types::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Retraction {
    #[n(0)]
    pub justification: Option<String>,
    #[n(1)]
    pub date_retracted: Option<TimeStamp<Utc>>,
}

impl Retraction {
    pub fn new(justification: Option<String>) -> Self {
        Self {
            justification,
            date_retracted: None,
        }
    }
}

impl SanctionVariant for Retraction {
    fn kind(&self) -> SanctionKind {
        SanctionKind::Retraction
    }

    // withdrawal needs an explicit yes from every admin
    fn auto_activates(&self) -> bool {
        false
    }

    fn url_templates(&self) -> UrlTemplates {
        UrlTemplates {
            approve: "{base_url}/token/retraction/approve/{artifact_id}/?token={token}",
            reject: "{base_url}/token/retraction/reject/{artifact_id}/?token={token}",
        }
    }

    fn extend_context(&self, ctx: &mut NotificationContext) {
        if let Some(justification) = &self.justification {
            ctx.insert("justification".into(), justification.clone());
        }
    }

    fn on_complete(
        &mut self,
        core: &SanctionCore,
        env: &HookEnv<'_>,
    ) -> SanctionResult<HookOutcome> {
        let registration = require_artifact(env, core.artifact_id())?;

        // visibility first: it is the step that can partially fail, and it is safe to repeat
        let nodes = publish_subtree(env, &registration, None)?;

        if self.date_retracted.is_none() {
            self.date_retracted = Some(stamp_once(env, core.id(), "date_retracted")?);
        }

        let mut params = audit_params(core, &registration.id);
        if let Some(justification) = &self.justification {
            params.insert("justification".into(), justification.clone());
        }
        log_once(
            env,
            core.id(),
            "retraction_approved",
            registration.log_target(),
            AuditEvent::RetractionApproved,
            &params,
            core.initiated_by(),
        )?;

        // an embargo on a withdrawn registration is void whether or not it has
        // started, and so is any request to end it early
        let mut cascades = vec![];
        for kind in [SanctionKind::Embargo, SanctionKind::EmbargoTerminationApproval] {
            if let Some(live) = env.tree.sanction_ref(core.artifact_id(), kind)? {
                cascades.push(Cascade::Cancel(live));
            }
        }

        reindex_all(env, &nodes);
        info!(
            sanction_id = %core.id(),
            registration = %registration.id,
            nodes = nodes.len(),
            "registration retracted"
        );

        Ok(HookOutcome {
            cascades,
            notices: vec![],
        })
    }

    fn on_reject(
        &mut self,
        core: &SanctionCore,
        env: &HookEnv<'_>,
    ) -> SanctionResult<HookOutcome> {
        if let Some(registration) = env.tree.get(core.artifact_id())? {
            log_once(
                env,
                core.id(),
                "retraction_cancelled",
                registration.log_target(),
                AuditEvent::RetractionCancelled,
                &audit_params(core, &registration.id),
                core.initiated_by(),
            )?;
        }
        Ok(HookOutcome::default())
    }
}
