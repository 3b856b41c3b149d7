//! The closed set of sanction kinds and the hooks each one supplies.
//!
//! Every kind implements [`SanctionVariant`]; [`Variant`] is the persisted,
//! tagged union that dispatches to them. Hooks touch the artifact tree through
//! [`HookEnv`] and hand anything that affects *other* sanctions back to the
//! caller as a [`Cascade`], so the service can commit it in the same
//! transaction as the sanction that caused it.
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, warn};

use crate::collaborators::{
    Artifact, ArtifactTree, AuditEvent, AuditParams, NotificationContext, Permissions, TemplateId,
};
use crate::error::{SanctionError, SanctionResult};
use crate::sanction::{ApprovalMode, Sanction, SanctionCore};
use crate::store::StepJournal;
use crate::types::{SanctionId, TimeStamp, UserId};

pub mod draft_approval;
pub mod embargo;
pub mod embargo_termination;
pub mod registration_approval;
pub mod retraction;

pub use draft_approval::{DraftRegistrationApproval, RegistrationChoice};
pub use embargo::Embargo;
pub use embargo_termination::EmbargoTerminationApproval;
pub use registration_approval::RegistrationApproval;
pub use retraction::Retraction;

/// Type tag of a sanction
#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum SanctionKind {
    #[n(0)]
    Embargo,
    #[n(1)]
    Retraction,
    #[n(2)]
    RegistrationApproval,
    #[n(3)]
    DraftRegistrationApproval,
    #[n(4)]
    EmbargoTerminationApproval,
}

impl SanctionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SanctionKind::Embargo => "embargo",
            SanctionKind::Retraction => "retraction",
            SanctionKind::RegistrationApproval => "registration_approval",
            SanctionKind::DraftRegistrationApproval => "draft_registration_approval",
            SanctionKind::EmbargoTerminationApproval => "embargo_termination_approval",
        }
    }
}

impl fmt::Display for SanctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link templates. `{base_url}`, `{artifact_id}` and `{token}` are substituted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrlTemplates {
    pub approve: &'static str,
    pub reject: &'static str,
}

pub struct HookEnv<'a> {
    pub tree: &'a dyn ArtifactTree,
    pub perms: &'a dyn Permissions,
    pub now: TimeStamp<Utc>,
    pub approval_window: Duration,
    pub notify_initiator: bool,
    pub journal: &'a StepJournal,
}

/// Work a hook asks the orchestrator to do on other sanctions
#[derive(Debug)]
pub enum Cascade {
    /// move a live sanction (pending, active or stuck) to rejected without
    /// running its hook
    Cancel(SanctionId),
    /// lift an active embargo ahead of its end date
    Release(SanctionId),
    /// persist and enrol a follow-on sanction
    Start {
        sanction: Box<Sanction>,
        authorizers: Vec<UserId>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub to: UserId,
    pub template: TemplateId,
    pub context: NotificationContext,
}

#[derive(Debug, Default)]
pub struct HookOutcome {
    pub cascades: Vec<Cascade>,
    pub notices: Vec<Notice>,
}

pub trait SanctionVariant {
    fn kind(&self) -> SanctionKind;

    fn mode(&self) -> ApprovalMode {
        ApprovalMode::Unanimous
    }
    /// Whether `end_date` is set and the expiry sweep may force approval
    fn auto_activates(&self) -> bool {
        true
    }
    /// Decided by a site administrator instead of ledger tokens
    fn bypasses_ledger(&self) -> bool {
        false
    }
    /// False when the approved state itself means something (an active embargo)
    fn completes_on_approval(&self) -> bool {
        true
    }
    fn is_eligible(&self, authorizer: &str, artifact_ref: &str, perms: &dyn Permissions) -> bool {
        perms.is_artifact_admin(authorizer, artifact_ref)
    }
    fn url_templates(&self) -> UrlTemplates;
    /// Kind-specific keys for notification context
    fn extend_context(&self, _ctx: &mut NotificationContext) {}

    fn on_complete(
        &mut self,
        core: &SanctionCore,
        env: &HookEnv<'_>,
    ) -> SanctionResult<HookOutcome>;
    fn on_reject(
        &mut self,
        core: &SanctionCore,
        env: &HookEnv<'_>,
    ) -> SanctionResult<HookOutcome>;
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub enum Variant {
    #[n(0)]
    Embargo(#[n(0)] Embargo),
    #[n(1)]
    Retraction(#[n(0)] Retraction),
    #[n(2)]
    RegistrationApproval(#[n(0)] RegistrationApproval),
    #[n(3)]
    DraftRegistrationApproval(#[n(0)] DraftRegistrationApproval),
    #[n(4)]
    EmbargoTerminationApproval(#[n(0)] EmbargoTerminationApproval),
}

impl Variant {
    fn as_dyn(&self) -> &dyn SanctionVariant {
        match self {
            Variant::Embargo(v) => v,
            Variant::Retraction(v) => v,
            Variant::RegistrationApproval(v) => v,
            Variant::DraftRegistrationApproval(v) => v,
            Variant::EmbargoTerminationApproval(v) => v,
        }
    }

    fn as_dyn_mut(&mut self) -> &mut dyn SanctionVariant {
        match self {
            Variant::Embargo(v) => v,
            Variant::Retraction(v) => v,
            Variant::RegistrationApproval(v) => v,
            Variant::DraftRegistrationApproval(v) => v,
            Variant::EmbargoTerminationApproval(v) => v,
        }
    }
}

impl SanctionVariant for Variant {
    fn kind(&self) -> SanctionKind {
        self.as_dyn().kind()
    }
    fn mode(&self) -> ApprovalMode {
        self.as_dyn().mode()
    }
    fn auto_activates(&self) -> bool {
        self.as_dyn().auto_activates()
    }
    fn bypasses_ledger(&self) -> bool {
        self.as_dyn().bypasses_ledger()
    }
    fn completes_on_approval(&self) -> bool {
        self.as_dyn().completes_on_approval()
    }
    fn is_eligible(&self, authorizer: &str, artifact_ref: &str, perms: &dyn Permissions) -> bool {
        self.as_dyn().is_eligible(authorizer, artifact_ref, perms)
    }
    fn url_templates(&self) -> UrlTemplates {
        self.as_dyn().url_templates()
    }
    fn extend_context(&self, ctx: &mut NotificationContext) {
        self.as_dyn().extend_context(ctx)
    }
    fn on_complete(
        &mut self,
        core: &SanctionCore,
        env: &HookEnv<'_>,
    ) -> SanctionResult<HookOutcome> {
        self.as_dyn_mut().on_complete(core, env)
    }
    fn on_reject(
        &mut self,
        core: &SanctionCore,
        env: &HookEnv<'_>,
    ) -> SanctionResult<HookOutcome> {
        self.as_dyn_mut().on_reject(core, env)
    }
}

// ---- helpers shared by the hooks ----

pub(crate) fn require_artifact(env: &HookEnv<'_>, id: &str) -> SanctionResult<Artifact> {
    env.tree
        .get(id)?
        .ok_or_else(|| SanctionError::ArtifactState {
            artifact_id: id.to_string(),
            reason: "artifact no longer exists".into(),
        })
}

pub(crate) fn guard_spam(artifact: &Artifact) -> SanctionResult<()> {
    if artifact.is_spam {
        error!(
            artifact_id = %artifact.id,
            "spam-flagged registration blocks completion; needs manual review"
        );
        return Err(SanctionError::ArtifactState {
            artifact_id: artifact.id.clone(),
            reason: "registration is flagged as spam".into(),
        });
    }
    Ok(())
}

/// Make `root` and every primary descendant public. Already-public nodes are
/// skipped so a retry after partial failure only touches what is left.
pub(crate) fn publish_subtree(
    env: &HookEnv<'_>,
    root: &Artifact,
    actor: Option<&str>,
) -> SanctionResult<Vec<Artifact>> {
    let mut nodes = vec![root.clone()];
    nodes.extend(env.tree.get_descendants(&root.id)?);

    let failed: Vec<(String, String)> = nodes
        .iter()
        .filter(|node| !node.is_public)
        .filter_map(|node| {
            env.tree
                .set_public(&node.id, actor)
                .err()
                .map(|e| (node.id.clone(), e.to_string()))
        })
        .collect();

    if !failed.is_empty() {
        error!(
            root = %root.id,
            failed = failed.len(),
            "subtree visibility update partially failed"
        );
        return Err(SanctionError::CascadeFailure {
            root: root.id.clone(),
            failed,
        });
    }
    Ok(nodes)
}

// search is eventually consistent; a failed reindex request is not a workflow error
pub(crate) fn reindex_all(env: &HookEnv<'_>, nodes: &[Artifact]) {
    for node in nodes {
        if let Err(e) = env.tree.request_reindex(&node.id) {
            warn!(artifact_id = %node.id, error = %e, "reindex request failed");
        }
    }
}

pub(crate) fn audit_params(core: &SanctionCore, registration: &str) -> AuditParams {
    let mut params = AuditParams::new();
    params.insert("sanction_id".into(), core.id().to_string());
    params.insert("registration".into(), registration.to_string());
    params
}

pub(crate) fn initiator_notice(
    core: &SanctionCore,
    kind: SanctionKind,
    env: &HookEnv<'_>,
) -> Option<Notice> {
    if !env.notify_initiator {
        return None;
    }
    let to = core.initiated_by()?.to_string();
    let mut context = NotificationContext::new();
    context.insert("sanction_id".into(), core.id().to_string());
    context.insert("artifact_id".into(), core.artifact_id().to_string());
    context.insert("kind".into(), kind.as_str().into());

    Some(Notice {
        to,
        template: TemplateId::InitiatorCompletion(kind),
        context,
    })
}

pub(crate) fn log_event(
    env: &HookEnv<'_>,
    target: &str,
    event: AuditEvent,
    params: &AuditParams,
    actor: Option<&str>,
) -> SanctionResult<()> {
    env.tree.add_log(target, event, params, actor)?;
    Ok(())
}

/// Run `step` at most once for this sanction. Its value is journaled and
/// handed back on every later attempt instead of running it again.
pub(crate) fn once(
    env: &HookEnv<'_>,
    sanction_id: &str,
    step: &str,
    f: impl FnOnce() -> SanctionResult<String>,
) -> SanctionResult<String> {
    if let Some(done) = env.journal.recorded(sanction_id, step)? {
        return Ok(done);
    }
    let value = f()?;
    env.journal.record(sanction_id, step, &value)?;
    Ok(value)
}

/// [`log_event`] that is skipped when an earlier attempt already wrote it
pub(crate) fn log_once(
    env: &HookEnv<'_>,
    sanction_id: &str,
    step: &str,
    target: &str,
    event: AuditEvent,
    params: &AuditParams,
    actor: Option<&str>,
) -> SanctionResult<()> {
    once(env, sanction_id, step, || {
        log_event(env, target, event, params, actor).map(|()| String::new())
    })?;
    Ok(())
}

/// Timestamp taken the first time `step` ran, so a retry keeps the original
pub(crate) fn stamp_once(
    env: &HookEnv<'_>,
    sanction_id: &str,
    step: &str,
) -> SanctionResult<TimeStamp<Utc>> {
    let raw = once(env, sanction_id, step, || {
        Ok(env.now.to_datetime_utc().to_rfc3339())
    })?;
    let at = DateTime::parse_from_rfc3339(&raw).map_err(|e| {
        anyhow::anyhow!("journaled {step} for {sanction_id} is not a timestamp: {e}")
    })?;
    Ok(TimeStamp::from(at.with_timezone(&Utc)))
}
