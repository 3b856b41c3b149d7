//! Interfaces to the systems the engine drives but does not own: the artifact
//! tree (registrations, drafts, audit log, search index), user permissions and
//! outbound mail. They are injected into [`crate::service::SanctionService`] so
//! tests can substitute fakes.
use std::collections::BTreeMap;

use crate::types::{ArtifactId, SanctionId, UserId};
use crate::variant::SanctionKind;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

impl CollaboratorError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Snapshot of a node in the artifact tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub id: ArtifactId,
    pub is_public: bool,
    pub is_spam: bool,
    pub registered_from: Option<ArtifactId>, // the source project a registration was made from
}

impl Artifact {
    /// Where audit events about this registration are recorded
    pub fn log_target(&self) -> &str {
        self.registered_from.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditEvent {
    EmbargoApproved,
    EmbargoCancelled,
    EmbargoCompleted,
    EmbargoTerminated,
    RetractionApproved,
    RetractionCancelled,
    ProjectRegistered,
    RegistrationCancelled,
    DraftApproved,
    DraftRejected,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::EmbargoApproved => "embargo_approved",
            AuditEvent::EmbargoCancelled => "embargo_cancelled",
            AuditEvent::EmbargoCompleted => "embargo_completed",
            AuditEvent::EmbargoTerminated => "embargo_terminated",
            AuditEvent::RetractionApproved => "retraction_approved",
            AuditEvent::RetractionCancelled => "retraction_cancelled",
            AuditEvent::ProjectRegistered => "project_registered",
            AuditEvent::RegistrationCancelled => "registration_cancelled",
            AuditEvent::DraftApproved => "draft_registration_approved",
            AuditEvent::DraftRejected => "draft_registration_rejected",
        }
    }
}

pub type AuditParams = BTreeMap<String, String>;

pub trait ArtifactTree: Send + Sync {
    fn get(&self, id: &str) -> CollaboratorResult<Option<Artifact>>;
    /// Primary descendants of `id`, not including `id` itself
    fn get_descendants(&self, id: &str) -> CollaboratorResult<Vec<Artifact>>;
    fn set_public(&self, id: &str, actor: Option<&str>) -> CollaboratorResult<()>;
    fn add_log(
        &self,
        id: &str,
        event: AuditEvent,
        params: &AuditParams,
        actor: Option<&str>,
    ) -> CollaboratorResult<()>;
    /// Must succeed as a no-op when the subtree is already gone
    fn delete_subtree(&self, id: &str) -> CollaboratorResult<()>;
    fn request_reindex(&self, id: &str) -> CollaboratorResult<()>;
    /// Users allowed to act as authorizers for `id`
    fn admins(&self, id: &str) -> CollaboratorResult<Vec<UserId>>;
    fn sanction_ref(&self, id: &str, kind: SanctionKind) -> CollaboratorResult<Option<SanctionId>>;
    fn set_sanction_ref(
        &self,
        id: &str,
        kind: SanctionKind,
        sanction: Option<&str>,
    ) -> CollaboratorResult<()>;
    /// Turn a draft into a (private) registration tree and return the new root id
    fn materialize_draft(
        &self,
        draft_id: &str,
        actor: Option<&str>,
    ) -> CollaboratorResult<ArtifactId>;
}

pub trait Permissions: Send + Sync {
    fn is_artifact_admin(&self, user: &str, artifact: &str) -> bool;
    /// Coarse site-wide permission used for draft review
    fn is_administrator(&self, user: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateId {
    AuthorizerPending(SanctionKind),
    NonAuthorizerPending(SanctionKind),
    InitiatorCompletion(SanctionKind),
    DraftRejected,
}

pub type NotificationContext = BTreeMap<String, String>;

pub trait NotificationGateway: Send + Sync {
    fn send(
        &self,
        to: &str,
        template: TemplateId,
        context: &NotificationContext,
    ) -> CollaboratorResult<()>;
}
