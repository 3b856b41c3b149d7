//! The approval state machine shared by every sanction kind.
//!
//! A [`Sanction`] is a [`SanctionCore`] (state, ledger, dates) plus the
//! [`Variant`] that supplies the hooks. Calls here only flip state and return
//! a [`Transition`]; the hooks run afterwards through
//! [`Sanction::run_completion`] / [`Sanction::run_rejection`], once the
//! transition has been persisted, so a lost write race never fires a hook.
use std::collections::BTreeMap;
use std::fmt;

use chrono::{Duration, Utc};
use tracing::{debug, info};

use crate::collaborators::Permissions;
use crate::error::{SanctionError, SanctionResult};
use crate::ledger::{ApprovalLedger, LedgerEntry};
use crate::token::{TokenIssuer, TokenKind, tokens_match};
use crate::types::{ArtifactId, SanctionId, TimeStamp, UserId};
use crate::variant::{HookEnv, HookOutcome, SanctionKind, SanctionVariant, Variant};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SanctionState {
    #[n(0)]
    Unapproved,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Completed,
}

impl SanctionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SanctionState::Rejected | SanctionState::Completed)
    }
}

impl fmt::Display for SanctionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SanctionState::Unapproved => "unapproved",
            SanctionState::Approved => "approved",
            SanctionState::Rejected => "rejected",
            SanctionState::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalMode {
    #[n(0)]
    Any,
    #[n(1)]
    Unanimous,
}

/// Rendered links for one authorizer, kept so resends never re-derive them
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct StashedUrls {
    #[n(0)]
    pub view: String,
    #[n(1)]
    pub approve: String,
    #[n(2)]
    pub reject: String,
}

/// What a call did to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    /// decision recorded, still waiting on other authorizers
    Pending,
    Approved,
    Rejected,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct SanctionCore {
    #[n(0)]
    id: SanctionId,
    #[n(1)]
    artifact_id: ArtifactId, // registration or draft guarded by this sanction
    #[n(2)]
    state: SanctionState,
    #[n(3)]
    mode: ApprovalMode,
    #[n(4)]
    ledger: ApprovalLedger,
    #[n(5)]
    stashed_urls: BTreeMap<UserId, StashedUrls>,
    #[n(6)]
    end_date: Option<TimeStamp<Utc>>,
    #[n(7)]
    initiation_date: TimeStamp<Utc>,
    #[n(8)]
    initiated_by: Option<UserId>,
    #[n(9)]
    settled_at: Option<TimeStamp<Utc>>, // set once the hook for the current state succeeded
    #[n(10)]
    revision: u64,
}

impl SanctionCore {
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn artifact_id(&self) -> &str {
        &self.artifact_id
    }
    pub fn state(&self) -> SanctionState {
        self.state
    }
    pub fn mode(&self) -> ApprovalMode {
        self.mode
    }
    pub fn ledger(&self) -> &ApprovalLedger {
        &self.ledger
    }
    pub fn stashed_urls(&self, authorizer: &str) -> Option<&StashedUrls> {
        self.stashed_urls.get(authorizer)
    }
    pub fn end_date(&self) -> Option<&TimeStamp<Utc>> {
        self.end_date.as_ref()
    }
    pub fn initiation_date(&self) -> &TimeStamp<Utc> {
        &self.initiation_date
    }
    pub fn initiated_by(&self) -> Option<&str> {
        self.initiated_by.as_deref()
    }
    pub fn settled_at(&self) -> Option<&TimeStamp<Utc>> {
        self.settled_at.as_ref()
    }
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Sanction {
    #[n(0)]
    core: SanctionCore,
    #[n(1)]
    variant: Variant,
}

impl Sanction {
    pub fn new(
        id: SanctionId,
        artifact_id: ArtifactId,
        variant: Variant,
        initiated_by: Option<UserId>,
        now: TimeStamp<Utc>,
        approval_window: Duration,
    ) -> Self {
        let end_date = variant
            .auto_activates()
            .then(|| now.shifted(approval_window));

        Self {
            core: SanctionCore {
                id,
                artifact_id,
                state: SanctionState::Unapproved,
                mode: variant.mode(),
                ledger: ApprovalLedger::default(),
                stashed_urls: BTreeMap::new(),
                end_date,
                initiation_date: now,
                initiated_by,
                settled_at: None,
                revision: 0,
            },
            variant,
        }
    }

    pub fn core(&self) -> &SanctionCore {
        &self.core
    }
    pub fn variant(&self) -> &Variant {
        &self.variant
    }
    pub fn id(&self) -> &str {
        &self.core.id
    }
    pub fn kind(&self) -> SanctionKind {
        self.variant.kind()
    }
    pub fn state(&self) -> SanctionState {
        self.core.state
    }
    pub fn ledger(&self) -> &ApprovalLedger {
        &self.core.ledger
    }
    pub fn revision(&self) -> u64 {
        self.core.revision
    }

    /// Approved, but the completion hook has not gone through yet
    pub fn is_stuck(&self) -> bool {
        self.core.state == SanctionState::Approved && self.core.settled_at.is_none()
    }

    /// Enrol `authorizer` with a fresh token pair. False when the variant's
    /// eligibility check fails or the sanction is no longer collecting
    /// decisions; true (and nothing minted) when already enrolled.
    pub fn add_authorizer(
        &mut self,
        authorizer: &str,
        artifact_ref: &str,
        issuer: &TokenIssuer,
        perms: &dyn Permissions,
    ) -> bool {
        if self.core.state != SanctionState::Unapproved {
            return false;
        }
        if !self.variant.is_eligible(authorizer, artifact_ref, perms) {
            debug!(sanction_id = %self.core.id, authorizer, "authorizer failed eligibility check");
            return false;
        }
        if self.core.ledger.contains(authorizer) {
            return true;
        }

        let entry = LedgerEntry {
            has_approved: false,
            approval_token: issuer.mint(&self.core.id, authorizer, TokenKind::Approval),
            rejection_token: issuer.mint(&self.core.id, authorizer, TokenKind::Rejection),
            artifact_ref: artifact_ref.to_string(),
        };
        self.core.ledger.insert(authorizer.to_string(), entry)
    }

    pub fn remove_authorizer(&mut self, authorizer: &str) -> bool {
        if self.core.state != SanctionState::Unapproved {
            return false;
        }
        self.core.stashed_urls.remove(authorizer);
        self.core.ledger.remove(authorizer)
    }

    pub fn token_for(&self, authorizer: &str, kind: TokenKind) -> SanctionResult<&str> {
        self.core
            .ledger
            .get(authorizer)
            .map(|entry| entry.token(kind))
            .ok_or_else(|| self.not_authorizer(authorizer))
    }

    pub fn approve(
        &mut self,
        authorizer: &str,
        token: &str,
        issuer: &TokenIssuer,
    ) -> SanctionResult<Transition> {
        self.check_presented(authorizer, token, TokenKind::Approval, issuer, "approve")?;
        self.core.ledger.mark_approved(authorizer);

        let decided = match self.core.mode {
            ApprovalMode::Any => true,
            ApprovalMode::Unanimous => self.core.ledger.all_approved(),
        };
        if !decided {
            debug!(
                sanction_id = %self.core.id,
                authorizer,
                approved = self.core.ledger.approved_count(),
                of = self.core.ledger.len(),
                "approval recorded"
            );
            return Ok(Transition::Pending);
        }

        self.core.state = SanctionState::Approved;
        info!(sanction_id = %self.core.id, kind = %self.kind(), authorizer, "sanction approved");
        Ok(Transition::Approved)
    }

    /// First rejection wins whatever the mode or the approvals so far
    pub fn reject(
        &mut self,
        authorizer: &str,
        token: &str,
        issuer: &TokenIssuer,
    ) -> SanctionResult<Transition> {
        self.check_presented(authorizer, token, TokenKind::Rejection, issuer, "reject")?;
        self.core.state = SanctionState::Rejected;
        info!(sanction_id = %self.core.id, kind = %self.kind(), authorizer, "sanction rejected");
        Ok(Transition::Rejected)
    }

    /// Decision path for variants that bypass the ledger (draft review)
    pub fn approve_by_authority(
        &mut self,
        actor: &str,
        perms: &dyn Permissions,
    ) -> SanctionResult<Transition> {
        self.check_authority(actor, perms, "approve")?;
        self.core.state = SanctionState::Approved;
        info!(
            sanction_id = %self.core.id,
            kind = %self.kind(),
            actor,
            "sanction approved by administrator"
        );
        Ok(Transition::Approved)
    }

    pub fn reject_by_authority(
        &mut self,
        actor: &str,
        perms: &dyn Permissions,
    ) -> SanctionResult<Transition> {
        self.check_authority(actor, perms, "reject")?;
        self.core.state = SanctionState::Rejected;
        info!(
            sanction_id = %self.core.id,
            kind = %self.kind(),
            actor,
            "sanction rejected by administrator"
        );
        Ok(Transition::Rejected)
    }

    /// Past the deadline silence counts as consent. No-op unless still
    /// unapproved with an `end_date` at or before `now`.
    pub fn force_activate(&mut self, now: &TimeStamp<Utc>) -> Transition {
        match &self.core.end_date {
            Some(end) if self.core.state == SanctionState::Unapproved && end <= now => {
                self.core.state = SanctionState::Approved;
                info!(
                    sanction_id = %self.core.id,
                    kind = %self.kind(),
                    "sanction activated after deadline"
                );
                Transition::Approved
            }
            _ => Transition::Unchanged,
        }
    }

    /// Reject on behalf of another sanction's completion. Applies to any live
    /// sanction, including an active embargo or one stuck mid-hook. The
    /// rejection hook is not run; the caller owns whatever cleanup the cascade
    /// implies.
    pub(crate) fn cancel_by_cascade(&mut self, now: &TimeStamp<Utc>) -> bool {
        if self.core.state.is_terminal() {
            return false;
        }
        self.core.state = SanctionState::Rejected;
        self.core.settled_at = Some(now.clone());
        true
    }

    pub(crate) fn run_completion(&mut self, env: &HookEnv<'_>) -> SanctionResult<HookOutcome> {
        if !self.is_stuck() {
            return Err(self.invalid_state("complete"));
        }
        let Sanction { core, variant } = self;

        let outcome = variant.on_complete(core, env)?;
        core.settled_at = Some(env.now.clone());
        if variant.completes_on_approval() {
            core.state = SanctionState::Completed;
        }
        Ok(outcome)
    }

    pub(crate) fn run_rejection(&mut self, env: &HookEnv<'_>) -> SanctionResult<HookOutcome> {
        if self.core.state != SanctionState::Rejected || self.core.settled_at.is_some() {
            return Err(self.invalid_state("clean up after rejection"));
        }
        let Sanction { core, variant } = self;

        let outcome = variant.on_reject(core, env)?;
        core.settled_at = Some(env.now.clone());
        Ok(outcome)
    }

    /// Lift an active embargo: registration goes public, embargo completes
    pub(crate) fn release_embargo(&mut self, env: &HookEnv<'_>) -> SanctionResult<HookOutcome> {
        if self.core.state != SanctionState::Approved || self.core.settled_at.is_none() {
            return Err(self.invalid_state("release"));
        }
        let Sanction { core, variant } = self;
        let Variant::Embargo(embargo) = variant else {
            return Err(SanctionError::InvalidState {
                sanction_id: core.id.clone(),
                state: core.state,
                action: "release a sanction that is not an embargo",
            });
        };

        let outcome = embargo.release(core, env)?;
        core.state = SanctionState::Completed;
        Ok(outcome)
    }

    pub(crate) fn stash_urls(&mut self, authorizer: &str, urls: StashedUrls) {
        if self.core.ledger.contains(authorizer) {
            self.core.stashed_urls.insert(authorizer.to_string(), urls);
        }
    }

    pub(crate) fn set_revision(&mut self, revision: u64) {
        self.core.revision = revision;
    }

    fn check_presented(
        &self,
        authorizer: &str,
        token: &str,
        kind: TokenKind,
        issuer: &TokenIssuer,
        action: &'static str,
    ) -> SanctionResult<()> {
        let entry = self
            .core
            .ledger
            .get(authorizer)
            .ok_or_else(|| self.not_authorizer(authorizer))?;
        if self.core.state != SanctionState::Unapproved {
            return Err(self.invalid_state(action));
        }

        let authentic = issuer.verify(token, &self.core.id, authorizer, kind);
        if authentic && tokens_match(entry.token(kind), token) {
            return Ok(());
        }
        let sanction_id = self.core.id.clone();
        Err(match kind {
            TokenKind::Approval => SanctionError::InvalidApprovalToken { sanction_id },
            TokenKind::Rejection => SanctionError::InvalidRejectionToken { sanction_id },
        })
    }

    fn check_authority(
        &self,
        actor: &str,
        perms: &dyn Permissions,
        action: &'static str,
    ) -> SanctionResult<()> {
        if !self.variant.bypasses_ledger() || !perms.is_administrator(actor) {
            return Err(self.not_authorizer(actor));
        }
        if self.core.state != SanctionState::Unapproved {
            return Err(self.invalid_state(action));
        }
        Ok(())
    }

    fn not_authorizer(&self, authorizer: &str) -> SanctionError {
        SanctionError::Permissions {
            sanction_id: self.core.id.clone(),
            authorizer: authorizer.to_string(),
        }
    }

    fn invalid_state(&self, action: &'static str) -> SanctionError {
        SanctionError::InvalidState {
            sanction_id: self.core.id.clone(),
            state: self.core.state,
            action,
        }
    }
}
