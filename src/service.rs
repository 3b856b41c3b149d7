//! Service layer API for sanction workflow operations
//!
//! Every decision follows the same path: flip the state machine inside a
//! compare-and-swap on the sanction record, then (only for the caller whose
//! write made the transition) run the variant hook, stage whatever it
//! cascades into, and commit the lot in one transaction. Mail goes out last
//! and never fails the call.
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{error, info, warn};

use crate::collaborators::{ArtifactTree, AuditEvent, NotificationGateway, Permissions};
use crate::config::Config;
use crate::error::{SanctionError, SanctionResult};
use crate::notify::{self, Notifier};
use crate::sanction::{Sanction, SanctionState, Transition};
use crate::store::{SanctionStore, Staged};
use crate::token::{TokenIssuer, TokenKind};
use crate::types::{SanctionId, TimeStamp, UserId};
use crate::utils::new_sanction_id;
use crate::variant::{
    Cascade, DraftRegistrationApproval, Embargo, EmbargoTerminationApproval, HookEnv, Notice,
    RegistrationApproval, RegistrationChoice, Retraction, SanctionKind, SanctionVariant, Variant,
    audit_params, log_once,
};

/// External systems the engine is wired to
#[derive(Clone)]
pub struct Collaborators {
    pub tree: Arc<dyn ArtifactTree>,
    pub perms: Arc<dyn Permissions>,
    pub mailer: Arc<dyn NotificationGateway>,
}

pub struct SanctionService {
    store: SanctionStore,
    issuer: TokenIssuer,
    notifier: Notifier,
    tree: Arc<dyn ArtifactTree>,
    perms: Arc<dyn Permissions>,
    approval_window: Duration,
    notify_initiator: bool,
}

/// Records produced while settling a sanction, written together
struct Settlement {
    staged: Vec<Staged>,
    notices: Vec<Notice>,
    started: Vec<SanctionId>,
}

impl SanctionService {
    pub fn new(
        instance: Arc<sled::Db>,
        config: &Config,
        collaborators: Collaborators,
    ) -> SanctionResult<Self> {
        Ok(Self {
            store: SanctionStore::open(&instance, config.cas_retry_limit)?,
            issuer: TokenIssuer::new(&config.token_secret)?,
            notifier: Notifier::new(collaborators.mailer, config.base_url.clone()),
            tree: collaborators.tree,
            perms: collaborators.perms,
            approval_window: config.approval_window(),
            notify_initiator: config.notify_initiator,
        })
    }

    pub fn load(&self, sanction_id: &str) -> SanctionResult<Sanction> {
        self.store.load(sanction_id)
    }

    pub fn flush(&self) -> SanctionResult<()> {
        self.store.flush()
    }

    // ---- starting a workflow ----

    /// Create and persist a sanction, enrolling each eligible authorizer and
    /// mailing them their links. Refused while another sanction of the same
    /// kind is live on the artifact.
    pub fn start(
        &self,
        artifact_id: &str,
        variant: Variant,
        initiated_by: Option<&str>,
        authorizers: &[UserId],
    ) -> SanctionResult<Sanction> {
        let kind = variant.kind();
        let mut sanction = Sanction::new(
            new_sanction_id()?,
            artifact_id.to_string(),
            variant,
            initiated_by.map(str::to_string),
            TimeStamp::new(),
            self.approval_window,
        );
        for authorizer in authorizers {
            self.enroll(&mut sanction, authorizer, artifact_id)?;
        }

        // the commit takes the artifact's slot for this kind, so the
        // back-reference is only pointed at a sanction that won it
        let sanction = self.commit_one(Staged::new_record(sanction))?;
        if let Err(e) = self
            .tree
            .set_sanction_ref(artifact_id, kind, Some(sanction.id()))
        {
            error!(
                sanction_id = %sanction.id(),
                artifact_id,
                error = %e,
                "could not back-reference new sanction; withdrawing it"
            );
            let now = TimeStamp::new();
            self.store
                .mutate(sanction.id(), |s| Ok(s.cancel_by_cascade(&now)))?;
            return Err(e.into());
        }

        info!(
            sanction_id = %sanction.id(),
            kind = %kind,
            artifact_id,
            authorizers = sanction.ledger().len(),
            "sanction started"
        );

        let enrolled: Vec<UserId> = sanction.ledger().authorizers().cloned().collect();
        self.notifier.notify_pending(&sanction, &enrolled);
        Ok(sanction)
    }

    pub fn request_retraction(
        &self,
        registration: &str,
        initiator: &str,
        justification: Option<String>,
    ) -> SanctionResult<Sanction> {
        let admins = self.tree.admins(registration)?;
        self.start(
            registration,
            Variant::Retraction(Retraction::new(justification)),
            Some(initiator),
            &admins,
        )
    }

    pub fn request_embargo(
        &self,
        registration: &str,
        initiator: &str,
        embargo_end_date: TimeStamp<Utc>,
        for_existing_registration: bool,
    ) -> SanctionResult<Sanction> {
        let admins = self.tree.admins(registration)?;
        self.start(
            registration,
            Variant::Embargo(Embargo::new(embargo_end_date, for_existing_registration)),
            Some(initiator),
            &admins,
        )
    }

    pub fn request_registration_approval(
        &self,
        registration: &str,
        initiator: &str,
    ) -> SanctionResult<Sanction> {
        let admins = self.tree.admins(registration)?;
        self.start(
            registration,
            Variant::RegistrationApproval(RegistrationApproval::new()),
            Some(initiator),
            &admins,
        )
    }

    /// Queue a draft for administrator review; no ledger, no tokens
    pub fn submit_draft(
        &self,
        draft_id: &str,
        initiator: &str,
        choice: RegistrationChoice,
    ) -> SanctionResult<Sanction> {
        self.start(
            draft_id,
            Variant::DraftRegistrationApproval(DraftRegistrationApproval::new(choice)),
            Some(initiator),
            &[],
        )
    }

    /// Ask the registration's admins to lift an active embargo early
    pub fn request_embargo_termination(
        &self,
        embargo_id: &str,
        initiator: &str,
    ) -> SanctionResult<Sanction> {
        let embargo = self.store.load(embargo_id)?;
        let active = matches!(embargo.variant(), Variant::Embargo(_))
            && embargo.state() == SanctionState::Approved
            && !embargo.is_stuck();
        if !active {
            return Err(SanctionError::InvalidState {
                sanction_id: embargo_id.to_string(),
                state: embargo.state(),
                action: "terminate an embargo that is not active",
            });
        }

        let registration = embargo.core().artifact_id();
        let admins = self.tree.admins(registration)?;
        self.start(
            registration,
            Variant::EmbargoTerminationApproval(EmbargoTerminationApproval::new(
                embargo_id.to_string(),
            )),
            Some(initiator),
            &admins,
        )
    }

    // ---- ledger management ----

    pub fn add_authorizer(
        &self,
        sanction_id: &str,
        authorizer: &str,
        artifact_ref: &str,
    ) -> SanctionResult<bool> {
        let (_, added) = self
            .store
            .mutate(sanction_id, |s| self.enroll(s, authorizer, artifact_ref))?;
        Ok(added)
    }

    pub fn remove_authorizer(&self, sanction_id: &str, authorizer: &str) -> SanctionResult<bool> {
        let (_, removed) = self
            .store
            .mutate(sanction_id, |s| Ok(s.remove_authorizer(authorizer)))?;
        Ok(removed)
    }

    pub fn token_for(
        &self,
        sanction_id: &str,
        authorizer: &str,
        kind: TokenKind,
    ) -> SanctionResult<String> {
        let sanction = self.store.load(sanction_id)?;
        Ok(sanction.token_for(authorizer, kind)?.to_string())
    }

    // ---- decisions ----

    pub fn approve(
        &self,
        sanction_id: &str,
        authorizer: &str,
        token: &str,
    ) -> SanctionResult<Sanction> {
        let (sanction, transition) = self
            .store
            .mutate(sanction_id, |s| s.approve(authorizer, token, &self.issuer))
            .inspect_err(|e| refused(sanction_id, authorizer, e))?;
        self.settle(sanction, transition)
    }

    pub fn reject(
        &self,
        sanction_id: &str,
        authorizer: &str,
        token: &str,
    ) -> SanctionResult<Sanction> {
        let (sanction, transition) = self
            .store
            .mutate(sanction_id, |s| s.reject(authorizer, token, &self.issuer))
            .inspect_err(|e| refused(sanction_id, authorizer, e))?;
        self.settle(sanction, transition)
    }

    pub fn approve_draft(&self, sanction_id: &str, actor: &str) -> SanctionResult<Sanction> {
        let (sanction, transition) = self
            .store
            .mutate(sanction_id, |s| s.approve_by_authority(actor, &*self.perms))
            .inspect_err(|e| refused(sanction_id, actor, e))?;
        self.settle(sanction, transition)
    }

    pub fn reject_draft(&self, sanction_id: &str, actor: &str) -> SanctionResult<Sanction> {
        let (sanction, transition) = self
            .store
            .mutate(sanction_id, |s| s.reject_by_authority(actor, &*self.perms))
            .inspect_err(|e| refused(sanction_id, actor, e))?;
        self.settle(sanction, transition)
    }

    /// Deadline activation. `None` when there was nothing to do: not yet due,
    /// or already decided by the time the record was locked.
    pub fn force_activate(
        &self,
        sanction_id: &str,
        now: TimeStamp<Utc>,
    ) -> SanctionResult<Option<Sanction>> {
        let (sanction, transition) = self
            .store
            .mutate(sanction_id, |s| Ok(s.force_activate(&now)))?;
        if transition != Transition::Approved {
            return Ok(None);
        }
        self.settle(sanction, transition).map(Some)
    }

    /// Re-run the hook of a sanction whose completion or rejection cleanup failed
    pub fn resume(&self, sanction_id: &str) -> SanctionResult<Sanction> {
        let sanction = self.store.load(sanction_id)?;
        let transition = match sanction.state() {
            SanctionState::Approved if sanction.is_stuck() => Transition::Approved,
            SanctionState::Rejected if sanction.core().settled_at().is_none() => {
                Transition::Rejected
            }
            state => {
                return Err(SanctionError::InvalidState {
                    sanction_id: sanction_id.to_string(),
                    state,
                    action: "resume",
                });
            }
        };
        info!(sanction_id, ?transition, "resuming settlement");
        self.settle(sanction, transition)
    }

    /// Lift an active embargo whose end date has passed
    pub fn release_embargo(
        &self,
        sanction_id: &str,
        now: TimeStamp<Utc>,
    ) -> SanctionResult<Sanction> {
        let mut embargo = self.store.load(sanction_id)?;
        let refuse = |action| SanctionError::InvalidState {
            sanction_id: sanction_id.to_string(),
            state: embargo.state(),
            action,
        };
        let Variant::Embargo(variant) = embargo.variant() else {
            return Err(refuse("release a sanction that is not an embargo"));
        };
        if embargo.state() != SanctionState::Approved || embargo.is_stuck() {
            return Err(refuse("release an embargo that is not active"));
        }
        if !variant.is_due(&now) {
            return Err(refuse("release an embargo before its end date"));
        }

        let env = self.hook_env(now);
        let outcome = embargo.release_embargo(&env)?;
        let embargo = self.commit_one(Staged::existing(embargo))?;
        self.forget_steps(embargo.id());
        self.notifier.deliver(&outcome.notices);
        Ok(embargo)
    }

    // ---- notifications ----

    /// Send the pending notice to each recipient; returns how many went out
    pub fn notify_pending(
        &self,
        sanction_id: &str,
        recipients: &[UserId],
    ) -> SanctionResult<usize> {
        let sanction = self.store.load(sanction_id)?;
        Ok(self.notifier.notify_pending(&sanction, recipients))
    }

    /// Re-send an authorizer's stashed links
    pub fn resend(&self, sanction_id: &str, authorizer: &str) -> SanctionResult<bool> {
        let sanction = self.store.load(sanction_id)?;
        if !sanction.ledger().contains(authorizer) {
            return Err(SanctionError::Permissions {
                sanction_id: sanction_id.to_string(),
                authorizer: authorizer.to_string(),
            });
        }
        Ok(self
            .notifier
            .notify_pending(&sanction, &[authorizer.to_string()])
            == 1)
    }

    /// Ids the expiry sweep should act on: (past-deadline pending, due embargoes)
    pub fn sweep_candidates(
        &self,
        now: &TimeStamp<Utc>,
    ) -> SanctionResult<(Vec<SanctionId>, Vec<SanctionId>)> {
        let mut expired = vec![];
        let mut due = vec![];
        for sanction in self.store.scan() {
            let sanction = sanction?;
            match sanction.state() {
                SanctionState::Unapproved
                    if sanction.core().end_date().is_some_and(|end| end <= now) =>
                {
                    expired.push(sanction.id().to_string())
                }
                SanctionState::Approved if !sanction.is_stuck() => {
                    if let Variant::Embargo(embargo) = sanction.variant() {
                        if embargo.is_due(now) {
                            due.push(sanction.id().to_string());
                        }
                    }
                }
                _ => {}
            }
        }
        Ok((expired, due))
    }

    // ---- internals ----

    fn enroll(
        &self,
        sanction: &mut Sanction,
        authorizer: &str,
        artifact_ref: &str,
    ) -> SanctionResult<bool> {
        if !sanction.add_authorizer(authorizer, artifact_ref, &self.issuer, &*self.perms) {
            return Ok(false);
        }
        if sanction.core().stashed_urls(authorizer).is_none() {
            let urls = notify::build_urls(sanction, authorizer, self.notifier.base_url())?;
            sanction.stash_urls(authorizer, urls);
        }
        Ok(true)
    }

    fn hook_env(&self, now: TimeStamp<Utc>) -> HookEnv<'_> {
        HookEnv {
            tree: &*self.tree,
            perms: &*self.perms,
            now,
            approval_window: self.approval_window,
            notify_initiator: self.notify_initiator,
            journal: self.store.journal(),
        }
    }

    // a leftover entry only means a settled sanction keeps a few stale keys
    fn forget_steps(&self, sanction_id: &str) {
        if let Err(e) = self.store.journal().clear(sanction_id) {
            warn!(sanction_id, error = %e, "could not clear hook step journal");
        }
    }

    /// Run the hook for `transition` and commit the sanction with its cascades.
    /// A hook error leaves the persisted record untouched (approved or
    /// rejected, unsettled) so [`Self::resume`] can pick it up.
    fn settle(&self, mut sanction: Sanction, transition: Transition) -> SanctionResult<Sanction> {
        let env = self.hook_env(TimeStamp::new());
        let hook = match transition {
            Transition::Approved => sanction.run_completion(&env),
            Transition::Rejected => sanction.run_rejection(&env),
            Transition::Pending | Transition::Unchanged => return Ok(sanction),
        };
        let outcome = hook.inspect_err(|e| {
            error!(
                sanction_id = %sanction.id(),
                kind = %sanction.kind(),
                error = %e,
                "hook failed; sanction left unsettled"
            )
        })?;

        let mut settlement = Settlement {
            staged: vec![Staged::existing(sanction)],
            notices: outcome.notices,
            started: vec![],
        };
        for cascade in outcome.cascades {
            self.stage_cascade(cascade, &env, &mut settlement)?;
        }

        let mut committed = self.store.commit(settlement.staged)?.into_iter();
        let sanction = committed
            .next()
            .ok_or_else(|| anyhow::anyhow!("commit returned no records"))?;
        info!(sanction_id = %sanction.id(), state = %sanction.state(), "sanction settled");
        self.forget_steps(sanction.id());
        let committed: Vec<Sanction> = committed.collect();
        for other in &committed {
            self.forget_steps(other.id());
        }

        let started = committed
            .iter()
            .filter(|s| settlement.started.iter().any(|id| id == s.id()));
        for sanction in started {
            let authorizers: Vec<UserId> = sanction.ledger().authorizers().cloned().collect();
            self.notifier.notify_pending(sanction, &authorizers);
        }
        self.notifier.deliver(&settlement.notices);

        Ok(sanction)
    }

    fn stage_cascade(
        &self,
        cascade: Cascade,
        env: &HookEnv<'_>,
        settlement: &mut Settlement,
    ) -> SanctionResult<()> {
        match cascade {
            Cascade::Cancel(other_id) => {
                let mut other = match self.store.load(&other_id) {
                    Ok(other) => other,
                    Err(SanctionError::NotFound(_)) => {
                        warn!(
                            sanction_id = %other_id,
                            "back-reference points at a missing sanction"
                        );
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                let was = other.state();
                if !other.cancel_by_cascade(&env.now) {
                    return Ok(());
                }
                if other.kind() == SanctionKind::Embargo {
                    if let Some(registration) = env.tree.get(other.core().artifact_id())? {
                        log_once(
                            env,
                            &other_id,
                            "cancelled",
                            registration.log_target(),
                            AuditEvent::EmbargoCancelled,
                            &audit_params(other.core(), &registration.id),
                            None,
                        )?;
                    }
                }
                info!(
                    sanction_id = %other_id,
                    kind = %other.kind(),
                    was = %was,
                    "live sanction cancelled by cascade"
                );
                settlement.staged.push(Staged::existing(other));
            }
            Cascade::Release(embargo_id) => {
                let mut embargo = self.store.load(&embargo_id)?;
                let outcome = embargo.release_embargo(env)?;
                settlement.notices.extend(outcome.notices);
                settlement.staged.push(Staged::existing(embargo));
            }
            Cascade::Start {
                mut sanction,
                authorizers,
            } => {
                let artifact_id = sanction.core().artifact_id().to_string();
                for authorizer in &authorizers {
                    self.enroll(&mut sanction, authorizer, &artifact_id)?;
                }
                // the id is stable across retries of the parent hook, so
                // repeating this write is harmless
                self.tree
                    .set_sanction_ref(&artifact_id, sanction.kind(), Some(sanction.id()))?;
                settlement.started.push(sanction.id().to_string());
                settlement.staged.push(Staged::new_record(*sanction));
            }
        }
        Ok(())
    }

    fn commit_one(&self, staged: Staged) -> SanctionResult<Sanction> {
        let id = staged.sanction.id().to_string();
        self.store
            .commit(vec![staged])?
            .pop()
            .ok_or(SanctionError::NotFound(id))
    }
}

fn refused(sanction_id: &str, who: &str, e: &SanctionError) {
    warn!(sanction_id, who, error = %e, "decision refused");
}
