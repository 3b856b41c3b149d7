//! In-memory collaborators and a service wired to a throwaway sled db
//!
//! Sled uses file-based locking, so every harness gets its own database in a
//! temp dir that is cleaned up when the harness is dropped.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use sanction_approval::collaborators::{
    Artifact, ArtifactTree, AuditEvent, AuditParams, CollaboratorError, CollaboratorResult,
    NotificationContext, NotificationGateway, Permissions, TemplateId,
};
use sanction_approval::sanction::Sanction;
use sanction_approval::{
    Collaborators, Config, SanctionKind, SanctionResult, SanctionService, TokenKind,
};
use tempfile::{TempDir, tempdir};

pub const SITE_ADMIN: &str = "site_admin";
pub const SECRET: [u8; 32] = [7; 32];

// ARTIFACT TREE

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub target: String,
    pub event: AuditEvent,
    pub params: AuditParams,
}

#[derive(Default)]
pub struct TreeState {
    pub nodes: BTreeMap<String, Artifact>,
    pub children: BTreeMap<String, Vec<String>>,
    pub admins: BTreeMap<String, Vec<String>>,
    pub refs: BTreeMap<(String, SanctionKind), String>,
    pub logs: Vec<LogEntry>,
    pub reindexed: Vec<String>,
    pub failing_set_public: BTreeSet<String>,
    pub failing_log_targets: BTreeSet<String>,
    pub failing_refs: bool,
    pub materialized: Vec<String>,
}

impl TreeState {
    fn descendants(&self, id: &str) -> Vec<String> {
        let mut out = vec![];
        let mut queue: Vec<String> = self.children.get(id).cloned().unwrap_or_default();
        while let Some(next) = queue.pop() {
            queue.extend(self.children.get(&next).cloned().unwrap_or_default());
            out.push(next);
        }
        out.sort();
        out
    }
}

#[derive(Default)]
pub struct FakeTree {
    state: Mutex<TreeState>,
}

impl FakeTree {
    pub fn state(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap()
    }

    /// Private registration `root` with `children` beneath it. Each node is
    /// registered from `<id>_source`, where its audit entries land.
    pub fn add_registration(&self, root: &str, children: &[&str], admins: &[&str]) {
        let mut st = self.state();
        for id in std::iter::once(&root).chain(children) {
            st.nodes.insert(
                id.to_string(),
                Artifact {
                    id: id.to_string(),
                    is_public: false,
                    is_spam: false,
                    registered_from: Some(format!("{id}_source")),
                },
            );
            st.admins
                .insert(id.to_string(), admins.iter().map(|a| a.to_string()).collect());
        }
        st.children
            .insert(root.to_string(), children.iter().map(|c| c.to_string()).collect());
    }

    pub fn add_draft(&self, draft: &str, admins: &[&str]) {
        let mut st = self.state();
        st.nodes.insert(
            draft.to_string(),
            Artifact {
                id: draft.to_string(),
                is_public: false,
                is_spam: false,
                registered_from: None,
            },
        );
        st.admins
            .insert(draft.to_string(), admins.iter().map(|a| a.to_string()).collect());
    }

    pub fn flag_spam(&self, id: &str, spam: bool) {
        if let Some(node) = self.state().nodes.get_mut(id) {
            node.is_spam = spam;
        }
    }

    pub fn fail_set_public(&self, id: &str, fail: bool) {
        let mut st = self.state();
        if fail {
            st.failing_set_public.insert(id.to_string());
        } else {
            st.failing_set_public.remove(id);
        }
    }

    /// Audit writes to `target` fail while set
    pub fn fail_logs_on(&self, target: &str, fail: bool) {
        let mut st = self.state();
        if fail {
            st.failing_log_targets.insert(target.to_string());
        } else {
            st.failing_log_targets.remove(target);
        }
    }

    pub fn fail_refs(&self, fail: bool) {
        self.state().failing_refs = fail;
    }

    pub fn is_public(&self, id: &str) -> bool {
        self.state().nodes.get(id).is_some_and(|n| n.is_public)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.state().nodes.contains_key(id)
    }

    pub fn count_events(&self, event: AuditEvent) -> usize {
        self.state().logs.iter().filter(|l| l.event == event).count()
    }

    pub fn events_on(&self, target: &str) -> Vec<AuditEvent> {
        self.state()
            .logs
            .iter()
            .filter(|l| l.target == target)
            .map(|l| l.event)
            .collect()
    }

    pub fn reference(&self, id: &str, kind: SanctionKind) -> Option<String> {
        self.state().refs.get(&(id.to_string(), kind)).cloned()
    }
}

impl ArtifactTree for FakeTree {
    fn get(&self, id: &str) -> CollaboratorResult<Option<Artifact>> {
        Ok(self.state().nodes.get(id).cloned())
    }

    fn get_descendants(&self, id: &str) -> CollaboratorResult<Vec<Artifact>> {
        let st = self.state();
        Ok(st
            .descendants(id)
            .iter()
            .filter_map(|d| st.nodes.get(d).cloned())
            .collect())
    }

    fn set_public(&self, id: &str, _actor: Option<&str>) -> CollaboratorResult<()> {
        let mut st = self.state();
        if st.failing_set_public.contains(id) {
            return Err(CollaboratorError::new(format!("{id}: storage unavailable")));
        }
        match st.nodes.get_mut(id) {
            Some(node) => {
                node.is_public = true;
                Ok(())
            }
            None => Err(CollaboratorError::new(format!("{id}: no such node"))),
        }
    }

    fn add_log(
        &self,
        id: &str,
        event: AuditEvent,
        params: &AuditParams,
        _actor: Option<&str>,
    ) -> CollaboratorResult<()> {
        let mut st = self.state();
        if st.failing_log_targets.contains(id) {
            return Err(CollaboratorError::new(format!("{id}: audit log unavailable")));
        }
        st.logs.push(LogEntry {
            target: id.to_string(),
            event,
            params: params.clone(),
        });
        Ok(())
    }

    fn delete_subtree(&self, id: &str) -> CollaboratorResult<()> {
        let mut st = self.state();
        for node in st.descendants(id).into_iter().chain(std::iter::once(id.to_string())) {
            st.nodes.remove(&node);
            st.children.remove(&node);
            st.admins.remove(&node);
        }
        Ok(())
    }

    fn request_reindex(&self, id: &str) -> CollaboratorResult<()> {
        self.state().reindexed.push(id.to_string());
        Ok(())
    }

    fn admins(&self, id: &str) -> CollaboratorResult<Vec<String>> {
        Ok(self.state().admins.get(id).cloned().unwrap_or_default())
    }

    fn sanction_ref(&self, id: &str, kind: SanctionKind) -> CollaboratorResult<Option<String>> {
        Ok(self.reference(id, kind))
    }

    fn set_sanction_ref(
        &self,
        id: &str,
        kind: SanctionKind,
        sanction: Option<&str>,
    ) -> CollaboratorResult<()> {
        let mut st = self.state();
        if st.failing_refs {
            return Err(CollaboratorError::new(format!("{id}: reference store unavailable")));
        }
        match sanction {
            Some(sanction) => st.refs.insert((id.to_string(), kind), sanction.to_string()),
            None => st.refs.remove(&(id.to_string(), kind)),
        };
        Ok(())
    }

    fn materialize_draft(
        &self,
        draft_id: &str,
        _actor: Option<&str>,
    ) -> CollaboratorResult<String> {
        let mut st = self.state();
        let admins = st
            .admins
            .get(draft_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::new(format!("{draft_id}: no such draft")))?;
        let id = format!("{draft_id}_reg{}", st.materialized.len() + 1);

        st.nodes.insert(
            id.clone(),
            Artifact {
                id: id.clone(),
                is_public: false,
                is_spam: false,
                registered_from: Some(draft_id.to_string()),
            },
        );
        st.admins.insert(id.clone(), admins);
        st.materialized.push(id.clone());
        Ok(id)
    }
}

// PERMISSIONS

/// Artifact admins come from the tree; site admins are fixed
pub struct FakePerms {
    tree: Arc<FakeTree>,
    site_admins: Vec<String>,
}

impl Permissions for FakePerms {
    fn is_artifact_admin(&self, user: &str, artifact: &str) -> bool {
        self.tree
            .state()
            .admins
            .get(artifact)
            .is_some_and(|admins| admins.iter().any(|a| a == user))
    }

    fn is_administrator(&self, user: &str) -> bool {
        self.site_admins.iter().any(|a| a == user)
    }
}

// MAIL

#[derive(Debug, Clone)]
pub struct Sent {
    pub to: String,
    pub template: TemplateId,
    pub context: NotificationContext,
}

#[derive(Default)]
pub struct FakeMailer {
    sent: Mutex<Vec<Sent>>,
    failing: AtomicBool,
}

impl FakeMailer {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, to: &str, template: TemplateId) -> Vec<Sent> {
        self.sent()
            .into_iter()
            .filter(|s| s.to == to && s.template == template)
            .collect()
    }
}

impl NotificationGateway for FakeMailer {
    fn send(
        &self,
        to: &str,
        template: TemplateId,
        context: &NotificationContext,
    ) -> CollaboratorResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::new("smtp relay refused connection"));
        }
        self.sent.lock().unwrap().push(Sent {
            to: to.to_string(),
            template,
            context: context.clone(),
        });
        Ok(())
    }
}

// HARNESS

pub struct Harness {
    pub service: Arc<SanctionService>,
    pub tree: Arc<FakeTree>,
    pub mailer: Arc<FakeMailer>,
    pub db: Arc<sled::Db>,
    _dir: TempDir,
}

pub fn harness() -> anyhow::Result<Harness> {
    harness_with(|_| {})
}

pub fn harness_with(tweak: impl FnOnce(&mut Config)) -> anyhow::Result<Harness> {
    let dir = tempdir()?;
    let mut config = Config::new(dir.path().join("sanctions.db"), SECRET.to_vec());
    tweak(&mut config);

    let db = Arc::new(config.open_db()?);
    let tree = Arc::new(FakeTree::default());
    let mailer = Arc::new(FakeMailer::default());
    let perms = Arc::new(FakePerms {
        tree: tree.clone(),
        site_admins: vec![SITE_ADMIN.to_string()],
    });

    let service = SanctionService::new(
        db.clone(),
        &config,
        Collaborators {
            tree: tree.clone(),
            perms,
            mailer: mailer.clone(),
        },
    )?;

    Ok(Harness {
        service: Arc::new(service),
        tree,
        mailer,
        db,
        _dir: dir,
    })
}

impl Harness {
    pub fn approve(&self, sanction_id: &str, who: &str) -> SanctionResult<Sanction> {
        let token = self.service.token_for(sanction_id, who, TokenKind::Approval)?;
        self.service.approve(sanction_id, who, &token)
    }

    pub fn reject(&self, sanction_id: &str, who: &str) -> SanctionResult<Sanction> {
        let token = self.service.token_for(sanction_id, who, TokenKind::Rejection)?;
        self.service.reject(sanction_id, who, &token)
    }
}
