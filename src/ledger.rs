//! Per-sanction record of who may decide and what they decided.
//!
//! Reads are public. Mutation is `pub(crate)` and only called from
//! [`crate::sanction::Sanction`], which owns the ledger.
use std::collections::BTreeMap;

use crate::token::TokenKind;
use crate::types::{ArtifactId, UserId};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    #[n(0)]
    pub has_approved: bool,
    #[n(1)]
    pub approval_token: String,
    #[n(2)]
    pub rejection_token: String,
    #[n(3)]
    pub artifact_ref: ArtifactId, // the artifact this authorizer was enrolled through
}

impl LedgerEntry {
    pub fn token(&self, kind: TokenKind) -> &str {
        match kind {
            TokenKind::Approval => &self.approval_token,
            TokenKind::Rejection => &self.rejection_token,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalLedger {
    #[n(0)]
    entries: BTreeMap<UserId, LedgerEntry>,
}

impl ApprovalLedger {
    pub fn get(&self, authorizer: &str) -> Option<&LedgerEntry> {
        self.entries.get(authorizer)
    }
    pub fn contains(&self, authorizer: &str) -> bool {
        self.entries.contains_key(authorizer)
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn authorizers(&self) -> impl Iterator<Item = &UserId> {
        self.entries.keys()
    }
    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &LedgerEntry)> {
        self.entries.iter()
    }
    /// An empty ledger is never "all approved"
    pub fn all_approved(&self) -> bool {
        !self.entries.is_empty() && self.entries.values().all(|e| e.has_approved)
    }
    pub fn approved_count(&self) -> usize {
        self.entries.values().filter(|e| e.has_approved).count()
    }

    /// Returns false when the authorizer already has an entry
    pub(crate) fn insert(&mut self, authorizer: UserId, entry: LedgerEntry) -> bool {
        if self.entries.contains_key(&authorizer) {
            return false;
        }
        self.entries.insert(authorizer, entry);
        true
    }
    pub(crate) fn remove(&mut self, authorizer: &str) -> bool {
        self.entries.remove(authorizer).is_some()
    }
    pub(crate) fn mark_approved(&mut self, authorizer: &str) {
        if let Some(entry) = self.entries.get_mut(authorizer) {
            entry.has_approved = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> LedgerEntry {
        LedgerEntry {
            has_approved: false,
            approval_token: "a".into(),
            rejection_token: "r".into(),
            artifact_ref: "node_1".into(),
        }
    }

    #[test]
    fn empty_ledger_is_not_all_approved() {
        assert!(!ApprovalLedger::default().all_approved());
    }

    #[test]
    fn insert_is_idempotent_per_authorizer() {
        let mut ledger = ApprovalLedger::default();
        assert!(ledger.insert("alice".into(), entry()));

        let mut replacement = entry();
        replacement.approval_token = "other".into();
        assert!(!ledger.insert("alice".into(), replacement));

        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get("alice").unwrap().approval_token, "a");
    }

    #[test]
    fn all_approved_tracks_every_entry() {
        let mut ledger = ApprovalLedger::default();
        ledger.insert("alice".into(), entry());
        ledger.insert("bob".into(), entry());

        ledger.mark_approved("alice");
        assert!(!ledger.all_approved());
        assert_eq!(ledger.approved_count(), 1);

        ledger.mark_approved("bob");
        assert!(ledger.all_approved());
    }

    #[test]
    fn token_lookup_by_kind() {
        let e = entry();
        assert_eq!(e.token(TokenKind::Approval), "a");
        assert_eq!(e.token(TokenKind::Rejection), "r");
    }
}
