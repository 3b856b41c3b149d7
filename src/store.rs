//! sled-backed persistence for sanction records.
//!
//! Single-record changes go through [`SanctionStore::mutate`], an optimistic
//! compare-and-swap loop on the raw bytes. Multi-record changes go through
//! [`SanctionStore::commit`], one sled transaction that re-checks the revision
//! of every record it writes.
//!
//! [`StepJournal`] sits beside the records and remembers which side effects a
//! hook already performed, so a hook re-run after a partial failure skips them.
use sled::Transactional;
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionalTree, abort,
};
use tracing::debug;

use crate::error::{SanctionError, SanctionResult};
use crate::sanction::Sanction;
use crate::types::ArtifactId;

pub const SANCTIONS_TREE: &str = "sanctions";
pub const LIVE_CLAIMS_TREE: &str = "live_claims";
pub const HOOK_STEPS_TREE: &str = "hook_steps";

/// A record to write in a [`SanctionStore::commit`]
#[derive(Debug)]
pub struct Staged {
    pub sanction: Sanction,
    /// revision currently on disk; `None` for a record that must not exist yet
    pub expected: Option<u64>,
    /// take the artifact's slot for this kind; refused while another holder is live
    pub claims_slot: bool,
}

impl Staged {
    pub fn existing(sanction: Sanction) -> Self {
        let expected = Some(sanction.revision());
        Self {
            sanction,
            expected,
            claims_slot: false,
        }
    }

    /// A freshly started sanction. It holds the single live slot for its kind
    /// on its artifact until it reaches a terminal state.
    pub fn new_record(sanction: Sanction) -> Self {
        Self {
            sanction,
            expected: None,
            claims_slot: true,
        }
    }
}

struct Write {
    id: String,
    expected: Option<u64>,
    bytes: Vec<u8>,
    slot: Option<(String, ArtifactId)>,
}

pub struct SanctionStore {
    tree: sled::Tree,
    claims: sled::Tree,
    journal: StepJournal,
    retry_limit: usize,
}

impl SanctionStore {
    pub fn open(db: &sled::Db, retry_limit: usize) -> SanctionResult<Self> {
        Ok(Self {
            tree: db.open_tree(SANCTIONS_TREE)?,
            claims: db.open_tree(LIVE_CLAIMS_TREE)?,
            journal: StepJournal {
                tree: db.open_tree(HOOK_STEPS_TREE)?,
            },
            retry_limit: retry_limit.max(1),
        })
    }

    pub fn journal(&self) -> &StepJournal {
        &self.journal
    }

    pub fn load(&self, id: &str) -> SanctionResult<Sanction> {
        let raw = self
            .tree
            .get(id.as_bytes())?
            .ok_or_else(|| SanctionError::NotFound(id.to_string()))?;
        decode(&raw)
    }

    /// Read, apply `f`, write back only if nothing changed underneath. A lost
    /// race re-reads and re-applies `f`; an error from `f` aborts without writing.
    pub fn mutate<R>(
        &self,
        id: &str,
        mut f: impl FnMut(&mut Sanction) -> SanctionResult<R>,
    ) -> SanctionResult<(Sanction, R)> {
        for attempt in 0..self.retry_limit {
            let old = self
                .tree
                .get(id.as_bytes())?
                .ok_or_else(|| SanctionError::NotFound(id.to_string()))?;
            let mut sanction = decode(&old)?;
            let result = f(&mut sanction)?;

            if encode(&sanction)? == old.as_ref() {
                return Ok((sanction, result));
            }
            sanction.set_revision(sanction.revision() + 1);
            let new = encode(&sanction)?;

            match self.tree.compare_and_swap(id.as_bytes(), Some(&old), Some(new))? {
                Ok(()) => return Ok((sanction, result)),
                Err(_) => debug!(sanction_id = id, attempt, "lost write race, retrying"),
            }
        }
        Err(SanctionError::Contention(id.to_string()))
    }

    /// Write every staged record atomically. Returns them with their new revisions.
    ///
    /// A record that claims a slot is refused with `ArtifactState` while the
    /// slot's current holder is still live. The check and the write share one
    /// transaction, so two concurrent starts cannot both succeed.
    pub fn commit(&self, staged: Vec<Staged>) -> SanctionResult<Vec<Sanction>> {
        let mut committed = Vec::with_capacity(staged.len());
        let mut writes = Vec::with_capacity(staged.len());
        for Staged {
            mut sanction,
            expected,
            claims_slot,
        } in staged
        {
            sanction.set_revision(expected.map_or(0, |rev| rev + 1));
            let artifact_id = sanction.core().artifact_id().to_string();
            writes.push(Write {
                id: sanction.id().to_string(),
                expected,
                bytes: encode(&sanction)?,
                slot: claims_slot
                    .then(|| (slot_key(&artifact_id, &sanction.kind().to_string()), artifact_id)),
            });
            committed.push(sanction);
        }

        (&self.tree, &self.claims)
            .transaction(|(records, claims)| {
                for write in &writes {
                    let current = match records.get(write.id.as_bytes())? {
                        Some(raw) => Some(
                            decode(&raw)
                                .map_err(ConflictableTransactionError::Abort)?
                                .revision(),
                        ),
                        None => None,
                    };
                    if current != write.expected {
                        return abort(SanctionError::Contention(write.id.clone()));
                    }
                    if let Some((key, artifact_id)) = &write.slot {
                        if let Some(holder) = live_holder(records, claims, key, &write.id)? {
                            return abort(SanctionError::ArtifactState {
                                artifact_id: artifact_id.clone(),
                                reason: format!("sanction {holder} is already in progress"),
                            });
                        }
                        claims.insert(key.as_bytes(), write.id.as_bytes())?;
                    }
                    records.insert(write.id.as_bytes(), write.bytes.clone())?;
                }
                Ok(())
            })
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => SanctionError::Storage(e),
            })?;

        Ok(committed)
    }

    pub fn scan(&self) -> impl Iterator<Item = SanctionResult<Sanction>> + '_ {
        self.tree
            .iter()
            .values()
            .map(|raw| decode(&raw?))
    }

    pub fn flush(&self) -> SanctionResult<()> {
        self.tree.flush()?;
        self.claims.flush()?;
        self.journal.tree.flush()?;
        Ok(())
    }
}

/// Side effects already performed by a hook that has not been settled yet,
/// keyed `<sanction id>/<step>`. Cleared once the sanction commits.
pub struct StepJournal {
    tree: sled::Tree,
}

impl StepJournal {
    pub fn recorded(&self, sanction_id: &str, step: &str) -> SanctionResult<Option<String>> {
        let raw = self.tree.get(step_key(sanction_id, step))?;
        Ok(raw.map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    pub fn record(&self, sanction_id: &str, step: &str, value: &str) -> SanctionResult<()> {
        self.tree
            .insert(step_key(sanction_id, step), value.as_bytes())?;
        Ok(())
    }

    pub fn clear(&self, sanction_id: &str) -> SanctionResult<usize> {
        let mut removed = 0;
        for entry in self.tree.scan_prefix(format!("{sanction_id}/")) {
            let (key, _) = entry?;
            self.tree.remove(key)?;
            removed += 1;
        }
        Ok(removed)
    }
}

fn step_key(sanction_id: &str, step: &str) -> String {
    format!("{sanction_id}/{step}")
}

/// The other sanction holding `key`, if it has been committed and is not terminal
fn live_holder(
    records: &TransactionalTree,
    claims: &TransactionalTree,
    key: &str,
    claimant: &str,
) -> Result<Option<String>, ConflictableTransactionError<SanctionError>> {
    let Some(holder) = claims.get(key.as_bytes())? else {
        return Ok(None);
    };
    let holder = String::from_utf8_lossy(&holder).into_owned();
    if holder == claimant {
        return Ok(None);
    }
    let Some(raw) = records.get(holder.as_bytes())? else {
        return Ok(None);
    };
    let live = !decode(&raw)
        .map_err(ConflictableTransactionError::Abort)?
        .state()
        .is_terminal();
    Ok(live.then_some(holder))
}

fn slot_key(artifact_id: &str, kind: &str) -> String {
    format!("{artifact_id}/{kind}")
}

fn encode(sanction: &Sanction) -> SanctionResult<Vec<u8>> {
    minicbor::to_vec(sanction).map_err(|e| SanctionError::Encode(e.to_string()))
}

fn decode(raw: &[u8]) -> SanctionResult<Sanction> {
    Ok(minicbor::decode(raw)?)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use tempfile::tempdir;

    use super::*;
    use crate::sanction::SanctionState;
    use crate::types::TimeStamp;
    use crate::variant::{Retraction, Variant};

    fn retraction(id: &str) -> Sanction {
        Sanction::new(
            id.into(),
            "reg".into(),
            Variant::Retraction(Retraction::new(None)),
            None,
            TimeStamp::new(),
            Duration::hours(48),
        )
    }

    #[test]
    fn second_live_start_on_the_same_slot_is_refused() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();
        let store = SanctionStore::open(&db, 4).unwrap();

        store.commit(vec![Staged::new_record(retraction("sanction_a"))]).unwrap();
        let err = store
            .commit(vec![Staged::new_record(retraction("sanction_b"))])
            .unwrap_err();
        assert!(matches!(err, SanctionError::ArtifactState { .. }));
        assert!(matches!(store.load("sanction_b"), Err(SanctionError::NotFound(_))));

        // a terminal holder frees the slot
        let mut first = store.load("sanction_a").unwrap();
        assert!(first.cancel_by_cascade(&TimeStamp::new()));
        store.commit(vec![Staged::existing(first)]).unwrap();
        store.commit(vec![Staged::new_record(retraction("sanction_b"))]).unwrap();
        assert_eq!(store.load("sanction_a").unwrap().state(), SanctionState::Rejected);
    }

    #[test]
    fn journal_remembers_steps_until_cleared() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();
        let store = SanctionStore::open(&db, 4).unwrap();
        let journal = store.journal();

        assert_eq!(journal.recorded("sanction_a", "materialized").unwrap(), None);
        journal.record("sanction_a", "materialized", "draft_reg1").unwrap();
        journal.record("sanction_a", "logged", "").unwrap();
        journal.record("sanction_ab", "logged", "").unwrap();

        assert_eq!(
            journal.recorded("sanction_a", "materialized").unwrap().as_deref(),
            Some("draft_reg1")
        );
        assert_eq!(journal.clear("sanction_a").unwrap(), 2);
        assert_eq!(journal.recorded("sanction_a", "logged").unwrap(), None);
        // keys are separated, so a longer id sharing the prefix is untouched
        assert!(journal.recorded("sanction_ab", "logged").unwrap().is_some());
    }
}
