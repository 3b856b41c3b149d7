//! Property-based tests for the approval policy
//!
//! These drive a `Sanction` directly, without storage, through randomly
//! ordered decision sequences and check the invariants that must hold for
//! every ordering: unanimity, first-approval-wins and reject-wins.

use chrono::Duration;
use proptest::prelude::*;
use sanction_approval::collaborators::Permissions;
use sanction_approval::sanction::{Sanction, SanctionState, Transition};
use sanction_approval::types::TimeStamp;
use sanction_approval::variant::{
    DraftRegistrationApproval, RegistrationApproval, RegistrationChoice, Variant,
};
use sanction_approval::{SanctionError, TokenIssuer, TokenKind};

struct Everyone;

impl Permissions for Everyone {
    fn is_artifact_admin(&self, _user: &str, _artifact: &str) -> bool {
        true
    }
    fn is_administrator(&self, user: &str) -> bool {
        user.starts_with("admin")
    }
}

fn issuer() -> TokenIssuer {
    TokenIssuer::new(&[42u8; 32]).unwrap()
}

fn unanimous_with(n: usize, issuer: &TokenIssuer) -> (Sanction, Vec<String>) {
    let mut sanction = Sanction::new(
        "sanction_prop".into(),
        "reg".into(),
        Variant::RegistrationApproval(RegistrationApproval::new()),
        None,
        TimeStamp::new(),
        Duration::hours(48),
    );
    let users: Vec<String> = (0..n).map(|i| format!("user{i}")).collect();
    for user in &users {
        assert!(sanction.add_authorizer(user, "reg", issuer, &Everyone));
    }
    (sanction, users)
}

fn approve(
    sanction: &mut Sanction,
    who: &str,
    issuer: &TokenIssuer,
) -> Result<Transition, SanctionError> {
    let token = sanction.token_for(who, TokenKind::Approval)?.to_string();
    sanction.approve(who, &token, issuer)
}

/// Strategy for an authorizer count together with a random approval order
fn order_strategy() -> impl Strategy<Value = (usize, Vec<usize>)> {
    (1usize..=7).prop_flat_map(|n| (Just(n), Just((0..n).collect::<Vec<_>>()).prop_shuffle()))
}

#[derive(Debug, Clone, Copy)]
enum Decision {
    Approve,
    Reject,
}

fn decision_strategy() -> impl Strategy<Value = Decision> {
    prop_oneof![Just(Decision::Approve), Just(Decision::Reject)]
}

proptest! {
    /// State flips to approved on exactly the Nth distinct approval, whatever the order
    #[test]
    fn unanimous_approves_on_last_distinct_authorizer((n, order) in order_strategy()) {
        let issuer = issuer();
        let (mut sanction, users) = unanimous_with(n, &issuer);

        for (step, idx) in order.iter().enumerate() {
            let transition = approve(&mut sanction, &users[*idx], &issuer).unwrap();
            if step + 1 < n {
                prop_assert_eq!(transition, Transition::Pending);
                prop_assert_eq!(sanction.state(), SanctionState::Unapproved);
            } else {
                prop_assert_eq!(transition, Transition::Approved);
                prop_assert_eq!(sanction.state(), SanctionState::Approved);
            }
        }
    }

    /// Re-presenting your own approval while others are pending changes nothing
    #[test]
    fn repeated_approval_is_not_counted_twice(n in 2usize..=6, repeats in 1usize..4) {
        let issuer = issuer();
        let (mut sanction, users) = unanimous_with(n, &issuer);

        for _ in 0..repeats {
            let transition = approve(&mut sanction, &users[0], &issuer).unwrap();
            prop_assert_eq!(transition, Transition::Pending);
        }
        prop_assert_eq!(sanction.ledger().approved_count(), 1);
        prop_assert_eq!(sanction.state(), SanctionState::Unapproved);
    }

    /// A single rejection anywhere in the sequence wins over any number of approvals
    #[test]
    fn rejection_wins_over_pending_approvals(
        decisions in prop::collection::vec(decision_strategy(), 2..8)
    ) {
        let issuer = issuer();
        let (mut sanction, users) = unanimous_with(decisions.len(), &issuer);
        let first_reject = decisions.iter().position(|d| matches!(d, Decision::Reject));

        for (i, decision) in decisions.iter().enumerate() {
            let who = &users[i];
            let result = match decision {
                Decision::Approve => approve(&mut sanction, who, &issuer),
                Decision::Reject => {
                    let token = sanction.token_for(who, TokenKind::Rejection).unwrap().to_string();
                    sanction.reject(who, &token, &issuer)
                }
            };
            match first_reject {
                Some(at) if i > at => {
                    let is_invalid_state = matches!(result, Err(SanctionError::InvalidState { .. }));
                    prop_assert!(is_invalid_state);
                }
                _ => prop_assert!(result.is_ok()),
            }
        }

        match first_reject {
            Some(_) => prop_assert_eq!(sanction.state(), SanctionState::Rejected),
            None => prop_assert_eq!(sanction.state(), SanctionState::Approved),
        }
    }

    /// In ANY mode the first decision settles it and every later one is refused
    #[test]
    fn any_mode_first_decision_wins(
        decisions in prop::collection::vec((0usize..4, decision_strategy()), 1..6)
    ) {
        let perms = Everyone;
        let mut sanction = Sanction::new(
            "sanction_draft".into(),
            "draft".into(),
            Variant::DraftRegistrationApproval(DraftRegistrationApproval::new(
                RegistrationChoice::Immediate,
            )),
            None,
            TimeStamp::new(),
            Duration::hours(48),
        );

        for (i, (admin, decision)) in decisions.iter().enumerate() {
            let actor = format!("admin{admin}");
            let result = match decision {
                Decision::Approve => sanction.approve_by_authority(&actor, &perms),
                Decision::Reject => sanction.reject_by_authority(&actor, &perms),
            };
            if i == 0 {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(
                    matches!(result, Err(SanctionError::InvalidState { .. })),
                    "decision {} was accepted",
                    i
                );
            }
        }

        let expected = match decisions[0].1 {
            Decision::Approve => SanctionState::Approved,
            Decision::Reject => SanctionState::Rejected,
        };
        prop_assert_eq!(sanction.state(), expected);
    }

    /// A token only ever authenticates for the authorizer and action it was minted for
    #[test]
    fn tokens_do_not_transfer(n in 2usize..=5, from in 0usize..5, to in 0usize..5) {
        prop_assume!(from < n && to < n && from != to);
        let issuer = issuer();
        let (mut sanction, users) = unanimous_with(n, &issuer);

        let stolen = sanction.token_for(&users[from], TokenKind::Approval).unwrap().to_string();
        let err = sanction.approve(&users[to], &stolen, &issuer).unwrap_err();
        let is_invalid_token = matches!(err, SanctionError::InvalidApprovalToken { .. });
        prop_assert!(is_invalid_token);

        let own_reject = sanction.token_for(&users[to], TokenKind::Rejection).unwrap().to_string();
        let err = sanction.approve(&users[to], &own_reject, &issuer).unwrap_err();
        let is_invalid_token = matches!(err, SanctionError::InvalidApprovalToken { .. });
        prop_assert!(is_invalid_token);
        prop_assert_eq!(sanction.ledger().approved_count(), 0);
    }
}
