//! Approval and rejection capability tokens.
//!
//! A token is `hex(nonce) || hex(mac)`. The MAC is HMAC-SHA256 over the
//! length-prefixed sanction id, authorizer id, action kind and nonce, so a
//! token presented for the wrong authorizer, sanction or action fails
//! verification without touching storage. The action kind only lives inside
//! the MAC, the string itself does not reveal it.
use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 16;
const MAC_LEN: usize = 32;
pub const MIN_SECRET_LEN: usize = 32;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    #[n(0)]
    Approval,
    #[n(1)]
    Rejection,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Approval => "approve",
            TokenKind::Rejection => "reject",
        }
    }
}

#[derive(Clone)]
pub struct TokenIssuer {
    mac: HmacSha256,
}

impl TokenIssuer {
    pub fn new(secret: &[u8]) -> anyhow::Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            anyhow::bail!(
                "token secret must be at least {MIN_SECRET_LEN} bytes, got {}",
                secret.len()
            );
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|_| anyhow::anyhow!("token secret rejected by HMAC"))?;

        Ok(Self { mac })
    }

    /// Mint a fresh token. Two calls never return the same string.
    pub fn mint(&self, sanction_id: &str, authorizer: &str, kind: TokenKind) -> String {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let sig = self
            .keyed(sanction_id, authorizer, kind, &nonce)
            .finalize()
            .into_bytes();

        format!("{}{}", hex::encode(nonce), hex::encode(sig))
    }

    /// Authenticity check only; whether the token is the one on record is the ledger's call.
    pub fn verify(
        &self,
        token: &str,
        sanction_id: &str,
        authorizer: &str,
        kind: TokenKind,
    ) -> bool {
        if token.len() != 2 * (NONCE_LEN + MAC_LEN) {
            return false;
        }
        let Ok(raw) = hex::decode(token) else {
            return false;
        };
        let (nonce, sig) = raw.split_at(NONCE_LEN);

        self.keyed(sanction_id, authorizer, kind, nonce)
            .verify_slice(sig)
            .is_ok()
    }

    fn keyed(
        &self,
        sanction_id: &str,
        authorizer: &str,
        kind: TokenKind,
        nonce: &[u8],
    ) -> HmacSha256 {
        let mut mac = self.mac.clone();
        for field in [
            sanction_id.as_bytes(),
            authorizer.as_bytes(),
            kind.as_str().as_bytes(),
            nonce,
        ] {
            mac.update(&(field.len() as u64).to_be_bytes());
            mac.update(field);
        }
        mac
    }
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer").finish_non_exhaustive()
    }
}

// compare without early exit so timing does not reveal the matching prefix
pub(crate) fn tokens_match(expected: &str, presented: &str) -> bool {
    expected.len() == presented.len()
        && expected
            .bytes()
            .zip(presented.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
