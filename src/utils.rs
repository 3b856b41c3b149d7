//! Utility functions for identifiers

use bech32::Bech32m;
use uuid7::uuid7;

pub const SANCTION_HRP: &str = "sanction_";

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Mint a fresh sanction id
pub fn new_sanction_id() -> anyhow::Result<String> {
    new_uuid_to_bech32(SANCTION_HRP)
}
