//! Per-chain-id initial state files.
//!
//! A chain that launches with a pre-registered account roster ships two
//! JSON artifacts: the roster itself and the three roots the populated
//! trees must hash to. Absence of either file is a valid no-op; a root
//! mismatch after population is fatal.

use std::path::{
    Path,
    PathBuf,
};

use eyre::{
    eyre,
    WrapErr as _,
};
use serde::Deserialize;

/// One pre-registered account: its relational row fields plus the leaves
/// it contributes to the data and nullifier trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitAccount {
    pub alias_hash: [u8; 32],
    pub account_public_key: [u8; 64],
    pub nonce: u32,
    pub note_commitments: [[u8; 32]; 2],
    pub nullifiers: Vec<[u8; 32]>,
}

/// The roots the populated trees must reproduce exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitRoots {
    pub data_root: [u8; 32],
    pub null_root: [u8; 32],
    pub roots_root: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialState {
    pub accounts: Vec<InitAccount>,
    pub roots: InitRoots,
}

#[derive(Deserialize)]
struct RawAccount {
    alias_hash: String,
    account_public_key: String,
    nonce: u32,
    note_commitments: Vec<String>,
    nullifiers: Vec<String>,
}

#[derive(Deserialize)]
struct RawRoots {
    data_root: String,
    null_root: String,
    roots_root: String,
}

/// The account roster file for `chain_id`.
#[must_use]
pub fn accounts_file(data_dir: &Path, chain_id: u64) -> PathBuf {
    data_dir.join(format!("init/chain-{chain_id}/accounts.json"))
}

/// The expected-roots file for `chain_id`.
#[must_use]
pub fn roots_file(data_dir: &Path, chain_id: u64) -> PathBuf {
    data_dir.join(format!("init/chain-{chain_id}/roots.json"))
}

/// Reads the initial state for `chain_id`, or `None` if the chain ships
/// without one.
///
/// # Errors
/// Returns an error if a present file fails to parse.
pub fn load(data_dir: &Path, chain_id: u64) -> eyre::Result<Option<InitialState>> {
    let accounts_path = accounts_file(data_dir, chain_id);
    let roots_path = roots_file(data_dir, chain_id);
    if !accounts_path.exists() || !roots_path.exists() {
        return Ok(None);
    }

    let accounts_json = std::fs::read_to_string(&accounts_path)
        .wrap_err_with(|| format!("failed reading {}", accounts_path.display()))?;
    let raw_accounts: Vec<RawAccount> = serde_json::from_str(&accounts_json)
        .wrap_err_with(|| format!("failed parsing {}", accounts_path.display()))?;
    let accounts = raw_accounts
        .into_iter()
        .map(parse_account)
        .collect::<eyre::Result<Vec<_>>>()
        .wrap_err("bad account record in init file")?;

    let roots_json = std::fs::read_to_string(&roots_path)
        .wrap_err_with(|| format!("failed reading {}", roots_path.display()))?;
    let raw_roots: RawRoots = serde_json::from_str(&roots_json)
        .wrap_err_with(|| format!("failed parsing {}", roots_path.display()))?;

    Ok(Some(InitialState {
        accounts,
        roots: InitRoots {
            data_root: word_from_hex(&raw_roots.data_root)?,
            null_root: word_from_hex(&raw_roots.null_root)?,
            roots_root: word_from_hex(&raw_roots.roots_root)?,
        },
    }))
}

fn parse_account(raw: RawAccount) -> eyre::Result<InitAccount> {
    let [first, second] = raw.note_commitments.as_slice() else {
        return Err(eyre!(
            "account must carry exactly two note commitments, got {}",
            raw.note_commitments.len(),
        ));
    };
    Ok(InitAccount {
        alias_hash: word_from_hex(&raw.alias_hash)?,
        account_public_key: key_from_hex(&raw.account_public_key)?,
        nonce: raw.nonce,
        note_commitments: [word_from_hex(first)?, word_from_hex(second)?],
        nullifiers: raw
            .nullifiers
            .iter()
            .map(|hex| word_from_hex(hex))
            .collect::<eyre::Result<Vec<_>>>()?,
    })
}

fn word_from_hex(hex: &str) -> eyre::Result<[u8; 32]> {
    let bytes = hex::decode(hex).wrap_err_with(|| format!("bad hex field `{hex}`"))?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| eyre!("expected 32 bytes, got {}", bytes.len()))
}

fn key_from_hex(hex: &str) -> eyre::Result<[u8; 64]> {
    let bytes = hex::decode(hex).wrap_err_with(|| format!("bad hex field `{hex}`"))?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| eyre!("expected 64 bytes, got {}", bytes.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_files(dir: &Path, chain_id: u64, accounts: &str, roots: &str) {
        let base = dir.join(format!("init/chain-{chain_id}"));
        std::fs::create_dir_all(&base).unwrap();
        std::fs::write(base.join("accounts.json"), accounts).unwrap();
        std::fs::write(base.join("roots.json"), roots).unwrap();
    }

    #[test]
    fn missing_files_are_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(None, load(dir.path(), 1).unwrap());
    }

    #[test]
    fn files_parse_into_typed_records() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = format!(
            r#"[{{
                "alias_hash": "{}",
                "account_public_key": "{}",
                "nonce": 1,
                "note_commitments": ["{}", "{}"],
                "nullifiers": ["{}"]
            }}]"#,
            "11".repeat(32),
            "22".repeat(64),
            "33".repeat(32),
            "44".repeat(32),
            "55".repeat(32),
        );
        let roots = format!(
            r#"{{"data_root": "{}", "null_root": "{}", "roots_root": "{}"}}"#,
            "aa".repeat(32),
            "bb".repeat(32),
            "cc".repeat(32),
        );
        write_files(dir.path(), 7, &accounts, &roots);

        let state = load(dir.path(), 7).unwrap().unwrap();
        assert_eq!(1, state.accounts.len());
        assert_eq!([0x11; 32], state.accounts[0].alias_hash);
        assert_eq!([0x22; 64], state.accounts[0].account_public_key);
        assert_eq!([[0x33; 32], [0x44; 32]], state.accounts[0].note_commitments);
        assert_eq!([0xaa; 32], state.roots.data_root);
        assert_eq!(None, load(dir.path(), 8).unwrap(), "other chain ids stay empty");
    }

    #[test]
    fn malformed_hex_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_files(
            dir.path(),
            1,
            r#"[{"alias_hash": "zz", "account_public_key": "00", "nonce": 0,
                "note_commitments": ["00", "00"], "nullifiers": []}]"#,
            r#"{"data_root": "00", "null_root": "00", "roots_root": "00"}"#,
        );
        assert!(load(dir.path(), 1).is_err());
    }
}
