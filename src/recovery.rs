//! Password reset via two secret answers ("security questions"),
//! without the server ever seeing the plaintext master key.
//!
//! The master key is wrapped twice, once under a key derived from each
//! answer (`k1 = pw_hash(r1, S11)`, `k2 = pw_hash(r2, S21)`): `recovery
//! = seal(seal(master, n1, k1), n2, k2)`. Recovering it requires both
//! answers; the server only ever stores the doubly-sealed blob plus
//! salts and verification hashes (`dataencr1`/`dataencr2`), never `k1`,
//! `k2`, or the master itself.

use crate::constants::*;
use crate::crypto::{self, MasterKey};
use crate::error::{Result, VaultError};
use crate::format::{Header, VaultFile};
use crate::session::VaultSession;
use log::info;
use std::path::Path;

/// Everything a caller uploads to the server after a successful
/// `create_data_for_server` call.
pub struct RecoveryBundle {
    /// `nonce1 (24B) | nonce2 (24B) | outer_sealed (64B)`.
    pub recovery_blob: Vec<u8>,
    pub salt_s11: [u8; SALT_SIZE],
    pub salt_s12: [u8; SALT_SIZE],
    pub salt_s21: [u8; SALT_SIZE],
    pub salt_s22: [u8; SALT_SIZE],
    pub second_pass_salt: [u8; SALT_SIZE],
    pub server_pass: MasterKey,
    /// Values the server stores to later authenticate the two answers
    /// without ever learning them.
    pub dataencr1: MasterKey,
    pub dataencr2: MasterKey,
}

const INNER_SEALED_LEN: usize = MASTER_KEY_SIZE + MAC_SIZE;
const OUTER_SEALED_LEN: usize = INNER_SEALED_LEN + MAC_SIZE;
const BLOB_LEN: usize = NONCE_SIZE * 2 + OUTER_SEALED_LEN;

fn pack_blob(n1: &[u8; NONCE_SIZE], n2: &[u8; NONCE_SIZE], outer: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BLOB_LEN);
    out.extend_from_slice(n1);
    out.extend_from_slice(n2);
    out.extend_from_slice(outer);
    out
}

fn unpack_blob(blob: &[u8]) -> Result<([u8; NONCE_SIZE], [u8; NONCE_SIZE], &[u8])> {
    if blob.len() != BLOB_LEN {
        return Err(VaultError::ParamErr("malformed recovery blob".into()));
    }
    let mut n1 = [0u8; NONCE_SIZE];
    n1.copy_from_slice(&blob[0..NONCE_SIZE]);
    let mut n2 = [0u8; NONCE_SIZE];
    n2.copy_from_slice(&blob[NONCE_SIZE..NONCE_SIZE * 2]);
    let outer = &blob[NONCE_SIZE * 2..];
    Ok((n1, n2, outer))
}

/// Generates a fresh recovery bundle for the currently open session,
/// from the two security answers `r1`/`r2`.
pub fn create_data_for_server(
    session: &mut VaultSession,
    r1: &[u8],
    r2: &[u8],
    m_cost_kib: u32,
    t_cost: u32,
) -> Result<RecoveryBundle> {
    let salt_s11 = crypto::random_bytes::<SALT_SIZE>();
    let salt_s12 = crypto::random_bytes::<SALT_SIZE>();
    let salt_s21 = crypto::random_bytes::<SALT_SIZE>();
    let salt_s22 = crypto::random_bytes::<SALT_SIZE>();
    let second_pass_salt = crypto::random_bytes::<SALT_SIZE>();

    let k1 = crypto::pw_hash(r1, &salt_s11, m_cost_kib, t_cost)?;
    let k2 = crypto::pw_hash(r2, &salt_s21, m_cost_kib, t_cost)?;
    let dataencr1 = crypto::pw_hash(&k1, &salt_s12, m_cost_kib, t_cost)?;
    let dataencr2 = crypto::pw_hash(&k2, &salt_s22, m_cost_kib, t_cost)?;

    let (server_pass, recovery_blob) = session.with_secret_keys(|derived_key, master_key| {
        let n1 = crypto::random_bytes::<NONCE_SIZE>();
        let inner = crypto::seal(&k1, &n1, b"", master_key)?;
        let n2 = crypto::random_bytes::<NONCE_SIZE>();
        let outer = crypto::seal(&k2, &n2, b"", &inner)?;
        let blob = pack_blob(&n1, &n2, &outer);
        let server_pass = crypto::pw_hash(derived_key, &second_pass_salt, m_cost_kib, t_cost)?;
        Ok((server_pass, blob))
    })?;

    info!("generated recovery bundle for {}", session.user());
    Ok(RecoveryBundle {
        recovery_blob,
        salt_s11,
        salt_s12,
        salt_s21,
        salt_s22,
        second_pass_salt,
        server_pass,
        dataencr1,
        dataencr2,
    })
}

/// The doubly-hashed password a client sends a server for authentication
/// before it has ever downloaded a vault header (so no per-vault salt is
/// available yet — both salts here are server-chosen and public).
pub fn make_password_for_server(
    password: &[u8],
    salt_first: &[u8; SALT_SIZE],
    salt_second: &[u8; SALT_SIZE],
    m_cost_kib: u32,
    t_cost: u32,
) -> Result<MasterKey> {
    let first = crypto::pw_hash(password, salt_first, m_cost_kib, t_cost)?;
    crypto::pw_hash(&first, salt_second, m_cost_kib, t_cost)
}

/// Resets the password on a closed vault using the two recovery answers
/// instead of the old password. Returns the new header bytes and the
/// new server-authentication material for upload.
#[allow(clippy::too_many_arguments)]
pub fn update_key_from_recovery(
    dir: &Path,
    user: &str,
    r1: &[u8],
    r2: &[u8],
    recovery_blob: &[u8],
    salt_s11: &[u8; SALT_SIZE],
    salt_s21: &[u8; SALT_SIZE],
    new_password: &[u8],
    m_cost_kib: u32,
    t_cost: u32,
) -> Result<(Vec<u8>, [u8; SALT_SIZE], MasterKey)> {
    crate::session::validate_dir_len(dir)?;
    let k1 = crypto::pw_hash(r1, salt_s11, m_cost_kib, t_cost)?;
    let k2 = crypto::pw_hash(r2, salt_s21, m_cost_kib, t_cost)?;

    let (n1, n2, outer) = unpack_blob(recovery_blob)?;
    let inner = crypto::open(&k2, &n2, b"", outer, VaultError::WrongPass)?;
    let master_bytes = crypto::open(&k1, &n1, b"", &inner, VaultError::WrongPass)?;
    let mut master_key = [0u8; MASTER_KEY_SIZE];
    master_key.copy_from_slice(&master_bytes);

    let path = VaultFile::path_for(dir, user);
    let mut file = VaultFile::open_existing(&path)?;
    if !file.verify_file_mac(&master_key)? {
        return Err(VaultError::FileCorrupt);
    }
    let (header, slot_count) = file.read_header()?;

    let new_salt = crypto::random_bytes::<SALT_SIZE>();
    let new_nonce = crypto::random_bytes::<NONCE_SIZE>();
    let new_kek = crypto::pw_hash(new_password, &new_salt, m_cost_kib, t_cost)?;
    let sealed = crypto::seal(&new_kek, &new_nonce, b"", &master_key)?;
    let mut enc_master = [0u8; MASTER_KEY_SIZE + MAC_SIZE];
    enc_master.copy_from_slice(&sealed);

    let new_header =
        Header { version: header.version, salt: new_salt, enc_master, master_nonce: new_nonce, last_server_time: header.last_server_time };
    file.write_header(&new_header, slot_count)?;
    file.rewrite_file_mac(&master_key)?;

    let new_second_pass_salt = crypto::random_bytes::<SALT_SIZE>();
    let new_server_pass = crypto::pw_hash(&new_kek, &new_second_pass_salt, m_cost_kib, t_cost)?;

    info!("recovered vault password for {user} via recovery flow");
    Ok((new_header.to_field_bytes().to_vec(), new_second_pass_salt, new_server_pass))
}
