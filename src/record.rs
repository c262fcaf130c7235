//! Per-record framing: `mtime | type | key | ciphertext | tag | nonce |
//! record_mac`. Seals values with the master key and MACs the whole
//! record (header, key, ciphertext, tag, and nonce) with the same key,
//! so a tampered nonce or truncated ciphertext is caught before the AEAD
//! tag is even checked.

use crate::constants::*;
use crate::crypto::{self, MasterKey, Nonce24};
use crate::error::{Result, VaultError};
use crate::format::{Slot, VaultFile};

pub struct OpenedRecord {
    pub mtime: u64,
    pub type_: u8,
    pub value: Vec<u8>,
}

fn record_aad(type_: u8, key_bytes: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + key_bytes.len());
    aad.push(type_);
    aad.extend_from_slice(key_bytes);
    aad
}

/// Builds the full on-disk bytes for a new record, ready to append to
/// the heap.
pub fn build_record(master_key: &MasterKey, type_: u8, key: &str, mtime: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
    if key.is_empty() || key.len() >= BOX_KEY_SIZE {
        return Err(VaultError::ParamErr("key length out of range".into()));
    }
    if plaintext.len() > DATA_SIZE {
        return Err(VaultError::ParamErr("value too large".into()));
    }
    let nonce: Nonce24 = crypto::random_bytes::<NONCE_SIZE>();
    let key_bytes = key.as_bytes();
    let aad = record_aad(type_, key_bytes);
    let sealed = crypto::seal(master_key, &nonce, &aad, plaintext)?; // ciphertext || tag

    let mut body = Vec::with_capacity(ENTRY_HEADER_SIZE + key_bytes.len() + sealed.len() + NONCE_SIZE);
    body.extend_from_slice(&mtime.to_le_bytes());
    body.push(type_);
    body.extend_from_slice(key_bytes);
    body.extend_from_slice(&sealed);
    body.extend_from_slice(&nonce);

    let mac = crypto::keyed_hash(master_key, &body);
    body.extend_from_slice(&mac);
    Ok(body)
}

/// Reads the whole record pointed at by `slot`.
pub fn read_raw(file: &mut VaultFile, slot: &Slot) -> Result<Vec<u8>> {
    let size = slot.record_size() as usize;
    let mut buf = vec![0u8; size];
    file.read_at(slot.file_offset as u64, &mut buf)?;
    Ok(buf)
}

/// Reads only `mtime`, `type`, and `key` — enough to rebuild the
/// `KeyIndex` without paying for the ciphertext or MAC verification.
pub fn read_key_header(file: &mut VaultFile, slot: &Slot) -> Result<(String, u64, u8)> {
    let len = ENTRY_HEADER_SIZE + slot.key_len as usize;
    let mut buf = vec![0u8; len];
    file.read_at(slot.file_offset as u64, &mut buf)?;
    let mtime = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let type_ = buf[8];
    let key = String::from_utf8(buf[ENTRY_HEADER_SIZE..].to_vec()).map_err(|_| VaultError::FileCorrupt)?;
    Ok((key, mtime, type_))
}

pub fn verify_mac(raw: &[u8], master_key: &MasterKey) -> bool {
    if raw.len() < HASH_SIZE {
        return false;
    }
    let (body, stored_mac) = raw.split_at(raw.len() - HASH_SIZE);
    let computed = crypto::keyed_hash(master_key, body);
    crypto::ct_eq(&computed, stored_mac)
}

/// Verifies the record MAC, then opens the AEAD ciphertext. Both
/// failures surface as `CryptoErr` per the error taxonomy: the system
/// does not distinguish "record MAC failed" from "AEAD tag failed" to
/// avoid a side channel richer than necessary.
pub fn open_record(file: &mut VaultFile, slot: &Slot, master_key: &MasterKey) -> Result<OpenedRecord> {
    let raw = read_raw(file, slot)?;
    if !verify_mac(&raw, master_key) {
        return Err(VaultError::CryptoErr);
    }
    let mtime = u64::from_le_bytes(raw[0..8].try_into().unwrap());
    let type_ = raw[8];
    let key_start = ENTRY_HEADER_SIZE;
    let key_end = key_start + slot.key_len as usize;
    let key_bytes = &raw[key_start..key_end];

    let sealed_start = key_end;
    let sealed_len = slot.val_len as usize + MAC_SIZE;
    let sealed_end = sealed_start + sealed_len;
    let nonce_start = sealed_end;
    let nonce: Nonce24 = raw[nonce_start..nonce_start + NONCE_SIZE].try_into().unwrap();

    let aad = record_aad(type_, key_bytes);
    let value = crypto::open(master_key, &nonce, &aad, &raw[sealed_start..sealed_end], VaultError::CryptoErr)?;
    Ok(OpenedRecord { mtime, type_, value })
}

/// Overwrites the ciphertext+tag region of a record with zeros, leaving
/// `mtime`, `type`, `key`, `nonce`, and the (now stale) `record_mac`
/// untouched. The slot's own state gates whether that stale MAC is ever
/// checked again.
pub fn tombstone_value_region(file: &mut VaultFile, slot: &Slot) -> Result<()> {
    let region_len = slot.val_len as usize + MAC_SIZE;
    let offset = slot.file_offset as u64 + ENTRY_HEADER_SIZE as u64 + slot.key_len as u64;
    file.write_at(offset, &vec![0u8; region_len])
}

/// Re-stamps `mtime` on a server-supplied record blob and recomputes its
/// MAC, after verifying the blob's existing MAC under the local master
/// key. Used by `add_encrypted`.
pub fn restamp_mtime(raw: &mut [u8], master_key: &MasterKey, new_mtime: u64) -> Result<()> {
    if !verify_mac(raw, master_key) {
        return Err(VaultError::CryptoErr);
    }
    raw[0..8].copy_from_slice(&new_mtime.to_le_bytes());
    let body_len = raw.len() - HASH_SIZE;
    let mac = crypto::keyed_hash(master_key, &raw[..body_len]);
    raw[body_len..].copy_from_slice(&mac);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Slot, VaultFile};

    fn slot_for(offset: u64, key: &str, val_len: usize) -> Slot {
        Slot { state: STATE_ACTIVE, file_offset: offset as u32, key_len: key.len() as u32, val_len: val_len as u32 }
    }

    #[test]
    fn build_and_open_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.vault");
        let mut file = VaultFile::create_new(&path).unwrap();
        let master_key: MasterKey = crypto::random_bytes();

        let body = build_record(&master_key, 1, "email", 1000, b"a@b.com").unwrap();
        let offset = file.append(&body).unwrap();
        let slot = slot_for(offset, "email", 7);

        let opened = open_record(&mut file, &slot, &master_key).unwrap();
        assert_eq!(opened.mtime, 1000);
        assert_eq!(opened.type_, 1);
        assert_eq!(opened.value, b"a@b.com");
    }

    #[test]
    fn open_record_fails_on_tampered_ciphertext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.vault");
        let mut file = VaultFile::create_new(&path).unwrap();
        let master_key: MasterKey = crypto::random_bytes();

        let body = build_record(&master_key, 1, "email", 1000, b"a@b.com").unwrap();
        let offset = file.append(&body).unwrap();
        let slot = slot_for(offset, "email", 7);

        // Flip one bit inside the ciphertext region.
        let tamper_offset = offset + ENTRY_HEADER_SIZE as u64 + "email".len() as u64;
        let mut byte = [0u8; 1];
        file.read_at(tamper_offset, &mut byte).unwrap();
        byte[0] ^= 0x01;
        file.write_at(tamper_offset, &byte).unwrap();

        let err = open_record(&mut file, &slot, &master_key).unwrap_err();
        assert!(matches!(err, VaultError::CryptoErr));
    }

    #[test]
    fn build_record_rejects_oversized_value() {
        let master_key: MasterKey = crypto::random_bytes();
        let too_big = vec![0u8; DATA_SIZE + 1];
        let err = build_record(&master_key, 0, "k", 0, &too_big).unwrap_err();
        assert!(matches!(err, VaultError::ParamErr(_)));
    }

    #[test]
    fn build_record_rejects_empty_key() {
        let master_key: MasterKey = crypto::random_bytes();
        let err = build_record(&master_key, 0, "", 0, b"v").unwrap_err();
        assert!(matches!(err, VaultError::ParamErr(_)));
    }

    #[test]
    fn tombstone_zeroes_value_region_but_keeps_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.vault");
        let mut file = VaultFile::create_new(&path).unwrap();
        let master_key: MasterKey = crypto::random_bytes();

        let body = build_record(&master_key, 2, "k", 55, b"value").unwrap();
        let offset = file.append(&body).unwrap();
        let slot = slot_for(offset, "k", 5);

        tombstone_value_region(&mut file, &slot).unwrap();

        let raw = read_raw(&mut file, &slot).unwrap();
        let region_start = ENTRY_HEADER_SIZE + "k".len();
        let region_len = 5 + MAC_SIZE;
        assert!(raw[region_start..region_start + region_len].iter().all(|&b| b == 0));
        // mtime, type, and key survive the tombstone.
        assert_eq!(u64::from_le_bytes(raw[0..8].try_into().unwrap()), 55);
        assert_eq!(raw[8], 2);
        assert_eq!(&raw[ENTRY_HEADER_SIZE..region_start], b"k");
    }

    #[test]
    fn restamp_mtime_updates_mtime_and_mac() {
        let master_key: MasterKey = crypto::random_bytes();
        let mut body = build_record(&master_key, 0, "k", 1, b"v").unwrap();
        restamp_mtime(&mut body, &master_key, 99).unwrap();
        assert_eq!(u64::from_le_bytes(body[0..8].try_into().unwrap()), 99);
        assert!(verify_mac(&body, &master_key));
    }

    #[test]
    fn restamp_mtime_fails_if_mac_already_invalid() {
        let master_key: MasterKey = crypto::random_bytes();
        let mut body = build_record(&master_key, 0, "k", 1, b"v").unwrap();
        let last = body.len() - 1;
        body[last] ^= 1;
        let err = restamp_mtime(&mut body, &master_key, 99).unwrap_err();
        assert!(matches!(err, VaultError::CryptoErr));
    }
}
