//! The append/tombstone/compact lifecycle over the slot table and heap.
//! `SessionEngine` never touches slots or the heap directly; everything
//! mutating goes through here so the file MAC is always recomputed as
//! the last step of a write.

use crate::constants::*;
use crate::crypto::MasterKey;
use crate::error::{Result, VaultError};
use crate::format::{Header, Slot, VaultFile};
use crate::index::{IndexEntry, KeyIndex};
use crate::record;
use log::{debug, info, warn};

/// Scans for the first `UNUSED` slot and appends a freshly sealed
/// record there. Returns `NoSpace` if the table has no free slot left;
/// callers are expected to compact and retry, never to surface
/// `NoSpace` to their own caller.
pub fn append(
    file: &mut VaultFile,
    index: &mut KeyIndex,
    master_key: &MasterKey,
    slot_count: u32,
    type_: u8,
    key: &str,
    mtime: u64,
    plaintext: &[u8],
) -> Result<()> {
    let mut target = None;
    for i in 0..slot_count {
        let slot = file.read_slot(i)?;
        if slot.is_unused() {
            target = Some(i);
            break;
        }
    }
    let slot_idx = match target {
        Some(i) => i,
        None => {
            debug!("append: slot table full at {slot_count} slots");
            return Err(VaultError::NoSpace);
        }
    };

    let body = record::build_record(master_key, type_, key, mtime, plaintext)?;
    let offset = file.append(&body)?;
    let offset: u32 = offset.try_into().map_err(|_| VaultError::FileCorrupt)?;

    let slot = Slot {
        state: STATE_ACTIVE,
        file_offset: offset,
        key_len: key.len() as u32,
        val_len: plaintext.len() as u32,
    };
    file.write_slot(slot_idx, &slot)?;
    file.rewrite_file_mac(master_key)?;
    index.insert(key.to_string(), IndexEntry { slot_index: slot_idx, mtime, type_ });
    debug!("append: wrote key into slot {slot_idx}");
    Ok(())
}

/// Tombstones the slot for `key`: flips its state to `DELETED`, zeroes
/// the ciphertext+tag region, and drops it from the index. The record's
/// `mtime`/`type`/`key`/`nonce`/stale `record_mac` are left untouched —
/// nothing but the slot state gates whether they are ever read again.
pub fn delete(file: &mut VaultFile, index: &mut KeyIndex, master_key: &MasterKey, key: &str) -> Result<()> {
    let entry = *index.get(key).ok_or_else(|| VaultError::ParamErr(format!("no such key: {key}")))?;
    let mut slot = file.read_slot(entry.slot_index)?;
    slot.state = STATE_DELETED;
    file.write_slot(entry.slot_index, &slot)?;
    record::tombstone_value_region(file, &slot)?;
    file.rewrite_file_mac(master_key)?;
    index.remove(key);
    debug!("delete: tombstoned slot {}", entry.slot_index);
    Ok(())
}

/// Doubles the slot table, repacks every `ACTIVE` record contiguously
/// into a fresh heap, drops tombstones and unused slots, truncates the
/// file to its new exact size, and rebuilds the file MAC. Returns the
/// new slot count and a freshly built `KeyIndex`.
pub fn compact(file: &mut VaultFile, master_key: &MasterKey, old_slot_count: u32) -> Result<(u32, KeyIndex)> {
    let (header, _) = file.read_header()?;

    let mut live: Vec<(Slot, String, u64, u8, Vec<u8>)> = Vec::new();
    for i in 0..old_slot_count {
        let slot = file.read_slot(i)?;
        if slot.is_unused() {
            break;
        }
        if !slot.is_active() {
            continue;
        }
        let raw = record::read_raw(file, &slot)?;
        let (key, mtime, type_) = record::read_key_header(file, &slot)?;
        live.push((slot, key, mtime, type_, raw));
    }

    let new_slot_count = old_slot_count.saturating_mul(2);
    let new_table_end = VaultFile::slot_table_end(new_slot_count);

    let mut heap = Vec::new();
    let mut new_slots = Vec::with_capacity(new_slot_count as usize);
    let mut index = KeyIndex::with_capacity(new_slot_count);
    for (old_slot, key, mtime, type_, raw) in &live {
        let offset = new_table_end + heap.len() as u64;
        let slot_idx = new_slots.len() as u32;
        heap.extend_from_slice(raw);
        new_slots.push(Slot {
            state: STATE_ACTIVE,
            file_offset: offset as u32,
            key_len: old_slot.key_len,
            val_len: old_slot.val_len,
        });
        index.insert(key.clone(), IndexEntry { slot_index: slot_idx, mtime: *mtime, type_: *type_ });
    }
    for _ in live.len()..new_slot_count as usize {
        new_slots.push(Slot::unused());
    }

    file.write_header(&header, new_slot_count)?;
    for (i, slot) in new_slots.iter().enumerate() {
        file.write_slot(i as u32, slot)?;
    }
    file.write_at(new_table_end, &heap)?;
    file.truncate(new_table_end + heap.len() as u64 + HASH_SIZE as u64)?;
    file.rewrite_file_mac(master_key)?;

    info!(
        "compact: {old_slot_count} -> {new_slot_count} slots, {} live entries",
        live.len()
    );
    Ok((new_slot_count, index))
}

/// Re-stamps and appends a server-supplied record blob directly,
/// bypassing `build_record` (the blob is already sealed and MACed by
/// whichever peer produced it — this just re-homes it under a new
/// `mtime`).
pub fn append_encrypted(
    file: &mut VaultFile,
    index: &mut KeyIndex,
    master_key: &MasterKey,
    slot_count: u32,
    key: &str,
    key_len: usize,
    val_len: usize,
    type_: u8,
    mtime: u64,
    mut blob: Vec<u8>,
) -> Result<()> {
    record::restamp_mtime(&mut blob, master_key, mtime)?;

    let mut target = None;
    for i in 0..slot_count {
        let slot = file.read_slot(i)?;
        if slot.is_unused() {
            target = Some(i);
            break;
        }
    }
    let slot_idx = target.ok_or_else(|| {
        warn!("append_encrypted: slot table full");
        VaultError::NoSpace
    })?;

    let offset = file.append(&blob)?;
    let offset: u32 = offset.try_into().map_err(|_| VaultError::FileCorrupt)?;
    let slot = Slot {
        state: STATE_ACTIVE,
        file_offset: offset,
        key_len: key_len as u32,
        val_len: val_len as u32,
    };
    file.write_slot(slot_idx, &slot)?;
    file.rewrite_file_mac(master_key)?;
    index.insert(key.to_string(), IndexEntry { slot_index: slot_idx, mtime, type_ });
    Ok(())
}

pub fn write_initial_file(path: &std::path::Path, header: &Header) -> Result<VaultFile> {
    let mut file = VaultFile::create_new(path)?;
    file.write_header(header, INITIAL_SIZE)?;
    for i in 0..INITIAL_SIZE {
        file.write_slot(i, &Slot::unused())?;
    }
    Ok(file)
}
