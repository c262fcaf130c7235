//! Byte-exact reader/writer for the fixed binary vault layout. All
//! multi-byte integers are little-endian. See §6 of the design notes for
//! the authoritative offset table; this module is its sole translation
//! into Rust types.

use crate::constants::*;
use crate::error::{Result, VaultError};
use fs4::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// The 108-byte header prefix (header fields + `slot_count`), decoded
/// into fields. `enc_master` is the wrapped master key: 32 ciphertext
/// bytes followed by a 16-byte AEAD tag.
#[derive(Debug, Clone)]
pub struct Header {
    pub version: u8,
    pub salt: [u8; SALT_SIZE],
    pub enc_master: [u8; MASTER_KEY_SIZE + MAC_SIZE],
    pub master_nonce: [u8; NONCE_SIZE],
    pub last_server_time: u64,
}

impl Header {
    /// Bytes `[0, 104)` — the "header-for-server" the sync protocol
    /// uploads and re-downloads.
    pub fn to_field_bytes(&self) -> [u8; HEADER_FIELDS_LEN] {
        let mut buf = [0u8; HEADER_FIELDS_LEN];
        buf[0] = self.version;
        buf[8..24].copy_from_slice(&self.salt);
        buf[24..72].copy_from_slice(&self.enc_master);
        buf[72..96].copy_from_slice(&self.master_nonce);
        buf[96..104].copy_from_slice(&self.last_server_time.to_le_bytes());
        buf
    }

    pub fn from_field_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_FIELDS_LEN {
            return Err(VaultError::FileCorrupt);
        }
        let version = buf[0];
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&buf[8..24]);
        let mut enc_master = [0u8; MASTER_KEY_SIZE + MAC_SIZE];
        enc_master.copy_from_slice(&buf[24..72]);
        let mut master_nonce = [0u8; NONCE_SIZE];
        master_nonce.copy_from_slice(&buf[72..96]);
        let last_server_time = u64::from_le_bytes(buf[96..104].try_into().unwrap());
        Ok(Self { version, salt, enc_master, master_nonce, last_server_time })
    }
}

/// A 16-byte slot-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub state: u32,
    pub file_offset: u32,
    pub key_len: u32,
    pub val_len: u32,
}

impl Slot {
    pub const SIZE: usize = LOC_SIZE;

    pub fn unused() -> Self {
        Self { state: STATE_UNUSED, file_offset: 0, key_len: 0, val_len: 0 }
    }

    pub fn is_active(&self) -> bool {
        self.state == STATE_ACTIVE
    }

    pub fn is_deleted(&self) -> bool {
        self.state == STATE_DELETED
    }

    pub fn is_unused(&self) -> bool {
        self.state == STATE_UNUSED
    }

    /// Total on-disk size of the record this slot points at.
    pub fn record_size(&self) -> u64 {
        ENTRY_HEADER_SIZE as u64
            + self.key_len as u64
            + self.val_len as u64
            + MAC_SIZE as u64
            + NONCE_SIZE as u64
            + HASH_SIZE as u64
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.state.to_le_bytes());
        buf[4..8].copy_from_slice(&self.file_offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.key_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.val_len.to_le_bytes());
        buf
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        Self {
            state: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            file_offset: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            key_len: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            val_len: u32::from_le_bytes(b[12..16].try_into().unwrap()),
        }
    }
}

/// Owns the vault's open file handle and offers raw, offset-addressed
/// I/O. Holds the cross-process exclusive advisory lock for its whole
/// lifetime; releasing it (via `Drop` or an explicit `unlock`) is the
/// only way a second session on the same path can succeed.
pub struct VaultFile {
    file: File,
    path: PathBuf,
    locked: bool,
}

fn vault_path(dir: &Path, user: &str) -> PathBuf {
    dir.join(format!("{user}.vault"))
}

impl VaultFile {
    pub fn path_for(dir: &Path, user: &str) -> PathBuf {
        vault_path(dir, user)
    }

    fn open_with(path: &Path, opts: &mut OpenOptions) -> Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
            opts.custom_flags(libc::O_DSYNC);
        }
        let file = opts.open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => VaultError::Access,
            std::io::ErrorKind::PermissionDenied => VaultError::Access,
            _ => VaultError::IoErr(e),
        })?;
        file.try_lock_exclusive().map_err(|_| VaultError::Syscall("vault file is already locked".into()))?;
        Ok(Self { file, path: path.to_path_buf(), locked: true })
    }

    /// Creates a new vault file; fails if one already exists at `path`.
    pub fn create_new(path: &Path) -> Result<Self> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create_new(true);
        Self::open_with(path, &mut opts).map_err(|e| match e {
            VaultError::IoErr(ref io) if io.kind() == std::io::ErrorKind::AlreadyExists => VaultError::Exist,
            other => other,
        })
    }

    /// Opens an existing vault file; fails if it is missing.
    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(VaultError::Access);
        }
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        Self::open_with(path, &mut opts)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.sync()?;
        Ok(())
    }

    /// Appends at end-of-file and returns the offset it was written at.
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)?;
        self.sync()?;
        Ok(offset)
    }

    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.sync()?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        // O_DSYNC already forces data-synchronous writes where supported;
        // sync_data() is the portable fallback for platforms that don't
        // honor the flag (or don't have it, see `custom_flags` above).
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read_header(&mut self) -> Result<(Header, u32)> {
        let mut buf = [0u8; HEADER_SIZE];
        self.read_at(0, &mut buf)?;
        let header = Header::from_field_bytes(&buf[..HEADER_FIELDS_LEN])?;
        let slot_count = u32::from_le_bytes(buf[HEADER_FIELDS_LEN..HEADER_SIZE].try_into().unwrap());
        Ok((header, slot_count))
    }

    pub fn write_header(&mut self, header: &Header, slot_count: u32) -> Result<()> {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..HEADER_FIELDS_LEN].copy_from_slice(&header.to_field_bytes());
        buf[HEADER_FIELDS_LEN..].copy_from_slice(&slot_count.to_le_bytes());
        self.write_at(0, &buf)
    }

    pub fn read_slot(&mut self, index: u32) -> Result<Slot> {
        let mut buf = [0u8; Slot::SIZE];
        self.read_at(HEADER_SIZE as u64 + index as u64 * Slot::SIZE as u64, &mut buf)?;
        Ok(Slot::from_bytes(&buf))
    }

    pub fn write_slot(&mut self, index: u32, slot: &Slot) -> Result<()> {
        self.write_at(HEADER_SIZE as u64 + index as u64 * Slot::SIZE as u64, &slot.to_bytes())
    }

    pub fn slot_table_end(slot_count: u32) -> u64 {
        HEADER_SIZE as u64 + slot_count as u64 * Slot::SIZE as u64
    }

    /// Recomputes the file MAC over `file[0..len-32]` and appends/
    /// overwrites the trailing 32 bytes, keyed with the master key.
    pub fn rewrite_file_mac(&mut self, master_key: &crate::crypto::MasterKey) -> Result<()> {
        let total_len = self.len()?;
        let body_len = total_len.saturating_sub(HASH_SIZE as u64);
        let mut hasher = crate::crypto::StreamingHash::new(master_key);
        let mut buf = vec![0u8; 64 * 1024];
        let mut remaining = body_len;
        let mut offset = 0u64;
        self.file.seek(SeekFrom::Start(0))?;
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            self.file.read_exact(&mut buf[..chunk])?;
            hasher.update(&buf[..chunk]);
            remaining -= chunk as u64;
            offset += chunk as u64;
        }
        let _ = offset;
        let mac = hasher.finalize();
        self.write_at(body_len, &mac)
    }

    /// Verifies the trailing file MAC against a freshly recomputed one.
    pub fn verify_file_mac(&mut self, master_key: &crate::crypto::MasterKey) -> Result<bool> {
        let total_len = self.len()?;
        if total_len < HASH_SIZE as u64 {
            return Err(VaultError::FileCorrupt);
        }
        let body_len = total_len - HASH_SIZE as u64;
        let mut hasher = crate::crypto::StreamingHash::new(master_key);
        let mut buf = vec![0u8; 64 * 1024];
        let mut remaining = body_len;
        self.file.seek(SeekFrom::Start(0))?;
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            self.file.read_exact(&mut buf[..chunk])?;
            hasher.update(&buf[..chunk]);
            remaining -= chunk as u64;
        }
        let mut stored = [0u8; HASH_SIZE];
        self.read_at(body_len, &mut stored)?;
        Ok(crate::crypto::ct_eq(&hasher.finalize(), &stored))
    }

    pub fn unlock_file(&mut self) {
        if self.locked {
            let _ = fs4::FileExt::unlock(&self.file);
            self.locked = false;
        }
    }
}

impl Drop for VaultFile {
    fn drop(&mut self) {
        self.unlock_file();
    }
}
