//! `VaultSession`: the public engine. Owns the file handle, the guarded
//! secret region (KEK scratch space, decrypted master key, and the
//! single-slot `HotBox`), and the `KeyIndex`. Every public method here
//! unlocks the secret region on entry and relocks it on every return
//! path via an RAII guard, so an early `?` can never leak an unlocked
//! session.

use crate::alloc;
use crate::constants::*;
use crate::crypto::{self, MasterKey};
use crate::error::{Result, VaultError};
use crate::format::{Header, VaultFile};
use crate::index::KeyIndex;
use crate::record;
use crate::secret_mem::{disable_core_dumps, SecretMem};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

const DERIVED_KEY_OFF: usize = 0;
const MASTER_KEY_OFF: usize = DERIVED_KEY_OFF + MASTER_KEY_SIZE;
const HOTBOX_KEY_OFF: usize = MASTER_KEY_OFF + MASTER_KEY_SIZE;
const HOTBOX_VALUE_OFF: usize = HOTBOX_KEY_OFF + BOX_KEY_SIZE;
const HOTBOX_TYPE_OFF: usize = HOTBOX_VALUE_OFF + DATA_SIZE;
const HOTBOX_KEYLEN_OFF: usize = HOTBOX_TYPE_OFF + 1;
const HOTBOX_VALLEN_OFF: usize = HOTBOX_KEYLEN_OFF + 4;
const SECRET_REGION_SIZE: usize = HOTBOX_VALLEN_OFF + 4;

/// Guard returned by unlocking the session's `SecretMem`. Relocks on
/// drop, covering every return path (including `?`) of the caller.
struct Unlocked<'a> {
    secret: &'a mut SecretMem,
}

impl<'a> Unlocked<'a> {
    fn new(secret: &'a mut SecretMem) -> Result<Self> {
        secret.unlock()?;
        Ok(Self { secret })
    }

    fn bytes(&mut self) -> &mut [u8] {
        unsafe { self.secret.as_mut_slice() }
    }

    fn master_key(&mut self) -> MasterKey {
        let mut out = [0u8; MASTER_KEY_SIZE];
        out.copy_from_slice(&self.bytes()[MASTER_KEY_OFF..MASTER_KEY_OFF + MASTER_KEY_SIZE]);
        out
    }

    fn set_master_key(&mut self, key: &MasterKey) {
        self.bytes()[MASTER_KEY_OFF..MASTER_KEY_OFF + MASTER_KEY_SIZE].copy_from_slice(key);
    }

    fn derived_key(&mut self) -> MasterKey {
        let mut out = [0u8; MASTER_KEY_SIZE];
        out.copy_from_slice(&self.bytes()[DERIVED_KEY_OFF..DERIVED_KEY_OFF + MASTER_KEY_SIZE]);
        out
    }

    fn set_derived_key(&mut self, key: &MasterKey) {
        self.bytes()[DERIVED_KEY_OFF..DERIVED_KEY_OFF + MASTER_KEY_SIZE].copy_from_slice(key);
    }

    fn hotbox_key_len(&mut self) -> usize {
        u32::from_le_bytes(self.bytes()[HOTBOX_KEYLEN_OFF..HOTBOX_KEYLEN_OFF + 4].try_into().unwrap()) as usize
    }

    fn hotbox_key(&mut self) -> Option<String> {
        let len = self.hotbox_key_len();
        if len == 0 {
            return None;
        }
        String::from_utf8(self.bytes()[HOTBOX_KEY_OFF..HOTBOX_KEY_OFF + len].to_vec()).ok()
    }

    fn hotbox_set(&mut self, key: &str, type_: u8, value: &[u8]) {
        let b = self.bytes();
        b[HOTBOX_KEY_OFF..HOTBOX_KEY_OFF + key.len()].copy_from_slice(key.as_bytes());
        b[HOTBOX_VALUE_OFF..HOTBOX_VALUE_OFF + value.len()].copy_from_slice(value);
        b[HOTBOX_TYPE_OFF] = type_;
        b[HOTBOX_KEYLEN_OFF..HOTBOX_KEYLEN_OFF + 4].copy_from_slice(&(key.len() as u32).to_le_bytes());
        b[HOTBOX_VALLEN_OFF..HOTBOX_VALLEN_OFF + 4].copy_from_slice(&(value.len() as u32).to_le_bytes());
    }

    fn hotbox_clear(&mut self) {
        let b = self.bytes();
        b[HOTBOX_KEYLEN_OFF..HOTBOX_KEYLEN_OFF + 4].copy_from_slice(&0u32.to_le_bytes());
        b[HOTBOX_VALLEN_OFF..HOTBOX_VALLEN_OFF + 4].copy_from_slice(&0u32.to_le_bytes());
    }

    fn hotbox_value(&mut self) -> (Vec<u8>, u8) {
        let val_len = u32::from_le_bytes(self.bytes()[HOTBOX_VALLEN_OFF..HOTBOX_VALLEN_OFF + 4].try_into().unwrap())
            as usize;
        let type_ = self.bytes()[HOTBOX_TYPE_OFF];
        let value = self.bytes()[HOTBOX_VALUE_OFF..HOTBOX_VALUE_OFF + val_len].to_vec();
        (value, type_)
    }
}

impl<'a> Drop for Unlocked<'a> {
    fn drop(&mut self) {
        if let Err(e) = self.secret.lock() {
            warn!("failed to relock session secret memory: {e}");
        }
    }
}

fn validate_user(user: &str) -> Result<()> {
    if user.is_empty() || user.len() >= MAX_USER_SIZE {
        return Err(VaultError::ParamErr("user name length out of range".into()));
    }
    Ok(())
}

fn validate_password(password: &[u8]) -> Result<()> {
    if password.is_empty() || password.len() >= MAX_PASS_SIZE {
        return Err(VaultError::ParamErr("password length out of range".into()));
    }
    Ok(())
}

pub(crate) fn validate_dir_len(dir: &Path) -> Result<()> {
    if dir.as_os_str().len() >= MAX_PATH_LEN {
        return Err(VaultError::ParamErr("directory path too long".into()));
    }
    Ok(())
}

/// The at-most-one-open session handle. Not `Sync`: callers needing
/// concurrent access must serialize externally.
pub struct VaultSession {
    file: Option<VaultFile>,
    secret: SecretMem,
    index: KeyIndex,
    slot_count: u32,
    dir: PathBuf,
    user: String,
}

impl VaultSession {
    /// Allocates the guarded secret region and disables core dumps for
    /// the process. Does not open or create a vault file.
    pub fn init() -> Result<Self> {
        disable_core_dumps();
        let secret = SecretMem::allocate(SECRET_REGION_SIZE)?;
        Ok(Self {
            file: None,
            secret,
            index: KeyIndex::with_capacity(INITIAL_SIZE),
            slot_count: INITIAL_SIZE,
            dir: PathBuf::new(),
            user: String::new(),
        })
    }

    fn require_open(&self) -> Result<()> {
        if self.file.is_none() {
            return Err(VaultError::VClose);
        }
        Ok(())
    }

    /// Creates a brand-new vault file with a freshly generated master
    /// key. Fails if a session is already open or a file already exists
    /// at `<dir>/<user>.vault`.
    pub fn create(&mut self, dir: &Path, user: &str, password: &[u8], m_cost_kib: u32, t_cost: u32) -> Result<()> {
        if self.file.is_some() {
            return Err(VaultError::VOpen);
        }
        validate_dir_len(dir)?;
        validate_user(user)?;
        validate_password(password)?;

        let path = VaultFile::path_for(dir, user);
        let salt = crypto::random_bytes::<SALT_SIZE>();
        let master_nonce = crypto::random_bytes::<NONCE_SIZE>();
        let master_key_bytes = crypto::random_bytes::<MASTER_KEY_SIZE>();
        let kek = crypto::pw_hash(password, &salt, m_cost_kib, t_cost)?;
        let sealed = crypto::seal(&kek, &master_nonce, b"", &master_key_bytes)?;
        let mut enc_master = [0u8; MASTER_KEY_SIZE + MAC_SIZE];
        enc_master.copy_from_slice(&sealed);

        let header = Header { version: FILE_VERSION, salt, enc_master, master_nonce, last_server_time: 0 };
        let mut file = alloc::write_initial_file(&path, &header)?;
        file.rewrite_file_mac(&master_key_bytes)?;

        let mut guard = Unlocked::new(&mut self.secret)?;
        guard.set_master_key(&master_key_bytes);
        guard.set_derived_key(&kek);
        drop(guard);

        self.slot_count = INITIAL_SIZE;
        self.index = KeyIndex::with_capacity(INITIAL_SIZE);
        self.dir = dir.to_path_buf();
        self.user = user.to_string();
        self.file = Some(file);
        info!("created vault for user {user}");
        Ok(())
    }

    /// Creates a vault from a header already downloaded from a server
    /// (e.g. onto a new machine): verifies `password` against the
    /// header's wrapped master, then writes a fresh, otherwise-empty
    /// file reusing that salt and wrapped master.
    pub fn create_from_header(
        &mut self,
        dir: &Path,
        user: &str,
        password: &[u8],
        header_bytes: &[u8],
        m_cost_kib: u32,
        t_cost: u32,
    ) -> Result<()> {
        if self.file.is_some() {
            return Err(VaultError::VOpen);
        }
        validate_dir_len(dir)?;
        validate_user(user)?;
        let header = Header::from_field_bytes(header_bytes)?;
        let kek = crypto::pw_hash(password, &header.salt, m_cost_kib, t_cost)?;
        let master_bytes = crypto::open(&kek, &header.master_nonce, b"", &header.enc_master, VaultError::WrongPass)?;
        let mut master_key = [0u8; MASTER_KEY_SIZE];
        master_key.copy_from_slice(&master_bytes);

        let path = VaultFile::path_for(dir, user);
        let mut file = alloc::write_initial_file(&path, &header)?;
        file.rewrite_file_mac(&master_key)?;

        let mut guard = Unlocked::new(&mut self.secret)?;
        guard.set_master_key(&master_key);
        guard.set_derived_key(&kek);
        drop(guard);

        self.slot_count = INITIAL_SIZE;
        self.index = KeyIndex::with_capacity(INITIAL_SIZE);
        self.dir = dir.to_path_buf();
        self.user = user.to_string();
        self.file = Some(file);
        info!("created vault for user {user} from downloaded header");
        Ok(())
    }

    /// Opens an existing vault file: derives the KEK, unwraps the
    /// master (`WrongPass` on tag mismatch), verifies the file MAC
    /// (`FileCorrupt` on mismatch), and rebuilds the `KeyIndex`.
    pub fn open(&mut self, dir: &Path, user: &str, password: &[u8], m_cost_kib: u32, t_cost: u32) -> Result<()> {
        if self.file.is_some() {
            return Err(VaultError::VOpen);
        }
        validate_dir_len(dir)?;
        validate_user(user)?;
        let path = VaultFile::path_for(dir, user);
        let mut file = VaultFile::open_existing(&path)?;
        let (header, slot_count) = file.read_header()?;
        let kek = crypto::pw_hash(password, &header.salt, m_cost_kib, t_cost)?;
        let master_bytes = crypto::open(&kek, &header.master_nonce, b"", &header.enc_master, VaultError::WrongPass)?;
        let mut master_key = [0u8; MASTER_KEY_SIZE];
        master_key.copy_from_slice(&master_bytes);

        if !file.verify_file_mac(&master_key)? {
            warn!("file MAC mismatch opening vault for {user}");
            return Err(VaultError::FileCorrupt);
        }
        let index = KeyIndex::build_from_file(&mut file, slot_count)?;

        let mut guard = Unlocked::new(&mut self.secret)?;
        guard.set_master_key(&master_key);
        guard.set_derived_key(&kek);
        drop(guard);

        self.slot_count = slot_count;
        self.index = index;
        self.dir = dir.to_path_buf();
        self.user = user.to_string();
        self.file = Some(file);
        info!("opened vault for user {user}, {} keys", self.index.len());
        Ok(())
    }

    /// Releases the file lock and zeroes every secret field. Idempotent
    /// calls after the first fail with `VClose`.
    pub fn close(&mut self) -> Result<()> {
        self.require_open()?;
        let mut guard = Unlocked::new(&mut self.secret)?;
        guard.bytes().fill(0);
        drop(guard);
        self.file = None;
        self.index = KeyIndex::with_capacity(INITIAL_SIZE);
        self.slot_count = INITIAL_SIZE;
        debug!("closed vault for user {}", self.user);
        Ok(())
    }

    /// Re-wraps the master key under a freshly derived KEK. The master
    /// key itself, and therefore every stored value, is unchanged.
    pub fn change_password(
        &mut self,
        old_password: &[u8],
        new_password: &[u8],
        m_cost_kib: u32,
        t_cost: u32,
    ) -> Result<()> {
        self.require_open()?;
        let (header, _slot_count) = self.file.as_mut().unwrap().read_header()?;
        let old_kek = crypto::pw_hash(old_password, &header.salt, m_cost_kib, t_cost)?;
        let reopened = crypto::open(&old_kek, &header.master_nonce, b"", &header.enc_master, VaultError::WrongPass)?;

        let mut guard = Unlocked::new(&mut self.secret)?;
        let current = guard.master_key();
        if !crypto::ct_eq(&reopened, &current) {
            return Err(VaultError::WrongPass);
        }

        let new_salt = crypto::random_bytes::<SALT_SIZE>();
        let new_nonce = crypto::random_bytes::<NONCE_SIZE>();
        let new_kek = crypto::pw_hash(new_password, &new_salt, m_cost_kib, t_cost)?;
        let sealed = crypto::seal(&new_kek, &new_nonce, b"", &current)?;
        let mut enc_master = [0u8; MASTER_KEY_SIZE + MAC_SIZE];
        enc_master.copy_from_slice(&sealed);
        guard.set_derived_key(&new_kek);
        // The master key is retained, but the HotBox is invalidated on
        // every password change regardless, per the data model invariant.
        guard.hotbox_clear();
        drop(guard);

        let new_header =
            Header { version: header.version, salt: new_salt, enc_master, master_nonce: new_nonce, last_server_time: header.last_server_time };
        let file = self.file.as_mut().unwrap();
        file.write_header(&new_header, self.slot_count)?;
        file.rewrite_file_mac(&current)?;
        info!("password changed for {}", self.user);
        Ok(())
    }

    /// Adds a new key. Compacts and retries once, transparently, if the
    /// slot table is full; `NoSpace` never escapes this call.
    pub fn add(&mut self, type_: u8, key: &str, value: &[u8], mtime: u64) -> Result<()> {
        self.require_open()?;
        if self.index.contains(key) {
            return Err(VaultError::KeyExist);
        }
        let mut guard = Unlocked::new(&mut self.secret)?;
        let master_key = guard.master_key();
        drop(guard);

        let file = self.file.as_mut().unwrap();
        match alloc::append(file, &mut self.index, &master_key, self.slot_count, type_, key, mtime, value) {
            Ok(()) => Ok(()),
            Err(VaultError::NoSpace) => {
                let (new_count, new_index) = alloc::compact(file, &master_key, self.slot_count)?;
                self.slot_count = new_count;
                self.index = new_index;
                alloc::append(file, &mut self.index, &master_key, self.slot_count, type_, key, mtime, value)
            }
            Err(e) => Err(e),
        }
    }

    /// `delete` followed by `add`. Fails with `ParamErr` if `key` is
    /// not already present, same as a bare `delete`.
    pub fn update(&mut self, type_: u8, key: &str, value: &[u8], mtime: u64) -> Result<()> {
        self.delete(key)?;
        self.add(type_, key, value, mtime)
    }

    /// Tombstones `key`. Invalidates the `HotBox` if it currently caches
    /// that key.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.require_open()?;
        if !self.index.contains(key) {
            return Err(VaultError::ParamErr(format!("no such key: {key}")));
        }
        let mut guard = Unlocked::new(&mut self.secret)?;
        let master_key = guard.master_key();
        let file = self.file.as_mut().unwrap();
        alloc::delete(file, &mut self.index, &master_key, key)?;
        if guard.hotbox_key().as_deref() == Some(key) {
            guard.hotbox_clear();
        }
        Ok(())
    }

    /// Decrypts `key` into the `HotBox`. A no-op if `key` is already
    /// cached there.
    pub fn open_key(&mut self, key: &str) -> Result<()> {
        self.require_open()?;
        let mut guard = Unlocked::new(&mut self.secret)?;
        if guard.hotbox_key().as_deref() == Some(key) {
            return Ok(());
        }
        let entry = *self.index.get(key).ok_or_else(|| VaultError::ParamErr(format!("no such key: {key}")))?;
        let file = self.file.as_mut().unwrap();
        let slot = file.read_slot(entry.slot_index)?;
        let master_key = guard.master_key();
        let opened = record::open_record(file, &slot, &master_key)?;
        guard.hotbox_set(key, opened.type_, &opened.value);
        Ok(())
    }

    /// Returns the value and type currently cached in the `HotBox`.
    /// Fails with `ParamErr` if no key is open.
    pub fn read_value(&mut self) -> Result<(Vec<u8>, u8)> {
        self.require_open()?;
        let mut guard = Unlocked::new(&mut self.secret)?;
        if guard.hotbox_key().is_none() {
            return Err(VaultError::ParamErr("no key is open".into()));
        }
        Ok(guard.hotbox_value())
    }

    pub fn list_keys(&self) -> Result<Vec<String>> {
        self.require_open()?;
        Ok(self.index.keys().map(|s| s.to_string()).collect())
    }

    pub fn num_keys(&self) -> Result<usize> {
        self.require_open()?;
        Ok(self.index.len())
    }

    pub fn last_modified(&self, key: &str) -> Result<Option<u64>> {
        self.require_open()?;
        Ok(self.index.get(key).map(|e| e.mtime))
    }

    /// Imports a record blob produced by another peer's `get_encrypted`
    /// (or this one): verifies its MAC under the local master key,
    /// re-stamps `mtime`, and appends.
    pub fn add_encrypted(&mut self, key: &str, type_: u8, mtime: u64, blob: Vec<u8>) -> Result<()> {
        self.require_open()?;
        if self.index.contains(key) {
            return Err(VaultError::KeyExist);
        }
        if key.is_empty() || key.len() >= BOX_KEY_SIZE {
            return Err(VaultError::ParamErr("key length out of range".into()));
        }
        let val_len = blob
            .len()
            .checked_sub(ENTRY_HEADER_SIZE + key.len() + MAC_SIZE + NONCE_SIZE + HASH_SIZE)
            .ok_or_else(|| VaultError::ParamErr("malformed record blob".into()))?;

        let mut guard = Unlocked::new(&mut self.secret)?;
        let master_key = guard.master_key();
        drop(guard);

        let file = self.file.as_mut().unwrap();
        let result = alloc::append_encrypted(
            file,
            &mut self.index,
            &master_key,
            self.slot_count,
            key,
            key.len(),
            val_len,
            type_,
            mtime,
            blob.clone(),
        );
        match result {
            Ok(()) => Ok(()),
            Err(VaultError::NoSpace) => {
                let (new_count, new_index) = alloc::compact(file, &master_key, self.slot_count)?;
                self.slot_count = new_count;
                self.index = new_index;
                alloc::append_encrypted(
                    file,
                    &mut self.index,
                    &master_key,
                    self.slot_count,
                    key,
                    key.len(),
                    val_len,
                    type_,
                    mtime,
                    blob,
                )
            }
            Err(e) => Err(e),
        }
    }

    /// Returns the raw, still-sealed record bytes for `key`, for upload
    /// to a server. Re-verifies the record MAC first.
    pub fn get_encrypted(&mut self, key: &str) -> Result<Vec<u8>> {
        self.require_open()?;
        let entry = *self.index.get(key).ok_or_else(|| VaultError::ParamErr(format!("no such key: {key}")))?;
        let mut guard = Unlocked::new(&mut self.secret)?;
        let master_key = guard.master_key();
        let file = self.file.as_mut().unwrap();
        let slot = file.read_slot(entry.slot_index)?;
        let raw = record::read_raw(file, &slot)?;
        if !record::verify_mac(&raw, &master_key) {
            warn!("get_encrypted: record MAC mismatch for a stored key");
            return Err(VaultError::FileCorrupt);
        }
        Ok(raw)
    }

    /// The header-for-server bytes (`[0, HEADER_FIELDS_LEN)`), for upload.
    /// Excludes `slot_count`, matching the convention `recovery::
    /// update_key_from_recovery` uses for the header bytes it returns.
    pub fn get_header(&mut self) -> Result<[u8; HEADER_FIELDS_LEN]> {
        self.require_open()?;
        let file = self.file.as_mut().unwrap();
        let mut buf = [0u8; HEADER_FIELDS_LEN];
        file.read_at(0, &mut buf)?;
        Ok(buf)
    }

    pub fn get_last_server_time(&mut self) -> Result<u64> {
        self.require_open()?;
        let (header, _) = self.file.as_mut().unwrap().read_header()?;
        Ok(header.last_server_time)
    }

    pub fn set_last_server_time(&mut self, ts: u64) -> Result<()> {
        self.require_open()?;
        let mut guard = Unlocked::new(&mut self.secret)?;
        let master_key = guard.master_key();
        drop(guard);

        let file = self.file.as_mut().unwrap();
        let (mut header, slot_count) = file.read_header()?;
        header.last_server_time = ts;
        file.write_header(&header, slot_count)?;
        file.rewrite_file_mac(&master_key)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Exposes the derived KEK and master key to a closure for the
    /// duration of a single unlock, for use by `recovery`. Not part of
    /// the public `SessionEngine` surface.
    pub(crate) fn with_secret_keys<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&MasterKey, &MasterKey) -> Result<R>,
    {
        self.require_open()?;
        let mut guard = Unlocked::new(&mut self.secret)?;
        let derived = guard.derived_key();
        let master = guard.master_key();
        drop(guard);
        f(&derived, &master)
    }
}
