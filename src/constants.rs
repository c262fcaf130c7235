//! Fixed sizes and sentinel values from the on-disk vault format.
//!
//! Every field here is a wire contract: changing one changes the file
//! layout. See `format.rs` for the byte-exact reader/writer that consumes
//! them.

/// Argon2id / AEAD key size, and the size of the master key itself.
pub const MASTER_KEY_SIZE: usize = 32;
/// Password salt stored in the header.
pub const SALT_SIZE: usize = 16;
/// AEAD authentication tag size.
pub const MAC_SIZE: usize = 16;
/// AEAD nonce size (XChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 24;
/// Keyed-hash output size (file MAC, record MAC).
pub const HASH_SIZE: usize = 32;
/// On-disk slot size.
pub const LOC_SIZE: usize = 16;
/// Header region through and including the `slot_count` field; this is
/// where the slot table begins.
pub const HEADER_SIZE: usize = 108;
/// Header-for-server length: everything before `slot_count` (offsets
/// `[0, 104)`), i.e. what `get_header` hands back for upload.
pub const HEADER_FIELDS_LEN: usize = 104;
/// `mtime` (8B) + `type` (1B) prefix of a record.
pub const ENTRY_HEADER_SIZE: usize = 9;

pub const MAX_PATH_LEN: usize = 4096;
pub const MAX_USER_SIZE: usize = 64;
pub const MAX_PASS_SIZE: usize = 256;
/// Keys are NUL-terminated in the `HotBox`; on-disk/API keys must be
/// strictly shorter than this.
pub const BOX_KEY_SIZE: usize = 256;
/// Maximum value size accepted by `add`/`update`.
pub const DATA_SIZE: usize = 4096;
/// Initial slot-table capacity. Must be a power of two.
pub const INITIAL_SIZE: u32 = 32;

pub const STATE_UNUSED: u32 = 0;
pub const STATE_DELETED: u32 = 1;
pub const STATE_ACTIVE: u32 = 0x0001_0001;

pub const FILE_VERSION: u8 = 1;

/// Argon2id defaults (moderate cost), used when the caller doesn't
/// override them explicitly.
pub const DEFAULT_M_COST_KIB: u32 = 131_072;
pub const DEFAULT_T_COST: u32 = 3;
