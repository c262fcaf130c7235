//! A guarded allocator for the secret bytes a `VaultSession` carries:
//! the KEK, the decrypted master key, and the `HotBox` plaintext cache.
//!
//! On unix this is a single `mmap`-backed, page-aligned region that is
//! `mlock`ed for its whole lifetime and `mprotect`ed between `PROT_NONE`
//! (default, no access) and `PROT_READ | PROT_WRITE` (only while a public
//! `SessionEngine` call is in progress). This is the same raw-syscall
//! style the corpus's lower-level crates use for manual memory control,
//! rather than pulling in a separate guarded-memory crate.
//!
//! Non-unix targets fall back to a plain heap buffer with best-effort
//! zeroing and no page protection; `unlock`/`lock` are no-ops there.

use crate::error::{Result, VaultError};

#[cfg(unix)]
mod imp {
    use super::*;
    use std::ffi::c_void;

    pub struct SecretMem {
        ptr: *mut u8,
        len: usize,
        mapped_len: usize,
    }

    fn page_size() -> usize {
        let p = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if p <= 0 {
            4096
        } else {
            p as usize
        }
    }

    impl SecretMem {
        pub fn allocate(len: usize) -> Result<Self> {
            let page = page_size();
            let mapped_len = ((len + page - 1) / page).max(1) * page;
            unsafe {
                let ptr = libc::mmap(
                    std::ptr::null_mut(),
                    mapped_len,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                );
                if ptr == libc::MAP_FAILED {
                    return Err(VaultError::MemErr);
                }
                if libc::mlock(ptr, mapped_len) != 0 {
                    libc::munmap(ptr, mapped_len);
                    return Err(VaultError::MemErr);
                }
                Ok(Self { ptr: ptr as *mut u8, len, mapped_len })
            }
        }

        fn protect(&self, prot: libc::c_int) -> Result<()> {
            let rc = unsafe { libc::mprotect(self.ptr as *mut c_void, self.mapped_len, prot) };
            if rc != 0 {
                return Err(VaultError::MemErr);
            }
            Ok(())
        }

        pub fn unlock(&mut self) -> Result<()> {
            self.protect(libc::PROT_READ | libc::PROT_WRITE)
        }

        pub fn lock(&mut self) -> Result<()> {
            self.protect(libc::PROT_NONE)
        }

        /// Safety: caller must have called `unlock()` and not yet called
        /// `lock()`.
        pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
            std::slice::from_raw_parts_mut(self.ptr, self.len)
        }
    }

    impl Drop for SecretMem {
        fn drop(&mut self) {
            unsafe {
                let _ = libc::mprotect(self.ptr as *mut c_void, self.mapped_len, libc::PROT_READ | libc::PROT_WRITE);
                for i in 0..self.mapped_len {
                    std::ptr::write_volatile(self.ptr.add(i), 0);
                }
                libc::munlock(self.ptr as *const c_void, self.mapped_len);
                libc::munmap(self.ptr as *mut c_void, self.mapped_len);
            }
        }
    }

    // The region is only ever touched while the owning `VaultSession` has
    // it unlocked under a single call stack; exposing it across threads
    // is the caller's responsibility same as any other `&mut`.
    unsafe impl Send for SecretMem {}
}

#[cfg(not(unix))]
mod imp {
    use super::*;
    use zeroize::Zeroize;

    pub struct SecretMem {
        buf: Vec<u8>,
    }

    impl SecretMem {
        pub fn allocate(len: usize) -> Result<Self> {
            Ok(Self { buf: vec![0u8; len] })
        }

        pub fn unlock(&mut self) -> Result<()> {
            Ok(())
        }

        pub fn lock(&mut self) -> Result<()> {
            Ok(())
        }

        pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
            &mut self.buf
        }
    }

    impl Drop for SecretMem {
        fn drop(&mut self) {
            self.buf.zeroize();
        }
    }
}

pub use imp::SecretMem;

/// Disables core dumps for the process. Called once from
/// `SessionEngine::init`.
pub fn disable_core_dumps() {
    #[cfg(unix)]
    unsafe {
        let limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        let _ = libc::setrlimit(libc::RLIMIT_CORE, &limit);
    }
}
