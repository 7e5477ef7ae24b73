//! Executable memory allocation
//!
//! Pages are mapped read-write for the copy, then flipped to read-execute.
//! No page is ever writable and executable at the same time, and emitted
//! code is never modified after finalization.

use crate::backend::CodegenError;

/// A page-aligned, read-execute mapping holding finalized native code.
pub struct ExecBuffer {
    ptr: *mut u8,
    len: usize,
    map_len: usize,
}

impl ExecBuffer {
    /// Map `code` into fresh executable memory.
    #[cfg(unix)]
    pub fn new(code: &[u8]) -> Result<ExecBuffer, CodegenError> {
        if code.is_empty() {
            return Err(CodegenError::AllocationFailed("empty code".to_string()));
        }
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let map_len = code.len().div_ceil(page) * page;
        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(CodegenError::AllocationFailed("mmap failed".to_string()));
            }
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr as *mut u8, code.len());
            if libc::mprotect(ptr, map_len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                libc::munmap(ptr, map_len);
                return Err(CodegenError::AllocationFailed(
                    "mprotect failed".to_string(),
                ));
            }
            Ok(ExecBuffer {
                ptr: ptr as *mut u8,
                len: code.len(),
                map_len,
            })
        }
    }

    /// Fallback for non-unix targets: plain heap memory, not executable.
    #[cfg(not(unix))]
    pub fn new(code: &[u8]) -> Result<ExecBuffer, CodegenError> {
        let mut v = code.to_vec().into_boxed_slice();
        let ptr = v.as_mut_ptr();
        let len = v.len();
        std::mem::forget(v);
        Ok(ExecBuffer {
            ptr,
            len,
            map_len: len,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.map_len);
        }
        #[cfg(not(unix))]
        unsafe {
            drop(Box::from_raw(std::slice::from_raw_parts_mut(
                self.ptr,
                self.map_len,
            )));
        }
    }
}

// Safety: the mapping is immutable after construction.
unsafe impl Send for ExecBuffer {}
unsafe impl Sync for ExecBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_bytes() {
        let code = [0xCCu8, 0x90, 0xC3];
        let buf = ExecBuffer::new(&code).unwrap();
        assert_eq!(buf.len(), 3);
        let copied = unsafe { std::slice::from_raw_parts(buf.as_ptr(), buf.len()) };
        assert_eq!(copied, &code);
    }

    #[test]
    fn test_empty_rejected() {
        assert!(ExecBuffer::new(&[]).is_err());
    }
}
