//! Backend-agnostic code generation
//!
//! The machine-code generator is an external collaborator: it takes the
//! serialized typed IL plus the method signature and frame layout, and
//! produces an executable buffer. `CodegenBackend` is that seam; the crate
//! ships only a stub implementation.

pub mod memory;
pub mod stub;

pub use self::memory::ExecBuffer;
pub use self::stub::StubBackend;

use crate::il::MethodBody;

/// Error during code generation
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("backend error: {0}")]
    BackendError(String),
    #[error("unsupported IL opcode {0:#x}")]
    UnsupportedInstruction(u8),
    #[error("executable memory allocation failed: {0}")]
    AllocationFailed(String),
}

/// Executable native code. Owns its buffer (when one exists) for the
/// lifetime of the record; the entry pointer stays valid until drop.
pub struct NativeCode {
    entry: *const u8,
    size: usize,
    _buf: Option<ExecBuffer>,
}

impl NativeCode {
    /// Wrap a finalized executable buffer.
    pub fn from_buffer(buf: ExecBuffer) -> NativeCode {
        NativeCode {
            entry: buf.as_ptr(),
            size: buf.len(),
            _buf: Some(buf),
        }
    }

    /// Wrap a host function pointer (test backends route compiled entry
    /// points at real Rust functions this way).
    pub fn from_entry(entry: *const u8, size: usize) -> NativeCode {
        NativeCode {
            entry,
            size,
            _buf: None,
        }
    }

    pub fn entry(&self) -> *const u8 {
        self.entry
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy out the native bytes (for `dump_native`).
    pub fn bytes(&self) -> Vec<u8> {
        // Safety: entry points at `size` readable bytes owned by this
        // record (executable pages are mapped readable).
        unsafe { std::slice::from_raw_parts(self.entry, self.size) }.to_vec()
    }
}

// Safety: the buffer is immutable after finalization and the entry pointer
// targets memory owned by this value.
unsafe impl Send for NativeCode {}
unsafe impl Sync for NativeCode {}

/// The backend seam: typed IL in, executable buffer out.
pub trait CodegenBackend: Send + Sync {
    /// Backend name (for diagnostics)
    fn name(&self) -> &str;

    /// Compile one serialized method to executable native code.
    fn compile_method(&self, body: &MethodBody<'_>) -> Result<NativeCode, CodegenError>;
}
