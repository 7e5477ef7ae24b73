//! Stub backend for exercising the pipeline without real codegen
//!
//! Produces a single trap instruction so the full compile path (IL
//! serialization, buffer allocation, record installation) runs end-to-end.
//! The resulting entry point must never be invoked.

use crate::backend::{CodegenBackend, CodegenError, ExecBuffer, NativeCode};
use crate::il::MethodBody;

/// A backend that emits a trap byte (INT3 on x86-64, BRK placeholder
/// elsewhere) instead of translating the IL.
pub struct StubBackend;

impl CodegenBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn compile_method(&self, body: &MethodBody<'_>) -> Result<NativeCode, CodegenError> {
        if body.il.is_empty() {
            return Err(CodegenError::BackendError("empty method".to_string()));
        }
        #[cfg(target_arch = "x86_64")]
        let trap: u8 = 0xCC;
        #[cfg(not(target_arch = "x86_64"))]
        let trap: u8 = 0x00;

        let buf = ExecBuffer::new(&[trap])?;
        Ok(NativeCode::from_buffer(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{IlType, MethodSig};

    #[test]
    fn test_stub_compiles_nonempty() {
        let sig = MethodSig {
            ret: IlType::Ptr,
            params: vec![IlType::Ptr, IlType::Ptr],
        };
        let body = MethodBody {
            il: &[crate::il::ops::RET],
            sig: &sig,
            locals: &[],
            max_stack: 4,
        };
        let native = StubBackend.compile_method(&body).unwrap();
        assert_eq!(native.size(), 1);
        assert_eq!(StubBackend.name(), "stub");
    }

    #[test]
    fn test_stub_rejects_empty() {
        let sig = MethodSig {
            ret: IlType::Void,
            params: vec![],
        };
        let body = MethodBody {
            il: &[],
            sig: &sig,
            locals: &[],
            max_stack: 0,
        };
        assert!(StubBackend.compile_method(&body).is_err());
    }
}
