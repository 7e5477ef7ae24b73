//! Codegen value-stack kinds
//!
//! The driver maintains this sequence in lock-step with the IL operand
//! stack so it always knows which entries are value references (needing
//! refcount management on every exit path) and which are raw unboxed
//! primitives.

/// Representation of one operand-stack entry during codegen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEntryKind {
    /// An unboxed primitive; currently only a raw f64.
    Value,
    /// A value reference, possibly carrying a tagged small integer.
    Object,
}

impl StackEntryKind {
    /// IL local type that can hold a spilled entry of this kind.
    pub fn il_type(self) -> crate::il::IlType {
        match self {
            StackEntryKind::Value => crate::il::IlType::F64,
            StackEntryKind::Object => crate::il::IlType::Ptr,
        }
    }
}
