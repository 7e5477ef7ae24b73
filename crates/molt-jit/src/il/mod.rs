//! IL emitter
//!
//! Builds the typed, stack-based IL stream for one method: constants,
//! arithmetic, locals, indirect memory access, labels and branches, helper
//! calls, and the final handoff to the code-generation backend. Locals of
//! the same type are pooled through a per-type free list so the driver can
//! spill aggressively without growing the frame.

pub mod display;
pub mod ops;

use rustc_hash::FxHashMap;

use crate::backend::{CodegenBackend, CodegenError, NativeCode};

/// Static types in the IL stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IlType {
    /// Pointer-sized integer; value references and raw pointers.
    Ptr,
    I32,
    I64,
    F64,
    Void,
}

/// Branch condition kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Always,
    True,
    False,
    Equal,
    NotEqual,
    LessEqual,
    /// Leave an exception-handling region.
    Leave,
}

impl BranchKind {
    fn long_op(self) -> u8 {
        match self {
            BranchKind::Always => ops::BR,
            BranchKind::True => ops::BRTRUE,
            BranchKind::False => ops::BRFALSE,
            BranchKind::Equal => ops::BEQ,
            BranchKind::NotEqual => ops::BNE,
            BranchKind::LessEqual => ops::BLE,
            BranchKind::Leave => ops::LEAVE,
        }
    }

    fn short_op(self) -> u8 {
        self.long_op() | 0x08
    }

    fn pops(self) -> i32 {
        match self {
            BranchKind::Always | BranchKind::Leave => 0,
            BranchKind::True | BranchKind::False => 1,
            BranchKind::Equal | BranchKind::NotEqual | BranchKind::LessEqual => 2,
        }
    }
}

/// Opaque label handle into the emitter's label table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub u32);

/// Opaque local-slot handle into the emitter's local table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IlLocal(pub u32);

#[derive(Debug, Default)]
struct LabelInfo {
    location: Option<usize>,
    fixups: Vec<usize>,
}

/// Method signature handed to the backend.
#[derive(Debug, Clone)]
pub struct MethodSig {
    pub ret: IlType,
    pub params: Vec<IlType>,
}

/// Serialized method: everything the backend needs.
pub struct MethodBody<'a> {
    pub il: &'a [u8],
    pub sig: &'a MethodSig,
    pub locals: &'a [IlType],
    pub max_stack: u32,
}

/// Result of a successful backend compilation.
pub struct CompiledMethod {
    /// The serialized IL, retained for `dump_il`.
    pub il: Vec<u8>,
    /// The executable artifact.
    pub native: NativeCode,
}

/// The IL emitter. Single-use: build, then `compile`.
pub struct IlEmitter {
    il: Vec<u8>,
    sig: MethodSig,
    locals: Vec<IlType>,
    free_lists: FxHashMap<IlType, Vec<IlLocal>>,
    labels: Vec<LabelInfo>,
    stack_size: i32,
    max_stack: i32,
}

impl IlEmitter {
    /// Start a method with the given signature. The static stack estimate
    /// starts at the parameter count plus slack for the prologue, matching
    /// the frame-on-stack convention the backend expects.
    pub fn new(sig: MethodSig) -> Self {
        let start = 2 + sig.params.len() as i32;
        IlEmitter {
            il: Vec::new(),
            sig,
            locals: Vec::new(),
            free_lists: FxHashMap::default(),
            labels: Vec::new(),
            stack_size: start,
            max_stack: start,
        }
    }

    pub fn il(&self) -> &[u8] {
        &self.il
    }

    pub fn len(&self) -> usize {
        self.il.len()
    }

    pub fn is_empty(&self) -> bool {
        self.il.is_empty()
    }

    /// Coarse static stack-depth estimate for the backend's frame sizing.
    /// This is not the abstract stack: it only ever overestimates.
    pub fn max_stack(&self) -> u32 {
        self.max_stack.max(0) as u32
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    fn adjust(&mut self, delta: i32) {
        self.stack_size += delta;
        if self.stack_size > self.max_stack {
            self.max_stack = self.stack_size;
        }
    }

    // ===== Locals and labels =====

    /// Allocate a local of `ty`, reusing a previously freed slot of the
    /// same type when one is available.
    pub fn define_local(&mut self, ty: IlType) -> IlLocal {
        if let Some(free) = self.free_lists.get_mut(&ty) {
            if let Some(local) = free.pop() {
                return local;
            }
        }
        self.define_local_no_cache(ty)
    }

    /// Allocate a local that bypasses the reuse pool.
    pub fn define_local_no_cache(&mut self, ty: IlType) -> IlLocal {
        let local = IlLocal(self.locals.len() as u32);
        self.locals.push(ty);
        local
    }

    /// Return a local to its type's free list. Double frees are a bug in
    /// the caller; debug builds assert.
    pub fn free_local(&mut self, local: IlLocal) {
        let ty = self.locals[local.0 as usize];
        let list = self.free_lists.entry(ty).or_default();
        debug_assert!(
            !list.contains(&local),
            "IL local {} double-freed",
            local.0
        );
        list.push(local);
    }

    pub fn define_label(&mut self) -> Label {
        self.labels.push(LabelInfo::default());
        Label(self.labels.len() as u32 - 1)
    }

    /// Resolve a label to the current offset and patch every pending
    /// branch that targeted it. A label may be marked at most once.
    pub fn mark_label(&mut self, label: Label) {
        let loc = self.il.len();
        let info = &mut self.labels[label.0 as usize];
        debug_assert!(info.location.is_none(), "label marked twice");
        info.location = Some(loc);
        let fixups = std::mem::take(&mut info.fixups);
        for from in fixups {
            // Displacement is relative to the end of the long instruction.
            let disp = (loc as i64 - (from as i64 + 4)) as i32;
            self.il[from..from + 4].copy_from_slice(&disp.to_le_bytes());
        }
    }

    // ===== Constants =====

    pub fn ld_i4(&mut self, value: i32) {
        self.il.push(ops::LDC_I4);
        self.il.extend_from_slice(&value.to_le_bytes());
        self.adjust(1);
    }

    pub fn ld_i8(&mut self, value: i64) {
        self.il.push(ops::LDC_I8);
        self.il.extend_from_slice(&value.to_le_bytes());
        self.adjust(1);
    }

    pub fn ld_r8(&mut self, value: f64) {
        self.il.push(ops::LDC_R8);
        self.il.extend_from_slice(&value.to_bits().to_le_bytes());
        self.adjust(1);
    }

    pub fn ld_ptr(&mut self, value: usize) {
        self.il.push(ops::LDC_PTR);
        self.il.extend_from_slice(&(value as u64).to_le_bytes());
        self.adjust(1);
    }

    pub fn load_null(&mut self) {
        self.il.push(ops::LDNULL);
        self.adjust(1);
    }

    // ===== Arithmetic and stack primitives =====

    pub fn add(&mut self) {
        self.il.push(ops::ADD);
        self.adjust(-1);
    }

    pub fn sub(&mut self) {
        self.il.push(ops::SUB);
        self.adjust(-1);
    }

    pub fn mul(&mut self) {
        self.il.push(ops::MUL);
        self.adjust(-1);
    }

    pub fn div(&mut self) {
        self.il.push(ops::DIV);
        self.adjust(-1);
    }

    pub fn rem(&mut self) {
        self.il.push(ops::REM);
        self.adjust(-1);
    }

    pub fn neg(&mut self) {
        self.il.push(ops::NEG);
    }

    pub fn bitwise_and(&mut self) {
        self.il.push(ops::AND);
        self.adjust(-1);
    }

    pub fn pop(&mut self) {
        self.il.push(ops::POP);
        self.adjust(-1);
    }

    pub fn dup(&mut self) {
        self.il.push(ops::DUP);
        self.adjust(1);
    }

    pub fn brk(&mut self) {
        self.il.push(ops::BREAK);
    }

    /// Return, consuming `pop_count` operands.
    pub fn ret(&mut self, pop_count: i32) {
        self.il.push(ops::RET);
        self.adjust(-pop_count);
    }

    // ===== Comparisons (push i32 0/1) =====

    pub fn compare_eq(&mut self) {
        self.il.push(ops::CEQ);
        self.adjust(-1);
    }

    pub fn compare_ne(&mut self) {
        self.compare_eq();
        self.ld_i4(0);
        self.compare_eq();
    }

    pub fn compare_lt(&mut self) {
        self.il.push(ops::CLT);
        self.adjust(-1);
    }

    pub fn compare_gt(&mut self) {
        self.il.push(ops::CGT);
        self.adjust(-1);
    }

    pub fn compare_ge(&mut self) {
        self.compare_lt();
        self.ld_i4(0);
        self.compare_eq();
    }

    pub fn compare_le(&mut self) {
        self.compare_gt();
        self.ld_i4(0);
        self.compare_eq();
    }

    /// `>=` over floats: unordered-less-than, inverted, so NaN compares
    /// false.
    pub fn compare_ge_float(&mut self) {
        self.il.push(ops::CLT_UN);
        self.adjust(-1);
        self.ld_i4(0);
        self.compare_eq();
    }

    /// `<=` over floats via inverted unordered-greater-than.
    pub fn compare_le_float(&mut self) {
        self.il.push(ops::CGT_UN);
        self.adjust(-1);
        self.ld_i4(0);
        self.compare_eq();
    }

    // ===== Locals and arguments =====

    pub fn ld_loc(&mut self, local: IlLocal) {
        self.il.push(ops::LDLOC);
        self.il.extend_from_slice(&(local.0 as u16).to_le_bytes());
        self.adjust(1);
    }

    pub fn st_loc(&mut self, local: IlLocal) {
        self.il.push(ops::STLOC);
        self.il.extend_from_slice(&(local.0 as u16).to_le_bytes());
        self.adjust(-1);
    }

    pub fn ld_loc_addr(&mut self, local: IlLocal) {
        self.il.push(ops::LDLOCA);
        self.il.extend_from_slice(&(local.0 as u16).to_le_bytes());
        self.adjust(1);
    }

    pub fn ld_arg(&mut self, index: u16) {
        self.il.push(ops::LDARG);
        self.il.extend_from_slice(&index.to_le_bytes());
        self.adjust(1);
    }

    // ===== Indirect memory access =====

    pub fn ld_ind_ptr(&mut self) {
        self.il.push(ops::LDIND_PTR);
    }

    pub fn ld_ind_i4(&mut self) {
        self.il.push(ops::LDIND_I4);
    }

    pub fn ld_ind_r8(&mut self) {
        self.il.push(ops::LDIND_R8);
    }

    pub fn st_ind_ptr(&mut self) {
        self.il.push(ops::STIND_PTR);
        self.adjust(-2);
    }

    pub fn st_ind_i4(&mut self) {
        self.il.push(ops::STIND_I4);
        self.adjust(-2);
    }

    pub fn st_ind_r8(&mut self) {
        self.il.push(ops::STIND_R8);
        self.adjust(-2);
    }

    // ===== Control flow =====

    /// Emit a branch to `label`. Uses the short form when the target is
    /// already resolved and the displacement fits a signed byte; an
    /// unresolved target always reserves the long form and records a
    /// fixup for `mark_label`.
    pub fn branch(&mut self, kind: BranchKind, label: Label) {
        let location = self.labels[label.0 as usize].location;
        match location {
            Some(loc) => {
                let short_disp = loc as i64 - (self.il.len() as i64 + 2);
                if (-128..=127).contains(&short_disp) {
                    self.il.push(kind.short_op());
                    self.il.push(short_disp as i8 as u8);
                } else {
                    let long_disp = (loc as i64 - (self.il.len() as i64 + 5)) as i32;
                    self.il.push(kind.long_op());
                    self.il.extend_from_slice(&long_disp.to_le_bytes());
                }
            }
            None => {
                self.il.push(kind.long_op());
                let at = self.il.len();
                self.labels[label.0 as usize].fixups.push(at);
                self.il.extend_from_slice(&0xFFFFu32.to_le_bytes());
            }
        }
        self.adjust(-kind.pops());
    }

    // ===== Calls =====

    /// Call through the helper catalog. The stack delta is `pop_count`
    /// down, one up unless the helper returns void.
    pub fn emit_call(&mut self, helper_id: u32, pop_count: i32) {
        self.il.push(ops::CALL);
        self.il.extend_from_slice(&helper_id.to_le_bytes());
        self.adjust(-pop_count);
        if crate::helpers::returns_value(helper_id) {
            self.adjust(1);
        }
    }

    // ===== Scratch arrays =====

    /// Allocate a pointer array of fixed length; pushes its base address.
    pub fn new_array(&mut self, len: u32) {
        self.il.push(ops::NEWARR);
        self.il.extend_from_slice(&len.to_le_bytes());
        self.adjust(1);
    }

    /// `array_local[index] = value_local`.
    pub fn st_elem(&mut self, array: IlLocal, index: u32, value: IlLocal) {
        self.ld_loc(array);
        self.ld_i4(index as i32);
        self.ld_loc(value);
        self.il.push(ops::STELEM);
        self.adjust(-3);
    }

    /// Load a pointer element from the base address on the stack.
    pub fn ld_elem_ptr(&mut self, index: u32) {
        self.il.push(ops::LDELEM_PTR);
        self.il.extend_from_slice(&index.to_le_bytes());
    }

    /// Load a float element from the base address on the stack.
    pub fn ld_elem_r8(&mut self, index: u32) {
        self.il.push(ops::LDELEM_R8);
        self.il.extend_from_slice(&index.to_le_bytes());
    }

    /// Pop a byte count and push a pointer to stack scratch space.
    pub fn alloca(&mut self) {
        self.il.push(ops::ALLOCA);
    }

    // ===== Finalization =====

    /// Serialize and hand the method to the backend. `extra_stack` widens
    /// the static estimate for methods whose host stack bound is known to
    /// exceed the IL estimate.
    pub fn compile(
        self,
        backend: &dyn CodegenBackend,
        extra_stack: u32,
    ) -> Result<CompiledMethod, CodegenError> {
        let body = MethodBody {
            il: &self.il,
            sig: &self.sig,
            locals: &self.locals,
            max_stack: self.max_stack() + extra_stack,
        };
        let native = backend.compile_method(&body)?;
        Ok(CompiledMethod {
            il: self.il,
            native,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitter() -> IlEmitter {
        IlEmitter::new(MethodSig {
            ret: IlType::Ptr,
            params: vec![IlType::Ptr, IlType::Ptr],
        })
    }

    #[test]
    fn test_local_pool_reuse() {
        let mut il = emitter();
        let a = il.define_local(IlType::Ptr);
        let b = il.define_local(IlType::Ptr);
        assert_ne!(a, b);
        il.free_local(a);
        let c = il.define_local(IlType::Ptr);
        assert_eq!(a, c);
        // Different type never reuses the slot.
        let d = il.define_local(IlType::F64);
        assert_ne!(c, d);
        assert_eq!(il.local_count(), 3);
    }

    #[test]
    fn test_no_cache_bypasses_pool() {
        let mut il = emitter();
        let a = il.define_local(IlType::Ptr);
        il.free_local(a);
        let b = il.define_local_no_cache(IlType::Ptr);
        assert_ne!(a, b);
    }

    #[test]
    fn test_forward_branch_long_and_patched() {
        let mut il = emitter();
        let target = il.define_label();
        il.ld_i4(1);
        il.branch(BranchKind::True, target);
        let branch_at = il.len() - 5;
        il.ld_i4(0);
        il.mark_label(target);
        let disp = i32::from_le_bytes(il.il()[branch_at + 1..branch_at + 5].try_into().unwrap());
        // Displacement is relative to the end of the long branch.
        assert_eq!(branch_at as i64 + 5 + disp as i64, il.len() as i64);
    }

    #[test]
    fn test_backward_branch_short() {
        let mut il = emitter();
        let top = il.define_label();
        il.mark_label(top);
        il.ld_i4(1);
        il.pop();
        il.branch(BranchKind::Always, top);
        // Short encoding: opcode + displacement byte.
        let op = il.il()[il.len() - 2];
        assert_eq!(op, ops::BR_S);
        let disp = il.il()[il.len() - 1] as i8;
        assert_eq!(il.len() as i64 + disp as i64, 0);
    }

    #[test]
    fn test_backward_branch_long_when_far() {
        let mut il = emitter();
        let top = il.define_label();
        il.mark_label(top);
        for _ in 0..40 {
            il.ld_i4(7);
            il.pop();
        }
        il.branch(BranchKind::Always, top);
        assert_eq!(il.il()[il.len() - 5], ops::BR);
    }

    #[test]
    fn test_max_stack_overestimates() {
        let mut il = IlEmitter::new(MethodSig {
            ret: IlType::Void,
            params: vec![],
        });
        let base = il.max_stack();
        il.ld_i4(1);
        il.ld_i4(2);
        il.ld_i4(3);
        il.add();
        il.add();
        il.pop();
        assert_eq!(il.max_stack(), base + 3);
    }

    #[test]
    fn test_compare_ne_expansion() {
        let mut il = emitter();
        il.ld_i4(1);
        il.ld_i4(2);
        il.compare_ne();
        // ceq; ldc 0; ceq
        let bytes = il.il();
        assert_eq!(bytes[bytes.len() - 7], ops::CEQ);
        assert_eq!(bytes[bytes.len() - 1], ops::CEQ);
    }
}
