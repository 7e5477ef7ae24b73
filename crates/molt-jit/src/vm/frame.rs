//! Execution frames
//!
//! The frame layout is ABI: emitted code holds a pointer to the
//! `last_instruction` field and reaches the local slot array through the
//! `locals` pointer, so the leading fields are `#[repr(C)]` and their
//! offsets are exposed for the compiler driver.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::vm::code::CodeObject;
use crate::vm::value::{alloc, Payload, ValueRef};

/// One activation record. Locals, cells and free variables share a single
/// slot array (`locals` points at its base).
#[repr(C)]
pub struct Frame {
    /// Offset of the most recently executed instruction. Emitted code
    /// updates this before every lowered opcode.
    pub last_instruction: i32,
    _pad: i32,
    /// Base of the slot array: locals, then cells, then frees.
    pub locals: *mut ValueRef,
    /// Globals dict (owned).
    pub globals: ValueRef,
    /// Builtins dict (owned).
    pub builtins: ValueRef,
    /// The code object being executed (kept alive by `code_ref`).
    pub code: *const CodeObject,

    // Host-side fields, not ABI.
    slots: Box<[ValueRef]>,
    code_ref: Arc<CodeObject>,
}

impl Frame {
    /// Byte offset of `last_instruction`, for emitted field access.
    pub const LASTI_OFFSET: usize = 0;

    /// Byte offset of the `locals` base pointer.
    pub const LOCALS_OFFSET: usize = 8;

    /// Create a frame for `code`. Takes ownership of the `globals` and
    /// `builtins` references. Cell slots are pre-populated with fresh
    /// cells; everything else starts null (unbound).
    pub fn new(code: Arc<CodeObject>, globals: ValueRef, builtins: ValueRef) -> Box<Frame> {
        let n = code.slot_count();
        let mut slots = vec![ValueRef::NULL; n].into_boxed_slice();
        let cell_base = code.local_count as usize;
        for i in 0..code.cell_count as usize {
            slots[cell_base + i] = alloc(Payload::CellVar(Cell::new(ValueRef::NULL)));
        }
        let locals = slots.as_mut_ptr();
        Box::new(Frame {
            last_instruction: -1,
            _pad: 0,
            locals,
            globals,
            builtins,
            code: Arc::as_ptr(&code),
            slots,
            code_ref: code,
        })
    }

    pub fn code(&self) -> &CodeObject {
        &self.code_ref
    }

    pub fn code_arc(&self) -> Arc<CodeObject> {
        self.code_ref.clone()
    }

    /// Bind an argument slot, taking ownership of the reference.
    pub fn set_arg(&mut self, index: usize, value: ValueRef) {
        self.set_slot(index, value);
    }

    /// Store into a slot (store-then-release ordering on the old value).
    pub fn set_slot(&mut self, index: usize, value: ValueRef) {
        let old = self.slots[index];
        self.slots[index] = value;
        old.decref();
    }

    /// Borrow a slot's current value (null when unbound).
    pub fn slot(&self, index: usize) -> ValueRef {
        self.slots[index]
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        for v in self.slots.iter() {
            v.decref();
        }
        self.globals.decref();
        self.builtins.decref();
    }
}

thread_local! {
    static FRAME_STACK: RefCell<Vec<*mut Frame>> = const { RefCell::new(Vec::new()) };
}

/// Push a frame onto the thread's frame stack. Called from the emitted
/// prologue.
pub fn push_frame(frame: *mut Frame) {
    FRAME_STACK.with(|s| s.borrow_mut().push(frame));
}

/// Pop a frame from the thread's frame stack. Called from the emitted
/// epilogue on both the success and error paths.
pub fn pop_frame(frame: *mut Frame) {
    FRAME_STACK.with(|s| {
        let popped = s.borrow_mut().pop();
        debug_assert_eq!(popped, Some(frame));
    });
}

/// Current frame-stack depth (diagnostics and tests).
pub fn frame_depth() -> usize {
    FRAME_STACK.with(|s| s.borrow().len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::code::CodeBuilder;
    use crate::vm::value::{new_dict, new_str, TypeKind};

    fn empty_frame() -> Box<Frame> {
        let code = Arc::new(CodeBuilder::new("f").local_count(2).cell_count(1).build());
        Frame::new(code, new_dict(), new_dict())
    }

    #[test]
    fn test_frame_layout_offsets() {
        assert_eq!(std::mem::offset_of!(Frame, last_instruction), Frame::LASTI_OFFSET);
        assert_eq!(std::mem::offset_of!(Frame, locals), Frame::LOCALS_OFFSET);
    }

    #[test]
    fn test_slots_start_unbound_cells_created() {
        let f = empty_frame();
        assert_eq!(f.slot_count(), 3);
        assert!(f.slot(0).is_null());
        assert!(f.slot(1).is_null());
        assert_eq!(f.slot(2).type_kind(), TypeKind::CellVar);
    }

    #[test]
    fn test_set_slot_releases_old() {
        let mut f = empty_frame();
        let a = new_str("a");
        a.incref();
        f.set_slot(0, a);
        assert_eq!(a.refcount(), 2);
        f.set_slot(0, new_str("b"));
        assert_eq!(a.refcount(), 1);
        a.decref();
    }

    #[test]
    fn test_frame_stack_discipline() {
        let mut f = empty_frame();
        let p: *mut Frame = &mut *f;
        let before = frame_depth();
        push_frame(p);
        assert_eq!(frame_depth(), before + 1);
        pop_frame(p);
        assert_eq!(frame_depth(), before);
    }
}
