//! Compiler driver
//!
//! Walks bytecode in order and lowers each opcode to IL, consulting the
//! abstract interpreter's per-offset snapshots to pick representations
//! (unboxed float fast paths, tagged-integer helpers, elided definedness
//! checks) and maintaining a parallel `StackEntryKind` sequence in
//! lock-step with the IL operand stack. Owns the exception-handler arena
//! and emits every reference-count operation on both the normal and the
//! error exit of each lowered opcode. Lowering functions are keyed by
//! opcode through `lower_for`.

pub mod stack;

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::absint::{AbsIntError, AbstractInterpreter};
use crate::backend::{CodegenBackend, CodegenError};
use crate::ehandling::{ExcVars, HandlerArena};
use crate::helpers::id;
use crate::il::{BranchKind, CompiledMethod, IlEmitter, IlLocal, IlType, Label, MethodSig};
use crate::lattice::AbstractValueKind;
use crate::vm::code::CodeObject;
use crate::vm::frame::Frame;
use crate::vm::opcode::{CompareKind, Instr, Opcode};
use self::stack::StackEntryKind;

/// Error during compilation. Any of these aborts the compilation and the
/// dispatcher permanently falls back to the interpreter for the code
/// object.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("analysis failed: {0}")]
    AbsInt(#[from] AbsIntError),
    #[error("backend failed: {0}")]
    Codegen(#[from] CodegenError),
    #[error("unsupported opcode {op:?} at offset {offset}")]
    UnsupportedOpcode { op: Opcode, offset: usize },
    #[error("no analysis snapshot for offset {0}")]
    MissingSnapshot(usize),
    #[error("operand stack inconsistency at offset {0}")]
    StackMismatch(usize),
    #[error("malformed block structure at offset {0}")]
    MalformedBlocks(usize),
    #[error("generator and coroutine code objects are interpreter-bound")]
    GeneratorCode,
}

static UNNAMED_LOCAL: Lazy<String> = Lazy::new(|| "<local>".to_string());

type LowerFn = for<'a> fn(&mut CompilerDriver<'a>, &Instr) -> Result<(), CompileError>;

/// The per-code-object compiler. Single-use: construct, then `compile`.
pub struct CompilerDriver<'a> {
    code: &'a CodeObject,
    ai: &'a AbstractInterpreter<'a>,
    il: IlEmitter,
    instrs: Vec<Instr>,
    cursor: usize,
    /// Parallel kind sequence for the IL operand stack.
    stack: Vec<StackEntryKind>,
    handlers: HandlerArena,
    current_handler: usize,
    /// Bytecode offset -> IL label for branch targets.
    offset_labels: FxHashMap<usize, Label>,
    /// Handler entry offset -> setup handler index.
    handler_entries: FxHashMap<usize, usize>,
    /// Setup handler index -> in-except handler created at its entry.
    in_except_of: FxHashMap<usize, usize>,
    /// AI scope id -> handler arena index.
    scope_to_handler: FxHashMap<usize, usize>,
    /// Offsets inside an except-dispatch region -> setup handler index.
    handler_region: FxHashMap<usize, usize>,
    lasti: IlLocal,
    retval: IlLocal,
    ret_label: Label,
    last_falls_through: bool,
}

impl<'a> CompilerDriver<'a> {
    pub fn new(
        code: &'a CodeObject,
        ai: &'a AbstractInterpreter<'a>,
    ) -> Result<CompilerDriver<'a>, CompileError> {
        if code.is_generator() {
            return Err(CompileError::GeneratorCode);
        }
        let mut il = IlEmitter::new(MethodSig {
            ret: IlType::Ptr,
            params: vec![IlType::Ptr, IlType::Ptr],
        });
        let lasti = il.define_local_no_cache(IlType::Ptr);
        let retval = il.define_local_no_cache(IlType::Ptr);
        let ret_label = il.define_label();
        let instrs = ai.instrs().to_vec();
        Ok(CompilerDriver {
            code,
            ai,
            il,
            instrs,
            cursor: 0,
            stack: Vec::new(),
            handlers: HandlerArena::new(),
            current_handler: 0,
            offset_labels: FxHashMap::default(),
            handler_entries: FxHashMap::default(),
            in_except_of: FxHashMap::default(),
            scope_to_handler: FxHashMap::default(),
            handler_region: FxHashMap::default(),
            lasti,
            retval,
            ret_label,
            last_falls_through: false,
        })
    }

    /// Translate the whole code object and hand the IL to the backend.
    pub fn compile(mut self, backend: &dyn CodegenBackend) -> Result<CompiledMethod, CompileError> {
        self.emit_prologue();

        for i in 0..self.instrs.len() {
            self.cursor = i;
            let instr = self.instrs[i];
            if !self.ai.reached(instr.offset) {
                continue;
            }
            self.sync_at_offset(instr.offset)?;
            self.emit_lasti_update(instr.offset);
            lower_for(instr.op)(&mut self, &instr)?;
            self.last_falls_through = instr_falls_through(&instr);
        }

        self.emit_epilogue();
        let extra = self.code.max_stack as u32 + 100;
        Ok(self.il.compile(backend, extra)?)
    }

    // ===== Walk bookkeeping =====

    fn emit_prologue(&mut self) {
        // Labels for every branch target up front.
        for i in 0..self.instrs.len() {
            if let Some(target) = self.instrs[i].branch_target() {
                if !self.offset_labels.contains_key(&target) {
                    let label = self.il.define_label();
                    self.offset_labels.insert(target, label);
                }
            }
        }

        // Root handler: raises with no enclosing try terminate the method.
        let root_raise = self.il.define_label();
        let root_reraise = self.il.define_label();
        let vars = self.define_exc_vars();
        self.handlers.set_root_handler(root_raise, root_reraise, vars);
        self.scope_to_handler.insert(0, 0);

        // Frame entry: push the frame, cache the last-instruction slot,
        // clear the return value.
        self.load_frame();
        self.il.emit_call(id::PUSH_FRAME, 1);
        self.load_frame();
        self.il.ld_ptr(Frame::LASTI_OFFSET);
        self.il.add();
        self.il.st_loc(self.lasti);
        self.il.load_null();
        self.il.st_loc(self.retval);
    }

    fn emit_epilogue(&mut self) {
        // Success exit: frame popped, spilled return value handed back.
        self.il.mark_label(self.ret_label);
        self.load_frame();
        self.il.emit_call(id::POP_FRAME, 1);
        self.il.ld_loc(self.retval);
        self.il.ret(1);

        // Error exit (the root handler's raise/reraise target).
        let root_raise = self.handlers.root().raise_label;
        let root_reraise = self.handlers.root().reraise_label;
        self.il.mark_label(root_raise);
        self.il.mark_label(root_reraise);
        self.load_frame();
        self.il.emit_call(id::POP_FRAME, 1);
        self.il.load_null();
        self.il.ret(1);

        // Out-of-line raise blocks for every nested handler.
        for idx in 1..self.handlers.len() {
            let (raise, reraise, handler_label, vars, parent, in_except, snapshot) = {
                let h = self.handlers.get(idx);
                (
                    h.raise_label,
                    h.reraise_label,
                    h.handler_label,
                    h.vars,
                    h.parent.unwrap_or(0),
                    h.in_except_handler,
                    h.stack_snapshot.clone(),
                )
            };
            let parent_raise = self.handlers.get(parent).raise_label;
            let parent_depth = self.handlers.get(parent).stack_snapshot.len();
            if in_except {
                // A raise inside an except clause restores the previous
                // exception state, releases this handler's stack region,
                // and propagates outward.
                self.il.mark_label(raise);
                self.il.mark_label(reraise);
                self.emit_unwind_exception(vars);
                self.emit_snapshot_unwind(&snapshot, parent_depth);
                self.il.branch(BranchKind::Always, parent_raise);
            } else {
                self.il.mark_label(raise);
                self.emit_prepare_exception(vars);
                if let Some(entry) = handler_label {
                    self.il.branch(BranchKind::Always, entry);
                }
                // Propagation past this handler: release its stack region
                // before re-dispatching in the enclosing scope.
                self.il.mark_label(reraise);
                self.emit_snapshot_unwind(&snapshot, parent_depth);
                self.il.branch(BranchKind::Always, parent_raise);
            }
        }
    }

    /// Release the part of a handler's stack snapshot that lies above the
    /// enclosing handler's depth (used when an exception propagates past
    /// the handler).
    fn emit_snapshot_unwind(&mut self, snapshot: &[StackEntryKind], parent_depth: usize) {
        if snapshot.len() <= parent_depth {
            return;
        }
        for kind in snapshot[parent_depth..].iter().rev() {
            match kind {
                StackEntryKind::Object => self.il.emit_call(id::DECREF, 1),
                StackEntryKind::Value => self.il.pop(),
            }
        }
    }

    /// Align the driver with control-flow context at `offset`: mark its
    /// label, reset or verify the kind stack, and enter except scopes.
    fn sync_at_offset(&mut self, offset: usize) -> Result<(), CompileError> {
        let is_label = self.offset_labels.contains_key(&offset);
        if !self.last_falls_through {
            // Reached by branches only: adopt the analyzer's stack shape.
            let depth = self
                .ai
                .get_stack_info(offset)
                .ok_or(CompileError::MissingSnapshot(offset))?
                .len();
            self.stack = vec![StackEntryKind::Object; depth];
            self.current_handler = self.handler_for_reset(offset);
        } else if is_label {
            let depth = self
                .ai
                .get_stack_info(offset)
                .ok_or(CompileError::MissingSnapshot(offset))?
                .len();
            if self.stack.len() != depth
                || self.stack.iter().any(|k| *k == StackEntryKind::Value)
            {
                return Err(CompileError::StackMismatch(offset));
            }
        }
        if is_label {
            let label = self.offset_labels[&offset];
            self.il.mark_label(label);
        }
        if let Some(&setup) = self.handler_entries.get(&offset) {
            self.enter_except_scope(offset, setup)?;
        }
        Ok(())
    }

    fn handler_for_reset(&self, offset: usize) -> usize {
        if let Some(&setup) = self.handler_region.get(&offset) {
            if let Some(&h2) = self.in_except_of.get(&setup) {
                return h2;
            }
        }
        let scope = self.ai.scope_at(offset);
        self.scope_to_handler.get(&scope).copied().unwrap_or(0)
    }

    fn enter_except_scope(&mut self, offset: usize, setup: usize) -> Result<(), CompileError> {
        if let Some(&existing) = self.in_except_of.get(&setup) {
            self.current_handler = existing;
            return Ok(());
        }
        let (snapshot, parent, vars, in_try_finally) = {
            let h = self.handlers.get(setup);
            (
                h.stack_snapshot.clone(),
                h.parent.unwrap_or(0),
                h.vars,
                h.in_try_finally,
            )
        };
        let raise = self.il.define_label();
        let reraise = self.il.define_label();
        let entry = *self
            .offset_labels
            .get(&offset)
            .ok_or(CompileError::MalformedBlocks(offset))?;
        let h2 = self.handlers.add_in_try_handler(
            raise,
            reraise,
            entry,
            snapshot,
            parent,
            vars,
            in_try_finally,
        );
        self.in_except_of.insert(setup, h2);
        self.current_handler = h2;
        Ok(())
    }

    // ===== Emission helpers =====

    fn load_frame(&mut self) {
        self.il.ld_arg(1);
    }

    fn emit_lasti_update(&mut self, offset: usize) {
        self.il.ld_loc(self.lasti);
        self.il.ld_i4(offset as i32);
        self.il.st_ind_i4();
    }

    fn define_exc_vars(&mut self) -> ExcVars {
        ExcVars {
            prev_exc: self.il.define_local_no_cache(IlType::Ptr),
            prev_val: self.il.define_local_no_cache(IlType::Ptr),
            prev_tb: self.il.define_local_no_cache(IlType::Ptr),
        }
    }

    fn name_ptr(&self, index: usize) -> usize {
        self.code
            .names
            .get(index)
            .map(|s| s as *const String as usize)
            .unwrap_or_else(|| &*UNNAMED_LOCAL as *const String as usize)
    }

    fn varname_ptr(&self, index: usize) -> usize {
        self.code
            .varnames
            .get(index)
            .map(|s| s as *const String as usize)
            .unwrap_or_else(|| &*UNNAMED_LOCAL as *const String as usize)
    }

    fn pop_kind(&mut self, offset: usize) -> Result<StackEntryKind, CompileError> {
        self.stack.pop().ok_or(CompileError::StackMismatch(offset))
    }

    fn push_object(&mut self) {
        self.stack.push(StackEntryKind::Object);
    }

    fn spill(&mut self, offset: usize) -> Result<(IlLocal, StackEntryKind), CompileError> {
        let kind = self.pop_kind(offset)?;
        let local = self.il.define_local(kind.il_type());
        self.il.st_loc(local);
        Ok((local, kind))
    }

    fn reload(&mut self, spilled: (IlLocal, StackEntryKind)) {
        self.il.ld_loc(spilled.0);
        self.il.free_local(spilled.0);
        self.stack.push(spilled.1);
    }

    /// Inline reference-count increment of the value on top of the stack.
    /// With `maybe_tagged`, a tagged small integer skips the heap touch.
    fn emit_incref(&mut self, maybe_tagged: bool) {
        let skip = if maybe_tagged {
            let skip = self.il.define_label();
            self.il.dup();
            self.il.ld_ptr(1);
            self.il.bitwise_and();
            self.il.branch(BranchKind::True, skip);
            Some(skip)
        } else {
            None
        };
        // The refcount is the first field of the heap cell.
        self.il.dup();
        self.il.dup();
        self.il.ld_ind_ptr();
        self.il.ld_ptr(1);
        self.il.add();
        self.il.st_ind_ptr();
        if let Some(skip) = skip {
            self.il.mark_label(skip);
        }
    }

    /// Unwind the tracked stack down to the current handler's snapshot
    /// depth (releasing object references) and branch to its raise label.
    /// Emitted on error paths only; the tracked stack is not mutated.
    fn branch_raise(&mut self) {
        let (depth, raise) = {
            let h = self.handlers.get(self.current_handler);
            (h.stack_snapshot.len(), h.raise_label)
        };
        let live: Vec<StackEntryKind> = if self.stack.len() > depth {
            self.stack[depth..].to_vec()
        } else {
            Vec::new()
        };
        for kind in live.iter().rev() {
            match kind {
                StackEntryKind::Object => self.il.emit_call(id::DECREF, 1),
                StackEntryKind::Value => self.il.pop(),
            }
        }
        self.il.branch(BranchKind::Always, raise);
    }

    /// Null-check the helper result on top of the stack.
    fn emit_error_check(&mut self) {
        let ok = self.il.define_label();
        self.il.dup();
        self.il.branch(BranchKind::True, ok);
        self.il.pop();
        self.branch_raise();
        self.il.mark_label(ok);
    }

    /// Check an i32 status result (nonzero = error, already consumed).
    fn emit_status_check(&mut self) {
        let ok = self.il.define_label();
        self.il.branch(BranchKind::False, ok);
        self.branch_raise();
        self.il.mark_label(ok);
    }

    fn emit_prepare_exception(&mut self, vars: ExcVars) {
        let exc = self.il.define_local(IlType::Ptr);
        let val = self.il.define_local(IlType::Ptr);
        let tb = self.il.define_local(IlType::Ptr);
        self.il.ld_loc_addr(exc);
        self.il.ld_loc_addr(val);
        self.il.ld_loc_addr(tb);
        self.il.ld_loc_addr(vars.prev_exc);
        self.il.ld_loc_addr(vars.prev_val);
        self.il.ld_loc_addr(vars.prev_tb);
        self.il.emit_call(id::PREPARE_EXCEPTION, 6);
        self.il.ld_loc(tb);
        self.il.ld_loc(val);
        self.il.ld_loc(exc);
        self.il.free_local(exc);
        self.il.free_local(val);
        self.il.free_local(tb);
    }

    fn emit_unwind_exception(&mut self, vars: ExcVars) {
        self.il.ld_loc(vars.prev_exc);
        self.il.ld_loc(vars.prev_val);
        self.il.ld_loc(vars.prev_tb);
        self.il.emit_call(id::UNWIND_EXCEPTION, 3);
    }

    fn emit_periodic_work(&mut self) {
        let ok = self.il.define_label();
        self.il.emit_call(id::PERIODIC_WORK, 0);
        self.il.branch(BranchKind::False, ok);
        self.branch_raise();
        self.il.mark_label(ok);
    }

    /// Address of the frame's slot array entry `index`.
    fn load_slot_addr(&mut self, index: usize) {
        self.load_frame();
        self.il.ld_ptr(Frame::LOCALS_OFFSET);
        self.il.add();
        self.il.ld_ind_ptr();
        self.il.ld_ptr(index * std::mem::size_of::<usize>());
        self.il.add();
    }

    fn load_slot_value(&mut self, index: usize) {
        self.load_slot_addr(index);
        self.il.ld_ind_ptr();
    }

    fn target_label(&self, instr: &Instr) -> Result<Label, CompileError> {
        let target = instr
            .branch_target()
            .ok_or(CompileError::MalformedBlocks(instr.offset))?;
        self.offset_labels
            .get(&target)
            .copied()
            .ok_or(CompileError::MalformedBlocks(instr.offset))
    }

    // ===== Representation decisions =====

    fn ai_stack(&self, offset: usize) -> Result<&[crate::lattice::AbstractValue], CompileError> {
        self.ai
            .get_stack_info(offset)
            .ok_or(CompileError::MissingSnapshot(offset))
    }

    /// Kinds of the top two abstract stack entries at `offset`.
    fn top_pair_kinds(
        &self,
        offset: usize,
    ) -> Result<(AbstractValueKind, AbstractValueKind), CompileError> {
        let stack = self.ai_stack(offset)?;
        if stack.len() < 2 {
            return Err(CompileError::StackMismatch(offset));
        }
        Ok((stack[stack.len() - 2].kind(), stack[stack.len() - 1].kind()))
    }

    fn is_float_pair(&self, offset: usize) -> bool {
        matches!(
            self.top_pair_kinds(offset),
            Ok((AbstractValueKind::Float, AbstractValueKind::Float))
        )
    }

    fn is_int_pair(&self, offset: usize) -> bool {
        use AbstractValueKind as K;
        matches!(
            self.top_pair_kinds(offset),
            Ok((K::Integer | K::Bool, K::Integer | K::Bool))
        )
    }

    /// Whether the instruction after the current one consumes an unboxed
    /// float result directly (so boxing can be skipped).
    fn next_tolerates_unboxed(&self) -> bool {
        let next = match self.instrs.get(self.cursor + 1) {
            Some(i) => *i,
            None => return false,
        };
        // A merge point needs boxed entries from every edge.
        if self.offset_labels.contains_key(&next.offset) {
            return false;
        }
        match next.op {
            Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinaryMultiply
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryModulo
            | Opcode::BinaryPower
            | Opcode::InplaceAdd
            | Opcode::InplaceSubtract
            | Opcode::InplaceMultiply
            | Opcode::InplaceTrueDivide
            | Opcode::InplaceFloorDivide
            | Opcode::InplaceModulo
            | Opcode::InplacePower => self.is_float_pair(next.offset),
            Opcode::UnaryNegative => {
                matches!(
                    self.ai_stack(next.offset).map(|s| s.last().map(|v| v.kind())),
                    Ok(Some(AbstractValueKind::Float))
                )
            }
            Opcode::CompareOp => {
                CompareKind::from_arg(next.arg) != Some(CompareKind::ExcMatch)
                    && self.is_float_pair(next.offset)
            }
            _ => false,
        }
    }

    /// Bring the top two entries (a proven float pair) into raw f64 form.
    fn unbox_float_pair(&mut self, offset: usize) -> Result<(), CompileError> {
        let rhs = self.pop_kind(offset)?;
        let lhs = self.pop_kind(offset)?;
        match (lhs, rhs) {
            (StackEntryKind::Value, StackEntryKind::Value) => {}
            (StackEntryKind::Value, StackEntryKind::Object) => {
                self.il.emit_call(id::FLOAT_TO_DOUBLE, 1);
            }
            (StackEntryKind::Object, StackEntryKind::Value) => {
                let tmp = self.il.define_local(IlType::F64);
                self.il.st_loc(tmp);
                self.il.emit_call(id::FLOAT_TO_DOUBLE, 1);
                self.il.ld_loc(tmp);
                self.il.free_local(tmp);
            }
            (StackEntryKind::Object, StackEntryKind::Object) => {
                let tmp = self.il.define_local(IlType::Ptr);
                self.il.st_loc(tmp);
                self.il.emit_call(id::FLOAT_TO_DOUBLE, 1);
                self.il.ld_loc(tmp);
                self.il.free_local(tmp);
                self.il.emit_call(id::FLOAT_TO_DOUBLE, 1);
            }
        }
        Ok(())
    }

    /// Box or keep the raw f64 result of a float fast path.
    fn finish_float_result(&mut self) {
        if self.next_tolerates_unboxed() {
            self.stack.push(StackEntryKind::Value);
        } else {
            self.il.emit_call(id::FLOAT_FROM_DOUBLE, 1);
            self.push_object();
        }
    }

    /// Guard the raw f64 divisor on top of the stack against zero.
    fn emit_float_zero_check(&mut self) {
        let ok = self.il.define_label();
        self.il.dup();
        self.il.ld_r8(0.0);
        self.il.branch(BranchKind::NotEqual, ok);
        self.il.pop();
        self.il.pop();
        self.il.emit_call(id::FLOAT_ZERO_DIVISION, 0);
        self.branch_raise();
        self.il.mark_label(ok);
    }

    /// Pop `count` stack values into a fresh scratch array, preserving
    /// their stack order in the array. Returns the array local.
    fn stash_to_array(
        &mut self,
        offset: usize,
        count: usize,
        slots: usize,
    ) -> Result<IlLocal, CompileError> {
        let arr = self.il.define_local(IlType::Ptr);
        self.il.new_array(slots as u32);
        self.il.st_loc(arr);
        for i in (0..count).rev() {
            let tmp = self.il.define_local(IlType::Ptr);
            self.il.st_loc(tmp);
            self.pop_kind(offset)?;
            self.il.st_elem(arr, i as u32, tmp);
            self.il.free_local(tmp);
        }
        Ok(arr)
    }
}

fn instr_falls_through(instr: &Instr) -> bool {
    instr.falls_through() && instr.op != Opcode::Reraise
}

/// Lowering table, keyed by opcode.
pub(crate) fn lower_for(op: Opcode) -> LowerFn {
    match op {
        Opcode::Nop => l_nop,
        Opcode::PopTop => l_pop_top,
        Opcode::RotTwo => l_rot_two,
        Opcode::RotThree => l_rot_three,
        Opcode::RotFour => l_rot_four,
        Opcode::DupTop => l_dup_top,
        Opcode::DupTopTwo => l_dup_top_two,
        Opcode::UnaryPositive | Opcode::UnaryNegative | Opcode::UnaryNot | Opcode::UnaryInvert => {
            l_unary
        }
        Opcode::BinaryAdd
        | Opcode::BinarySubtract
        | Opcode::BinaryMultiply
        | Opcode::BinaryTrueDivide
        | Opcode::BinaryFloorDivide
        | Opcode::BinaryModulo
        | Opcode::BinaryPower
        | Opcode::BinaryMatrixMultiply
        | Opcode::BinaryLshift
        | Opcode::BinaryRshift
        | Opcode::BinaryAnd
        | Opcode::BinaryOr
        | Opcode::BinaryXor
        | Opcode::BinarySubscr
        | Opcode::InplaceAdd
        | Opcode::InplaceSubtract
        | Opcode::InplaceMultiply
        | Opcode::InplaceTrueDivide
        | Opcode::InplaceFloorDivide
        | Opcode::InplaceModulo
        | Opcode::InplacePower
        | Opcode::InplaceMatrixMultiply
        | Opcode::InplaceLshift
        | Opcode::InplaceRshift
        | Opcode::InplaceAnd
        | Opcode::InplaceOr
        | Opcode::InplaceXor => l_binary,
        Opcode::StoreSubscr => l_store_subscr,
        Opcode::DeleteSubscr => l_delete_subscr,
        Opcode::LoadConst => l_load_const,
        Opcode::LoadFast => l_load_fast,
        Opcode::StoreFast => l_store_fast,
        Opcode::DeleteFast => l_delete_fast,
        Opcode::LoadName | Opcode::LoadGlobal => l_load_global,
        Opcode::StoreName | Opcode::StoreGlobal => l_store_global,
        Opcode::DeleteName | Opcode::DeleteGlobal => l_delete_global,
        Opcode::LoadDeref => l_load_deref,
        Opcode::StoreDeref => l_store_deref,
        Opcode::DeleteDeref => l_delete_deref,
        Opcode::LoadClassDeref => l_load_classderef,
        Opcode::LoadClosure => l_load_closure,
        Opcode::LoadAttr => l_load_attr,
        Opcode::StoreAttr => l_store_attr,
        Opcode::DeleteAttr => l_delete_attr,
        Opcode::CompareOp => l_compare_op,
        Opcode::IsOp => l_is_op,
        Opcode::ContainsOp => l_contains_op,
        Opcode::JumpForward | Opcode::JumpAbsolute => l_jump,
        Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => l_pop_jump,
        Opcode::JumpIfTrueOrPop | Opcode::JumpIfFalseOrPop => l_jump_or_pop,
        Opcode::ReturnValue => l_return,
        Opcode::GetIter => l_get_iter,
        Opcode::ForIter => l_for_iter,
        Opcode::SetupFinally => l_setup_finally,
        Opcode::PopBlock => l_pop_block,
        Opcode::PopExcept => l_pop_except,
        Opcode::Reraise => l_reraise,
        Opcode::RaiseVarargs => l_raise_varargs,
        Opcode::BuildTuple => l_build_tuple,
        Opcode::BuildList => l_build_list,
        Opcode::BuildSet => l_build_set,
        Opcode::BuildMap => l_build_map,
        Opcode::BuildSlice => l_build_slice,
        Opcode::BuildString => l_build_string,
        Opcode::ListAppend => l_list_append,
        Opcode::SetAdd => l_set_add,
        Opcode::MapAdd => l_map_add,
        Opcode::ListExtend | Opcode::SetUpdate | Opcode::DictUpdate | Opcode::DictMerge => {
            l_container_merge
        }
        Opcode::ListToTuple => l_list_to_tuple,
        Opcode::UnpackSequence => l_unpack_sequence,
        Opcode::UnpackEx => l_unpack_ex,
        Opcode::CallFunction => l_call_function,
        Opcode::CallFunctionKw => l_call_function_kw,
        Opcode::CallFunctionEx => l_call_function_ex,
        Opcode::LoadMethod => l_load_method,
        Opcode::CallMethod => l_call_method,
        Opcode::MakeFunction => l_make_function,
        Opcode::FormatValue => l_format_value,
        Opcode::ImportName => l_import_name,
        Opcode::ImportFrom => l_import_from,
        Opcode::ImportStar => l_import_star,
        Opcode::LoadBuildClass => l_load_build_class,
        Opcode::SetupAnnotations => l_setup_annotations,
        Opcode::LoadAssertionError => l_load_assertion_error,
        Opcode::ExtendedArg => l_unsupported,
    }
}

fn l_unsupported(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let _ = d;
    Err(CompileError::UnsupportedOpcode {
        op: instr.op,
        offset: instr.offset,
    })
}

fn l_nop(_d: &mut CompilerDriver<'_>, _instr: &Instr) -> Result<(), CompileError> {
    Ok(())
}

fn l_pop_top(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    match d.pop_kind(instr.offset)? {
        StackEntryKind::Object => d.il.emit_call(id::DECREF, 1),
        StackEntryKind::Value => d.il.pop(),
    }
    Ok(())
}

fn l_rot_two(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let top = d.spill(instr.offset)?;
    let second = d.spill(instr.offset)?;
    d.reload(top);
    d.reload(second);
    Ok(())
}

fn l_rot_three(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let top = d.spill(instr.offset)?;
    let second = d.spill(instr.offset)?;
    let third = d.spill(instr.offset)?;
    d.reload(top);
    d.reload(third);
    d.reload(second);
    Ok(())
}

fn l_rot_four(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let top = d.spill(instr.offset)?;
    let second = d.spill(instr.offset)?;
    let third = d.spill(instr.offset)?;
    let fourth = d.spill(instr.offset)?;
    d.reload(top);
    d.reload(fourth);
    d.reload(third);
    d.reload(second);
    Ok(())
}

fn l_dup_top(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    if d.stack.last() != Some(&StackEntryKind::Object) {
        return Err(CompileError::StackMismatch(instr.offset));
    }
    d.il.dup();
    d.emit_incref(true);
    d.push_object();
    Ok(())
}

fn l_dup_top_two(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let b = d.spill(instr.offset)?;
    let a = d.spill(instr.offset)?;
    if a.1 != StackEntryKind::Object || b.1 != StackEntryKind::Object {
        return Err(CompileError::StackMismatch(instr.offset));
    }
    d.il.ld_loc(a.0);
    d.il.ld_loc(b.0);
    d.il.ld_loc(a.0);
    d.emit_incref(true);
    d.il.ld_loc(b.0);
    d.emit_incref(true);
    d.il.free_local(a.0);
    d.il.free_local(b.0);
    d.stack.push(StackEntryKind::Object);
    d.stack.push(StackEntryKind::Object);
    d.stack.push(StackEntryKind::Object);
    d.stack.push(StackEntryKind::Object);
    Ok(())
}

fn l_unary(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let top_kind = d
        .ai_stack(instr.offset)?
        .last()
        .map(|v| v.kind())
        .unwrap_or(AbstractValueKind::Any);
    if instr.op == Opcode::UnaryNegative && top_kind == AbstractValueKind::Float {
        // Unboxed negate.
        let kind = d.pop_kind(instr.offset)?;
        if kind == StackEntryKind::Object {
            d.il.emit_call(id::FLOAT_TO_DOUBLE, 1);
        }
        d.il.neg();
        d.finish_float_result();
        return Ok(());
    }
    let helper = match instr.op {
        Opcode::UnaryPositive => id::UNARY_POSITIVE,
        Opcode::UnaryNegative => id::UNARY_NEGATIVE,
        Opcode::UnaryNot => id::UNARY_NOT,
        _ => id::UNARY_INVERT,
    };
    d.pop_kind(instr.offset)?;
    d.il.emit_call(helper, 1);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn generic_binary_helper(op: Opcode) -> u32 {
    match op {
        Opcode::BinaryAdd => id::ADD,
        Opcode::InplaceAdd => id::INPLACE_ADD,
        Opcode::BinarySubtract | Opcode::InplaceSubtract => id::SUBTRACT,
        Opcode::BinaryMultiply | Opcode::InplaceMultiply => id::MULTIPLY,
        Opcode::BinaryTrueDivide | Opcode::InplaceTrueDivide => id::TRUE_DIVIDE,
        Opcode::BinaryFloorDivide | Opcode::InplaceFloorDivide => id::FLOOR_DIVIDE,
        Opcode::BinaryModulo | Opcode::InplaceModulo => id::MODULO,
        Opcode::BinaryPower | Opcode::InplacePower => id::POWER,
        Opcode::BinaryMatrixMultiply | Opcode::InplaceMatrixMultiply => id::MATRIX_MULTIPLY,
        Opcode::BinaryLshift | Opcode::InplaceLshift => id::LSHIFT,
        Opcode::BinaryRshift | Opcode::InplaceRshift => id::RSHIFT,
        Opcode::BinaryAnd | Opcode::InplaceAnd => id::BIT_AND,
        Opcode::BinaryOr | Opcode::InplaceOr => id::BIT_OR,
        Opcode::BinaryXor | Opcode::InplaceXor => id::BIT_XOR,
        Opcode::BinarySubscr => id::SUBSCR,
        _ => unreachable!("not a binary opcode"),
    }
}

fn tagged_int_helper(op: Opcode) -> Option<u32> {
    match op {
        Opcode::BinaryAdd | Opcode::InplaceAdd => Some(id::TAGGED_ADD),
        Opcode::BinarySubtract | Opcode::InplaceSubtract => Some(id::TAGGED_SUB),
        Opcode::BinaryMultiply | Opcode::InplaceMultiply => Some(id::TAGGED_MUL),
        Opcode::BinaryLshift | Opcode::InplaceLshift => Some(id::TAGGED_LSHIFT),
        Opcode::BinaryPower | Opcode::InplacePower => Some(id::TAGGED_POWER),
        _ => None,
    }
}

fn float_fast_path(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinaryMultiply
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryModulo
            | Opcode::BinaryPower
            | Opcode::InplaceAdd
            | Opcode::InplaceSubtract
            | Opcode::InplaceMultiply
            | Opcode::InplaceTrueDivide
            | Opcode::InplaceFloorDivide
            | Opcode::InplaceModulo
            | Opcode::InplacePower
    )
}

fn l_binary(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    // Float pair proven by the analyzer: native float arithmetic.
    if float_fast_path(instr.op) && d.is_float_pair(instr.offset) {
        d.unbox_float_pair(instr.offset)?;
        match instr.op {
            Opcode::BinaryAdd | Opcode::InplaceAdd => d.il.add(),
            Opcode::BinarySubtract | Opcode::InplaceSubtract => d.il.sub(),
            Opcode::BinaryMultiply | Opcode::InplaceMultiply => d.il.mul(),
            Opcode::BinaryTrueDivide | Opcode::InplaceTrueDivide => {
                d.emit_float_zero_check();
                d.il.div();
            }
            Opcode::BinaryFloorDivide | Opcode::InplaceFloorDivide => {
                d.emit_float_zero_check();
                d.il.div();
                d.il.emit_call(id::FLOAT_FLOOR, 1);
            }
            Opcode::BinaryModulo | Opcode::InplaceModulo => {
                d.emit_float_zero_check();
                d.il.emit_call(id::FLOAT_MODULUS, 2);
            }
            Opcode::BinaryPower | Opcode::InplacePower => {
                d.il.emit_call(id::FLOAT_POWER, 2);
            }
            _ => unreachable!(),
        }
        d.finish_float_result();
        return Ok(());
    }

    // Integer pair: overflow-aware tagged fast path helpers.
    let helper = if d.is_int_pair(instr.offset) {
        tagged_int_helper(instr.op).unwrap_or_else(|| generic_binary_helper(instr.op))
    } else {
        generic_binary_helper(instr.op)
    };
    d.pop_kind(instr.offset)?;
    d.pop_kind(instr.offset)?;
    d.il.emit_call(helper, 2);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_store_subscr(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.pop_kind(instr.offset)?;
    d.pop_kind(instr.offset)?;
    d.pop_kind(instr.offset)?;
    d.il.emit_call(id::STORE_SUBSCR, 3);
    d.emit_status_check();
    Ok(())
}

fn l_delete_subscr(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.pop_kind(instr.offset)?;
    d.pop_kind(instr.offset)?;
    d.il.emit_call(id::DELETE_SUBSCR, 2);
    d.emit_status_check();
    Ok(())
}

fn l_load_const(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let c = d
        .code
        .const_at(instr.arg as usize)
        .ok_or(CompileError::StackMismatch(instr.offset))?;
    d.il.ld_ptr(c.0);
    if !c.is_tagged() {
        d.emit_incref(false);
    }
    d.push_object();
    Ok(())
}

fn l_load_fast(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let index = instr.arg as usize;
    d.load_slot_value(index);
    let needs_check = d
        .ai
        .get_local_info(instr.offset, index)
        .map(|info| info.maybe_undefined)
        .unwrap_or(true);
    if needs_check {
        let ok = d.il.define_label();
        d.il.dup();
        d.il.branch(BranchKind::True, ok);
        d.il.pop();
        let name = d.varname_ptr(index);
        d.il.ld_ptr(name);
        d.il.emit_call(id::UNBOUND_LOCAL, 1);
        d.branch_raise();
        d.il.mark_label(ok);
    }
    d.emit_incref(true);
    d.push_object();
    Ok(())
}

fn l_store_fast(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let index = instr.arg as usize;
    d.pop_kind(instr.offset)?;
    let value = d.il.define_local(IlType::Ptr);
    d.il.st_loc(value);
    // When the analyzer proves the slot was never assigned on any path,
    // the old-value read and release are skipped entirely.
    let definitely_unbound = d
        .ai
        .get_local_info(instr.offset, index)
        .map(|info| info.value.kind() == AbstractValueKind::Undefined)
        .unwrap_or(false);
    if definitely_unbound {
        d.load_slot_addr(index);
        d.il.ld_loc(value);
        d.il.st_ind_ptr();
    } else {
        // Load the old occupant, overwrite the slot, then release the old
        // value: the slot never holds a freed reference.
        d.load_slot_value(index);
        d.load_slot_addr(index);
        d.il.ld_loc(value);
        d.il.st_ind_ptr();
        d.il.emit_call(id::DECREF, 1);
    }
    d.il.free_local(value);
    Ok(())
}

fn l_delete_fast(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let index = instr.arg as usize;
    // Unbound delete raises; the old value is released after the slot is
    // cleared.
    let ok = d.il.define_label();
    d.load_slot_value(index);
    d.il.dup();
    d.il.branch(BranchKind::True, ok);
    d.il.pop();
    let name = d.varname_ptr(index);
    d.il.ld_ptr(name);
    d.il.emit_call(id::UNBOUND_LOCAL, 1);
    d.branch_raise();
    d.il.mark_label(ok);
    d.load_slot_addr(index);
    d.il.load_null();
    d.il.st_ind_ptr();
    d.il.emit_call(id::DECREF, 1);
    Ok(())
}

fn l_load_global(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.load_frame();
    let name = d.name_ptr(instr.arg as usize);
    d.il.ld_ptr(name);
    d.il.emit_call(id::LOAD_GLOBAL, 2);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_store_global(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.pop_kind(instr.offset)?;
    d.load_frame();
    let name = d.name_ptr(instr.arg as usize);
    d.il.ld_ptr(name);
    d.il.emit_call(id::STORE_GLOBAL, 3);
    d.emit_status_check();
    Ok(())
}

fn l_delete_global(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.load_frame();
    let name = d.name_ptr(instr.arg as usize);
    d.il.ld_ptr(name);
    d.il.emit_call(id::DELETE_GLOBAL, 2);
    d.emit_status_check();
    Ok(())
}

fn l_load_deref(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.load_frame();
    d.il.ld_i4(instr.arg as i32);
    d.il.emit_call(id::CELL_GET, 2);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_store_deref(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.pop_kind(instr.offset)?;
    d.load_frame();
    d.il.ld_i4(instr.arg as i32);
    d.il.emit_call(id::CELL_SET, 3);
    Ok(())
}

fn l_delete_deref(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.load_frame();
    d.il.ld_i4(instr.arg as i32);
    d.il.emit_call(id::CELL_CLEAR, 2);
    d.emit_status_check();
    Ok(())
}

fn l_load_classderef(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.load_frame();
    d.il.ld_i4(instr.arg as i32);
    d.il.emit_call(id::LOAD_CLASSDEREF, 2);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_load_closure(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let slot = d.code.local_count as usize + instr.arg as usize;
    d.load_slot_value(slot);
    d.emit_incref(false);
    d.push_object();
    Ok(())
}

fn l_load_attr(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.pop_kind(instr.offset)?;
    let name = d.name_ptr(instr.arg as usize);
    d.il.ld_ptr(name);
    d.il.emit_call(id::LOAD_ATTR, 2);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_store_attr(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.pop_kind(instr.offset)?;
    d.pop_kind(instr.offset)?;
    let name = d.name_ptr(instr.arg as usize);
    d.il.ld_ptr(name);
    d.il.emit_call(id::STORE_ATTR, 3);
    d.emit_status_check();
    Ok(())
}

fn l_delete_attr(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.pop_kind(instr.offset)?;
    let name = d.name_ptr(instr.arg as usize);
    d.il.ld_ptr(name);
    d.il.emit_call(id::DELETE_ATTR, 2);
    d.emit_status_check();
    Ok(())
}

fn l_compare_op(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let kind = CompareKind::from_arg(instr.arg).ok_or(CompileError::MalformedBlocks(instr.offset))?;
    if kind == CompareKind::ExcMatch {
        d.pop_kind(instr.offset)?;
        d.pop_kind(instr.offset)?;
        d.il.emit_call(id::COMPARE_EXCEPTIONS, 2);
        d.emit_error_check();
        d.push_object();
        return Ok(());
    }
    if d.is_float_pair(instr.offset) {
        d.unbox_float_pair(instr.offset)?;
        match kind {
            CompareKind::Eq => d.il.compare_eq(),
            CompareKind::Ne => d.il.compare_ne(),
            CompareKind::Lt => d.il.compare_lt(),
            CompareKind::Gt => d.il.compare_gt(),
            CompareKind::Le => d.il.compare_le_float(),
            CompareKind::Ge => d.il.compare_ge_float(),
            CompareKind::ExcMatch => unreachable!(),
        }
        d.il.emit_call(id::BOOL_FROM_I32, 1);
        d.push_object();
        return Ok(());
    }
    if d.is_int_pair(instr.offset) {
        let helper = match kind {
            CompareKind::Eq => id::TAGGED_EQ,
            CompareKind::Ne => id::TAGGED_NE,
            CompareKind::Lt => id::TAGGED_LT,
            CompareKind::Le => id::TAGGED_LE,
            CompareKind::Gt => id::TAGGED_GT,
            CompareKind::Ge => id::TAGGED_GE,
            CompareKind::ExcMatch => unreachable!(),
        };
        d.pop_kind(instr.offset)?;
        d.pop_kind(instr.offset)?;
        d.il.emit_call(helper, 2);
        d.il.emit_call(id::BOOL_FROM_I32, 1);
        d.push_object();
        return Ok(());
    }
    d.pop_kind(instr.offset)?;
    d.pop_kind(instr.offset)?;
    d.il.ld_i4(instr.arg as i32);
    d.il.emit_call(id::RICH_COMPARE, 3);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_is_op(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.pop_kind(instr.offset)?;
    d.pop_kind(instr.offset)?;
    let helper = if instr.arg == 0 { id::IS } else { id::IS_NOT };
    d.il.emit_call(helper, 2);
    d.push_object();
    Ok(())
}

fn l_contains_op(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.pop_kind(instr.offset)?;
    d.pop_kind(instr.offset)?;
    let helper = if instr.arg == 0 {
        id::CONTAINS
    } else {
        id::NOT_CONTAINS
    };
    d.il.emit_call(helper, 2);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_jump(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let target = instr
        .branch_target()
        .ok_or(CompileError::MalformedBlocks(instr.offset))?;
    if target <= instr.offset {
        d.emit_periodic_work();
    }
    let label = d.target_label(instr)?;
    let src_scope = d.ai.scope_at(instr.offset);
    let tgt_scope = d.ai.scope_at(target);
    if src_scope == tgt_scope {
        d.il.branch(BranchKind::Always, label);
        return Ok(());
    }
    // Leaving one or more try blocks: unwind each crossed handler's stack
    // region before branching.
    let src_chain = d.ai.scope_chain(src_scope);
    let tgt_chain = d.ai.scope_chain(tgt_scope);
    if tgt_chain.iter().any(|s| !src_chain.contains(s)) {
        return Err(CompileError::MalformedBlocks(instr.offset));
    }
    for scope in &src_chain {
        if tgt_chain.contains(scope) {
            break;
        }
        let handler = *d
            .scope_to_handler
            .get(scope)
            .ok_or(CompileError::MalformedBlocks(instr.offset))?;
        let depth = d.handlers.get(handler).stack_snapshot.len();
        while d.stack.len() > depth {
            match d.pop_kind(instr.offset)? {
                StackEntryKind::Object => d.il.emit_call(id::DECREF, 1),
                StackEntryKind::Value => d.il.pop(),
            }
        }
    }
    d.il.branch(BranchKind::Leave, label);
    Ok(())
}

fn l_pop_jump(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let target = instr
        .branch_target()
        .ok_or(CompileError::MalformedBlocks(instr.offset))?;
    if d.ai.scope_at(instr.offset) != d.ai.scope_at(target) {
        return Err(CompileError::MalformedBlocks(instr.offset));
    }
    if target <= instr.offset {
        d.emit_periodic_work();
    }
    let label = d.target_label(instr)?;
    d.pop_kind(instr.offset)?;
    // Probe truthiness (borrowing), release the value, then branch on the
    // saved flag.
    d.il.dup();
    d.il.emit_call(id::IS_TRUE, 1);
    let flag = d.il.define_local(IlType::I32);
    d.il.st_loc(flag);
    d.il.emit_call(id::DECREF, 1);
    d.il.ld_loc(flag);
    d.il.free_local(flag);
    let kind = if instr.op == Opcode::PopJumpIfTrue {
        BranchKind::True
    } else {
        BranchKind::False
    };
    d.il.branch(kind, label);
    Ok(())
}

fn l_jump_or_pop(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let target = instr
        .branch_target()
        .ok_or(CompileError::MalformedBlocks(instr.offset))?;
    if d.ai.scope_at(instr.offset) != d.ai.scope_at(target) {
        return Err(CompileError::MalformedBlocks(instr.offset));
    }
    let label = d.target_label(instr)?;
    d.il.dup();
    d.il.emit_call(id::IS_TRUE, 1);
    let kind = if instr.op == Opcode::JumpIfTrueOrPop {
        BranchKind::True
    } else {
        BranchKind::False
    };
    d.il.branch(kind, label);
    // Fall through: the value is discarded.
    d.pop_kind(instr.offset)?;
    d.il.emit_call(id::DECREF, 1);
    Ok(())
}

fn l_return(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.pop_kind(instr.offset)?;
    // Spill the return value (releasing any earlier spill).
    d.il.ld_loc(d.retval);
    d.il.emit_call(id::DECREF, 1);
    d.il.st_loc(d.retval);
    // Release everything still on the operand stack.
    while let Some(kind) = d.stack.pop() {
        match kind {
            StackEntryKind::Object => d.il.emit_call(id::DECREF, 1),
            StackEntryKind::Value => d.il.pop(),
        }
    }
    // Unwind intervening handlers (restoring exception state where an
    // except clause was active) and leave to the common return path.
    for h in d.handlers.chain(d.current_handler) {
        let (in_except, vars) = {
            let handler = d.handlers.get(h);
            (handler.in_except_handler, handler.vars)
        };
        if in_except {
            d.emit_unwind_exception(vars);
        }
    }
    d.il.branch(BranchKind::Leave, d.ret_label);
    Ok(())
}

fn l_get_iter(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.pop_kind(instr.offset)?;
    d.il.emit_call(id::GET_ITER, 1);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_for_iter(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let exhaust_label = d.target_label(instr)?;
    let cont = d.il.define_label();
    let ok = d.il.define_label();
    // The iterator stays on the stack across iterations; the helper
    // borrows it.
    d.il.dup();
    d.il.emit_call(id::ITER_NEXT, 1);
    // Clean exhaustion comes back as the shared sentinel.
    d.il.dup();
    d.il.ld_ptr(crate::vm::value::iter_sentinel().0);
    d.il.branch(BranchKind::NotEqual, cont);
    d.il.pop();
    d.il.emit_call(id::DECREF, 1);
    // The iterator is gone on the exit edge.
    d.pop_kind(instr.offset)?;
    d.il.branch(BranchKind::Always, exhaust_label);
    d.il.mark_label(cont);
    // Restore the loop-path view of the stack (iterator still present).
    d.push_object();
    // Null means the iterator failed.
    d.il.dup();
    d.il.branch(BranchKind::True, ok);
    d.il.pop();
    d.branch_raise();
    d.il.mark_label(ok);
    d.push_object();
    Ok(())
}

fn l_setup_finally(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let target = instr
        .branch_target()
        .ok_or(CompileError::MalformedBlocks(instr.offset))?;
    let raise = d.il.define_label();
    let reraise = d.il.define_label();
    let entry = *d
        .offset_labels
        .get(&target)
        .ok_or(CompileError::MalformedBlocks(instr.offset))?;
    let vars = d.define_exc_vars();
    let handler = d.handlers.add_setup_finally_handler(
        raise,
        reraise,
        entry,
        d.stack.clone(),
        d.current_handler,
        vars,
    );
    d.current_handler = handler;
    d.handler_entries.insert(target, handler);
    let body_scope = d.ai.scope_at(instr.next_offset());
    d.scope_to_handler.insert(body_scope, handler);
    // Record the except-dispatch region so branch-only entries (the
    // no-match re-raise chain) resume under the in-except handler.
    let base_scope = d.ai.scope_at(target);
    let mut i = d.cursor;
    while i < d.instrs.len() {
        let probe = d.instrs[i];
        if probe.offset >= target && d.ai.reached(probe.offset) {
            if d.ai.scope_at(probe.offset) == base_scope {
                d.handler_region.insert(probe.offset, handler);
                if probe.op == Opcode::Reraise {
                    break;
                }
            }
        }
        i += 1;
    }
    Ok(())
}

fn l_pop_block(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let parent = d
        .handlers
        .get(d.current_handler)
        .parent
        .ok_or(CompileError::MalformedBlocks(instr.offset))?;
    d.current_handler = parent;
    Ok(())
}

fn l_pop_except(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let (in_except, vars, parent) = {
        let h = d.handlers.get(d.current_handler);
        (h.in_except_handler, h.vars, h.parent)
    };
    if !in_except {
        return Err(CompileError::MalformedBlocks(instr.offset));
    }
    d.emit_unwind_exception(vars);
    d.current_handler = parent.ok_or(CompileError::MalformedBlocks(instr.offset))?;
    Ok(())
}

fn l_reraise(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    // The exception triple (traceback, value, type) is on the stack in
    // exactly the restore helper's argument order.
    d.pop_kind(instr.offset)?;
    d.pop_kind(instr.offset)?;
    d.pop_kind(instr.offset)?;
    d.il.emit_call(id::ERR_RESTORE, 3);
    let reraise = d.handlers.get(d.current_handler).reraise_label;
    d.il.branch(BranchKind::Always, reraise);
    Ok(())
}

fn l_raise_varargs(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    match instr.arg {
        0 => {
            d.il.load_null();
            d.il.load_null();
        }
        1 => {
            d.pop_kind(instr.offset)?;
            d.il.load_null();
        }
        2 => {
            d.pop_kind(instr.offset)?;
            d.pop_kind(instr.offset)?;
        }
        _ => {
            return Err(CompileError::UnsupportedOpcode {
                op: instr.op,
                offset: instr.offset,
            })
        }
    }
    d.il.emit_call(id::DO_RAISE, 2);
    d.il.pop();
    d.branch_raise();
    Ok(())
}

fn build_from_array(
    d: &mut CompilerDriver<'_>,
    instr: &Instr,
    helper: u32,
    count: usize,
    slots: usize,
) -> Result<(), CompileError> {
    let arr = d.stash_to_array(instr.offset, count, slots)?;
    d.il.ld_loc(arr);
    d.il.ld_i4(count as i32);
    d.il.emit_call(helper, 2);
    d.il.free_local(arr);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_build_tuple(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let n = instr.arg as usize;
    build_from_array(d, instr, id::TUPLE_FROM_ARRAY, n, n)
}

fn l_build_list(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let n = instr.arg as usize;
    build_from_array(d, instr, id::LIST_FROM_ARRAY, n, n)
}

fn l_build_set(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let n = instr.arg as usize;
    build_from_array(d, instr, id::SET_FROM_ARRAY, n, n)
}

fn l_build_map(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let n = instr.arg as usize;
    let arr = d.stash_to_array(instr.offset, n * 2, n * 2)?;
    d.il.ld_loc(arr);
    d.il.ld_i4(n as i32);
    d.il.emit_call(id::DICT_FROM_ARRAY, 2);
    d.il.free_local(arr);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_build_string(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let n = instr.arg as usize;
    build_from_array(d, instr, id::UNICODE_JOIN_ARRAY, n, n)
}

fn l_build_slice(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    if instr.arg == 2 {
        // Missing step: fill with None.
        d.il.ld_ptr(crate::vm::value::none_value().0);
        d.emit_incref(false);
        d.push_object();
    } else if instr.arg != 3 {
        return Err(CompileError::UnsupportedOpcode {
            op: instr.op,
            offset: instr.offset,
        });
    }
    d.pop_kind(instr.offset)?;
    d.pop_kind(instr.offset)?;
    d.pop_kind(instr.offset)?;
    d.il.emit_call(id::BUILD_SLICE, 3);
    d.push_object();
    Ok(())
}

/// Reorder the stack so a container at depth `depth` and the top value(s)
/// become direct helper arguments, calling `helper`, which returns the
/// container (left on the stack at its old depth).
fn container_op(
    d: &mut CompilerDriver<'_>,
    instr: &Instr,
    helper: u32,
    depth: usize,
    extra_keys: bool,
) -> Result<(), CompileError> {
    // Spill the operand(s).
    let value = d.spill(instr.offset)?;
    let key = if extra_keys {
        Some(d.spill(instr.offset)?)
    } else {
        None
    };
    // Spill everything between the container and the operands.
    let mut mids = Vec::new();
    for _ in 1..depth {
        mids.push(d.spill(instr.offset)?);
    }
    let container = d.spill(instr.offset)?;
    // Arguments in helper order.
    if let Some(key) = key {
        d.il.ld_loc(key.0);
        d.il.ld_loc(value.0);
        d.il.ld_loc(container.0);
        d.il.free_local(key.0);
        d.il.free_local(value.0);
        d.il.free_local(container.0);
        d.il.emit_call(helper, 3);
    } else {
        d.il.ld_loc(value.0);
        d.il.ld_loc(container.0);
        d.il.free_local(value.0);
        d.il.free_local(container.0);
        d.il.emit_call(helper, 2);
    }
    d.emit_error_check();
    d.push_object();
    for mid in mids.into_iter().rev() {
        d.reload(mid);
    }
    Ok(())
}

fn l_list_append(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    container_op(d, instr, id::LIST_APPEND, instr.arg as usize, false)
}

fn l_set_add(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    container_op(d, instr, id::SET_ADD, instr.arg as usize, false)
}

fn l_map_add(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    container_op(d, instr, id::MAP_ADD, instr.arg as usize, true)
}

fn l_container_merge(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let helper = match instr.op {
        Opcode::ListExtend => id::LIST_EXTEND,
        Opcode::SetUpdate => id::SET_UPDATE,
        Opcode::DictUpdate => id::DICT_UPDATE,
        _ => id::DICT_MERGE,
    };
    container_op(d, instr, helper, instr.arg as usize, false)
}

fn l_list_to_tuple(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.pop_kind(instr.offset)?;
    d.il.emit_call(id::LIST_TO_TUPLE, 1);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_unpack_sequence(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let n = instr.arg as usize;
    let arr = d.il.define_local(IlType::Ptr);
    d.il.new_array(n as u32);
    d.il.st_loc(arr);
    d.pop_kind(instr.offset)?;
    d.il.ld_i4(n as i32);
    d.il.ld_loc(arr);
    d.il.emit_call(id::UNPACK_SEQUENCE, 3);
    d.emit_status_check();
    // First element ends up on top.
    for i in (0..n).rev() {
        d.il.ld_loc(arr);
        d.il.ld_elem_ptr(i as u32);
        d.push_object();
    }
    d.il.free_local(arr);
    Ok(())
}

fn l_unpack_ex(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let before = (instr.arg & 0xFF) as usize;
    let after = (instr.arg >> 8) as usize;
    let total = before + 1 + after;
    let arr = d.il.define_local(IlType::Ptr);
    d.il.new_array(total as u32);
    d.il.st_loc(arr);
    d.pop_kind(instr.offset)?;
    d.il.ld_i4(before as i32);
    d.il.ld_i4(after as i32);
    d.il.ld_loc(arr);
    d.il.emit_call(id::UNPACK_EX, 4);
    d.emit_status_check();
    for i in (0..total).rev() {
        d.il.ld_loc(arr);
        d.il.ld_elem_ptr(i as u32);
        d.push_object();
    }
    d.il.free_local(arr);
    Ok(())
}

fn l_call_function(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let n = instr.arg as usize;
    if n <= 4 {
        let helper = [id::CALL_0, id::CALL_1, id::CALL_2, id::CALL_3, id::CALL_4][n];
        for _ in 0..=n {
            d.pop_kind(instr.offset)?;
        }
        d.il.emit_call(helper, n as i32 + 1);
    } else {
        // Wide calls go through an argument tuple.
        let arr = d.stash_to_array(instr.offset, n, n)?;
        d.il.ld_loc(arr);
        d.il.ld_i4(n as i32);
        d.il.emit_call(id::TUPLE_FROM_ARRAY, 2);
        d.il.free_local(arr);
        d.emit_error_check();
        d.pop_kind(instr.offset)?; // callable
        d.il.emit_call(id::CALL_N, 2);
    }
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_call_function_kw(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let n = instr.arg as usize;
    let names = d.spill(instr.offset)?;
    let arr = d.stash_to_array(instr.offset, n, n)?;
    d.il.ld_loc(arr);
    d.il.ld_i4(n as i32);
    d.il.emit_call(id::TUPLE_FROM_ARRAY, 2);
    d.il.free_local(arr);
    d.emit_error_check();
    d.il.ld_loc(names.0);
    d.il.free_local(names.0);
    d.pop_kind(instr.offset)?; // callable
    d.il.emit_call(id::KWCALL_N, 3);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_call_function_ex(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    if instr.arg & 1 != 0 {
        d.pop_kind(instr.offset)?;
        d.pop_kind(instr.offset)?;
        d.pop_kind(instr.offset)?;
        d.il.emit_call(id::CALL_KWARGS, 3);
    } else {
        d.pop_kind(instr.offset)?;
        d.pop_kind(instr.offset)?;
        d.il.emit_call(id::CALL_ARGS, 2);
    }
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_load_method(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.pop_kind(instr.offset)?;
    let name = d.name_ptr(instr.arg as usize);
    d.il.ld_ptr(name);
    d.il.emit_call(id::LOAD_METHOD, 2);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_call_method(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let n = instr.arg as usize;
    if n <= 4 {
        let helper = [
            id::METH_CALL_0,
            id::METH_CALL_1,
            id::METH_CALL_2,
            id::METH_CALL_3,
            id::METH_CALL_4,
        ][n];
        for _ in 0..=n {
            d.pop_kind(instr.offset)?;
        }
        d.il.emit_call(helper, n as i32 + 1);
    } else {
        let arr = d.stash_to_array(instr.offset, n, n)?;
        d.il.ld_loc(arr);
        d.il.ld_i4(n as i32);
        d.il.emit_call(id::TUPLE_FROM_ARRAY, 2);
        d.il.free_local(arr);
        d.emit_error_check();
        d.pop_kind(instr.offset)?; // method
        d.il.emit_call(id::METH_CALL_N, 2);
    }
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_make_function(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    // Stack: [defaults?, kwdefaults?, annotations?, closure?, code, qualname]
    d.pop_kind(instr.offset)?;
    d.pop_kind(instr.offset)?;
    d.load_frame();
    d.il.emit_call(id::NEW_FUNCTION, 3);
    d.emit_error_check();
    d.push_object();
    for (bit, helper) in [
        (0x08u32, id::SET_CLOSURE),
        (0x04, id::SET_ANNOTATIONS),
        (0x02, id::SET_KW_DEFAULTS),
        (0x01, id::SET_DEFAULTS),
    ] {
        if instr.arg & bit != 0 {
            let func = d.spill(instr.offset)?;
            d.pop_kind(instr.offset)?; // the attribute value below
            d.il.ld_loc(func.0);
            d.il.free_local(func.0);
            d.il.emit_call(helper, 2);
            d.emit_error_check();
            d.push_object();
        }
    }
    Ok(())
}

fn l_format_value(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    let conversion = instr.arg & 0x03;
    let conv_helper = match conversion {
        1 => Some(id::OBJECT_STR),
        2 => Some(id::OBJECT_REPR),
        3 => Some(id::OBJECT_ASCII),
        _ => None,
    };
    if instr.arg & 0x04 != 0 {
        let spec = d.spill(instr.offset)?;
        if let Some(helper) = conv_helper {
            d.pop_kind(instr.offset)?;
            d.il.emit_call(helper, 1);
            d.emit_error_check();
            d.push_object();
        }
        d.reload(spec);
        d.pop_kind(instr.offset)?;
        d.pop_kind(instr.offset)?;
        d.il.emit_call(id::FORMAT_OBJECT, 2);
    } else {
        d.pop_kind(instr.offset)?;
        d.il.emit_call(conv_helper.unwrap_or(id::FORMAT_VALUE), 1);
    }
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_import_name(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.pop_kind(instr.offset)?;
    d.pop_kind(instr.offset)?;
    let name = d.name_ptr(instr.arg as usize);
    d.il.ld_ptr(name);
    d.load_frame();
    d.il.emit_call(id::IMPORT_NAME, 4);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_import_from(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    // The module stays on the stack; the helper borrows it.
    d.il.dup();
    let name = d.name_ptr(instr.arg as usize);
    d.il.ld_ptr(name);
    d.il.emit_call(id::IMPORT_FROM, 2);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_import_star(d: &mut CompilerDriver<'_>, instr: &Instr) -> Result<(), CompileError> {
    d.pop_kind(instr.offset)?;
    d.load_frame();
    d.il.emit_call(id::IMPORT_STAR, 2);
    d.emit_status_check();
    Ok(())
}

fn l_load_build_class(d: &mut CompilerDriver<'_>, _instr: &Instr) -> Result<(), CompileError> {
    d.load_frame();
    d.il.emit_call(id::LOAD_BUILD_CLASS, 1);
    d.emit_error_check();
    d.push_object();
    Ok(())
}

fn l_setup_annotations(d: &mut CompilerDriver<'_>, _instr: &Instr) -> Result<(), CompileError> {
    d.load_frame();
    d.il.emit_call(id::SETUP_ANNOTATIONS, 1);
    d.emit_status_check();
    Ok(())
}

fn l_load_assertion_error(d: &mut CompilerDriver<'_>, _instr: &Instr) -> Result<(), CompileError> {
    d.il.emit_call(id::LOAD_ASSERTION_ERROR, 0);
    d.push_object();
    Ok(())
}
