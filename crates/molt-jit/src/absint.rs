//! Abstract interpreter
//!
//! Forward fixed-point analysis over a code object's bytecode. For every
//! reachable offset it computes the abstract stack and the abstract
//! locals array (the "snapshot" the compiler driver consults), merging
//! states element-wise at join points until nothing changes. Transfer
//! functions are looked up per opcode through `transfer_for`, which is the
//! extension point for new opcodes.

use rustc_hash::FxHashMap;

use crate::lattice::{AbstractValue, AbstractValueKind, BinaryOp, UnaryOp};
use crate::vm::code::CodeObject;
use crate::vm::opcode::{decode, CompareKind, DecodeError, Instr, Opcode};

/// Error during abstract interpretation. Any of these makes the code
/// object uncompilable; the dispatcher then pins it to the interpreter.
#[derive(Debug, thiserror::Error)]
pub enum AbsIntError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("abstract stack underflow at offset {0}")]
    StackUnderflow(usize),
    #[error("stack depth mismatch merging into offset {0}")]
    DepthMismatch(usize),
    #[error("exception-scope mismatch merging into offset {0}")]
    ScopeMismatch(usize),
    #[error("jump to invalid offset {target} at offset {offset}")]
    BadJump { offset: usize, target: usize },
    #[error("local index {index} out of range at offset {offset}")]
    LocalOutOfRange { offset: usize, index: usize },
    #[error("unsupported opcode {op:?} at offset {offset}")]
    UnsupportedOpcode { op: Opcode, offset: usize },
    #[error("analysis exceeded {0} worklist steps")]
    Diverged(usize),
}

/// Safety bound on worklist processing.
const MAX_WORKLIST_STEPS: usize = 100_000;

/// Definedness-tracked abstract local.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalInfo {
    pub value: AbstractValue,
    /// Some path reaches this point without assigning the local; codegen
    /// must emit a defined-check before reading it.
    pub maybe_undefined: bool,
}

impl LocalInfo {
    fn undefined() -> LocalInfo {
        LocalInfo {
            value: AbstractValue::UNDEFINED,
            maybe_undefined: true,
        }
    }

    fn defined(value: AbstractValue) -> LocalInfo {
        LocalInfo {
            value,
            maybe_undefined: false,
        }
    }

    fn join_with(&self, other: &LocalInfo) -> LocalInfo {
        LocalInfo {
            value: self.value.join_with(&other.value),
            maybe_undefined: self.maybe_undefined || other.maybe_undefined,
        }
    }
}

/// Abstract machine state at one bytecode offset: operand stack (top
/// last), locals, and the enclosing exception scope.
#[derive(Debug, Clone)]
pub struct InterpState {
    pub stack: Vec<AbstractValue>,
    pub locals: Vec<LocalInfo>,
    pub scope: usize,
}

impl InterpState {
    fn pop(&mut self, offset: usize) -> Result<AbstractValue, AbsIntError> {
        self.stack.pop().ok_or(AbsIntError::StackUnderflow(offset))
    }

    fn push(&mut self, v: AbstractValue) {
        self.stack.push(v);
    }

    fn push_kind(&mut self, kind: AbstractValueKind) {
        self.stack.push(AbstractValue::of_kind(kind));
    }
}

/// A try-block scope discovered during analysis. Scope 0 is the synthetic
/// function root. Used to validate nesting and to tell the driver which
/// handler chain an offset runs under.
#[derive(Debug, Clone, Copy)]
pub struct ShadowScope {
    /// Offset of the `SetupFinally` that opened this scope.
    pub setup_offset: usize,
    /// Handler entry offset.
    pub target: usize,
    /// Enclosing scope id.
    pub parent: usize,
}

type Successors = Vec<(usize, InterpState)>;
type TransferFn =
    for<'a> fn(&mut AbstractInterpreter<'a>, &Instr, InterpState) -> Result<Successors, AbsIntError>;

/// The abstract interpreter for one code object. Single-use.
pub struct AbstractInterpreter<'a> {
    code: &'a CodeObject,
    instrs: Vec<Instr>,
    index_of: FxHashMap<usize, usize>,
    snapshots: FxHashMap<usize, InterpState>,
    scopes: Vec<ShadowScope>,
    scope_by_setup: FxHashMap<usize, usize>,
    return_info: Option<AbstractValue>,
    arg_kinds: Vec<AbstractValueKind>,
}

impl<'a> AbstractInterpreter<'a> {
    pub fn new(code: &'a CodeObject) -> Result<Self, AbsIntError> {
        let instrs = decode(&code.code)?;
        let mut index_of = FxHashMap::default();
        for (i, instr) in instrs.iter().enumerate() {
            index_of.insert(instr.offset, i);
        }
        Ok(AbstractInterpreter {
            code,
            instrs,
            index_of,
            snapshots: FxHashMap::default(),
            scopes: vec![ShadowScope {
                setup_offset: usize::MAX,
                target: usize::MAX,
                parent: 0,
            }],
            scope_by_setup: FxHashMap::default(),
            return_info: None,
            arg_kinds: vec![AbstractValueKind::Any; code.arg_count as usize],
        })
    }

    /// Seed an argument's abstract kind (from the specialization
    /// dispatcher's recorded argument-type vector).
    pub fn set_arg_kind(&mut self, index: usize, kind: AbstractValueKind) {
        if index < self.arg_kinds.len() {
            self.arg_kinds[index] = kind;
        }
    }

    pub fn code(&self) -> &CodeObject {
        self.code
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    /// Run to fixed point.
    pub fn interpret(&mut self) -> Result<(), AbsIntError> {
        if self.instrs.is_empty() {
            return Ok(());
        }
        let locals: Vec<LocalInfo> = (0..self.code.local_count as usize)
            .map(|i| {
                if i < self.arg_kinds.len() {
                    LocalInfo::defined(AbstractValue::of_kind(self.arg_kinds[i]))
                } else {
                    LocalInfo::undefined()
                }
            })
            .collect();
        let entry = InterpState {
            stack: Vec::new(),
            locals,
            scope: 0,
        };
        self.snapshots.insert(0, entry);

        let mut worklist = vec![0usize];
        let mut steps = 0usize;
        while let Some(offset) = worklist.pop() {
            steps += 1;
            if steps > MAX_WORKLIST_STEPS {
                return Err(AbsIntError::Diverged(MAX_WORKLIST_STEPS));
            }
            let instr = match self.index_of.get(&offset) {
                Some(&i) => self.instrs[i],
                None => {
                    return Err(AbsIntError::BadJump {
                        offset,
                        target: offset,
                    })
                }
            };
            let state = self.snapshots[&offset].clone();
            let successors = transfer_for(instr.op)(self, &instr, state)?;
            for (succ, state) in successors {
                if !self.index_of.contains_key(&succ) {
                    return Err(AbsIntError::BadJump {
                        offset,
                        target: succ,
                    });
                }
                if self.merge_into(succ, state)? {
                    worklist.push(succ);
                }
            }
        }
        Ok(())
    }

    fn merge_into(&mut self, offset: usize, incoming: InterpState) -> Result<bool, AbsIntError> {
        match self.snapshots.get_mut(&offset) {
            None => {
                self.snapshots.insert(offset, incoming);
                Ok(true)
            }
            Some(existing) => {
                if existing.stack.len() != incoming.stack.len() {
                    return Err(AbsIntError::DepthMismatch(offset));
                }
                if existing.scope != incoming.scope {
                    return Err(AbsIntError::ScopeMismatch(offset));
                }
                let mut changed = false;
                for (e, i) in existing.stack.iter_mut().zip(incoming.stack.iter()) {
                    let joined = e.join_with(i);
                    if joined != *e {
                        *e = joined;
                        changed = true;
                    }
                }
                for (e, i) in existing.locals.iter_mut().zip(incoming.locals.iter()) {
                    let joined = e.join_with(i);
                    if joined != *e {
                        *e = joined;
                        changed = true;
                    }
                }
                Ok(changed)
            }
        }
    }

    fn scope_for_setup(&mut self, setup_offset: usize, target: usize, parent: usize) -> usize {
        if let Some(&id) = self.scope_by_setup.get(&setup_offset) {
            return id;
        }
        let id = self.scopes.len();
        self.scopes.push(ShadowScope {
            setup_offset,
            target,
            parent,
        });
        self.scope_by_setup.insert(setup_offset, id);
        id
    }

    // ===== Results =====

    /// Whether the fixed point reached this offset at all.
    pub fn reached(&self, offset: usize) -> bool {
        self.snapshots.contains_key(&offset)
    }

    /// The abstract stack on entry to `offset` (top last).
    pub fn get_stack_info(&self, offset: usize) -> Option<&[AbstractValue]> {
        self.snapshots.get(&offset).map(|s| s.stack.as_slice())
    }

    /// The abstract local on entry to `offset`.
    pub fn get_local_info(&self, offset: usize, index: usize) -> Option<&LocalInfo> {
        self.snapshots.get(&offset).and_then(|s| s.locals.get(index))
    }

    /// Join of all `ReturnValue` operands.
    pub fn get_return_info(&self) -> AbstractValue {
        self.return_info.unwrap_or(AbstractValue::ANY)
    }

    /// Exception scope in force at `offset`.
    pub fn scope_at(&self, offset: usize) -> usize {
        self.snapshots.get(&offset).map(|s| s.scope).unwrap_or(0)
    }

    pub fn scopes(&self) -> &[ShadowScope] {
        &self.scopes
    }

    /// Scope ids from `scope` outward, excluding the root.
    pub fn scope_chain(&self, mut scope: usize) -> Vec<usize> {
        let mut chain = Vec::new();
        while scope != 0 {
            chain.push(scope);
            scope = self.scopes[scope].parent;
        }
        chain
    }
}

/// Map a bytecode binary/in-place opcode to its lattice operator.
pub(crate) fn binary_op_of(op: Opcode) -> Option<BinaryOp> {
    Some(match op {
        Opcode::BinaryAdd | Opcode::InplaceAdd => BinaryOp::Add,
        Opcode::BinarySubtract | Opcode::InplaceSubtract => BinaryOp::Sub,
        Opcode::BinaryMultiply | Opcode::InplaceMultiply => BinaryOp::Mul,
        Opcode::BinaryTrueDivide | Opcode::InplaceTrueDivide => BinaryOp::TrueDiv,
        Opcode::BinaryFloorDivide | Opcode::InplaceFloorDivide => BinaryOp::FloorDiv,
        Opcode::BinaryModulo | Opcode::InplaceModulo => BinaryOp::Mod,
        Opcode::BinaryPower | Opcode::InplacePower => BinaryOp::Pow,
        Opcode::BinaryMatrixMultiply | Opcode::InplaceMatrixMultiply => BinaryOp::MatMul,
        Opcode::BinaryLshift | Opcode::InplaceLshift => BinaryOp::LShift,
        Opcode::BinaryRshift | Opcode::InplaceRshift => BinaryOp::RShift,
        Opcode::BinaryAnd | Opcode::InplaceAnd => BinaryOp::And,
        Opcode::BinaryOr | Opcode::InplaceOr => BinaryOp::Or,
        Opcode::BinaryXor | Opcode::InplaceXor => BinaryOp::Xor,
        Opcode::BinarySubscr => BinaryOp::Subscr,
        _ => return None,
    })
}

/// Transfer-function table, keyed by opcode.
pub(crate) fn transfer_for(op: Opcode) -> TransferFn {
    match op {
        Opcode::Nop | Opcode::SetupAnnotations => t_nop,
        Opcode::PopTop => t_pop_top,
        Opcode::RotTwo => t_rot_two,
        Opcode::RotThree => t_rot_three,
        Opcode::RotFour => t_rot_four,
        Opcode::DupTop => t_dup_top,
        Opcode::DupTopTwo => t_dup_top_two,
        Opcode::UnaryPositive | Opcode::UnaryNegative | Opcode::UnaryNot | Opcode::UnaryInvert => {
            t_unary
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
        | Opcode::InplaceXor => t_binary,
        Opcode::StoreSubscr => t_store_subscr,
        Opcode::DeleteSubscr => t_delete_subscr,
        Opcode::LoadConst => t_load_const,
        Opcode::LoadFast => t_load_fast,
        Opcode::StoreFast => t_store_fast,
        Opcode::DeleteFast => t_delete_fast,
        Opcode::LoadName | Opcode::LoadGlobal => t_push_any,
        Opcode::StoreName | Opcode::StoreGlobal | Opcode::StoreDeref => t_pop_one,
        Opcode::DeleteName | Opcode::DeleteGlobal | Opcode::DeleteDeref => t_nop,
        Opcode::LoadDeref | Opcode::LoadClassDeref | Opcode::LoadClosure => t_push_any,
        Opcode::LoadAttr => t_load_attr,
        Opcode::StoreAttr => t_store_attr,
        Opcode::DeleteAttr => t_pop_one,
        Opcode::CompareOp => t_compare,
        Opcode::IsOp | Opcode::ContainsOp => t_bool_binary,
        Opcode::JumpForward | Opcode::JumpAbsolute => t_jump,
        Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => t_pop_jump,
        Opcode::JumpIfTrueOrPop | Opcode::JumpIfFalseOrPop => t_jump_or_pop,
        Opcode::ReturnValue => t_return,
        Opcode::GetIter => t_get_iter,
        Opcode::ForIter => t_for_iter,
        Opcode::SetupFinally => t_setup_finally,
        Opcode::PopBlock => t_pop_block,
        Opcode::PopExcept => t_nop,
        Opcode::Reraise => t_reraise,
        Opcode::RaiseVarargs => t_raise,
        Opcode::BuildTuple => t_build_tuple,
        Opcode::BuildList => t_build_list,
        Opcode::BuildSet => t_build_set,
        Opcode::BuildMap => t_build_map,
        Opcode::BuildSlice => t_build_slice,
        Opcode::BuildString => t_build_string,
        Opcode::ListAppend | Opcode::SetAdd => t_pop_one,
        Opcode::MapAdd => t_pop_two,
        Opcode::ListExtend | Opcode::SetUpdate | Opcode::DictUpdate | Opcode::DictMerge => {
            t_pop_one
        }
        Opcode::ListToTuple => t_list_to_tuple,
        Opcode::UnpackSequence => t_unpack_sequence,
        Opcode::UnpackEx => t_unpack_ex,
        Opcode::CallFunction => t_call_function,
        Opcode::CallFunctionKw => t_call_function_kw,
        Opcode::CallFunctionEx => t_call_function_ex,
        Opcode::LoadMethod => t_load_method,
        Opcode::CallMethod => t_call_method,
        Opcode::MakeFunction => t_make_function,
        Opcode::FormatValue => t_format_value,
        Opcode::ImportName => t_import_name,
        Opcode::ImportFrom => t_push_any,
        Opcode::ImportStar => t_pop_one,
        Opcode::LoadBuildClass => t_push_any,
        Opcode::LoadAssertionError => t_load_assertion_error,
        Opcode::ExtendedArg => t_unsupported,
    }
}

fn fall(instr: &Instr, state: InterpState) -> Successors {
    vec![(instr.next_offset(), state)]
}

fn t_nop(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    Ok(fall(instr, state))
}

fn t_unsupported(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    _state: InterpState,
) -> Result<Successors, AbsIntError> {
    Err(AbsIntError::UnsupportedOpcode {
        op: instr.op,
        offset: instr.offset,
    })
}

fn t_pop_top(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    state.pop(instr.offset)?;
    Ok(fall(instr, state))
}

fn t_pop_one(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    state.pop(instr.offset)?;
    Ok(fall(instr, state))
}

fn t_pop_two(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    state.pop(instr.offset)?;
    state.pop(instr.offset)?;
    Ok(fall(instr, state))
}

fn t_rot_two(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    let a = state.pop(instr.offset)?;
    let b = state.pop(instr.offset)?;
    state.push(a);
    state.push(b);
    Ok(fall(instr, state))
}

fn t_rot_three(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    let a = state.pop(instr.offset)?;
    let b = state.pop(instr.offset)?;
    let c = state.pop(instr.offset)?;
    state.push(a);
    state.push(c);
    state.push(b);
    Ok(fall(instr, state))
}

fn t_rot_four(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    let a = state.pop(instr.offset)?;
    let b = state.pop(instr.offset)?;
    let c = state.pop(instr.offset)?;
    let d = state.pop(instr.offset)?;
    state.push(a);
    state.push(d);
    state.push(c);
    state.push(b);
    Ok(fall(instr, state))
}

fn t_dup_top(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    let a = *state
        .stack
        .last()
        .ok_or(AbsIntError::StackUnderflow(instr.offset))?;
    state.push(a);
    Ok(fall(instr, state))
}

fn t_dup_top_two(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    let n = state.stack.len();
    if n < 2 {
        return Err(AbsIntError::StackUnderflow(instr.offset));
    }
    let a = state.stack[n - 2];
    let b = state.stack[n - 1];
    state.push(a);
    state.push(b);
    Ok(fall(instr, state))
}

fn t_unary(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    let v = state.pop(instr.offset)?;
    let op = match instr.op {
        Opcode::UnaryPositive => UnaryOp::Pos,
        Opcode::UnaryNegative => UnaryOp::Neg,
        Opcode::UnaryNot => UnaryOp::Not,
        _ => UnaryOp::Invert,
    };
    state.push(v.unary(op));
    Ok(fall(instr, state))
}

fn t_binary(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    let rhs = state.pop(instr.offset)?;
    let lhs = state.pop(instr.offset)?;
    let op = binary_op_of(instr.op).expect("binary transfer on non-binary opcode");
    state.push(lhs.binary(op, &rhs));
    Ok(fall(instr, state))
}

fn t_store_subscr(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    state.pop(instr.offset)?; // index
    state.pop(instr.offset)?; // container
    state.pop(instr.offset)?; // value
    Ok(fall(instr, state))
}

fn t_delete_subscr(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    state.pop(instr.offset)?;
    state.pop(instr.offset)?;
    Ok(fall(instr, state))
}

fn t_load_const(
    ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    match ai.code.const_at(instr.arg as usize) {
        Some(c) => state.push(AbstractValue::of_constant(c)),
        None => state.push(AbstractValue::ANY),
    }
    Ok(fall(instr, state))
}

fn t_load_fast(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    let index = instr.arg as usize;
    let info = *state
        .locals
        .get(index)
        .ok_or(AbsIntError::LocalOutOfRange {
            offset: instr.offset,
            index,
        })?;
    // The value flows through unchanged; the definedness bit is what the
    // driver reads to decide whether to emit the unbound check.
    let mut v = info.value;
    if v.kind == AbstractValueKind::Undefined {
        v = AbstractValue::ANY;
    }
    state.push(v);
    Ok(fall(instr, state))
}

fn t_store_fast(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    let index = instr.arg as usize;
    let v = state.pop(instr.offset)?;
    if index >= state.locals.len() {
        return Err(AbsIntError::LocalOutOfRange {
            offset: instr.offset,
            index,
        });
    }
    state.locals[index] = LocalInfo::defined(v);
    Ok(fall(instr, state))
}

fn t_delete_fast(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    let index = instr.arg as usize;
    if index >= state.locals.len() {
        return Err(AbsIntError::LocalOutOfRange {
            offset: instr.offset,
            index,
        });
    }
    state.locals[index] = LocalInfo::undefined();
    Ok(fall(instr, state))
}

fn t_push_any(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    state.push(AbstractValue::ANY);
    Ok(fall(instr, state))
}

fn t_load_attr(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    state.pop(instr.offset)?;
    state.push(AbstractValue::ANY);
    Ok(fall(instr, state))
}

fn t_store_attr(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    state.pop(instr.offset)?; // object
    state.pop(instr.offset)?; // value
    Ok(fall(instr, state))
}

fn t_compare(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    let rhs = state.pop(instr.offset)?;
    let lhs = state.pop(instr.offset)?;
    if CompareKind::from_arg(instr.arg) == Some(CompareKind::ExcMatch) {
        state.push_kind(AbstractValueKind::Bool);
    } else {
        state.push(lhs.compare(&rhs));
    }
    Ok(fall(instr, state))
}

fn t_bool_binary(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    state.pop(instr.offset)?;
    state.pop(instr.offset)?;
    state.push_kind(AbstractValueKind::Bool);
    Ok(fall(instr, state))
}

fn jump_target(instr: &Instr) -> usize {
    instr.branch_target().expect("jump opcode without target")
}

fn t_jump(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    Ok(vec![(jump_target(instr), state)])
}

fn t_pop_jump(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    state.pop(instr.offset)?;
    Ok(vec![
        (instr.next_offset(), state.clone()),
        (jump_target(instr), state),
    ])
}

fn t_jump_or_pop(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    let kept = state.clone();
    state.pop(instr.offset)?;
    Ok(vec![(instr.next_offset(), state), (jump_target(instr), kept)])
}

fn t_return(
    ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    let v = state.pop(instr.offset)?;
    ai.return_info = Some(match ai.return_info {
        Some(prev) => prev.join_with(&v),
        None => v,
    });
    Ok(Vec::new())
}

fn t_get_iter(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    let src = state.pop(instr.offset)?;
    state.push(AbstractValue {
        kind: AbstractValueKind::Iterable,
        constant: None,
        element: Some(src.iter_element()),
    });
    Ok(fall(instr, state))
}

fn t_for_iter(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    let iter = *state
        .stack
        .last()
        .ok_or(AbsIntError::StackUnderflow(instr.offset))?;
    // Exhaustion path: iterator is popped, control jumps past the loop.
    let mut done = state.clone();
    done.pop(instr.offset)?;
    // Iteration path: the element is pushed above the iterator.
    state.push_kind(iter.element.unwrap_or(AbstractValueKind::Any));
    Ok(vec![(instr.next_offset(), state), (jump_target(instr), done)])
}

fn t_setup_finally(
    ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    let target = jump_target(instr);
    let scope = ai.scope_for_setup(instr.offset, target, state.scope);
    let mut body = state.clone();
    body.scope = scope;
    // The handler entry sees the setup-site stack plus the exception
    // triple (traceback, value, type on top), running under the enclosing
    // scope.
    let mut handler = state;
    handler.push(AbstractValue::ANY);
    handler.push(AbstractValue::ANY);
    handler.push(AbstractValue::ANY);
    Ok(vec![(instr.next_offset(), body), (target, handler)])
}

fn t_pop_block(
    ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    if state.scope == 0 {
        return Err(AbsIntError::ScopeMismatch(instr.offset));
    }
    state.scope = ai.scopes[state.scope].parent;
    Ok(fall(instr, state))
}

fn t_reraise(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    state.pop(instr.offset)?;
    state.pop(instr.offset)?;
    state.pop(instr.offset)?;
    Ok(Vec::new())
}

fn t_raise(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    for _ in 0..instr.arg {
        state.pop(instr.offset)?;
    }
    Ok(Vec::new())
}

fn build_n(
    instr: &Instr,
    mut state: InterpState,
    result: AbstractValueKind,
    pops: usize,
) -> Result<Successors, AbsIntError> {
    for _ in 0..pops {
        state.pop(instr.offset)?;
    }
    state.push_kind(result);
    Ok(fall(instr, state))
}

fn t_build_tuple(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    build_n(instr, state, AbstractValueKind::Tuple, instr.arg as usize)
}

fn t_build_list(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    build_n(instr, state, AbstractValueKind::List, instr.arg as usize)
}

fn t_build_set(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    build_n(instr, state, AbstractValueKind::Set, instr.arg as usize)
}

fn t_build_map(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    build_n(instr, state, AbstractValueKind::Dict, instr.arg as usize * 2)
}

fn t_build_slice(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    build_n(instr, state, AbstractValueKind::Slice, instr.arg as usize)
}

fn t_build_string(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    build_n(instr, state, AbstractValueKind::String, instr.arg as usize)
}

fn t_list_to_tuple(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    build_n(instr, state, AbstractValueKind::Tuple, 1)
}

fn t_unpack_sequence(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    state.pop(instr.offset)?;
    for _ in 0..instr.arg {
        state.push(AbstractValue::ANY);
    }
    Ok(fall(instr, state))
}

fn t_unpack_ex(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    let before = (instr.arg & 0xFF) as usize;
    let after = (instr.arg >> 8) as usize;
    state.pop(instr.offset)?;
    for _ in 0..after {
        state.push(AbstractValue::ANY);
    }
    state.push_kind(AbstractValueKind::List);
    for _ in 0..before {
        state.push(AbstractValue::ANY);
    }
    Ok(fall(instr, state))
}

fn t_call_function(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    build_n(instr, state, AbstractValueKind::Any, instr.arg as usize + 1)
}

fn t_call_function_kw(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    build_n(instr, state, AbstractValueKind::Any, instr.arg as usize + 2)
}

fn t_call_function_ex(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    let pops = if instr.arg & 1 != 0 { 3 } else { 2 };
    build_n(instr, state, AbstractValueKind::Any, pops)
}

fn t_load_method(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    state.pop(instr.offset)?;
    state.push_kind(AbstractValueKind::Method);
    Ok(fall(instr, state))
}

fn t_call_method(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    build_n(instr, state, AbstractValueKind::Any, instr.arg as usize + 1)
}

fn t_make_function(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    let extras = (instr.arg & 0x0F).count_ones() as usize;
    build_n(instr, state, AbstractValueKind::Function, 2 + extras)
}

fn t_format_value(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    let pops = if instr.arg & 0x04 != 0 { 2 } else { 1 };
    build_n(instr, state, AbstractValueKind::String, pops)
}

fn t_import_name(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    state: InterpState,
) -> Result<Successors, AbsIntError> {
    build_n(instr, state, AbstractValueKind::Any, 2)
}

fn t_load_assertion_error(
    _ai: &mut AbstractInterpreter<'_>,
    instr: &Instr,
    mut state: InterpState,
) -> Result<Successors, AbsIntError> {
    state.push_kind(AbstractValueKind::Type);
    Ok(fall(instr, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::code::CodeBuilder;
    use crate::vm::value::{new_str, none_value, ValueRef};
    use AbstractValueKind as K;

    #[test]
    fn test_const_int_return() {
        let mut b = CodeBuilder::new("f");
        let c = b.add_const(ValueRef::from_int(42));
        b.emit(Opcode::LoadConst, c);
        b.op(Opcode::ReturnValue);
        let code = b.build();
        let mut ai = AbstractInterpreter::new(&code).unwrap();
        ai.interpret().unwrap();
        assert_eq!(ai.get_return_info().kind(), K::Integer);
    }

    #[test]
    fn test_conditional_return_joins_to_any() {
        // if arg0: return 42 else: return 'abc'
        let mut b = CodeBuilder::new("f").arg_count(1);
        let int_c = b.add_const(ValueRef::from_int(42));
        let s = new_str("abc");
        let str_c = b.add_const(s);
        b.emit(Opcode::LoadFast, 0); // 0
        b.emit(Opcode::PopJumpIfFalse, 8); // 2
        b.emit(Opcode::LoadConst, int_c); // 4
        b.op(Opcode::ReturnValue); // 6
        b.emit(Opcode::LoadConst, str_c); // 8
        b.op(Opcode::ReturnValue); // 10
        let code = b.build();
        let mut ai = AbstractInterpreter::new(&code).unwrap();
        ai.interpret().unwrap();
        assert_eq!(ai.get_return_info().kind(), K::Any);
    }

    #[test]
    fn test_code_after_return_unreached() {
        let mut b = CodeBuilder::new("f");
        let c = b.add_const(ValueRef::from_int(42));
        b.emit(Opcode::LoadConst, c); // 0
        b.op(Opcode::ReturnValue); // 2
        b.emit(Opcode::LoadConst, c); // 4 (dead)
        b.op(Opcode::ReturnValue); // 6
        let code = b.build();
        let mut ai = AbstractInterpreter::new(&code).unwrap();
        ai.interpret().unwrap();
        assert_eq!(ai.get_return_info().kind(), K::Integer);
        assert!(!ai.reached(4));
    }

    #[test]
    fn test_delete_fast_tracking() {
        // x = 1; del x; return None
        let mut b = CodeBuilder::new("f").local_count(1);
        let one = b.add_const(ValueRef::from_int(1));
        let n = none_value();
        n.incref();
        let none_c = b.add_const(n);
        b.emit(Opcode::LoadConst, one); // 0
        b.emit(Opcode::StoreFast, 0); // 2
        b.emit(Opcode::DeleteFast, 0); // 4
        b.emit(Opcode::LoadConst, none_c); // 6
        b.op(Opcode::ReturnValue); // 8
        let code = b.build();
        let mut ai = AbstractInterpreter::new(&code).unwrap();
        ai.interpret().unwrap();

        let at0 = ai.get_local_info(0, 0).unwrap();
        assert_eq!(at0.value.kind(), K::Undefined);
        assert!(at0.maybe_undefined);

        let at4 = ai.get_local_info(4, 0).unwrap();
        assert_eq!(at4.value.kind(), K::Integer);
        assert!(!at4.maybe_undefined);

        let at6 = ai.get_local_info(6, 0).unwrap();
        assert_eq!(at6.value.kind(), K::Undefined);
        assert!(at6.maybe_undefined);
    }

    #[test]
    fn test_conditional_assign_merges_maybe_undefined() {
        // if arg0: x = 1
        // return None  (x maybe undefined at the merge)
        let mut b = CodeBuilder::new("f").arg_count(1).local_count(2);
        let one = b.add_const(ValueRef::from_int(1));
        let n = none_value();
        n.incref();
        let none_c = b.add_const(n);
        b.emit(Opcode::LoadFast, 0); // 0
        b.emit(Opcode::PopJumpIfFalse, 8); // 2
        b.emit(Opcode::LoadConst, one); // 4
        b.emit(Opcode::StoreFast, 1); // 6
        b.emit(Opcode::LoadConst, none_c); // 8
        b.op(Opcode::ReturnValue); // 10
        let code = b.build();
        let mut ai = AbstractInterpreter::new(&code).unwrap();
        ai.interpret().unwrap();

        let merged = ai.get_local_info(8, 1).unwrap();
        assert_eq!(merged.value.kind(), K::Integer);
        assert!(merged.maybe_undefined);
    }

    #[test]
    fn test_specialized_arg_kinds_flow() {
        // return arg0 + arg1 with both args seeded as Float
        let mut b = CodeBuilder::new("f").arg_count(2);
        b.emit(Opcode::LoadFast, 0);
        b.emit(Opcode::LoadFast, 1);
        b.op(Opcode::BinaryAdd);
        b.op(Opcode::ReturnValue);
        let code = b.build();
        let mut ai = AbstractInterpreter::new(&code).unwrap();
        ai.set_arg_kind(0, K::Float);
        ai.set_arg_kind(1, K::Float);
        ai.interpret().unwrap();
        assert_eq!(ai.get_return_info().kind(), K::Float);
    }

    #[test]
    fn test_int_division_promotes() {
        let mut b = CodeBuilder::new("f").arg_count(2);
        b.emit(Opcode::LoadFast, 0);
        b.emit(Opcode::LoadFast, 1);
        b.op(Opcode::BinaryTrueDivide);
        b.op(Opcode::ReturnValue);
        let code = b.build();
        let mut ai = AbstractInterpreter::new(&code).unwrap();
        ai.set_arg_kind(0, K::Integer);
        ai.set_arg_kind(1, K::Integer);
        ai.interpret().unwrap();
        assert_eq!(ai.get_return_info().kind(), K::Float);
    }

    #[test]
    fn test_loop_fixed_point_string_elements() {
        // for c in arg0 (a string): pass; return None
        let mut b = CodeBuilder::new("f").arg_count(1).local_count(2);
        let n = none_value();
        n.incref();
        let none_c = b.add_const(n);
        b.emit(Opcode::LoadFast, 0); // 0
        b.op(Opcode::GetIter); // 2
        b.emit(Opcode::ForIter, 6); // 4 -> exhaust 12
        b.emit(Opcode::StoreFast, 1); // 6
        b.emit(Opcode::JumpAbsolute, 4); // 8
        b.op(Opcode::Nop); // 10 (unreached)
        b.emit(Opcode::LoadConst, none_c); // 12
        b.op(Opcode::ReturnValue); // 14
        let code = b.build();
        let mut ai = AbstractInterpreter::new(&code).unwrap();
        ai.set_arg_kind(0, K::String);
        ai.interpret().unwrap();
        // The loop variable picked up the iterator's element type.
        let loop_var = ai.get_local_info(8, 1).unwrap();
        assert_eq!(loop_var.value.kind(), K::String);
        // Stack depth at the loop head is stable across iterations.
        assert_eq!(ai.get_stack_info(4).unwrap().len(), 1);
        assert_eq!(ai.get_return_info().kind(), K::None);
    }

    #[test]
    fn test_setup_finally_scopes_and_handler_stack() {
        // try: pass
        // except: reraise
        let mut b = CodeBuilder::new("f");
        let n = none_value();
        n.incref();
        let none_c = b.add_const(n);
        b.emit(Opcode::SetupFinally, 6); // 0 -> handler at 8
        b.op(Opcode::Nop); // 2
        b.op(Opcode::PopBlock); // 4
        b.emit(Opcode::JumpForward, 6); // 6 -> 14
        b.op(Opcode::Reraise); // 8 (handler entry)
        b.op(Opcode::Nop); // 10 (unreached)
        b.op(Opcode::Nop); // 12 (unreached)
        b.emit(Opcode::LoadConst, none_c); // 14
        b.op(Opcode::ReturnValue); // 16
        let code = b.build();
        let mut ai = AbstractInterpreter::new(&code).unwrap();
        ai.interpret().unwrap();

        // Inside the try body a non-root scope is active.
        assert_ne!(ai.scope_at(2), 0);
        // After PopBlock we are back at the root.
        assert_eq!(ai.scope_at(6), 0);
        // The handler entry sees the exception triple.
        assert_eq!(ai.get_stack_info(8).unwrap().len(), 3);
        assert_eq!(ai.scope_at(8), 0);
    }

    #[test]
    fn test_depth_mismatch_rejected() {
        let mut b = CodeBuilder::new("bad");
        let c = b.add_const(ValueRef::from_int(1));
        b.emit(Opcode::LoadConst, c); // 0
        b.emit(Opcode::PopJumpIfFalse, 8); // 2
        b.emit(Opcode::LoadConst, c); // 4
        b.emit(Opcode::JumpAbsolute, 8); // 6  (depth 1 into merge)
        b.op(Opcode::ReturnValue); // 8  (depth 0 from the pop-jump path)
        let code = b.build();
        let mut ai = AbstractInterpreter::new(&code).unwrap();
        assert!(ai.interpret().is_err());
    }

    #[test]
    fn test_bad_jump_rejected() {
        let mut b = CodeBuilder::new("bad");
        b.emit(Opcode::JumpAbsolute, 100);
        let code = b.build();
        let mut ai = AbstractInterpreter::new(&code).unwrap();
        assert!(matches!(
            ai.interpret(),
            Err(AbsIntError::BadJump { .. })
        ));
    }
}
