//! Code objects: the read-only compilation input
//!
//! A `CodeObject` carries everything the abstract interpreter and compiler
//! driver need: wordcode bytes, constant pool, name pool, slot counts, and
//! a stack-depth bound. `CodeBuilder` is the assembler used by hosts and
//! tests to construct code objects directly.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::vm::opcode::Opcode;
use crate::vm::value::ValueRef;

/// Process-unique code object identity, used as the dispatcher's cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeId(pub u64);

static NEXT_CODE_ID: AtomicU64 = AtomicU64::new(1);

/// Code object flags relevant to the JIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeFlags(pub u8);

impl CodeFlags {
    pub const GENERATOR: CodeFlags = CodeFlags(0x01);
    pub const COROUTINE: CodeFlags = CodeFlags(0x02);

    pub fn contains(self, other: CodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: CodeFlags) {
        self.0 |= other.0;
    }
}

/// A function's compiled bytecode and pools. Read-only once built.
pub struct CodeObject {
    pub id: CodeId,
    pub name: String,
    pub filename: String,
    pub first_line: u32,
    /// Wordcode: pairs of (opcode, oparg) bytes, `ExtendedArg` widens.
    pub code: Vec<u8>,
    /// Constant pool. The code object owns one reference to each entry.
    pub consts: Vec<ValueRef>,
    /// Name pool (attributes, globals, imports).
    pub names: Vec<String>,
    /// Local variable names, for unbound-local error messages.
    pub varnames: Vec<String>,
    pub arg_count: u16,
    pub local_count: u16,
    pub cell_count: u16,
    pub free_count: u16,
    pub max_stack: u16,
    pub flags: CodeFlags,
}

impl CodeObject {
    /// Total frame slots: locals followed by cell/free variables.
    pub fn slot_count(&self) -> usize {
        self.local_count as usize + self.cell_count as usize + self.free_count as usize
    }

    pub fn const_at(&self, index: usize) -> Option<ValueRef> {
        self.consts.get(index).copied()
    }

    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(|s| s.as_str())
    }

    pub fn varname(&self, index: usize) -> &str {
        self.varnames
            .get(index)
            .map(|s| s.as_str())
            .unwrap_or("<anonymous>")
    }

    /// Generator and coroutine code objects are permanently
    /// interpreter-bound (the dispatcher refuses them).
    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR) || self.flags.contains(CodeFlags::COROUTINE)
    }
}

impl Drop for CodeObject {
    fn drop(&mut self) {
        for c in self.consts.drain(..) {
            c.decref();
        }
    }
}

impl std::fmt::Debug for CodeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<code {} at {}:{} ({} bytes)>",
            self.name,
            self.filename,
            self.first_line,
            self.code.len()
        )
    }
}

/// Assembler for code objects.
pub struct CodeBuilder {
    name: String,
    filename: String,
    first_line: u32,
    code: Vec<u8>,
    consts: Vec<ValueRef>,
    names: Vec<String>,
    varnames: Vec<String>,
    arg_count: u16,
    local_count: u16,
    cell_count: u16,
    max_stack: u16,
    flags: CodeFlags,
}

impl CodeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        CodeBuilder {
            name: name.into(),
            filename: "<assembled>".to_string(),
            first_line: 1,
            code: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            arg_count: 0,
            local_count: 0,
            cell_count: 0,
            max_stack: 16,
            flags: CodeFlags::default(),
        }
    }

    pub fn arg_count(mut self, n: u16) -> Self {
        self.arg_count = n;
        if self.local_count < n {
            self.local_count = n;
        }
        self
    }

    pub fn local_count(mut self, n: u16) -> Self {
        self.local_count = n;
        self
    }

    pub fn cell_count(mut self, n: u16) -> Self {
        self.cell_count = n;
        self
    }

    pub fn max_stack(mut self, n: u16) -> Self {
        self.max_stack = n;
        self
    }

    pub fn generator(mut self) -> Self {
        self.flags.insert(CodeFlags::GENERATOR);
        self
    }

    /// Intern a constant; the builder takes over the caller's reference.
    pub fn add_const(&mut self, v: ValueRef) -> u32 {
        self.consts.push(v);
        (self.consts.len() - 1) as u32
    }

    pub fn add_name(&mut self, name: impl Into<String>) -> u32 {
        let name = name.into();
        if let Some(i) = self.names.iter().position(|n| *n == name) {
            return i as u32;
        }
        self.names.push(name);
        (self.names.len() - 1) as u32
    }

    pub fn add_varname(&mut self, name: impl Into<String>) -> u32 {
        self.varnames.push(name.into());
        (self.varnames.len() - 1) as u32
    }

    /// Current bytecode offset; the next emitted instruction lands here.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Emit one instruction, inserting `ExtendedArg` prefixes as needed.
    pub fn emit(&mut self, op: Opcode, arg: u32) {
        if arg > 0xFF_FFFF {
            self.code.push(Opcode::ExtendedArg as u8);
            self.code.push((arg >> 24) as u8);
        }
        if arg > 0xFFFF {
            self.code.push(Opcode::ExtendedArg as u8);
            self.code.push((arg >> 16) as u8);
        }
        if arg > 0xFF {
            self.code.push(Opcode::ExtendedArg as u8);
            self.code.push((arg >> 8) as u8);
        }
        self.code.push(op as u8);
        self.code.push(arg as u8);
    }

    /// Emit an argument-less instruction.
    pub fn op(&mut self, op: Opcode) {
        self.emit(op, 0);
    }

    /// Patch a previously emitted single-byte oparg in place.
    pub fn patch_arg(&mut self, instr_offset: usize, arg: u8) {
        self.code[instr_offset + 1] = arg;
    }

    pub fn build(self) -> CodeObject {
        CodeObject {
            id: CodeId(NEXT_CODE_ID.fetch_add(1, Ordering::Relaxed)),
            name: self.name,
            filename: self.filename,
            first_line: self.first_line,
            code: self.code,
            consts: self.consts,
            names: self.names,
            varnames: self.varnames,
            arg_count: self.arg_count,
            local_count: self.local_count,
            cell_count: self.cell_count,
            free_count: 0,
            max_stack: self.max_stack,
            flags: self.flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::ValueRef;

    #[test]
    fn test_builder_basic() {
        let mut b = CodeBuilder::new("f").arg_count(1);
        let c = b.add_const(ValueRef::from_int(42));
        b.emit(Opcode::LoadConst, c);
        b.op(Opcode::ReturnValue);
        let code = b.build();
        assert_eq!(code.code.len(), 4);
        assert_eq!(code.arg_count, 1);
        assert_eq!(code.const_at(0).unwrap().int_value(), Some(42));
    }

    #[test]
    fn test_extended_arg_emission() {
        let mut b = CodeBuilder::new("wide");
        b.emit(Opcode::LoadConst, 0x1_02);
        let code = b.build();
        assert_eq!(code.code[0], Opcode::ExtendedArg as u8);
        assert_eq!(code.code[1], 0x01);
        assert_eq!(code.code[2], Opcode::LoadConst as u8);
        assert_eq!(code.code[3], 0x02);
    }

    #[test]
    fn test_code_ids_unique() {
        let a = CodeBuilder::new("a").build();
        let b = CodeBuilder::new("b").build();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_name_interning() {
        let mut b = CodeBuilder::new("n");
        let i = b.add_name("x");
        let j = b.add_name("x");
        let k = b.add_name("y");
        assert_eq!(i, j);
        assert_ne!(i, k);
    }
}
