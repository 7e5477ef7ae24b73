//! Shared helpers for the integration suites: assemble code objects,
//! run the full analysis + lowering pipeline against the stub backend,
//! and inspect the produced IL as text.

use molt_jit::absint::AbstractInterpreter;
use molt_jit::backend::StubBackend;
use molt_jit::compiler::{CompileError, CompilerDriver};
use molt_jit::il::display::disassemble;
use molt_jit::il::CompiledMethod;
use molt_jit::vm::CodeObject;

/// Run analysis and compilation for a code object.
pub fn compile(code: &CodeObject) -> Result<CompiledMethod, CompileError> {
    let mut ai = AbstractInterpreter::new(code)?;
    ai.interpret()?;
    let driver = CompilerDriver::new(code, &ai)?;
    driver.compile(&StubBackend)
}

/// Run analysis with seeded argument kinds, then compile.
pub fn compile_specialized(
    code: &CodeObject,
    kinds: &[molt_jit::lattice::AbstractValueKind],
) -> Result<CompiledMethod, CompileError> {
    let mut ai = AbstractInterpreter::new(code)?;
    for (i, k) in kinds.iter().enumerate() {
        ai.set_arg_kind(i, *k);
    }
    ai.interpret()?;
    let driver = CompilerDriver::new(code, &ai)?;
    driver.compile(&StubBackend)
}

/// Compile and return the disassembled IL.
pub fn compile_text(code: &CodeObject) -> String {
    disassemble(&compile(code).expect("compilation failed").il)
}

/// The disassembler's rendering of a helper-call operand.
pub fn helper(id: u32) -> String {
    format!("helper:{:#x}", id)
}
