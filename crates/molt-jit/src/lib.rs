//! Molt JIT
//!
//! A specializing just-in-time compiler for the Molt VM's dynamically
//! typed, stack-based bytecode:
//! - **Abstract interpreter**: fixed-point type analysis with per-offset
//!   stack/local snapshots (`absint`, `lattice`)
//! - **Compiler driver**: opcode-by-opcode lowering to a typed stack IL,
//!   with exception-handler modeling and explicit reference-count
//!   management (`compiler`, `ehandling`, `il`)
//! - **Runtime helper catalog**: the registry of primitives emitted code
//!   calls (`helpers`)
//! - **Backend seam**: pluggable machine-code generation behind
//!   `CodegenBackend` (`backend`)
//! - **Specialization dispatcher**: per-code-object caching by argument
//!   shape, thresholds, and the process control API (`dispatch`)
//! - **Host model**: values, code objects, frames, and exception state
//!   the compiler targets (`vm`)
//!
//! # Example
//!
//! ```rust,ignore
//! use molt_jit::vm::{CodeBuilder, Opcode, ValueRef};
//! use molt_jit::absint::AbstractInterpreter;
//!
//! let mut b = CodeBuilder::new("f");
//! let c = b.add_const(ValueRef::from_int(42));
//! b.emit(Opcode::LoadConst, c);
//! b.op(Opcode::ReturnValue);
//! let code = b.build();
//!
//! let mut ai = AbstractInterpreter::new(&code).unwrap();
//! ai.interpret().unwrap();
//! assert_eq!(ai.get_return_info().kind().to_string(), "int");
//! ```

#![warn(rust_2018_idioms)]

/// Abstract interpreter: worklist fixed point over bytecode
pub mod absint;

/// Backend seam: machine-code generation behind a trait
pub mod backend;

/// Compiler driver: opcode lowering to IL
pub mod compiler;

/// Specialization dispatcher and process control API
pub mod dispatch;

/// Exception-handler arena for one compilation
pub mod ehandling;

/// Runtime helper catalog and intrinsic implementations
pub mod helpers;

/// Typed stack-IL emitter
pub mod il;

/// Abstract value lattice: kinds, join, operator tables
pub mod lattice;

/// Host VM model: values, code objects, frames, exception state
pub mod vm;

pub use self::absint::{AbsIntError, AbstractInterpreter, InterpState, LocalInfo};
pub use self::backend::{CodegenBackend, CodegenError, ExecBuffer, NativeCode, StubBackend};
pub use self::compiler::{stack::StackEntryKind, CompileError, CompilerDriver};
pub use self::dispatch::{
    disable, dump_il, dump_native, enable, get_threshold, info, initialize, register_module,
    reset, set_threshold, stats, status, CodeInfo, Dispatcher, EvaluatorFn, JitStats, JittedCode,
};
pub use self::ehandling::{ExcVars, ExceptionHandler, HandlerArena};
pub use self::il::{BranchKind, CompiledMethod, IlEmitter, IlLocal, IlType, Label, MethodSig};
pub use self::lattice::{AbstractValue, AbstractValueKind, BinaryOp, UnaryOp};
pub use self::vm::{CodeBuilder, CodeObject, Frame, Opcode, ValueRef};
