//! Specialization dispatcher
//!
//! Decides whether and when to compile a code object, caches compiled
//! variants by argument shape, and routes calls between native entry
//! points and the host interpreter. One `JittedCode` record per code
//! object; process-wide installation state, threshold, and counters live
//! behind accessors so embedders and tests can reset them.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::absint::AbstractInterpreter;
use crate::backend::CodegenBackend;
use crate::compiler::{CompileError, CompilerDriver};
use crate::helpers::intrins;
use crate::il::CompiledMethod;
use crate::lattice::{kind_of_value, AbstractValueKind};
use crate::vm::code::{CodeId, CodeObject};
use crate::vm::exc;
use crate::vm::frame::Frame;
use crate::vm::value::{dict_get_str, new_dict, ExcKind, FunctionKind, Payload, ValueRef};

/// Upper bound on recorded argument shapes per code object.
pub const MAX_SPECIALIZATIONS: usize = 5;

const DEFAULT_THRESHOLD: u32 = 1000;

/// Opaque evaluator-state parameter of the jitted entry ABI (the record
/// that owns the entry point).
#[repr(C)]
pub struct EvalState {
    _private: [u8; 0],
}

/// Native entry ABI: returns a new reference, or null with the thread's
/// exception set.
pub type EvaluatorFn = unsafe extern "C" fn(*mut EvalState, *mut Frame) -> ValueRef;

/// Host fallback evaluator (the interpreter).
pub type InterpFn = fn(&CodeObject, &mut Frame) -> ValueRef;

/// One compiled variant keyed by an exact argument-type vector.
pub struct SpecializationNode {
    pub types: Vec<AbstractValueKind>,
    pub entry: Option<EvaluatorFn>,
    pub hit_count: u32,
    /// Owns the native buffer backing `entry`.
    code: Option<CompiledMethod>,
}

impl SpecializationNode {
    fn new(types: Vec<AbstractValueKind>) -> SpecializationNode {
        SpecializationNode {
            types,
            entry: None,
            hit_count: 0,
            code: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EvalMode {
    /// Still counting invocations toward the threshold.
    Counting,
    /// The Any-typed generic entry is installed; argument shapes are
    /// recorded and hot ones get their own compiled variant.
    Specializing,
}

/// Per-code-object compilation state.
pub struct JittedCode {
    code: Arc<CodeObject>,
    pub failed: bool,
    pub run_count: u32,
    /// Threshold captured when the record was created.
    pub threshold: u32,
    /// Serialized IL of the installed entry (for `dump_il`).
    pub il: Vec<u8>,
    pub native_size: usize,
    generic: Option<EvaluatorFn>,
    generic_code: Option<CompiledMethod>,
    pub specializations: Vec<SpecializationNode>,
    mode: EvalMode,
}

impl JittedCode {
    fn new(code: Arc<CodeObject>) -> JittedCode {
        JittedCode {
            code,
            failed: false,
            run_count: 0,
            threshold: get_threshold(),
            il: Vec::new(),
            native_size: 0,
            generic: None,
            generic_code: None,
            specializations: Vec::new(),
            mode: EvalMode::Counting,
        }
    }

    pub fn code(&self) -> &CodeObject {
        &self.code
    }

    pub fn compiled(&self) -> bool {
        self.generic.is_some() || self.specializations.iter().any(|n| n.entry.is_some())
    }
}

/// The dispatcher: registry of records plus the compile pipeline.
pub struct Dispatcher {
    records: Mutex<FxHashMap<CodeId, Box<JittedCode>>>,
    backend: Box<dyn CodegenBackend>,
    interp: InterpFn,
}

impl Dispatcher {
    pub fn new(backend: Box<dyn CodegenBackend>, interp: InterpFn) -> Dispatcher {
        Dispatcher {
            records: Mutex::new(FxHashMap::default()),
            backend,
            interp,
        }
    }

    /// The frame-evaluation hook: route this invocation.
    pub fn eval_frame(&self, frame: &mut Frame) -> ValueRef {
        eval_via(self, frame)
    }
}

fn arg_type_vector(code: &CodeObject, frame: &Frame) -> Vec<AbstractValueKind> {
    (0..code.arg_count as usize)
        .map(|i| {
            let v = frame.slot(i);
            if v.is_null() {
                AbstractValueKind::Any
            } else {
                kind_of_value(v)
            }
        })
        .collect()
}

/// Compile `code` with the given argument kinds seeded into the analyzer.
fn compile_with_kinds(
    backend: &dyn CodegenBackend,
    code: &CodeObject,
    kinds: &[AbstractValueKind],
) -> Result<CompiledMethod, CompileError> {
    let mut ai = AbstractInterpreter::new(code)?;
    for (i, k) in kinds.iter().enumerate() {
        ai.set_arg_kind(i, *k);
    }
    ai.interpret()?;
    let driver = CompilerDriver::new(code, &ai)?;
    driver.compile(backend)
}

fn entry_of(method: &CompiledMethod) -> EvaluatorFn {
    // Safety: the backend produced this buffer for exactly this ABI.
    unsafe { std::mem::transmute::<*const u8, EvaluatorFn>(method.native.entry()) }
}

static INSTALLED: AtomicBool = AtomicBool::new(false);
static THRESHOLD: AtomicU32 = AtomicU32::new(DEFAULT_THRESHOLD);
static COMPILED_COUNT: AtomicU64 = AtomicU64::new(0);
static FAILED_COUNT: AtomicU64 = AtomicU64::new(0);

static DISPATCHER: Lazy<Mutex<Option<Arc<Dispatcher>>>> = Lazy::new(|| Mutex::new(None));

/// Install the dispatcher instance used by the process-level API. The
/// host calls this once at startup with its backend and interpreter.
pub fn initialize(backend: Box<dyn CodegenBackend>, interp: InterpFn) {
    *DISPATCHER.lock() = Some(Arc::new(Dispatcher::new(backend, interp)));
}

fn dispatcher() -> Option<Arc<Dispatcher>> {
    DISPATCHER.lock().clone()
}

/// Install the frame-evaluation hook. Returns true when the state
/// changed (it was not installed before).
pub fn enable() -> bool {
    !INSTALLED.swap(true, Ordering::SeqCst)
}

/// Uninstall the frame-evaluation hook. Returns true when the state
/// changed.
pub fn disable() -> bool {
    INSTALLED.swap(false, Ordering::SeqCst)
}

/// Whether the dispatcher is installed.
pub fn status() -> bool {
    INSTALLED.load(Ordering::SeqCst)
}

/// Process-wide invocation threshold.
pub fn get_threshold() -> u32 {
    THRESHOLD.load(Ordering::SeqCst)
}

/// Set the threshold; returns the previous value.
pub fn set_threshold(value: u32) -> u32 {
    THRESHOLD.swap(value, Ordering::SeqCst)
}

/// Per-code-object introspection, serializable as a map.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CodeInfo {
    pub failed: bool,
    pub compiled: bool,
    pub run_count: u64,
}

/// Process-level counters, serializable as a map.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JitStats {
    pub failed: u64,
    pub compiled: u64,
}

/// JIT status of one code object.
pub fn info(code: &CodeObject) -> CodeInfo {
    if let Some(d) = dispatcher() {
        let records = d.records.lock();
        if let Some(r) = records.get(&code.id) {
            return CodeInfo {
                failed: r.failed,
                compiled: r.compiled(),
                run_count: r.run_count as u64,
            };
        }
    }
    CodeInfo {
        failed: false,
        compiled: false,
        run_count: 0,
    }
}

/// Process-level compile counters.
pub fn stats() -> JitStats {
    JitStats {
        failed: FAILED_COUNT.load(Ordering::SeqCst),
        compiled: COMPILED_COUNT.load(Ordering::SeqCst),
    }
}

/// IL bytes of the compiled form, when one exists.
pub fn dump_il(code: &CodeObject) -> Option<Vec<u8>> {
    let d = dispatcher()?;
    let records = d.records.lock();
    let r = records.get(&code.id)?;
    if r.failed || !r.compiled() {
        return None;
    }
    Some(r.il.clone())
}

/// Native code bytes of the compiled form, when one exists.
pub fn dump_native(code: &CodeObject) -> Option<Vec<u8>> {
    let d = dispatcher()?;
    let records = d.records.lock();
    let r = records.get(&code.id)?;
    if r.failed {
        return None;
    }
    if let Some(method) = r.generic_code.as_ref() {
        return Some(method.native.bytes());
    }
    r.specializations
        .iter()
        .find_map(|n| n.code.as_ref())
        .map(|m| m.native.bytes())
}

/// Drop all records and restore defaults. Test/reset hook.
pub fn reset() {
    if let Some(d) = dispatcher() {
        d.records.lock().clear();
    }
    INSTALLED.store(false, Ordering::SeqCst);
    THRESHOLD.store(DEFAULT_THRESHOLD, Ordering::SeqCst);
    COMPILED_COUNT.store(0, Ordering::SeqCst);
    FAILED_COUNT.store(0, Ordering::SeqCst);
}

/// Evaluate a frame through the installed dispatcher, or the interpreter
/// when the hook is disabled.
pub fn eval_frame(frame: &mut Frame) -> ValueRef {
    match dispatcher() {
        Some(d) => {
            if status() {
                eval_via(&d, frame)
            } else {
                let code = frame.code_arc();
                (d.interp)(&code, frame)
            }
        }
        None => {
            exc::raise(ExcKind::RuntimeError, "no evaluator installed");
            ValueRef::NULL
        }
    }
}

fn eval_via(d: &Dispatcher, frame: &mut Frame) -> ValueRef {
    let code = frame.code_arc();
    if code.is_generator() {
        return (d.interp)(&code, frame);
    }

    enum Action {
        Interp,
        Native(EvaluatorFn, *mut EvalState),
    }

    let action = {
        let mut records = d.records.lock();
        let record = records
            .entry(code.id)
            .or_insert_with(|| Box::new(JittedCode::new(code.clone())));
        if record.failed {
            Action::Interp
        } else {
            record.run_count += 1;
            match record.mode {
                EvalMode::Counting => {
                    if record.run_count < record.threshold {
                        Action::Interp
                    } else {
                        // Hot: compile the generic entry first, with Any
                        // for every argument kind, so it is valid for any
                        // argument shape.
                        let any = vec![AbstractValueKind::Any; code.arg_count as usize];
                        match compile_with_kinds(&*d.backend, &code, &any) {
                            Ok(method) => {
                                COMPILED_COUNT.fetch_add(1, Ordering::SeqCst);
                                let entry = entry_of(&method);
                                record.il = method.il.clone();
                                record.native_size = method.native.size();
                                record.generic = Some(entry);
                                record.generic_code = Some(method);
                                record.mode = EvalMode::Specializing;
                                let state = (&mut **record) as *mut JittedCode as *mut EvalState;
                                Action::Native(entry, state)
                            }
                            Err(_) => {
                                FAILED_COUNT.fetch_add(1, Ordering::SeqCst);
                                record.failed = true;
                                Action::Interp
                            }
                        }
                    }
                }
                EvalMode::Specializing => {
                    let generic = record.generic.expect("specializing without generic entry");
                    let types = arg_type_vector(&code, frame);
                    if types.is_empty() {
                        // No arguments: the generic entry is the exact
                        // variant.
                        let state = (&mut **record) as *mut JittedCode as *mut EvalState;
                        Action::Native(generic, state)
                    } else {
                        let matched = record
                            .specializations
                            .iter()
                            .position(|n| n.types == types);
                        match matched {
                            // A specialized entry runs only when the
                            // argument-type vector matches its recorded
                            // vector exactly.
                            Some(i) if record.specializations[i].entry.is_some() => {
                                let entry = record.specializations[i].entry.unwrap();
                                let state = (&mut **record) as *mut JittedCode as *mut EvalState;
                                Action::Native(entry, state)
                            }
                            Some(i) => {
                                record.specializations[i].hit_count += 1;
                                if record.specializations[i].hit_count >= record.threshold {
                                    match compile_with_kinds(&*d.backend, &code, &types) {
                                        Ok(method) => {
                                            COMPILED_COUNT.fetch_add(1, Ordering::SeqCst);
                                            let entry = entry_of(&method);
                                            record.il = method.il.clone();
                                            record.native_size = method.native.size();
                                            record.specializations[i].entry = Some(entry);
                                            record.specializations[i].code = Some(method);
                                            let state = (&mut **record) as *mut JittedCode
                                                as *mut EvalState;
                                            Action::Native(entry, state)
                                        }
                                        Err(_) => {
                                            FAILED_COUNT.fetch_add(1, Ordering::SeqCst);
                                            record.failed = true;
                                            Action::Interp
                                        }
                                    }
                                } else {
                                    // Recorded but not yet hot: the
                                    // shape-agnostic generic entry serves
                                    // it.
                                    let state =
                                        (&mut **record) as *mut JittedCode as *mut EvalState;
                                    Action::Native(generic, state)
                                }
                            }
                            None if record.specializations.len() < MAX_SPECIALIZATIONS => {
                                record.specializations.push(SpecializationNode::new(types));
                                Action::Interp
                            }
                            None => {
                                let state = (&mut **record) as *mut JittedCode as *mut EvalState;
                                Action::Native(generic, state)
                            }
                        }
                    }
                }
            }
        }
    };

    match action {
        Action::Interp => (d.interp)(&code, frame),
        Action::Native(entry, state) => unsafe { entry(state, frame) },
    }
}

/// Call a bytecode-backed function value with borrowed arguments. Used by
/// the call helpers when emitted code invokes a non-native function.
pub fn call_bytecode(func: ValueRef, args: &[ValueRef]) -> ValueRef {
    let (code, globals) = match func.payload() {
        Payload::Function(data) => match &data.kind {
            FunctionKind::Bytecode { code, globals } => (code.clone(), *globals),
            _ => {
                exc::raise(ExcKind::TypeError, "not a bytecode function");
                return ValueRef::NULL;
            }
        },
        _ => {
            exc::raise(ExcKind::TypeError, "not a bytecode function");
            return ValueRef::NULL;
        }
    };
    if args.len() != code.arg_count as usize {
        exc::raise(
            ExcKind::TypeError,
            format!(
                "{}() takes {} arguments ({} given)",
                code.name, code.arg_count, args.len()
            ),
        );
        return ValueRef::NULL;
    }
    globals.incref();
    let builtins = match dict_get_str(globals, "__builtins__") {
        Some(b) => {
            b.incref();
            b
        }
        None => new_dict(),
    };
    let mut frame = Frame::new(code, globals, builtins);
    for (i, a) in args.iter().enumerate() {
        a.incref();
        frame.set_arg(i, *a);
    }
    eval_frame(&mut frame)
}

// Re-export so embedders reach the module registry next to the rest of
// the host-facing surface.
pub use crate::helpers::intrins::register_module;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::code::CodeBuilder;
    use crate::vm::opcode::Opcode;
    use crate::vm::value::{new_dict, none_value};

    // The dispatcher state is process-wide; serialize the tests that
    // touch it.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn interp_returns_seven(_code: &CodeObject, _frame: &mut Frame) -> ValueRef {
        ValueRef::from_int(7)
    }

    /// A "native entry" the test backend can stand in with.
    unsafe extern "C" fn fake_entry(_state: *mut EvalState, _frame: *mut Frame) -> ValueRef {
        ValueRef::from_int(42)
    }

    struct FnBackend;

    impl CodegenBackend for FnBackend {
        fn name(&self) -> &str {
            "fn-backend"
        }

        fn compile_method(
            &self,
            body: &crate::il::MethodBody<'_>,
        ) -> Result<crate::backend::NativeCode, crate::backend::CodegenError> {
            let _ = body;
            Ok(crate::backend::NativeCode::from_entry(
                fake_entry as *const u8,
                1,
            ))
        }
    }

    fn simple_code() -> CodeObject {
        let mut b = CodeBuilder::new("f");
        let c = b.add_const(ValueRef::from_int(1));
        b.emit(Opcode::LoadConst, c);
        b.op(Opcode::ReturnValue);
        b.build()
    }

    fn run_frame(code: &Arc<CodeObject>) -> ValueRef {
        let mut frame = Frame::new(code.clone(), new_dict(), new_dict());
        eval_frame(&mut frame)
    }

    #[test]
    fn test_dispatcher_full_lifecycle() {
        let _guard = TEST_LOCK.lock();
        initialize(Box::new(FnBackend), interp_returns_seven);
        reset();
        set_threshold(2);
        enable();

        let code = Arc::new(simple_code());
        // Below threshold: interpreter.
        let r = run_frame(&code);
        assert_eq!(r.int_value(), Some(7));
        assert!(!info(&code).compiled);

        // Crossing the threshold compiles and installs the generic entry.
        let r = run_frame(&code);
        assert_eq!(r.int_value(), Some(42));
        // With no arguments the generic entry is the exact variant.
        for _ in 0..3 {
            let r = run_frame(&code);
            assert_eq!(r.int_value(), Some(42));
        }
        let i = info(&code);
        assert!(i.compiled);
        assert!(!i.failed);
        assert!(stats().compiled >= 1);
        assert!(dump_il(&code).is_some());
        assert!(dump_native(&code).is_some());
        reset();
    }

    #[test]
    fn test_specialized_shapes_dispatch_independently() {
        let _guard = TEST_LOCK.lock();
        use std::sync::atomic::AtomicUsize;

        // Distinct entry points per compilation, so the test can tell
        // which variant a call was routed to.
        unsafe extern "C" fn entry_generic(_s: *mut EvalState, _f: *mut Frame) -> ValueRef {
            ValueRef::from_int(1001)
        }
        unsafe extern "C" fn entry_first(_s: *mut EvalState, _f: *mut Frame) -> ValueRef {
            ValueRef::from_int(1002)
        }
        unsafe extern "C" fn entry_second(_s: *mut EvalState, _f: *mut Frame) -> ValueRef {
            ValueRef::from_int(1003)
        }

        struct SeqBackend(AtomicUsize);

        impl CodegenBackend for SeqBackend {
            fn name(&self) -> &str {
                "seq"
            }

            fn compile_method(
                &self,
                _body: &crate::il::MethodBody<'_>,
            ) -> Result<crate::backend::NativeCode, crate::backend::CodegenError> {
                let entries = [
                    entry_generic as *const u8,
                    entry_first as *const u8,
                    entry_second as *const u8,
                ];
                let i = self.0.fetch_add(1, Ordering::SeqCst).min(2);
                Ok(crate::backend::NativeCode::from_entry(entries[i], 1))
            }
        }

        initialize(Box::new(SeqBackend(AtomicUsize::new(0))), interp_returns_seven);
        reset();
        set_threshold(2);
        enable();

        // f(x): return x
        let code = {
            let mut b = CodeBuilder::new("f").arg_count(1);
            b.emit(Opcode::LoadFast, 0);
            b.op(Opcode::ReturnValue);
            Arc::new(b.build())
        };
        let run_with = |v: ValueRef| {
            let mut frame = Frame::new(code.clone(), new_dict(), new_dict());
            frame.set_arg(0, v);
            eval_frame(&mut frame)
        };
        let int_arg = || ValueRef::from_int(5);
        let float_arg = || crate::vm::value::new_float(2.5);

        // Counting, then the Any-typed generic entry comes up.
        assert_eq!(run_with(int_arg()).int_value(), Some(7));
        assert_eq!(run_with(int_arg()).int_value(), Some(1001));
        // Integer shape: recorded (interpreter pass), warm (generic),
        // then hot enough to get its own variant.
        assert_eq!(run_with(int_arg()).int_value(), Some(7));
        assert_eq!(run_with(int_arg()).int_value(), Some(1001));
        assert_eq!(run_with(int_arg()).int_value(), Some(1002));

        // A different shape must not reach the Integer-specialized entry:
        // it is recorded, then served by the shape-agnostic generic.
        assert_eq!(run_with(float_arg()).int_value(), Some(7));
        assert_eq!(run_with(float_arg()).int_value(), Some(1001));
        // Hot: the Float shape compiles its own variant.
        assert_eq!(run_with(float_arg()).int_value(), Some(1003));

        // Each shape keeps dispatching to exactly its own entry.
        assert_eq!(run_with(int_arg()).int_value(), Some(1002));
        assert_eq!(run_with(float_arg()).int_value(), Some(1003));
        assert!(stats().compiled >= 3);
        reset();
    }

    #[test]
    fn test_enable_disable_idempotence() {
        let _guard = TEST_LOCK.lock();
        initialize(Box::new(FnBackend), interp_returns_seven);
        reset();
        assert!(enable());
        assert!(!enable());
        assert!(status());
        assert!(disable());
        assert!(!disable());
        assert!(!status());
        reset();
    }

    #[test]
    fn test_threshold_accessors() {
        let _guard = TEST_LOCK.lock();
        initialize(Box::new(FnBackend), interp_returns_seven);
        reset();
        let prev = set_threshold(17);
        assert_eq!(prev, DEFAULT_THRESHOLD);
        assert_eq!(get_threshold(), 17);
        reset();
        assert_eq!(get_threshold(), DEFAULT_THRESHOLD);
    }

    #[test]
    fn test_generator_code_stays_interpreted() {
        let _guard = TEST_LOCK.lock();
        initialize(Box::new(FnBackend), interp_returns_seven);
        reset();
        set_threshold(1);
        enable();
        let code = Arc::new(CodeBuilder::new("gen").generator().build());
        for _ in 0..5 {
            let r = run_frame(&code);
            assert_eq!(r.int_value(), Some(7));
        }
        assert!(!info(&code).compiled);
        reset();
    }

    #[test]
    fn test_failed_compilation_pins_interpreter() {
        let _guard = TEST_LOCK.lock();
        struct FailBackend;
        impl CodegenBackend for FailBackend {
            fn name(&self) -> &str {
                "fail"
            }
            fn compile_method(
                &self,
                _body: &crate::il::MethodBody<'_>,
            ) -> Result<crate::backend::NativeCode, crate::backend::CodegenError> {
                Err(crate::backend::CodegenError::BackendError(
                    "no codegen".to_string(),
                ))
            }
        }
        initialize(Box::new(FailBackend), interp_returns_seven);
        reset();
        set_threshold(1);
        enable();
        let code = Arc::new(simple_code());
        for _ in 0..4 {
            let r = run_frame(&code);
            assert_eq!(r.int_value(), Some(7), "always interpreted");
        }
        let i = info(&code);
        assert!(i.failed);
        assert!(!i.compiled);
        assert!(stats().failed >= 1);
        assert!(dump_il(&code).is_none());
        // Permanently pinned: further calls never retry.
        let r = run_frame(&code);
        assert_eq!(r.int_value(), Some(7));
        reset();
    }

    #[test]
    fn test_info_serializes_as_map() {
        let _guard = TEST_LOCK.lock();
        let code = simple_code();
        let json = serde_json::to_value(info(&code)).unwrap();
        assert!(json.get("failed").is_some());
        assert!(json.get("compiled").is_some());
        assert!(json.get("run_count").is_some());
        let stats_json = serde_json::to_value(stats()).unwrap();
        assert!(stats_json.get("failed").is_some());
        assert!(stats_json.get("compiled").is_some());
        let _ = none_value();
    }
}
