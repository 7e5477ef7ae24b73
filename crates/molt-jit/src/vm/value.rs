//! Value representation for the Molt VM
//!
//! Values are reference-counted heap cells addressed through `ValueRef`, a
//! single pointer-sized word. Small integers are packed directly into the
//! word with a one-bit tag so the common integer case never allocates.
//! Everything emitted code touches goes through this representation, so the
//! layout and the incref/decref contract here are ABI.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::vm::code::CodeObject;

/// Smallest integer representable in the tagged encoding.
pub const TAGGED_MIN: i64 = -(1 << 62);
/// Largest integer representable in the tagged encoding.
pub const TAGGED_MAX: i64 = (1 << 62) - 1;

/// Initial refcount for immortal cells (singletons, type objects). Large
/// enough that paired incref/decref traffic can never reach zero.
const IMMORTAL: usize = usize::MAX / 2;

/// A reference to a VM value.
///
/// The word is either:
/// - `0`: null (no value; in helper returns this means "exception pending"),
/// - odd: a tagged small integer, value in the upper 63 bits,
/// - even non-zero: a pointer to a heap [`ObjectCell`].
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueRef(pub usize);

impl ValueRef {
    /// The null reference.
    pub const NULL: ValueRef = ValueRef(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether this reference is a tagged small integer rather than a pointer.
    pub fn is_tagged(self) -> bool {
        self.0 & 1 == 1
    }

    /// Pack a small integer. Caller must ensure `v` is in the tagged range.
    pub fn from_tagged(v: i64) -> ValueRef {
        debug_assert!((TAGGED_MIN..=TAGGED_MAX).contains(&v));
        ValueRef(((v << 1) | 1) as usize)
    }

    /// Unpack a tagged small integer.
    pub fn tagged_value(self) -> i64 {
        debug_assert!(self.is_tagged());
        (self.0 as i64) >> 1
    }

    /// Make an integer value, tagged when it fits, boxed otherwise.
    pub fn from_int(v: i64) -> ValueRef {
        if (TAGGED_MIN..=TAGGED_MAX).contains(&v) {
            ValueRef::from_tagged(v)
        } else {
            alloc(Payload::Int(v))
        }
    }

    pub(crate) fn cell<'a>(self) -> &'a ObjectCell {
        debug_assert!(!self.is_null() && !self.is_tagged());
        unsafe { &*(self.0 as *const ObjectCell) }
    }

    /// Payload of a heap value. Must not be called on null or tagged refs.
    pub fn payload<'a>(self) -> &'a Payload {
        &self.cell().payload
    }

    /// Increment the reference count. No-op for null and tagged refs.
    pub fn incref(self) {
        if self.is_null() || self.is_tagged() {
            return;
        }
        self.cell().refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the reference count, freeing the cell at zero. No-op for
    /// null and tagged refs.
    pub fn decref(self) {
        if self.is_null() || self.is_tagged() {
            return;
        }
        if self.cell().refcount.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            unsafe { drop(Box::from_raw(self.0 as *mut ObjectCell)) }
        }
    }

    /// Current reference count (tagged refs report 1).
    pub fn refcount(self) -> usize {
        if self.is_null() || self.is_tagged() {
            1
        } else {
            self.cell().refcount.load(Ordering::Relaxed)
        }
    }

    /// Integer value for Int (tagged or boxed) and Bool payloads.
    pub fn int_value(self) -> Option<i64> {
        if self.is_null() {
            return None;
        }
        if self.is_tagged() {
            return Some(self.tagged_value());
        }
        match self.payload() {
            Payload::Int(v) => Some(*v),
            Payload::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Float value for Float payloads and anything `int_value` accepts.
    pub fn float_value(self) -> Option<f64> {
        if !self.is_null() && !self.is_tagged() {
            if let Payload::Float(f) = self.payload() {
                return Some(*f);
            }
        }
        self.int_value().map(|v| v as f64)
    }

    /// Runtime type of this value.
    pub fn type_kind(self) -> TypeKind {
        if self.is_tagged() {
            return TypeKind::Int;
        }
        debug_assert!(!self.is_null());
        match self.payload() {
            Payload::None => TypeKind::None,
            Payload::Bool(_) => TypeKind::Bool,
            Payload::Int(_) => TypeKind::Int,
            Payload::Float(_) => TypeKind::Float,
            Payload::Str(_) => TypeKind::Str,
            Payload::Bytes(_) => TypeKind::Bytes,
            Payload::List(_) => TypeKind::List,
            Payload::Tuple(_) => TypeKind::Tuple,
            Payload::Set(_) => TypeKind::Set,
            Payload::FrozenSet(_) => TypeKind::FrozenSet,
            Payload::Dict(_) => TypeKind::Dict,
            Payload::Complex { .. } => TypeKind::Complex,
            Payload::Slice { .. } => TypeKind::Slice,
            Payload::Range { .. } => TypeKind::Range,
            Payload::Iter(_) => TypeKind::Iter,
            Payload::Function(_) => TypeKind::Function,
            Payload::Method { .. } => TypeKind::Method,
            Payload::CellVar(_) => TypeKind::CellVar,
            Payload::Module { .. } => TypeKind::Module,
            Payload::Type(_) => TypeKind::Type,
            Payload::Exception(e) => TypeKind::Exception(e.kind),
            Payload::Code(_) => TypeKind::Code,
            Payload::Sentinel => TypeKind::None,
        }
    }
}

/// Heap cell: refcount followed by the payload.
#[repr(C)]
pub struct ObjectCell {
    refcount: AtomicUsize,
    pub payload: Payload,
}

impl Drop for ObjectCell {
    fn drop(&mut self) {
        self.payload.release_children();
    }
}

/// Host-visible runtime types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    None,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
    Tuple,
    Set,
    FrozenSet,
    Dict,
    Complex,
    Slice,
    Range,
    Iter,
    Function,
    Method,
    CellVar,
    Module,
    Type,
    Code,
    Exception(ExcKind),
}

impl TypeKind {
    pub fn name(self) -> &'static str {
        match self {
            TypeKind::None => "NoneType",
            TypeKind::Bool => "bool",
            TypeKind::Int => "int",
            TypeKind::Float => "float",
            TypeKind::Str => "str",
            TypeKind::Bytes => "bytes",
            TypeKind::List => "list",
            TypeKind::Tuple => "tuple",
            TypeKind::Set => "set",
            TypeKind::FrozenSet => "frozenset",
            TypeKind::Dict => "dict",
            TypeKind::Complex => "complex",
            TypeKind::Slice => "slice",
            TypeKind::Range => "range",
            TypeKind::Iter => "iterator",
            TypeKind::Function => "function",
            TypeKind::Method => "method",
            TypeKind::CellVar => "cell",
            TypeKind::Module => "module",
            TypeKind::Type => "type",
            TypeKind::Code => "code",
            TypeKind::Exception(k) => k.name(),
        }
    }
}

/// Built-in exception kinds. A closed set: user-defined exception classes
/// are a front-end feature the VM models as subkinds of `Exception`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcKind {
    BaseException,
    Exception,
    TypeError,
    ValueError,
    ZeroDivisionError,
    OverflowError,
    NameError,
    UnboundLocalError,
    AttributeError,
    KeyError,
    IndexError,
    StopIteration,
    RuntimeError,
    ImportError,
    AssertionError,
    InterruptedError,
}

impl ExcKind {
    pub fn name(self) -> &'static str {
        match self {
            ExcKind::BaseException => "BaseException",
            ExcKind::Exception => "Exception",
            ExcKind::TypeError => "TypeError",
            ExcKind::ValueError => "ValueError",
            ExcKind::ZeroDivisionError => "ZeroDivisionError",
            ExcKind::OverflowError => "OverflowError",
            ExcKind::NameError => "NameError",
            ExcKind::UnboundLocalError => "UnboundLocalError",
            ExcKind::AttributeError => "AttributeError",
            ExcKind::KeyError => "KeyError",
            ExcKind::IndexError => "IndexError",
            ExcKind::StopIteration => "StopIteration",
            ExcKind::RuntimeError => "RuntimeError",
            ExcKind::ImportError => "ImportError",
            ExcKind::AssertionError => "AssertionError",
            ExcKind::InterruptedError => "InterruptedError",
        }
    }

    /// Single-inheritance check against the builtin hierarchy.
    pub fn matches(self, pattern: ExcKind) -> bool {
        if self == pattern || pattern == ExcKind::BaseException {
            return true;
        }
        // Everything except BaseException descends from Exception.
        pattern == ExcKind::Exception && self != ExcKind::BaseException
    }
}

/// Exception instance payload.
#[derive(Debug)]
pub struct ExceptionData {
    pub kind: ExcKind,
    pub message: String,
}

/// Host-native callable: borrowed args, returns a new reference or null
/// with the thread's exception set.
pub type NativeFn = fn(args: &[ValueRef]) -> ValueRef;

/// Function object payload. `defaults`/`kwdefaults`/`annotations`/`closure`
/// are populated after construction by the function-construction helpers.
pub struct FunctionData {
    pub name: String,
    pub kind: FunctionKind,
    pub defaults: Cell<ValueRef>,
    pub kwdefaults: Cell<ValueRef>,
    pub annotations: Cell<ValueRef>,
    pub closure: Cell<ValueRef>,
}

pub enum FunctionKind {
    /// Host-provided native function.
    Native(NativeFn),
    /// Function backed by a code object; only callable through the host's
    /// evaluator, never directly by emitted code.
    Bytecode { code: Arc<CodeObject>, globals: ValueRef },
}

impl std::fmt::Debug for FunctionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<function {}>", self.name)
    }
}

/// Iterator payload state.
#[derive(Debug)]
pub struct IterState {
    pub target: ValueRef,
    pub index: usize,
}

/// Payload of a heap value.
#[derive(Debug)]
pub enum Payload {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(RefCell<Vec<ValueRef>>),
    Tuple(Box<[ValueRef]>),
    Set(RefCell<Vec<ValueRef>>),
    FrozenSet(Box<[ValueRef]>),
    /// Association list; lookup is by value equality. Small-dict shape is
    /// all the runtime helpers need.
    Dict(RefCell<Vec<(ValueRef, ValueRef)>>),
    Complex {
        real: f64,
        imag: f64,
    },
    Slice {
        start: ValueRef,
        stop: ValueRef,
        step: ValueRef,
    },
    Range {
        start: i64,
        stop: i64,
        step: i64,
    },
    Iter(RefCell<IterState>),
    Function(FunctionData),
    Method {
        receiver: ValueRef,
        callable: ValueRef,
    },
    /// Closure cell variable.
    CellVar(Cell<ValueRef>),
    Module {
        name: String,
        dict: ValueRef,
    },
    /// A builtin type object.
    Type(TypeKind),
    Exception(ExceptionData),
    /// A code object constant (the operand of function construction).
    Code(Arc<CodeObject>),
    /// Iteration-exhausted marker; never escapes emitted code.
    Sentinel,
}

impl Payload {
    fn release_children(&mut self) {
        match self {
            Payload::List(items) | Payload::Set(items) => {
                for v in items.get_mut().drain(..) {
                    v.decref();
                }
            }
            Payload::Tuple(items) | Payload::FrozenSet(items) => {
                for v in items.iter() {
                    v.decref();
                }
            }
            Payload::Dict(entries) => {
                for (k, v) in entries.get_mut().drain(..) {
                    k.decref();
                    v.decref();
                }
            }
            Payload::Slice { start, stop, step } => {
                start.decref();
                stop.decref();
                step.decref();
            }
            Payload::Iter(state) => {
                state.get_mut().target.decref();
            }
            Payload::Function(data) => {
                data.defaults.get().decref();
                data.kwdefaults.get().decref();
                data.annotations.get().decref();
                data.closure.get().decref();
                if let FunctionKind::Bytecode { globals, .. } = &data.kind {
                    globals.decref();
                }
            }
            Payload::Method { receiver, callable } => {
                receiver.decref();
                callable.decref();
            }
            Payload::CellVar(cell) => {
                cell.get().decref();
            }
            Payload::Module { dict, .. } => {
                dict.decref();
            }
            _ => {}
        }
    }
}

/// Allocate a heap value with refcount 1.
pub fn alloc(payload: Payload) -> ValueRef {
    let cell = Box::new(ObjectCell {
        refcount: AtomicUsize::new(1),
        payload,
    });
    ValueRef(Box::into_raw(cell) as usize)
}

fn alloc_immortal(payload: Payload) -> ValueRef {
    let cell = Box::new(ObjectCell {
        refcount: AtomicUsize::new(IMMORTAL),
        payload,
    });
    ValueRef(Box::into_raw(cell) as usize)
}

static NONE: Lazy<ValueRef> = Lazy::new(|| alloc_immortal(Payload::None));
static TRUE: Lazy<ValueRef> = Lazy::new(|| alloc_immortal(Payload::Bool(true)));
static FALSE: Lazy<ValueRef> = Lazy::new(|| alloc_immortal(Payload::Bool(false)));
static SENTINEL: Lazy<ValueRef> = Lazy::new(|| alloc_immortal(Payload::Sentinel));

/// The `None` singleton (borrowed; incref when storing).
pub fn none_value() -> ValueRef {
    *NONE
}

/// The `True`/`False` singletons (borrowed).
pub fn bool_value(b: bool) -> ValueRef {
    if b {
        *TRUE
    } else {
        *FALSE
    }
}

/// The iteration-exhausted sentinel (borrowed; compared by identity).
pub fn iter_sentinel() -> ValueRef {
    *SENTINEL
}

static TYPE_OBJECTS: Lazy<parking_lot::Mutex<Vec<(TypeKind, ValueRef)>>> =
    Lazy::new(|| parking_lot::Mutex::new(Vec::new()));

/// The immortal type object for a builtin kind (borrowed).
pub fn type_object(kind: TypeKind) -> ValueRef {
    let mut table = TYPE_OBJECTS.lock();
    if let Some((_, v)) = table.iter().find(|(k, _)| *k == kind) {
        return *v;
    }
    let v = alloc_immortal(Payload::Type(kind));
    table.push((kind, v));
    v
}

/// The immortal type object for a builtin exception kind (borrowed).
pub fn exc_type_object(kind: ExcKind) -> ValueRef {
    type_object(TypeKind::Exception(kind))
}

/// Construct an exception instance (new reference).
pub fn new_exception(kind: ExcKind, message: impl Into<String>) -> ValueRef {
    alloc(Payload::Exception(ExceptionData {
        kind,
        message: message.into(),
    }))
}

/// Construct a string value (new reference).
pub fn new_str(s: impl Into<String>) -> ValueRef {
    alloc(Payload::Str(s.into()))
}

/// Construct a float value (new reference).
pub fn new_float(f: f64) -> ValueRef {
    alloc(Payload::Float(f))
}

/// Construct a list taking ownership of the element references.
pub fn new_list(items: Vec<ValueRef>) -> ValueRef {
    alloc(Payload::List(RefCell::new(items)))
}

/// Construct a tuple taking ownership of the element references.
pub fn new_tuple(items: Vec<ValueRef>) -> ValueRef {
    alloc(Payload::Tuple(items.into_boxed_slice()))
}

/// Construct an empty dict (new reference).
pub fn new_dict() -> ValueRef {
    alloc(Payload::Dict(RefCell::new(Vec::new())))
}

/// Construct a bytes value (new reference).
pub fn new_bytes(b: Vec<u8>) -> ValueRef {
    alloc(Payload::Bytes(b))
}

/// Look up `key` in a dict value. Returns a borrowed reference.
pub fn dict_get(dict: ValueRef, key: ValueRef) -> Option<ValueRef> {
    match dict.payload() {
        Payload::Dict(entries) => entries
            .borrow()
            .iter()
            .find(|(k, _)| values_equal(*k, key))
            .map(|(_, v)| *v),
        _ => None,
    }
}

/// Look up a string key in a dict value. Returns a borrowed reference.
pub fn dict_get_str(dict: ValueRef, key: &str) -> Option<ValueRef> {
    match dict.payload() {
        Payload::Dict(entries) => entries
            .borrow()
            .iter()
            .find(|(k, _)| {
                !k.is_tagged()
                    && matches!(k.payload(), Payload::Str(s) if s == key)
            })
            .map(|(_, v)| *v),
        _ => None,
    }
}

/// Insert into a dict value, taking ownership of both references. An
/// existing entry keeps its original key; the new value replaces the old.
/// Returns false (releasing both references) when `dict` is not a dict.
pub fn dict_set(dict: ValueRef, key: ValueRef, value: ValueRef) -> bool {
    match dict.payload() {
        Payload::Dict(entries) => {
            let mut entries = entries.borrow_mut();
            if let Some(slot) = entries.iter_mut().find(|(k, _)| values_equal(*k, key)) {
                key.decref();
                let old = slot.1;
                slot.1 = value;
                old.decref();
            } else {
                entries.push((key, value));
            }
            true
        }
        _ => {
            key.decref();
            value.decref();
            false
        }
    }
}

/// Remove a key from a dict value. Returns false when absent.
pub fn dict_remove(dict: ValueRef, key: ValueRef) -> bool {
    match dict.payload() {
        Payload::Dict(entries) => {
            let mut entries = entries.borrow_mut();
            if let Some(at) = entries.iter().position(|(k, _)| values_equal(*k, key)) {
                let (k, v) = entries.remove(at);
                k.decref();
                v.decref();
                true
            } else {
                false
            }
        }
        _ => false,
    }
}

/// Truthiness. Total over all payloads; containers test emptiness.
pub fn value_is_true(v: ValueRef) -> bool {
    if v.is_tagged() {
        return v.tagged_value() != 0;
    }
    match v.payload() {
        Payload::None => false,
        Payload::Bool(b) => *b,
        Payload::Int(i) => *i != 0,
        Payload::Float(f) => *f != 0.0,
        Payload::Str(s) => !s.is_empty(),
        Payload::Bytes(b) => !b.is_empty(),
        Payload::List(items) | Payload::Set(items) => !items.borrow().is_empty(),
        Payload::Tuple(items) | Payload::FrozenSet(items) => !items.is_empty(),
        Payload::Dict(entries) => !entries.borrow().is_empty(),
        Payload::Complex { real, imag } => *real != 0.0 || *imag != 0.0,
        Payload::Range { start, stop, step } => range_len(*start, *stop, *step) > 0,
        _ => true,
    }
}

pub(crate) fn range_len(start: i64, stop: i64, step: i64) -> i64 {
    if step > 0 {
        ((stop - start) + step - 1).max(0) / step
    } else if step < 0 {
        ((start - stop) + (-step) - 1).max(0) / -step
    } else {
        0
    }
}

/// Value equality: structural for primitives and containers, identity
/// fallback for everything else.
pub fn values_equal(a: ValueRef, b: ValueRef) -> bool {
    if a == b {
        return true;
    }
    if a.is_null() || b.is_null() {
        return false;
    }
    // Numeric cross-representation comparisons.
    if let (Some(x), Some(y)) = (a.int_value(), b.int_value()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.float_value(), b.float_value()) {
        return x == y;
    }
    if a.is_tagged() || b.is_tagged() {
        return false;
    }
    match (a.payload(), b.payload()) {
        (Payload::Str(x), Payload::Str(y)) => x == y,
        (Payload::Bytes(x), Payload::Bytes(y)) => x == y,
        (Payload::Tuple(x), Payload::Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| values_equal(*p, *q))
        }
        (Payload::List(x), Payload::List(y)) => {
            let x = x.borrow();
            let y = y.borrow();
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| values_equal(*p, *q))
        }
        (
            Payload::Complex { real: r1, imag: i1 },
            Payload::Complex { real: r2, imag: i2 },
        ) => r1 == r2 && i1 == i2,
        _ => false,
    }
}

/// Ordering comparison for the orderable builtin types. `None` means the
/// pair is unordered and the caller should raise a type error.
pub fn values_ordering(a: ValueRef, b: ValueRef) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.int_value(), b.int_value()) {
        return Some(x.cmp(&y));
    }
    if let (Some(x), Some(y)) = (a.float_value(), b.float_value()) {
        return x.partial_cmp(&y);
    }
    if a.is_tagged() || b.is_tagged() || a.is_null() || b.is_null() {
        return None;
    }
    match (a.payload(), b.payload()) {
        (Payload::Str(x), Payload::Str(y)) => Some(x.cmp(y)),
        (Payload::Bytes(x), Payload::Bytes(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// `str()` rendering.
pub fn value_str(v: ValueRef) -> String {
    if v.is_tagged() {
        return v.tagged_value().to_string();
    }
    match v.payload() {
        Payload::Str(s) => s.clone(),
        _ => value_repr(v),
    }
}

/// `repr()` rendering.
pub fn value_repr(v: ValueRef) -> String {
    if v.is_null() {
        return "<null>".to_string();
    }
    if v.is_tagged() {
        return v.tagged_value().to_string();
    }
    match v.payload() {
        Payload::None => "None".to_string(),
        Payload::Bool(b) => if *b { "True" } else { "False" }.to_string(),
        Payload::Int(i) => i.to_string(),
        Payload::Float(f) => format_float(*f),
        Payload::Str(s) => format!("'{}'", s),
        Payload::Bytes(b) => format!("b'{}'", String::from_utf8_lossy(b)),
        Payload::List(items) => {
            let items = items.borrow();
            let parts: Vec<String> = items.iter().map(|v| value_repr(*v)).collect();
            format!("[{}]", parts.join(", "))
        }
        Payload::Tuple(items) => {
            let parts: Vec<String> = items.iter().map(|v| value_repr(*v)).collect();
            if parts.len() == 1 {
                format!("({},)", parts[0])
            } else {
                format!("({})", parts.join(", "))
            }
        }
        Payload::Set(items) => {
            let items = items.borrow();
            if items.is_empty() {
                "set()".to_string()
            } else {
                let parts: Vec<String> = items.iter().map(|v| value_repr(*v)).collect();
                format!("{{{}}}", parts.join(", "))
            }
        }
        Payload::FrozenSet(items) => {
            let parts: Vec<String> = items.iter().map(|v| value_repr(*v)).collect();
            format!("frozenset({{{}}})", parts.join(", "))
        }
        Payload::Dict(entries) => {
            let entries = entries.borrow();
            let parts: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{}: {}", value_repr(*k), value_repr(*v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        Payload::Complex { real, imag } => format!("({}+{}j)", real, imag),
        Payload::Slice { start, stop, step } => format!(
            "slice({}, {}, {})",
            value_repr(*start),
            value_repr(*stop),
            value_repr(*step)
        ),
        Payload::Range { start, stop, step } => {
            if *step == 1 {
                format!("range({}, {})", start, stop)
            } else {
                format!("range({}, {}, {})", start, stop, step)
            }
        }
        Payload::Iter(_) => "<iterator>".to_string(),
        Payload::Function(data) => format!("<function {}>", data.name),
        Payload::Method { callable, .. } => format!("<bound {}>", value_repr(*callable)),
        Payload::CellVar(cell) => format!("<cell {}>", value_repr(cell.get())),
        Payload::Module { name, .. } => format!("<module '{}'>", name),
        Payload::Type(k) => format!("<class '{}'>", k.name()),
        Payload::Exception(e) => format!("{}({:?})", e.kind.name(), e.message),
        Payload::Code(c) => format!("<code {}>", c.name),
        Payload::Sentinel => "<sentinel>".to_string(),
    }
}

fn format_float(f: f64) -> String {
    if f == f.trunc() && f.is_finite() && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_roundtrip() {
        for v in [0i64, 1, -1, 42, TAGGED_MIN, TAGGED_MAX] {
            let r = ValueRef::from_int(v);
            assert!(r.is_tagged());
            assert_eq!(r.tagged_value(), v);
            assert_eq!(r.int_value(), Some(v));
        }
    }

    #[test]
    fn test_out_of_range_ints_box() {
        let r = ValueRef::from_int(TAGGED_MAX + 1);
        assert!(!r.is_tagged());
        assert_eq!(r.int_value(), Some(TAGGED_MAX + 1));
        assert_eq!(r.type_kind(), TypeKind::Int);
        r.decref();
    }

    #[test]
    fn test_refcount_lifecycle() {
        let v = new_str("hello");
        assert_eq!(v.refcount(), 1);
        v.incref();
        assert_eq!(v.refcount(), 2);
        v.decref();
        assert_eq!(v.refcount(), 1);
        v.decref();
    }

    #[test]
    fn test_container_drop_releases_children() {
        let child = new_str("x");
        child.incref(); // keep one reference to observe the count
        let list = alloc(Payload::List(RefCell::new(vec![child])));
        assert_eq!(child.refcount(), 2);
        list.decref();
        assert_eq!(child.refcount(), 1);
        child.decref();
    }

    #[test]
    fn test_truthiness() {
        assert!(!value_is_true(none_value()));
        assert!(!value_is_true(ValueRef::from_int(0)));
        assert!(value_is_true(ValueRef::from_int(3)));
        assert!(!value_is_true(bool_value(false)));
        let s = new_str("");
        assert!(!value_is_true(s));
        s.decref();
    }

    #[test]
    fn test_equality_across_representations() {
        let boxed = alloc(Payload::Int(7));
        let tagged = ValueRef::from_int(7);
        assert!(values_equal(boxed, tagged));
        let f = alloc(Payload::Float(7.0));
        assert!(values_equal(f, tagged));
        boxed.decref();
        f.decref();
    }

    #[test]
    fn test_exc_hierarchy() {
        assert!(ExcKind::ZeroDivisionError.matches(ExcKind::Exception));
        assert!(ExcKind::ZeroDivisionError.matches(ExcKind::BaseException));
        assert!(!ExcKind::ZeroDivisionError.matches(ExcKind::TypeError));
        assert!(!ExcKind::BaseException.matches(ExcKind::Exception));
    }

    #[test]
    fn test_repr() {
        let t = alloc(Payload::Tuple(
            vec![ValueRef::from_int(1), ValueRef::from_int(2)].into_boxed_slice(),
        ));
        assert_eq!(value_repr(t), "(1, 2)");
        t.decref();
        assert_eq!(value_repr(bool_value(true)), "True");
    }
}
