//! Abstract value lattice
//!
//! The type approximations the abstract interpreter computes per stack
//! slot and local. `join` is the least upper bound over kinds; the
//! operator tables answer "what kind does this operation produce" for the
//! combinations the compiler specializes on, and `Any` for everything
//! else (the driver then emits the fully generic helper call).

use crate::vm::value::{value_is_true, Payload, TypeKind, ValueRef};

/// Representational kinds tracked by the abstract interpreter. `Undefined`
/// marks "assigned-before-use might fail"; `Any` is top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbstractValueKind {
    Any,
    Undefined,
    Integer,
    Float,
    Bool,
    None,
    Bytes,
    String,
    List,
    Tuple,
    Set,
    FrozenSet,
    Dict,
    Complex,
    Function,
    Method,
    Slice,
    Iterable,
    Type,
}

use AbstractValueKind as K;

impl std::fmt::Display for AbstractValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            K::Any => "any",
            K::Undefined => "undefined",
            K::Integer => "int",
            K::Float => "float",
            K::Bool => "bool",
            K::None => "none",
            K::Bytes => "bytes",
            K::String => "str",
            K::List => "list",
            K::Tuple => "tuple",
            K::Set => "set",
            K::FrozenSet => "frozenset",
            K::Dict => "dict",
            K::Complex => "complex",
            K::Function => "function",
            K::Method => "method",
            K::Slice => "slice",
            K::Iterable => "iterable",
            K::Type => "type",
        };
        write!(f, "{}", name)
    }
}

/// Least upper bound. `Undefined` is absorbed by the other side (the
/// caller tracks `maybe_undefined` separately); differing kinds go to
/// `Any`.
pub fn join(a: AbstractValueKind, b: AbstractValueKind) -> AbstractValueKind {
    if a == b {
        return a;
    }
    match (a, b) {
        (K::Undefined, other) | (other, K::Undefined) => other,
        _ => K::Any,
    }
}

/// Binary operators the result tables answer for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    And,
    Or,
    Xor,
    MatMul,
    Subscr,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Pos,
    Neg,
    Not,
    Invert,
}

fn numeric(kind: AbstractValueKind) -> bool {
    matches!(kind, K::Integer | K::Float | K::Bool)
}

/// Result kind of a binary operation. Bool operands behave as integers in
/// arithmetic, with the Bool-preserving exceptions the table calls out.
pub fn binary_result(
    op: BinaryOp,
    lhs: AbstractValueKind,
    rhs: AbstractValueKind,
) -> AbstractValueKind {
    use BinaryOp::*;

    // Bool-preserving special cases first.
    if lhs == K::Bool {
        match (op, rhs) {
            (And | Or | Xor, K::Bool) => return K::Bool,
            (Mod, K::Integer) => return K::Bool,
            _ => {}
        }
    }

    // Complex contaminates float/int arithmetic.
    if (lhs == K::Complex && (numeric(rhs) || rhs == K::Complex))
        || (rhs == K::Complex && numeric(lhs))
    {
        return match op {
            Add | Sub | Mul | TrueDiv | Pow => K::Complex,
            _ => K::Any,
        };
    }

    // Float arithmetic: any float operand promotes.
    if (lhs == K::Float && numeric(rhs)) || (rhs == K::Float && numeric(lhs)) {
        return match op {
            Add | Sub | Mul | TrueDiv | FloorDiv | Mod | Pow => K::Float,
            _ => K::Any,
        };
    }

    // Integer/Bool pairs.
    if numeric(lhs) && numeric(rhs) {
        return match op {
            TrueDiv => K::Float,
            Add | Sub | Mul | FloorDiv | Mod | Pow | LShift | RShift | And | Or | Xor => K::Integer,
            MatMul | Subscr => K::Any,
        };
    }

    // Sequence and container shapes.
    match (op, lhs, rhs) {
        (Add, K::String, K::String) => K::String,
        (Add, K::Bytes, K::Bytes) => K::Bytes,
        (Add, K::List, K::List) => K::List,
        (Add, K::Tuple, K::Tuple) => K::Tuple,

        (Mul, K::String, K::Integer | K::Bool) | (Mul, K::Integer | K::Bool, K::String) => {
            K::String
        }
        (Mul, K::Bytes, K::Integer | K::Bool) | (Mul, K::Integer | K::Bool, K::Bytes) => K::Bytes,
        (Mul, K::List, K::Integer | K::Bool) | (Mul, K::Integer | K::Bool, K::List) => K::List,
        (Mul, K::Tuple, K::Integer | K::Bool) | (Mul, K::Integer | K::Bool, K::Tuple) => K::Tuple,

        (Mod, K::String, _) => K::String,
        (Mod, K::Bytes, _) => K::Bytes,

        (And | Or | Xor | Sub, K::Set | K::FrozenSet, K::Set | K::FrozenSet) => K::Set,

        (Subscr, K::String, K::Integer | K::Bool | K::Slice) => K::String,
        (Subscr, K::Bytes, K::Integer | K::Bool) => K::Integer,
        (Subscr, K::Bytes, K::Slice) => K::Bytes,
        (Subscr, K::List, K::Slice) => K::List,
        (Subscr, K::Tuple, K::Slice) => K::Tuple,

        _ => K::Any,
    }
}

/// Result kind of a unary operation.
pub fn unary_result(op: UnaryOp, v: AbstractValueKind) -> AbstractValueKind {
    match op {
        UnaryOp::Not => K::Bool,
        UnaryOp::Invert => match v {
            K::Integer | K::Bool => K::Integer,
            _ => K::Any,
        },
        UnaryOp::Pos | UnaryOp::Neg => match v {
            K::Integer | K::Bool => K::Integer,
            K::Float => K::Float,
            K::Complex => K::Complex,
            _ => K::Any,
        },
    }
}

/// Result kind of a rich comparison: `Bool` when both sides are concrete,
/// `Any` when either side may carry user-defined comparison behavior.
pub fn compare_result(lhs: AbstractValueKind, rhs: AbstractValueKind) -> AbstractValueKind {
    if lhs == K::Any || rhs == K::Any {
        K::Any
    } else {
        K::Bool
    }
}

/// Abstract kind of a concrete constant.
pub fn kind_of_value(v: ValueRef) -> AbstractValueKind {
    match v.type_kind() {
        TypeKind::None => K::None,
        TypeKind::Bool => K::Bool,
        TypeKind::Int => K::Integer,
        TypeKind::Float => K::Float,
        TypeKind::Str => K::String,
        TypeKind::Bytes => K::Bytes,
        TypeKind::List => K::List,
        TypeKind::Tuple => K::Tuple,
        TypeKind::Set => K::Set,
        TypeKind::FrozenSet => K::FrozenSet,
        TypeKind::Dict => K::Dict,
        TypeKind::Complex => K::Complex,
        TypeKind::Slice => K::Slice,
        TypeKind::Function => K::Function,
        TypeKind::Method => K::Method,
        TypeKind::Iter | TypeKind::Range => K::Iterable,
        TypeKind::Type | TypeKind::Exception(_) => K::Type,
        _ => K::Any,
    }
}

/// One abstract value: a kind, an optional known constant, and (for
/// iterators) the element kind the iterable fixes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AbstractValue {
    pub kind: AbstractValueKind,
    pub constant: Option<ValueRef>,
    pub element: Option<AbstractValueKind>,
}

impl AbstractValue {
    pub const ANY: AbstractValue = AbstractValue {
        kind: K::Any,
        constant: None,
        element: None,
    };

    pub const UNDEFINED: AbstractValue = AbstractValue {
        kind: K::Undefined,
        constant: None,
        element: None,
    };

    pub fn of_kind(kind: AbstractValueKind) -> AbstractValue {
        AbstractValue {
            kind,
            constant: None,
            element: None,
        }
    }

    /// Abstract value of a constant-pool entry, remembering the constant.
    pub fn of_constant(v: ValueRef) -> AbstractValue {
        AbstractValue {
            kind: kind_of_value(v),
            constant: Some(v),
            element: None,
        }
    }

    pub fn kind(&self) -> AbstractValueKind {
        self.kind
    }

    /// True when this value is statically known truthy.
    pub fn is_always_true(&self) -> bool {
        match self.constant {
            Some(c) => value_is_true(c),
            None => false,
        }
    }

    /// True when this value is statically known falsy.
    pub fn is_always_false(&self) -> bool {
        match self.constant {
            Some(c) => !value_is_true(c),
            None => false,
        }
    }

    /// Whether this value is a statically known string constant.
    pub fn constant_str(&self) -> Option<&str> {
        let c = self.constant?;
        if c.is_tagged() {
            return None;
        }
        match c.payload() {
            Payload::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn binary(&self, op: BinaryOp, rhs: &AbstractValue) -> AbstractValue {
        AbstractValue::of_kind(binary_result(op, self.kind, rhs.kind))
    }

    pub fn unary(&self, op: UnaryOp) -> AbstractValue {
        AbstractValue::of_kind(unary_result(op, self.kind))
    }

    pub fn compare(&self, rhs: &AbstractValue) -> AbstractValue {
        AbstractValue::of_kind(compare_result(self.kind, rhs.kind))
    }

    /// Join with another abstract value (element-wise snapshot merge).
    pub fn join_with(&self, other: &AbstractValue) -> AbstractValue {
        AbstractValue {
            kind: join(self.kind, other.kind),
            constant: match (self.constant, other.constant) {
                (Some(a), Some(b)) if a == b => Some(a),
                _ => None,
            },
            element: match (self.element, other.element) {
                (Some(a), Some(b)) if a == b => Some(a),
                _ => None,
            },
        }
    }

    /// Element kind an iterator over this value yields, when the kind
    /// fixes it.
    pub fn iter_element(&self) -> AbstractValueKind {
        match self.kind {
            K::String => K::String,
            K::Bytes => K::Integer,
            _ => K::Any,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::{new_str, none_value, ValueRef};

    #[test]
    fn test_join_rules() {
        assert_eq!(join(K::Integer, K::Integer), K::Integer);
        assert_eq!(join(K::Integer, K::Float), K::Any);
        assert_eq!(join(K::Undefined, K::Integer), K::Integer);
        assert_eq!(join(K::Integer, K::Undefined), K::Integer);
        assert_eq!(join(K::Any, K::Integer), K::Any);
    }

    #[test]
    fn test_integer_table() {
        assert_eq!(binary_result(BinaryOp::Add, K::Integer, K::Integer), K::Integer);
        assert_eq!(binary_result(BinaryOp::TrueDiv, K::Integer, K::Integer), K::Float);
        assert_eq!(binary_result(BinaryOp::Add, K::Integer, K::Float), K::Float);
        assert_eq!(binary_result(BinaryOp::Mul, K::Integer, K::List), K::List);
        assert_eq!(binary_result(BinaryOp::Mul, K::Integer, K::Tuple), K::Tuple);
        assert_eq!(binary_result(BinaryOp::Mul, K::Integer, K::String), K::String);
        assert_eq!(binary_result(BinaryOp::Mul, K::Integer, K::Bytes), K::Bytes);
    }

    #[test]
    fn test_bool_table() {
        assert_eq!(binary_result(BinaryOp::Add, K::Bool, K::Integer), K::Integer);
        assert_eq!(binary_result(BinaryOp::And, K::Bool, K::Bool), K::Bool);
        assert_eq!(binary_result(BinaryOp::Mod, K::Bool, K::Integer), K::Bool);
        assert_eq!(binary_result(BinaryOp::TrueDiv, K::Bool, K::Integer), K::Float);
        assert_eq!(binary_result(BinaryOp::Add, K::Bool, K::Float), K::Float);
    }

    #[test]
    fn test_float_table() {
        for op in [
            BinaryOp::Add,
            BinaryOp::Sub,
            BinaryOp::Mul,
            BinaryOp::TrueDiv,
            BinaryOp::FloorDiv,
            BinaryOp::Mod,
            BinaryOp::Pow,
        ] {
            assert_eq!(binary_result(op, K::Float, K::Float), K::Float);
            assert_eq!(binary_result(op, K::Float, K::Integer), K::Float);
        }
        assert_eq!(binary_result(BinaryOp::Add, K::Float, K::Complex), K::Complex);
    }

    #[test]
    fn test_string_bytes_table() {
        assert_eq!(binary_result(BinaryOp::Add, K::String, K::String), K::String);
        assert_eq!(binary_result(BinaryOp::Mod, K::String, K::Any), K::String);
        assert_eq!(binary_result(BinaryOp::Mul, K::String, K::Integer), K::String);
        assert_eq!(binary_result(BinaryOp::Subscr, K::String, K::Integer), K::String);
        assert_eq!(binary_result(BinaryOp::Subscr, K::String, K::Slice), K::String);
        assert_eq!(binary_result(BinaryOp::Add, K::Bytes, K::Bytes), K::Bytes);
        assert_eq!(binary_result(BinaryOp::Subscr, K::Bytes, K::Integer), K::Integer);
        assert_eq!(binary_result(BinaryOp::Subscr, K::Bytes, K::Slice), K::Bytes);
        assert_eq!(binary_result(BinaryOp::Mod, K::Bytes, K::Any), K::Bytes);
    }

    #[test]
    fn test_container_table() {
        assert_eq!(binary_result(BinaryOp::And, K::Set, K::Set), K::Set);
        assert_eq!(binary_result(BinaryOp::Or, K::Set, K::FrozenSet), K::Set);
        assert_eq!(binary_result(BinaryOp::Add, K::List, K::List), K::List);
        assert_eq!(binary_result(BinaryOp::Add, K::List, K::Tuple), K::Any);
    }

    #[test]
    fn test_unary_table() {
        assert_eq!(unary_result(UnaryOp::Not, K::Dict), K::Bool);
        assert_eq!(unary_result(UnaryOp::Invert, K::Bool), K::Integer);
        assert_eq!(unary_result(UnaryOp::Neg, K::Bool), K::Integer);
        assert_eq!(unary_result(UnaryOp::Pos, K::Bool), K::Integer);
        assert_eq!(unary_result(UnaryOp::Neg, K::Integer), K::Integer);
        assert_eq!(unary_result(UnaryOp::Neg, K::Float), K::Float);
    }

    #[test]
    fn test_constant_truthiness() {
        let v = AbstractValue::of_constant(ValueRef::from_int(0));
        assert!(v.is_always_false());
        assert!(!v.is_always_true());
        let s = new_str("x");
        let v = AbstractValue::of_constant(s);
        assert!(v.is_always_true());
        s.decref();
        let n = AbstractValue::of_constant(none_value());
        assert_eq!(n.kind(), K::None);
        assert!(n.is_always_false());
    }

    #[test]
    fn test_iter_element() {
        assert_eq!(AbstractValue::of_kind(K::String).iter_element(), K::String);
        assert_eq!(AbstractValue::of_kind(K::Bytes).iter_element(), K::Integer);
        assert_eq!(AbstractValue::of_kind(K::List).iter_element(), K::Any);
    }
}
