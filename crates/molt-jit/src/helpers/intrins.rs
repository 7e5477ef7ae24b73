//! Runtime helper implementations
//!
//! These are the functions emitted code calls through the helper catalog.
//! The ownership contract is uniform unless the catalog entry says
//! otherwise: helpers take ownership of every `ValueRef` argument and
//! return a fresh reference, or null with the thread's exception set.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::vm::exc;
use crate::vm::frame::Frame;
use crate::vm::value::{
    alloc, bool_value, dict_get, dict_get_str, dict_remove, dict_set, exc_type_object,
    iter_sentinel, new_bytes, new_exception, new_float, new_list, new_str, new_tuple, none_value,
    range_len, value_is_true, value_repr, value_str, values_equal, values_ordering, ExcKind,
    FunctionData, FunctionKind, IterState, Payload, TypeKind, ValueRef,
};

// ===== Shared error paths =====

fn type_error(msg: String) -> ValueRef {
    exc::raise(ExcKind::TypeError, msg);
    ValueRef::NULL
}

fn binary_type_error(op: &str, l: ValueRef, r: ValueRef) -> ValueRef {
    let msg = format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        l.type_kind().name(),
        r.type_kind().name()
    );
    l.decref();
    r.decref();
    type_error(msg)
}

fn zero_division(msg: &str) -> ValueRef {
    exc::raise(ExcKind::ZeroDivisionError, msg.to_string());
    ValueRef::NULL
}

fn overflow(msg: &str) -> ValueRef {
    exc::raise(ExcKind::OverflowError, msg.to_string());
    ValueRef::NULL
}

// ===== Numeric shape dispatch =====

enum NumPair {
    Ints(i64, i64),
    Floats(f64, f64),
    Complex(f64, f64, f64, f64),
    Other,
}

fn is_float(v: ValueRef) -> bool {
    !v.is_null() && !v.is_tagged() && matches!(v.payload(), Payload::Float(_))
}

fn complex_parts(v: ValueRef) -> Option<(f64, f64)> {
    if !v.is_null() && !v.is_tagged() {
        if let Payload::Complex { real, imag } = v.payload() {
            return Some((*real, *imag));
        }
    }
    v.float_value().map(|f| (f, 0.0))
}

fn num_pair(l: ValueRef, r: ValueRef) -> NumPair {
    if is_float(l) || is_float(r) {
        if let (Some(a), Some(b)) = (l.float_value(), r.float_value()) {
            return NumPair::Floats(a, b);
        }
    }
    if let (Some(a), Some(b)) = (l.int_value(), r.int_value()) {
        return NumPair::Ints(a, b);
    }
    let l_complex = !l.is_null() && !l.is_tagged() && matches!(l.payload(), Payload::Complex { .. });
    let r_complex = !r.is_null() && !r.is_tagged() && matches!(r.payload(), Payload::Complex { .. });
    if l_complex || r_complex {
        if let (Some((a, b)), Some((c, d))) = (complex_parts(l), complex_parts(r)) {
            return NumPair::Complex(a, b, c, d);
        }
    }
    NumPair::Other
}

fn int_result(v: Option<i64>) -> ValueRef {
    match v {
        Some(v) => ValueRef::from_int(v),
        None => overflow("integer result out of range"),
    }
}

fn py_floordiv(a: i64, b: i64) -> i64 {
    let q = a / b;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

fn py_mod(a: i64, b: i64) -> i64 {
    let r = a % b;
    if r != 0 && ((r < 0) != (b < 0)) {
        r + b
    } else {
        r
    }
}

fn int_pow(base: i64, exp: i64) -> ValueRef {
    if exp < 0 {
        return new_float((base as f64).powf(exp as f64));
    }
    if exp > u32::MAX as i64 {
        return overflow("exponent too large");
    }
    int_result(base.checked_pow(exp as u32))
}

// ===== Binary operators =====

pub extern "C" fn add(l: ValueRef, r: ValueRef) -> ValueRef {
    match num_pair(l, r) {
        NumPair::Ints(a, b) => {
            let res = int_result(a.checked_add(b));
            l.decref();
            r.decref();
            return res;
        }
        NumPair::Floats(a, b) => {
            l.decref();
            r.decref();
            return new_float(a + b);
        }
        NumPair::Complex(a, b, c, d) => {
            l.decref();
            r.decref();
            return alloc(Payload::Complex {
                real: a + c,
                imag: b + d,
            });
        }
        NumPair::Other => {}
    }
    if l.is_tagged() || r.is_tagged() {
        return binary_type_error("+", l, r);
    }
    let res = match (l.payload(), r.payload()) {
        (Payload::Str(a), Payload::Str(b)) => Some(new_str(format!("{}{}", a, b))),
        (Payload::Bytes(a), Payload::Bytes(b)) => {
            let mut out = a.clone();
            out.extend_from_slice(b);
            Some(new_bytes(out))
        }
        (Payload::List(a), Payload::List(b)) => {
            let mut out: Vec<ValueRef> = a.borrow().clone();
            out.extend(b.borrow().iter().copied());
            for v in &out {
                v.incref();
            }
            Some(new_list(out))
        }
        (Payload::Tuple(a), Payload::Tuple(b)) => {
            let out: Vec<ValueRef> = a.iter().chain(b.iter()).copied().collect();
            for v in &out {
                v.incref();
            }
            Some(new_tuple(out))
        }
        _ => None,
    };
    match res {
        Some(v) => {
            l.decref();
            r.decref();
            v
        }
        None => binary_type_error("+", l, r),
    }
}

pub extern "C" fn subtract(l: ValueRef, r: ValueRef) -> ValueRef {
    match num_pair(l, r) {
        NumPair::Ints(a, b) => {
            let res = int_result(a.checked_sub(b));
            l.decref();
            r.decref();
            return res;
        }
        NumPair::Floats(a, b) => {
            l.decref();
            r.decref();
            return new_float(a - b);
        }
        NumPair::Complex(a, b, c, d) => {
            l.decref();
            r.decref();
            return alloc(Payload::Complex {
                real: a - c,
                imag: b - d,
            });
        }
        NumPair::Other => {}
    }
    if !l.is_tagged() && !r.is_tagged() {
        if let (Payload::Set(a), Payload::Set(b)) = (l.payload(), r.payload()) {
            let b = b.borrow();
            let out: Vec<ValueRef> = a
                .borrow()
                .iter()
                .filter(|v| !b.iter().any(|w| values_equal(**v, *w)))
                .copied()
                .collect();
            for v in &out {
                v.incref();
            }
            let res = alloc(Payload::Set(RefCell::new(out)));
            l.decref();
            r.decref();
            return res;
        }
    }
    binary_type_error("-", l, r)
}

fn repeat_sequence(seq: ValueRef, count: i64) -> Option<ValueRef> {
    let n = count.max(0) as usize;
    match seq.payload() {
        Payload::Str(s) => Some(new_str(s.repeat(n))),
        Payload::Bytes(b) => Some(new_bytes(b.repeat(n))),
        Payload::List(items) => {
            let items = items.borrow();
            let mut out = Vec::with_capacity(items.len() * n);
            for _ in 0..n {
                for v in items.iter() {
                    v.incref();
                    out.push(*v);
                }
            }
            Some(new_list(out))
        }
        Payload::Tuple(items) => {
            let mut out = Vec::with_capacity(items.len() * n);
            for _ in 0..n {
                for v in items.iter() {
                    v.incref();
                    out.push(*v);
                }
            }
            Some(new_tuple(out))
        }
        _ => None,
    }
}

pub extern "C" fn multiply(l: ValueRef, r: ValueRef) -> ValueRef {
    match num_pair(l, r) {
        NumPair::Ints(a, b) => {
            let res = int_result(a.checked_mul(b));
            l.decref();
            r.decref();
            return res;
        }
        NumPair::Floats(a, b) => {
            l.decref();
            r.decref();
            return new_float(a * b);
        }
        NumPair::Complex(a, b, c, d) => {
            l.decref();
            r.decref();
            return alloc(Payload::Complex {
                real: a * c - b * d,
                imag: a * d + b * c,
            });
        }
        NumPair::Other => {}
    }
    // sequence * int, int * sequence
    let (seq, count) = if l.int_value().is_some() && !r.is_tagged() {
        (r, l.int_value())
    } else if r.int_value().is_some() && !l.is_tagged() {
        (l, r.int_value())
    } else {
        (ValueRef::NULL, None)
    };
    if let Some(count) = count {
        if let Some(res) = repeat_sequence(seq, count) {
            l.decref();
            r.decref();
            return res;
        }
    }
    binary_type_error("*", l, r)
}

pub extern "C" fn true_divide(l: ValueRef, r: ValueRef) -> ValueRef {
    match num_pair(l, r) {
        NumPair::Ints(a, b) => {
            l.decref();
            r.decref();
            if b == 0 {
                return zero_division("division by zero");
            }
            new_float(a as f64 / b as f64)
        }
        NumPair::Floats(a, b) => {
            l.decref();
            r.decref();
            if b == 0.0 {
                return zero_division("float division by zero");
            }
            new_float(a / b)
        }
        NumPair::Complex(a, b, c, d) => {
            l.decref();
            r.decref();
            let denom = c * c + d * d;
            if denom == 0.0 {
                return zero_division("complex division by zero");
            }
            alloc(Payload::Complex {
                real: (a * c + b * d) / denom,
                imag: (b * c - a * d) / denom,
            })
        }
        NumPair::Other => binary_type_error("/", l, r),
    }
}

pub extern "C" fn floor_divide(l: ValueRef, r: ValueRef) -> ValueRef {
    match num_pair(l, r) {
        NumPair::Ints(a, b) => {
            l.decref();
            r.decref();
            if b == 0 {
                return zero_division("integer division or modulo by zero");
            }
            ValueRef::from_int(py_floordiv(a, b))
        }
        NumPair::Floats(a, b) => {
            l.decref();
            r.decref();
            if b == 0.0 {
                return zero_division("float floor division by zero");
            }
            new_float((a / b).floor())
        }
        _ => binary_type_error("//", l, r),
    }
}

fn percent_format(fmt: &str, args: ValueRef) -> String {
    let mut items: Vec<ValueRef> = Vec::new();
    if !args.is_tagged() && matches!(args.payload(), Payload::Tuple(_)) {
        if let Payload::Tuple(t) = args.payload() {
            items.extend(t.iter().copied());
        }
    } else {
        items.push(args);
    }
    let mut out = String::new();
    let mut next = 0usize;
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('s') => {
                let arg = items.get(next).copied().unwrap_or_else(none_value);
                next += 1;
                out.push_str(&value_str(arg));
            }
            Some('d') => {
                let arg = items.get(next).copied().unwrap_or_else(none_value);
                next += 1;
                out.push_str(&arg.int_value().map(|v| v.to_string()).unwrap_or_default());
            }
            Some('r') => {
                let arg = items.get(next).copied().unwrap_or_else(none_value);
                next += 1;
                out.push_str(&value_repr(arg));
            }
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

pub extern "C" fn modulo(l: ValueRef, r: ValueRef) -> ValueRef {
    if !l.is_null() && !l.is_tagged() {
        if let Payload::Str(fmt) = l.payload() {
            let res = new_str(percent_format(fmt, r));
            l.decref();
            r.decref();
            return res;
        }
        if let Payload::Bytes(fmt) = l.payload() {
            let text = String::from_utf8_lossy(fmt).to_string();
            let res = new_bytes(percent_format(&text, r).into_bytes());
            l.decref();
            r.decref();
            return res;
        }
    }
    match num_pair(l, r) {
        NumPair::Ints(a, b) => {
            l.decref();
            r.decref();
            if b == 0 {
                return zero_division("integer division or modulo by zero");
            }
            ValueRef::from_int(py_mod(a, b))
        }
        NumPair::Floats(a, b) => {
            l.decref();
            r.decref();
            if b == 0.0 {
                return zero_division("float modulo");
            }
            new_float(a - b * (a / b).floor())
        }
        _ => binary_type_error("%", l, r),
    }
}

pub extern "C" fn power(l: ValueRef, r: ValueRef) -> ValueRef {
    match num_pair(l, r) {
        NumPair::Ints(a, b) => {
            let res = int_pow(a, b);
            l.decref();
            r.decref();
            res
        }
        NumPair::Floats(a, b) => {
            l.decref();
            r.decref();
            new_float(a.powf(b))
        }
        _ => binary_type_error("** or pow()", l, r),
    }
}

pub extern "C" fn matrix_multiply(l: ValueRef, r: ValueRef) -> ValueRef {
    binary_type_error("@", l, r)
}

pub extern "C" fn lshift(l: ValueRef, r: ValueRef) -> ValueRef {
    match num_pair(l, r) {
        NumPair::Ints(a, b) => {
            l.decref();
            r.decref();
            if b < 0 {
                exc::raise(ExcKind::ValueError, "negative shift count");
                return ValueRef::NULL;
            }
            if b >= 63 {
                return if a == 0 {
                    ValueRef::from_int(0)
                } else {
                    overflow("shifted value out of range")
                };
            }
            int_result(a.checked_mul(1i64 << b))
        }
        _ => binary_type_error("<<", l, r),
    }
}

pub extern "C" fn rshift(l: ValueRef, r: ValueRef) -> ValueRef {
    match num_pair(l, r) {
        NumPair::Ints(a, b) => {
            l.decref();
            r.decref();
            if b < 0 {
                exc::raise(ExcKind::ValueError, "negative shift count");
                return ValueRef::NULL;
            }
            ValueRef::from_int(if b >= 64 {
                if a < 0 {
                    -1
                } else {
                    0
                }
            } else {
                a >> b
            })
        }
        _ => binary_type_error(">>", l, r),
    }
}

fn both_bools(l: ValueRef, r: ValueRef) -> Option<(bool, bool)> {
    if l.is_tagged() || r.is_tagged() || l.is_null() || r.is_null() {
        return None;
    }
    match (l.payload(), r.payload()) {
        (Payload::Bool(a), Payload::Bool(b)) => Some((*a, *b)),
        _ => None,
    }
}

fn set_items(v: ValueRef) -> Option<Vec<ValueRef>> {
    if v.is_null() || v.is_tagged() {
        return None;
    }
    match v.payload() {
        Payload::Set(items) => Some(items.borrow().clone()),
        Payload::FrozenSet(items) => Some(items.to_vec()),
        _ => None,
    }
}

fn set_bitwise(op: u8, l: ValueRef, r: ValueRef) -> Option<ValueRef> {
    let a = set_items(l)?;
    let b = set_items(r)?;
    let out: Vec<ValueRef> = match op {
        b'&' => a
            .iter()
            .filter(|v| b.iter().any(|w| values_equal(**v, *w)))
            .copied()
            .collect(),
        b'|' => {
            let mut out = a.clone();
            for w in &b {
                if !out.iter().any(|v| values_equal(*v, *w)) {
                    out.push(*w);
                }
            }
            out
        }
        _ => {
            let mut out: Vec<ValueRef> = a
                .iter()
                .filter(|v| !b.iter().any(|w| values_equal(**v, *w)))
                .copied()
                .collect();
            for w in &b {
                if !a.iter().any(|v| values_equal(*v, *w)) {
                    out.push(*w);
                }
            }
            out
        }
    };
    for v in &out {
        v.incref();
    }
    Some(alloc(Payload::Set(RefCell::new(out))))
}

pub extern "C" fn bit_and(l: ValueRef, r: ValueRef) -> ValueRef {
    if let Some((a, b)) = both_bools(l, r) {
        l.decref();
        r.decref();
        let res = bool_value(a & b);
        res.incref();
        return res;
    }
    if let Some(res) = set_bitwise(b'&', l, r) {
        l.decref();
        r.decref();
        return res;
    }
    match num_pair(l, r) {
        NumPair::Ints(a, b) => {
            l.decref();
            r.decref();
            ValueRef::from_int(a & b)
        }
        _ => binary_type_error("&", l, r),
    }
}

pub extern "C" fn bit_or(l: ValueRef, r: ValueRef) -> ValueRef {
    if let Some((a, b)) = both_bools(l, r) {
        l.decref();
        r.decref();
        let res = bool_value(a | b);
        res.incref();
        return res;
    }
    if let Some(res) = set_bitwise(b'|', l, r) {
        l.decref();
        r.decref();
        return res;
    }
    match num_pair(l, r) {
        NumPair::Ints(a, b) => {
            l.decref();
            r.decref();
            ValueRef::from_int(a | b)
        }
        _ => binary_type_error("|", l, r),
    }
}

pub extern "C" fn bit_xor(l: ValueRef, r: ValueRef) -> ValueRef {
    if let Some((a, b)) = both_bools(l, r) {
        l.decref();
        r.decref();
        let res = bool_value(a ^ b);
        res.incref();
        return res;
    }
    if let Some(res) = set_bitwise(b'^', l, r) {
        l.decref();
        r.decref();
        return res;
    }
    match num_pair(l, r) {
        NumPair::Ints(a, b) => {
            l.decref();
            r.decref();
            ValueRef::from_int(a ^ b)
        }
        _ => binary_type_error("^", l, r),
    }
}

/// In-place add: list extends in place, everything else follows `add`.
pub extern "C" fn inplace_add(l: ValueRef, r: ValueRef) -> ValueRef {
    if !l.is_null() && !l.is_tagged() {
        if let Payload::List(items) = l.payload() {
            let extra = iterate_all(r);
            match extra {
                Some(extra) => {
                    items.borrow_mut().extend(extra);
                    r.decref();
                    return l;
                }
                None => {
                    return binary_type_error("+=", l, r);
                }
            }
        }
    }
    add(l, r)
}

// ===== Tagged integer fast paths =====

/// Addition on an integer pair proven by the analyzer. Handles the
/// tagged/boxed transition internally: results that no longer fit the
/// tagged range come back boxed.
pub extern "C" fn tagged_add(l: ValueRef, r: ValueRef) -> ValueRef {
    match (l.int_value(), r.int_value()) {
        (Some(a), Some(b)) => {
            let res = int_result(a.checked_add(b));
            l.decref();
            r.decref();
            res
        }
        _ => add(l, r),
    }
}

pub extern "C" fn tagged_sub(l: ValueRef, r: ValueRef) -> ValueRef {
    match (l.int_value(), r.int_value()) {
        (Some(a), Some(b)) => {
            let res = int_result(a.checked_sub(b));
            l.decref();
            r.decref();
            res
        }
        _ => subtract(l, r),
    }
}

pub extern "C" fn tagged_mul(l: ValueRef, r: ValueRef) -> ValueRef {
    match (l.int_value(), r.int_value()) {
        (Some(a), Some(b)) => {
            let res = int_result(a.checked_mul(b));
            l.decref();
            r.decref();
            res
        }
        _ => multiply(l, r),
    }
}

pub extern "C" fn tagged_lshift(l: ValueRef, r: ValueRef) -> ValueRef {
    lshift(l, r)
}

pub extern "C" fn tagged_power(l: ValueRef, r: ValueRef) -> ValueRef {
    power(l, r)
}

fn tagged_compare(l: ValueRef, r: ValueRef) -> Option<std::cmp::Ordering> {
    let res = values_ordering(l, r);
    l.decref();
    r.decref();
    res
}

pub extern "C" fn tagged_eq(l: ValueRef, r: ValueRef) -> i32 {
    (tagged_compare(l, r) == Some(std::cmp::Ordering::Equal)) as i32
}

pub extern "C" fn tagged_ne(l: ValueRef, r: ValueRef) -> i32 {
    (tagged_compare(l, r) != Some(std::cmp::Ordering::Equal)) as i32
}

pub extern "C" fn tagged_lt(l: ValueRef, r: ValueRef) -> i32 {
    (tagged_compare(l, r) == Some(std::cmp::Ordering::Less)) as i32
}

pub extern "C" fn tagged_le(l: ValueRef, r: ValueRef) -> i32 {
    matches!(
        tagged_compare(l, r),
        Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
    ) as i32
}

pub extern "C" fn tagged_gt(l: ValueRef, r: ValueRef) -> i32 {
    (tagged_compare(l, r) == Some(std::cmp::Ordering::Greater)) as i32
}

pub extern "C" fn tagged_ge(l: ValueRef, r: ValueRef) -> i32 {
    matches!(
        tagged_compare(l, r),
        Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
    ) as i32
}

// ===== Conversions =====

pub extern "C" fn float_from_double(value: f64) -> ValueRef {
    new_float(value)
}

pub extern "C" fn bool_from_i32(value: i32) -> ValueRef {
    let v = bool_value(value != 0);
    v.incref();
    v
}

/// Unbox a proven int/bool into a raw f64 for native float arithmetic.
pub extern "C" fn int_to_double(v: ValueRef) -> f64 {
    let res = v.float_value().unwrap_or(0.0);
    v.decref();
    res
}

/// Unbox a proven float into a raw f64.
pub extern "C" fn float_to_double(v: ValueRef) -> f64 {
    let res = v.float_value().unwrap_or(0.0);
    v.decref();
    res
}

pub extern "C" fn float_power(a: f64, b: f64) -> f64 {
    a.powf(b)
}

pub extern "C" fn float_floor(a: f64) -> f64 {
    a.floor()
}

pub extern "C" fn float_modulus(a: f64, b: f64) -> f64 {
    a - b * (a / b).floor()
}

// ===== Unary operators =====

pub extern "C" fn unary_positive(v: ValueRef) -> ValueRef {
    if let Some(a) = v.int_value() {
        v.decref();
        return ValueRef::from_int(a);
    }
    if let Some(f) = v.float_value() {
        v.decref();
        return new_float(f);
    }
    let msg = format!("bad operand type for unary +: '{}'", v.type_kind().name());
    v.decref();
    type_error(msg)
}

pub extern "C" fn unary_negative(v: ValueRef) -> ValueRef {
    if !is_float(v) {
        if let Some(a) = v.int_value() {
            v.decref();
            return int_result(a.checked_neg());
        }
    }
    if let Some(f) = v.float_value() {
        v.decref();
        return new_float(-f);
    }
    let msg = format!("bad operand type for unary -: '{}'", v.type_kind().name());
    v.decref();
    type_error(msg)
}

pub extern "C" fn unary_not(v: ValueRef) -> ValueRef {
    let res = bool_value(!value_is_true(v));
    res.incref();
    v.decref();
    res
}

/// `not` producing a raw i32 for an immediately following branch.
pub extern "C" fn unary_not_i32(v: ValueRef) -> i32 {
    let res = !value_is_true(v) as i32;
    v.decref();
    res
}

pub extern "C" fn unary_invert(v: ValueRef) -> ValueRef {
    if !is_float(v) {
        if let Some(a) = v.int_value() {
            v.decref();
            return ValueRef::from_int(!a);
        }
    }
    let msg = format!("bad operand type for unary ~: '{}'", v.type_kind().name());
    v.decref();
    type_error(msg)
}

/// Truthiness probe; borrows its argument.
pub extern "C" fn is_true(v: ValueRef) -> i32 {
    value_is_true(v) as i32
}

pub extern "C" fn decref_value(v: ValueRef) {
    v.decref();
}

// ===== Comparison =====

pub extern "C" fn rich_compare(l: ValueRef, r: ValueRef, op: i32) -> ValueRef {
    let res = match op {
        2 => Some(values_equal(l, r)),
        3 => Some(!values_equal(l, r)),
        _ => match values_ordering(l, r) {
            Some(ord) => Some(match op {
                0 => ord == std::cmp::Ordering::Less,
                1 => ord != std::cmp::Ordering::Greater,
                4 => ord == std::cmp::Ordering::Greater,
                _ => ord != std::cmp::Ordering::Less,
            }),
            None => None,
        },
    };
    match res {
        Some(b) => {
            l.decref();
            r.decref();
            let v = bool_value(b);
            v.incref();
            v
        }
        None => {
            let msg = format!(
                "'{}' not supported between instances of '{}' and '{}'",
                ["<", "<=", "==", "!=", ">", ">="][op.clamp(0, 5) as usize],
                l.type_kind().name(),
                r.type_kind().name()
            );
            l.decref();
            r.decref();
            type_error(msg)
        }
    }
}

pub extern "C" fn is_(l: ValueRef, r: ValueRef) -> ValueRef {
    let res = bool_value(l == r);
    res.incref();
    l.decref();
    r.decref();
    res
}

pub extern "C" fn is_not(l: ValueRef, r: ValueRef) -> ValueRef {
    let res = bool_value(l != r);
    res.incref();
    l.decref();
    r.decref();
    res
}

pub extern "C" fn is_bool(l: ValueRef, r: ValueRef) -> i32 {
    let res = (l == r) as i32;
    l.decref();
    r.decref();
    res
}

pub extern "C" fn is_not_bool(l: ValueRef, r: ValueRef) -> i32 {
    let res = (l != r) as i32;
    l.decref();
    r.decref();
    res
}

fn contains_impl(item: ValueRef, container: ValueRef) -> Option<bool> {
    if container.is_null() || container.is_tagged() {
        return None;
    }
    match container.payload() {
        Payload::List(items) | Payload::Set(items) => {
            Some(items.borrow().iter().any(|v| values_equal(*v, item)))
        }
        Payload::Tuple(items) | Payload::FrozenSet(items) => {
            Some(items.iter().any(|v| values_equal(*v, item)))
        }
        Payload::Dict(entries) => {
            Some(entries.borrow().iter().any(|(k, _)| values_equal(*k, item)))
        }
        Payload::Str(s) => {
            if item.is_tagged() {
                return None;
            }
            match item.payload() {
                Payload::Str(sub) => Some(s.contains(sub.as_str())),
                _ => None,
            }
        }
        Payload::Bytes(b) => item.int_value().map(|i| b.contains(&(i as u8))),
        Payload::Range { start, stop, step } => item.int_value().map(|i| {
            if *step > 0 {
                i >= *start && i < *stop && (i - start) % step == 0
            } else if *step < 0 {
                i <= *start && i > *stop && (start - i) % (-step) == 0
            } else {
                false
            }
        }),
        _ => None,
    }
}

pub extern "C" fn contains(item: ValueRef, container: ValueRef) -> ValueRef {
    match contains_impl(item, container) {
        Some(b) => {
            item.decref();
            container.decref();
            let v = bool_value(b);
            v.incref();
            v
        }
        None => {
            let msg = format!(
                "argument of type '{}' is not iterable",
                container.type_kind().name()
            );
            item.decref();
            container.decref();
            type_error(msg)
        }
    }
}

pub extern "C" fn not_contains(item: ValueRef, container: ValueRef) -> ValueRef {
    match contains_impl(item, container) {
        Some(b) => {
            item.decref();
            container.decref();
            let v = bool_value(!b);
            v.incref();
            v
        }
        None => {
            let msg = format!(
                "argument of type '{}' is not iterable",
                container.type_kind().name()
            );
            item.decref();
            container.decref();
            type_error(msg)
        }
    }
}

// ===== Subscripts =====

fn normalize_index(i: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if i < 0 { i + len } else { i };
    if idx < 0 || idx >= len {
        None
    } else {
        Some(idx as usize)
    }
}

fn slice_indices(slice: ValueRef, len: usize) -> Result<(i64, i64, i64), ()> {
    let (start, stop, step) = match slice.payload() {
        Payload::Slice { start, stop, step } => (*start, *stop, *step),
        _ => return Err(()),
    };
    let step = match step.int_value() {
        Some(0) => {
            exc::raise(ExcKind::ValueError, "slice step cannot be zero");
            return Err(());
        }
        Some(s) => s,
        None => 1,
    };
    let len = len as i64;
    let clamp = |v: i64| -> i64 {
        let v = if v < 0 { v + len } else { v };
        v.clamp(if step < 0 { -1 } else { 0 }, if step < 0 { len - 1 } else { len })
    };
    let start = match start.int_value() {
        Some(v) => clamp(v),
        None => {
            if step < 0 {
                len - 1
            } else {
                0
            }
        }
    };
    let stop = match stop.int_value() {
        Some(v) => clamp(v),
        None => {
            if step < 0 {
                -1
            } else {
                len
            }
        }
    };
    Ok((start, stop, step))
}

fn slice_positions(slice: ValueRef, len: usize) -> Result<Vec<usize>, ()> {
    let (start, stop, step) = slice_indices(slice, len)?;
    let mut out = Vec::new();
    let mut i = start;
    if step > 0 {
        while i < stop {
            out.push(i as usize);
            i += step;
        }
    } else {
        while i > stop {
            out.push(i as usize);
            i += step;
        }
    }
    Ok(out)
}

pub extern "C" fn subscr(container: ValueRef, index: ValueRef) -> ValueRef {
    if container.is_null() || container.is_tagged() {
        return binary_type_error("[]", container, index);
    }
    let is_slice = !index.is_null()
        && !index.is_tagged()
        && matches!(index.payload(), Payload::Slice { .. });
    let result: Option<ValueRef> = match container.payload() {
        Payload::List(items) => {
            if is_slice {
                let items = items.borrow();
                match slice_positions(index, items.len()) {
                    Ok(pos) => {
                        let out: Vec<ValueRef> = pos.iter().map(|&i| items[i]).collect();
                        for v in &out {
                            v.incref();
                        }
                        Some(new_list(out))
                    }
                    Err(()) => None,
                }
            } else {
                match index.int_value() {
                    Some(i) => {
                        let items = items.borrow();
                        match normalize_index(i, items.len()) {
                            Some(at) => {
                                let v = items[at];
                                v.incref();
                                Some(v)
                            }
                            None => {
                                exc::raise(ExcKind::IndexError, "list index out of range");
                                None
                            }
                        }
                    }
                    None => None,
                }
            }
        }
        Payload::Tuple(items) => {
            if is_slice {
                match slice_positions(index, items.len()) {
                    Ok(pos) => {
                        let out: Vec<ValueRef> = pos.iter().map(|&i| items[i]).collect();
                        for v in &out {
                            v.incref();
                        }
                        Some(new_tuple(out))
                    }
                    Err(()) => None,
                }
            } else {
                match index.int_value().and_then(|i| normalize_index(i, items.len())) {
                    Some(at) => {
                        let v = items[at];
                        v.incref();
                        Some(v)
                    }
                    None => {
                        exc::raise(ExcKind::IndexError, "tuple index out of range");
                        None
                    }
                }
            }
        }
        Payload::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            if is_slice {
                match slice_positions(index, chars.len()) {
                    Ok(pos) => Some(new_str(pos.iter().map(|&i| chars[i]).collect::<String>())),
                    Err(()) => None,
                }
            } else {
                match index.int_value().and_then(|i| normalize_index(i, chars.len())) {
                    Some(at) => Some(new_str(chars[at].to_string())),
                    None => {
                        exc::raise(ExcKind::IndexError, "string index out of range");
                        None
                    }
                }
            }
        }
        Payload::Bytes(b) => {
            if is_slice {
                match slice_positions(index, b.len()) {
                    Ok(pos) => Some(new_bytes(pos.iter().map(|&i| b[i]).collect())),
                    Err(()) => None,
                }
            } else {
                match index.int_value().and_then(|i| normalize_index(i, b.len())) {
                    Some(at) => Some(ValueRef::from_int(b[at] as i64)),
                    None => {
                        exc::raise(ExcKind::IndexError, "index out of range");
                        None
                    }
                }
            }
        }
        Payload::Dict(_) => match dict_get(container, index) {
            Some(v) => {
                v.incref();
                Some(v)
            }
            None => {
                exc::raise(ExcKind::KeyError, value_repr(index));
                None
            }
        },
        _ => None,
    };
    match result {
        Some(v) => {
            container.decref();
            index.decref();
            v
        }
        None => {
            if !exc::pending() {
                let msg = format!(
                    "'{}' object is not subscriptable",
                    container.type_kind().name()
                );
                exc::raise(ExcKind::TypeError, msg);
            }
            container.decref();
            index.decref();
            ValueRef::NULL
        }
    }
}

pub extern "C" fn store_subscr(value: ValueRef, container: ValueRef, index: ValueRef) -> i32 {
    if container.is_null() || container.is_tagged() {
        value.decref();
        container.decref();
        index.decref();
        exc::raise(ExcKind::TypeError, "object does not support item assignment");
        return -1;
    }
    let ok = match container.payload() {
        Payload::List(items) => match index.int_value() {
            Some(i) => {
                let mut items = items.borrow_mut();
                let len = items.len();
                match normalize_index(i, len) {
                    Some(at) => {
                        let old = items[at];
                        items[at] = value;
                        old.decref();
                        index.decref();
                        true
                    }
                    None => {
                        exc::raise(ExcKind::IndexError, "list assignment index out of range");
                        value.decref();
                        index.decref();
                        false
                    }
                }
            }
            None => {
                exc::raise(ExcKind::TypeError, "list indices must be integers");
                value.decref();
                index.decref();
                false
            }
        },
        Payload::Dict(_) => {
            dict_set(container, index, value);
            true
        }
        _ => {
            let msg = format!(
                "'{}' object does not support item assignment",
                container.type_kind().name()
            );
            exc::raise(ExcKind::TypeError, msg);
            value.decref();
            index.decref();
            false
        }
    };
    container.decref();
    if ok {
        0
    } else {
        -1
    }
}

pub extern "C" fn delete_subscr(container: ValueRef, index: ValueRef) -> i32 {
    if container.is_null() || container.is_tagged() {
        container.decref();
        index.decref();
        exc::raise(ExcKind::TypeError, "object does not support item deletion");
        return -1;
    }
    let ok = match container.payload() {
        Payload::List(items) => match index.int_value() {
            Some(i) => {
                let mut items = items.borrow_mut();
                let len = items.len();
                match normalize_index(i, len) {
                    Some(at) => {
                        let old = items.remove(at);
                        old.decref();
                        true
                    }
                    None => {
                        exc::raise(ExcKind::IndexError, "list assignment index out of range");
                        false
                    }
                }
            }
            None => {
                exc::raise(ExcKind::TypeError, "list indices must be integers");
                false
            }
        },
        Payload::Dict(_) => {
            if dict_remove(container, index) {
                true
            } else {
                exc::raise(ExcKind::KeyError, value_repr(index));
                false
            }
        }
        _ => {
            let msg = format!(
                "'{}' object does not support item deletion",
                container.type_kind().name()
            );
            exc::raise(ExcKind::TypeError, msg);
            false
        }
    };
    container.decref();
    index.decref();
    if ok {
        0
    } else {
        -1
    }
}

// ===== Iteration =====

pub extern "C" fn get_iter(v: ValueRef) -> ValueRef {
    let iterable = !v.is_null()
        && !v.is_tagged()
        && matches!(
            v.payload(),
            Payload::List(_)
                | Payload::Tuple(_)
                | Payload::Set(_)
                | Payload::FrozenSet(_)
                | Payload::Dict(_)
                | Payload::Str(_)
                | Payload::Bytes(_)
                | Payload::Range { .. }
        );
    if !iterable {
        // An iterator is its own iterator.
        if !v.is_null() && !v.is_tagged() && matches!(v.payload(), Payload::Iter(_)) {
            return v;
        }
        let msg = format!("'{}' object is not iterable", v.type_kind().name());
        v.decref();
        return type_error(msg);
    }
    alloc(Payload::Iter(RefCell::new(IterState {
        target: v,
        index: 0,
    })))
}

/// Advance an iterator. Borrows the iterator; returns a new reference to
/// the next element, the shared sentinel on clean exhaustion, or null with
/// an exception set.
pub extern "C" fn iter_next(iter: ValueRef) -> ValueRef {
    if iter.is_null() || iter.is_tagged() {
        exc::raise(ExcKind::TypeError, "iter_next on non-iterator");
        return ValueRef::NULL;
    }
    let state = match iter.payload() {
        Payload::Iter(state) => state,
        _ => {
            exc::raise(ExcKind::TypeError, "iter_next on non-iterator");
            return ValueRef::NULL;
        }
    };
    let mut state = state.borrow_mut();
    let at = state.index;
    let target = state.target;
    let next: Option<ValueRef> = match target.payload() {
        Payload::List(items) => items.borrow().get(at).map(|v| {
            v.incref();
            *v
        }),
        Payload::Tuple(items) | Payload::FrozenSet(items) => items.get(at).map(|v| {
            v.incref();
            *v
        }),
        Payload::Set(items) => items.borrow().get(at).map(|v| {
            v.incref();
            *v
        }),
        Payload::Dict(entries) => entries.borrow().get(at).map(|(k, _)| {
            k.incref();
            *k
        }),
        Payload::Str(s) => s.chars().nth(at).map(|c| new_str(c.to_string())),
        Payload::Bytes(b) => b.get(at).map(|byte| ValueRef::from_int(*byte as i64)),
        Payload::Range { start, stop, step } => {
            if (at as i64) < range_len(*start, *stop, *step) {
                Some(ValueRef::from_int(start + step * at as i64))
            } else {
                None
            }
        }
        _ => None,
    };
    match next {
        Some(v) => {
            state.index += 1;
            v
        }
        None => iter_sentinel(),
    }
}

// ===== Containers =====

unsafe fn array_values(base: *mut ValueRef, len: i32) -> Vec<ValueRef> {
    std::slice::from_raw_parts(base, len as usize).to_vec()
}

/// Build a tuple from a scratch array, taking ownership of the entries.
///
/// # Safety
/// `base` must point at `len` initialized `ValueRef`s.
pub unsafe extern "C" fn tuple_from_array(base: *mut ValueRef, len: i32) -> ValueRef {
    new_tuple(array_values(base, len))
}

/// # Safety
/// `base` must point at `len` initialized `ValueRef`s.
pub unsafe extern "C" fn list_from_array(base: *mut ValueRef, len: i32) -> ValueRef {
    new_list(array_values(base, len))
}

/// # Safety
/// `base` must point at `len` initialized `ValueRef`s.
pub unsafe extern "C" fn set_from_array(base: *mut ValueRef, len: i32) -> ValueRef {
    let mut out: Vec<ValueRef> = Vec::new();
    for v in array_values(base, len) {
        if out.iter().any(|w| values_equal(*w, v)) {
            v.decref();
        } else {
            out.push(v);
        }
    }
    alloc(Payload::Set(RefCell::new(out)))
}

/// Build a dict from `len` (key, value) pairs laid out consecutively.
///
/// # Safety
/// `base` must point at `2 * len` initialized `ValueRef`s.
pub unsafe extern "C" fn dict_from_array(base: *mut ValueRef, len: i32) -> ValueRef {
    let flat = array_values(base, len * 2);
    let dict = crate::vm::value::new_dict();
    for pair in flat.chunks(2) {
        dict_set(dict, pair[0], pair[1]);
    }
    dict
}

/// Join `len` string values into one string (f-string assembly).
///
/// # Safety
/// `base` must point at `len` initialized `ValueRef`s.
pub unsafe extern "C" fn unicode_join_array(base: *mut ValueRef, len: i32) -> ValueRef {
    let parts = array_values(base, len);
    let mut out = String::new();
    for v in &parts {
        out.push_str(&value_str(*v));
    }
    for v in parts {
        v.decref();
    }
    new_str(out)
}

pub extern "C" fn list_append(value: ValueRef, list: ValueRef) -> ValueRef {
    if list.is_null() || list.is_tagged() {
        value.decref();
        list.decref();
        exc::raise(ExcKind::TypeError, "list_append target is not a list");
        return ValueRef::NULL;
    }
    match list.payload() {
        Payload::List(items) => {
            items.borrow_mut().push(value);
            list
        }
        _ => {
            value.decref();
            list.decref();
            exc::raise(ExcKind::TypeError, "list_append target is not a list");
            ValueRef::NULL
        }
    }
}

pub extern "C" fn set_add(value: ValueRef, set: ValueRef) -> ValueRef {
    if set.is_null() || set.is_tagged() {
        value.decref();
        set.decref();
        exc::raise(ExcKind::TypeError, "set_add target is not a set");
        return ValueRef::NULL;
    }
    match set.payload() {
        Payload::Set(items) => {
            let mut items = items.borrow_mut();
            if items.iter().any(|v| values_equal(*v, value)) {
                value.decref();
            } else {
                items.push(value);
            }
            drop(items);
            set
        }
        _ => {
            value.decref();
            set.decref();
            exc::raise(ExcKind::TypeError, "set_add target is not a set");
            ValueRef::NULL
        }
    }
}

pub extern "C" fn map_add(key: ValueRef, value: ValueRef, dict: ValueRef) -> ValueRef {
    if dict.is_null() || dict.is_tagged() || !matches!(dict.payload(), Payload::Dict(_)) {
        key.decref();
        value.decref();
        dict.decref();
        exc::raise(ExcKind::TypeError, "map_add target is not a dict");
        return ValueRef::NULL;
    }
    dict_set(dict, key, value);
    dict
}

/// All elements of an iterable as fresh references, or None when the value
/// is not iterable.
fn iterate_all(v: ValueRef) -> Option<Vec<ValueRef>> {
    if v.is_null() || v.is_tagged() {
        return None;
    }
    let mut out = Vec::new();
    match v.payload() {
        Payload::List(items) | Payload::Set(items) => {
            for x in items.borrow().iter() {
                x.incref();
                out.push(*x);
            }
        }
        Payload::Tuple(items) | Payload::FrozenSet(items) => {
            for x in items.iter() {
                x.incref();
                out.push(*x);
            }
        }
        Payload::Dict(entries) => {
            for (k, _) in entries.borrow().iter() {
                k.incref();
                out.push(*k);
            }
        }
        Payload::Str(s) => {
            for c in s.chars() {
                out.push(new_str(c.to_string()));
            }
        }
        Payload::Bytes(b) => {
            for byte in b.iter() {
                out.push(ValueRef::from_int(*byte as i64));
            }
        }
        Payload::Range { start, stop, step } => {
            let n = range_len(*start, *stop, *step);
            for i in 0..n {
                out.push(ValueRef::from_int(start + step * i));
            }
        }
        _ => return None,
    }
    Some(out)
}

pub extern "C" fn list_extend(iterable: ValueRef, list: ValueRef) -> ValueRef {
    let items = match iterate_all(iterable) {
        Some(items) => items,
        None => {
            let msg = format!("'{}' object is not iterable", iterable.type_kind().name());
            iterable.decref();
            list.decref();
            return type_error(msg);
        }
    };
    iterable.decref();
    match list.payload() {
        Payload::List(dst) => {
            dst.borrow_mut().extend(items);
            list
        }
        _ => {
            for v in items {
                v.decref();
            }
            list.decref();
            exc::raise(ExcKind::TypeError, "list_extend target is not a list");
            ValueRef::NULL
        }
    }
}

pub extern "C" fn set_update(iterable: ValueRef, set: ValueRef) -> ValueRef {
    let items = match iterate_all(iterable) {
        Some(items) => items,
        None => {
            let msg = format!("'{}' object is not iterable", iterable.type_kind().name());
            iterable.decref();
            set.decref();
            return type_error(msg);
        }
    };
    iterable.decref();
    let mut result = set;
    for v in items {
        result = set_add(v, result);
        if result.is_null() {
            return ValueRef::NULL;
        }
    }
    result
}

fn dict_pairs(v: ValueRef) -> Option<Vec<(ValueRef, ValueRef)>> {
    if v.is_null() || v.is_tagged() {
        return None;
    }
    match v.payload() {
        Payload::Dict(entries) => {
            let out: Vec<(ValueRef, ValueRef)> = entries.borrow().clone();
            for (k, val) in &out {
                k.incref();
                val.incref();
            }
            Some(out)
        }
        _ => None,
    }
}

pub extern "C" fn dict_update(other: ValueRef, dict: ValueRef) -> ValueRef {
    let pairs = match dict_pairs(other) {
        Some(p) => p,
        None => {
            let msg = format!("'{}' object is not a mapping", other.type_kind().name());
            other.decref();
            dict.decref();
            return type_error(msg);
        }
    };
    other.decref();
    for (k, v) in pairs {
        dict_set(dict, k, v);
    }
    dict
}

/// Like `dict_update` but raises on duplicate keys (`**` at call sites).
pub extern "C" fn dict_merge(other: ValueRef, dict: ValueRef) -> ValueRef {
    let pairs = match dict_pairs(other) {
        Some(p) => p,
        None => {
            let msg = format!("'{}' object is not a mapping", other.type_kind().name());
            other.decref();
            dict.decref();
            return type_error(msg);
        }
    };
    other.decref();
    for (k, v) in &pairs {
        if dict_get(dict, *k).is_some() {
            let msg = format!("got multiple values for keyword argument {}", value_repr(*k));
            for (k2, v2) in &pairs {
                k2.decref();
                v2.decref();
            }
            dict.decref();
            return type_error(msg);
        }
        k.incref();
        v.incref();
        dict_set(dict, *k, *v);
    }
    for (k, v) in pairs {
        k.decref();
        v.decref();
    }
    dict
}

pub extern "C" fn list_to_tuple(list: ValueRef) -> ValueRef {
    match list.payload() {
        Payload::List(items) => {
            let out: Vec<ValueRef> = items.borrow().clone();
            for v in &out {
                v.incref();
            }
            let res = new_tuple(out);
            list.decref();
            res
        }
        _ => {
            list.decref();
            exc::raise(ExcKind::TypeError, "list_to_tuple on non-list");
            ValueRef::NULL
        }
    }
}

pub extern "C" fn build_slice(start: ValueRef, stop: ValueRef, step: ValueRef) -> ValueRef {
    alloc(Payload::Slice { start, stop, step })
}

/// Unpack `seq` into exactly `size` slots written to `storage`.
///
/// # Safety
/// `storage` must have room for `size` `ValueRef`s.
pub unsafe extern "C" fn unpack_sequence(
    seq: ValueRef,
    size: i32,
    storage: *mut ValueRef,
) -> i32 {
    let items = match iterate_all(seq) {
        Some(items) => items,
        None => {
            let msg = format!("cannot unpack non-iterable '{}'", seq.type_kind().name());
            seq.decref();
            type_error(msg);
            return -1;
        }
    };
    seq.decref();
    if items.len() != size as usize {
        let msg = if items.len() < size as usize {
            format!("not enough values to unpack (expected {})", size)
        } else {
            format!("too many values to unpack (expected {})", size)
        };
        for v in items {
            v.decref();
        }
        exc::raise(ExcKind::ValueError, msg);
        return -1;
    }
    for (i, v) in items.into_iter().enumerate() {
        storage.add(i).write(v);
    }
    0
}

/// Unpack with a starred middle target: writes `left` values, then a list
/// of the remainder minus `right`, then `right` trailing values.
///
/// # Safety
/// `storage` must have room for `left + 1 + right` `ValueRef`s.
pub unsafe extern "C" fn unpack_ex(
    seq: ValueRef,
    left: i32,
    right: i32,
    storage: *mut ValueRef,
) -> i32 {
    let items = match iterate_all(seq) {
        Some(items) => items,
        None => {
            let msg = format!("cannot unpack non-iterable '{}'", seq.type_kind().name());
            seq.decref();
            type_error(msg);
            return -1;
        }
    };
    seq.decref();
    let needed = (left + right) as usize;
    if items.len() < needed {
        let msg = format!("not enough values to unpack (expected at least {})", needed);
        for v in items {
            v.decref();
        }
        exc::raise(ExcKind::ValueError, msg);
        return -1;
    }
    let mid_end = items.len() - right as usize;
    let mut slot = 0usize;
    for v in &items[..left as usize] {
        storage.add(slot).write(*v);
        slot += 1;
    }
    let middle: Vec<ValueRef> = items[left as usize..mid_end].to_vec();
    storage.add(slot).write(new_list(middle));
    slot += 1;
    for v in &items[mid_end..] {
        storage.add(slot).write(*v);
        slot += 1;
    }
    0
}

// ===== Names, globals, attributes, cells =====

unsafe fn name_str<'a>(name: *const String) -> &'a str {
    (*name).as_str()
}

/// # Safety
/// `frame` and `name` must be live pointers from the compiled method.
pub unsafe extern "C" fn load_global(frame: *mut Frame, name: *const String) -> ValueRef {
    let frame = &*frame;
    let name = name_str(name);
    if let Some(v) = dict_get_str(frame.globals, name) {
        v.incref();
        return v;
    }
    if let Some(v) = dict_get_str(frame.builtins, name) {
        v.incref();
        return v;
    }
    exc::raise(ExcKind::NameError, format!("name '{}' is not defined", name));
    ValueRef::NULL
}

/// # Safety
/// `frame` and `name` must be live pointers from the compiled method.
pub unsafe extern "C" fn store_global(
    value: ValueRef,
    frame: *mut Frame,
    name: *const String,
) -> i32 {
    let frame = &*frame;
    dict_set(frame.globals, new_str(name_str(name)), value);
    0
}

/// # Safety
/// `frame` and `name` must be live pointers from the compiled method.
pub unsafe extern "C" fn delete_global(frame: *mut Frame, name: *const String) -> i32 {
    let frame = &*frame;
    let key = new_str(name_str(name));
    let removed = dict_remove(frame.globals, key);
    key.decref();
    if removed {
        0
    } else {
        exc::raise(
            ExcKind::NameError,
            format!("name '{}' is not defined", name_str(name)),
        );
        -1
    }
}

/// # Safety
/// `obj` owned; `name` must be a live pointer from the compiled method.
pub unsafe extern "C" fn load_attr(obj: ValueRef, name: *const String) -> ValueRef {
    let name = name_str(name);
    if !obj.is_null() && !obj.is_tagged() {
        if let Payload::Module { dict, .. } = obj.payload() {
            if let Some(v) = dict_get_str(*dict, name) {
                v.incref();
                obj.decref();
                return v;
            }
        }
    }
    let msg = format!(
        "'{}' object has no attribute '{}'",
        obj.type_kind().name(),
        name
    );
    obj.decref();
    exc::raise(ExcKind::AttributeError, msg);
    ValueRef::NULL
}

/// # Safety
/// `value`/`obj` owned; `name` must be a live pointer.
pub unsafe extern "C" fn store_attr(value: ValueRef, obj: ValueRef, name: *const String) -> i32 {
    let name = name_str(name);
    if !obj.is_null() && !obj.is_tagged() {
        if let Payload::Module { dict, .. } = obj.payload() {
            dict_set(*dict, new_str(name), value);
            obj.decref();
            return 0;
        }
    }
    let msg = format!(
        "'{}' object has no settable attribute '{}'",
        obj.type_kind().name(),
        name
    );
    value.decref();
    obj.decref();
    exc::raise(ExcKind::AttributeError, msg);
    -1
}

/// # Safety
/// `obj` owned; `name` must be a live pointer.
pub unsafe extern "C" fn delete_attr(obj: ValueRef, name: *const String) -> i32 {
    let name = name_str(name);
    if !obj.is_null() && !obj.is_tagged() {
        if let Payload::Module { dict, .. } = obj.payload() {
            let key = new_str(name);
            let removed = dict_remove(*dict, key);
            key.decref();
            obj.decref();
            if removed {
                return 0;
            }
            exc::raise(
                ExcKind::AttributeError,
                format!("attribute '{}' not found", name),
            );
            return -1;
        }
    }
    obj.decref();
    exc::raise(
        ExcKind::AttributeError,
        format!("attribute '{}' not found", name),
    );
    -1
}

fn cell_at(frame: &Frame, index: i32) -> Option<&Cell<ValueRef>> {
    let code = frame.code();
    let slot = code.local_count as usize + index as usize;
    if slot >= frame.slot_count() {
        return None;
    }
    let cell = frame.slot(slot);
    if cell.is_null() || cell.is_tagged() {
        return None;
    }
    match cell.payload() {
        Payload::CellVar(inner) => Some(inner),
        _ => None,
    }
}

/// # Safety
/// `frame` must be a live pointer from the compiled method.
pub unsafe extern "C" fn cell_get(frame: *mut Frame, index: i32) -> ValueRef {
    let frame = &*frame;
    match cell_at(frame, index).map(|c| c.get()) {
        Some(v) if !v.is_null() => {
            v.incref();
            v
        }
        _ => {
            let name = format!("cell {}", index);
            exc::raise(
                ExcKind::NameError,
                format!("free variable '{}' referenced before assignment", name),
            );
            ValueRef::NULL
        }
    }
}

/// # Safety
/// `frame` must be a live pointer from the compiled method.
pub unsafe extern "C" fn cell_set(value: ValueRef, frame: *mut Frame, index: i32) {
    let frame = &*frame;
    if let Some(cell) = cell_at(frame, index) {
        let old = cell.replace(value);
        old.decref();
    } else {
        value.decref();
    }
}

/// # Safety
/// `frame` must be a live pointer from the compiled method.
pub unsafe extern "C" fn cell_clear(frame: *mut Frame, index: i32) -> i32 {
    let frame = &*frame;
    if let Some(cell) = cell_at(frame, index) {
        let old = cell.replace(ValueRef::NULL);
        if !old.is_null() {
            old.decref();
            return 0;
        }
    }
    exc::raise(ExcKind::NameError, "free variable referenced before assignment");
    -1
}

/// # Safety
/// `frame` must be a live pointer from the compiled method.
pub unsafe extern "C" fn load_classderef(frame: *mut Frame, index: i32) -> ValueRef {
    cell_get(frame, index)
}

// ===== Calls =====

/// Call `target` with borrowed arguments; returns a new reference.
pub fn do_call(target: ValueRef, args: &[ValueRef]) -> ValueRef {
    if target.is_null() || target.is_tagged() {
        return type_error(format!(
            "'{}' object is not callable",
            target.type_kind().name()
        ));
    }
    match target.payload() {
        Payload::Function(data) => match &data.kind {
            FunctionKind::Native(f) => f(args),
            FunctionKind::Bytecode { .. } => crate::dispatch::call_bytecode(target, args),
        },
        Payload::Method { receiver, callable } => {
            if matches!(receiver.payload(), Payload::Module { .. }) {
                do_call(*callable, args)
            } else {
                let mut with_self = Vec::with_capacity(args.len() + 1);
                with_self.push(*receiver);
                with_self.extend_from_slice(args);
                do_call(*callable, &with_self)
            }
        }
        Payload::Type(kind) => construct(*kind, args),
        _ => type_error(format!(
            "'{}' object is not callable",
            target.type_kind().name()
        )),
    }
}

fn construct(kind: TypeKind, args: &[ValueRef]) -> ValueRef {
    match kind {
        TypeKind::Exception(k) => {
            let msg = args.first().map(|v| value_str(*v)).unwrap_or_default();
            new_exception(k, msg)
        }
        TypeKind::Int => match args.first() {
            Some(v) => match v.int_value() {
                Some(i) => ValueRef::from_int(i),
                None => match v.float_value() {
                    Some(f) => ValueRef::from_int(f as i64),
                    None => type_error("invalid int() argument".to_string()),
                },
            },
            None => ValueRef::from_int(0),
        },
        TypeKind::Float => match args.first() {
            Some(v) => match v.float_value() {
                Some(f) => new_float(f),
                None => type_error("invalid float() argument".to_string()),
            },
            None => new_float(0.0),
        },
        TypeKind::Bool => {
            let b = args.first().map(|v| value_is_true(*v)).unwrap_or(false);
            let v = bool_value(b);
            v.incref();
            v
        }
        TypeKind::Str => match args.first() {
            Some(v) => new_str(value_str(*v)),
            None => new_str(""),
        },
        TypeKind::List => match args.first() {
            Some(v) => match iterate_all(*v) {
                Some(items) => new_list(items),
                None => type_error("list() argument must be iterable".to_string()),
            },
            None => new_list(Vec::new()),
        },
        TypeKind::Tuple => match args.first() {
            Some(v) => match iterate_all(*v) {
                Some(items) => new_tuple(items),
                None => type_error("tuple() argument must be iterable".to_string()),
            },
            None => new_tuple(Vec::new()),
        },
        _ => type_error(format!("cannot construct '{}' values", kind.name())),
    }
}

fn call_owned(target: ValueRef, args: &[ValueRef]) -> ValueRef {
    let res = do_call(target, args);
    target.decref();
    for a in args {
        a.decref();
    }
    res
}

pub extern "C" fn call0(target: ValueRef) -> ValueRef {
    call_owned(target, &[])
}

pub extern "C" fn call1(target: ValueRef, a0: ValueRef) -> ValueRef {
    call_owned(target, &[a0])
}

pub extern "C" fn call2(target: ValueRef, a0: ValueRef, a1: ValueRef) -> ValueRef {
    call_owned(target, &[a0, a1])
}

pub extern "C" fn call3(target: ValueRef, a0: ValueRef, a1: ValueRef, a2: ValueRef) -> ValueRef {
    call_owned(target, &[a0, a1, a2])
}

pub extern "C" fn call4(
    target: ValueRef,
    a0: ValueRef,
    a1: ValueRef,
    a2: ValueRef,
    a3: ValueRef,
) -> ValueRef {
    call_owned(target, &[a0, a1, a2, a3])
}

fn tuple_items(v: ValueRef) -> Option<Vec<ValueRef>> {
    if v.is_null() || v.is_tagged() {
        return None;
    }
    match v.payload() {
        Payload::Tuple(items) => Some(items.to_vec()),
        _ => None,
    }
}

pub extern "C" fn call_n(target: ValueRef, args: ValueRef) -> ValueRef {
    match tuple_items(args) {
        Some(items) => {
            let res = do_call(target, &items);
            target.decref();
            args.decref();
            res
        }
        None => {
            target.decref();
            args.decref();
            type_error("argument pack must be a tuple".to_string())
        }
    }
}

pub extern "C" fn kwcall_n(target: ValueRef, args: ValueRef, names: ValueRef) -> ValueRef {
    let name_count = tuple_items(names).map(|v| v.len()).unwrap_or(0);
    if name_count > 0 {
        target.decref();
        args.decref();
        names.decref();
        return type_error("keyword arguments are not supported by this callable".to_string());
    }
    names.decref();
    call_n(target, args)
}

pub extern "C" fn call_args(target: ValueRef, args: ValueRef) -> ValueRef {
    call_n(target, args)
}

pub extern "C" fn call_kwargs(target: ValueRef, args: ValueRef, kwargs: ValueRef) -> ValueRef {
    let empty = match kwargs.payload() {
        Payload::Dict(entries) => entries.borrow().is_empty(),
        _ => false,
    };
    if !empty {
        target.decref();
        args.decref();
        kwargs.decref();
        return type_error("keyword arguments are not supported by this callable".to_string());
    }
    kwargs.decref();
    call_n(target, args)
}

/// # Safety
/// `name` must be a live pointer from the compiled method.
pub unsafe extern "C" fn load_method(obj: ValueRef, name: *const String) -> ValueRef {
    let name_s = name_str(name);
    let callable = if !obj.is_null() && !obj.is_tagged() {
        match obj.payload() {
            Payload::Module { dict, .. } => dict_get_str(*dict, name_s),
            _ => None,
        }
    } else {
        None
    };
    match callable {
        Some(c) => {
            c.incref();
            alloc(Payload::Method {
                receiver: obj,
                callable: c,
            })
        }
        None => {
            let msg = format!(
                "'{}' object has no attribute '{}'",
                obj.type_kind().name(),
                name_s
            );
            obj.decref();
            exc::raise(ExcKind::AttributeError, msg);
            ValueRef::NULL
        }
    }
}

pub extern "C" fn meth_call0(method: ValueRef) -> ValueRef {
    call_owned(method, &[])
}

pub extern "C" fn meth_call1(method: ValueRef, a0: ValueRef) -> ValueRef {
    call_owned(method, &[a0])
}

pub extern "C" fn meth_call2(method: ValueRef, a0: ValueRef, a1: ValueRef) -> ValueRef {
    call_owned(method, &[a0, a1])
}

pub extern "C" fn meth_call3(
    method: ValueRef,
    a0: ValueRef,
    a1: ValueRef,
    a2: ValueRef,
) -> ValueRef {
    call_owned(method, &[a0, a1, a2])
}

pub extern "C" fn meth_call4(
    method: ValueRef,
    a0: ValueRef,
    a1: ValueRef,
    a2: ValueRef,
    a3: ValueRef,
) -> ValueRef {
    call_owned(method, &[a0, a1, a2, a3])
}

pub extern "C" fn meth_call_n(method: ValueRef, args: ValueRef) -> ValueRef {
    call_n(method, args)
}

// ===== Function construction =====

/// # Safety
/// `frame` must be a live pointer from the compiled method.
pub unsafe extern "C" fn new_function(
    code: ValueRef,
    qualname: ValueRef,
    frame: *mut Frame,
) -> ValueRef {
    let frame = &*frame;
    let code_arc: Arc<crate::vm::code::CodeObject> = match code.payload() {
        Payload::Code(c) => c.clone(),
        _ => {
            code.decref();
            qualname.decref();
            return type_error("function constructor expects a code object".to_string());
        }
    };
    let name = value_str(qualname);
    code.decref();
    qualname.decref();
    frame.globals.incref();
    alloc(Payload::Function(FunctionData {
        name,
        kind: FunctionKind::Bytecode {
            code: code_arc,
            globals: frame.globals,
        },
        defaults: Cell::new(ValueRef::NULL),
        kwdefaults: Cell::new(ValueRef::NULL),
        annotations: Cell::new(ValueRef::NULL),
        closure: Cell::new(ValueRef::NULL),
    }))
}

fn set_function_field(
    value: ValueRef,
    func: ValueRef,
    pick: fn(&FunctionData) -> &Cell<ValueRef>,
) -> ValueRef {
    match func.payload() {
        Payload::Function(data) => {
            let cell = pick(data);
            let old = cell.replace(value);
            old.decref();
            func
        }
        _ => {
            value.decref();
            func.decref();
            type_error("expected a function object".to_string())
        }
    }
}

pub extern "C" fn set_closure(closure: ValueRef, func: ValueRef) -> ValueRef {
    set_function_field(closure, func, |d| &d.closure)
}

pub extern "C" fn set_defaults(defaults: ValueRef, func: ValueRef) -> ValueRef {
    set_function_field(defaults, func, |d| &d.defaults)
}

pub extern "C" fn set_kw_defaults(kwdefaults: ValueRef, func: ValueRef) -> ValueRef {
    set_function_field(kwdefaults, func, |d| &d.kwdefaults)
}

pub extern "C" fn set_annotations(annotations: ValueRef, func: ValueRef) -> ValueRef {
    set_function_field(annotations, func, |d| &d.annotations)
}

/// # Safety
/// `frame` must be a live pointer from the compiled method.
pub unsafe extern "C" fn load_build_class(frame: *mut Frame) -> ValueRef {
    let frame = &*frame;
    match dict_get_str(frame.builtins, "__build_class__") {
        Some(v) => {
            v.incref();
            v
        }
        None => {
            exc::raise(ExcKind::NameError, "__build_class__ not found");
            ValueRef::NULL
        }
    }
}

/// # Safety
/// `frame` must be a live pointer from the compiled method.
pub unsafe extern "C" fn setup_annotations(frame: *mut Frame) -> i32 {
    let frame = &*frame;
    if dict_get_str(frame.globals, "__annotations__").is_none() {
        dict_set(
            frame.globals,
            new_str("__annotations__"),
            crate::vm::value::new_dict(),
        );
    }
    0
}

pub extern "C" fn load_assertion_error() -> ValueRef {
    let v = exc_type_object(ExcKind::AssertionError);
    v.incref();
    v
}

// ===== Exception machinery =====

/// Split the pending exception: the captured triple goes to the first
/// three out-slots (owned by the caller), the previously handled triple
/// goes to the prev slots, and the handled state becomes the new triple.
///
/// # Safety
/// All six pointers must target writable `ValueRef` slots.
pub unsafe extern "C" fn prepare_exception(
    exc_out: *mut ValueRef,
    val_out: *mut ValueRef,
    tb_out: *mut ValueRef,
    prev_exc: *mut ValueRef,
    prev_val: *mut ValueRef,
    prev_tb: *mut ValueRef,
) {
    let (t, v, tb) = exc::take_pending().unwrap_or_else(|| {
        let n = none_value();
        n.incref();
        n.incref();
        n.incref();
        (n, n, n)
    });
    // The handled state keeps its own references.
    t.incref();
    v.incref();
    tb.incref();
    let prev = exc::swap_handled(Some((t, v, tb)));
    exc_out.write(t);
    val_out.write(v);
    tb_out.write(tb);
    match prev {
        Some((pt, pv, ptb)) => {
            prev_exc.write(pt);
            prev_val.write(pv);
            prev_tb.write(ptb);
        }
        None => {
            prev_exc.write(ValueRef::NULL);
            prev_val.write(ValueRef::NULL);
            prev_tb.write(ValueRef::NULL);
        }
    }
}

/// Restore the previously handled exception state, consuming the three
/// references captured by `prepare_exception`.
pub extern "C" fn unwind_exception(prev_exc: ValueRef, prev_val: ValueRef, prev_tb: ValueRef) {
    let new = if prev_exc.is_null() && prev_val.is_null() && prev_tb.is_null() {
        None
    } else {
        Some((prev_exc, prev_val, prev_tb))
    };
    if let Some((t, v, tb)) = exc::swap_handled(new) {
        t.decref();
        v.decref();
        tb.decref();
    }
}

pub extern "C" fn do_raise(exc_value: ValueRef, cause: ValueRef) -> i32 {
    cause.decref();
    if exc_value.is_null() {
        // Bare raise: re-raise the exception being handled.
        match exc::handled_snapshot() {
            Some((t, v, tb)) => {
                exc::set_pending(t, v, tb);
            }
            None => {
                exc::raise(ExcKind::RuntimeError, "No active exception to re-raise");
            }
        }
        return -1;
    }
    if !exc_value.is_tagged() {
        match exc_value.payload() {
            Payload::Exception(data) => {
                let ty = exc_type_object(data.kind);
                ty.incref();
                let tb = none_value();
                tb.incref();
                exc::set_pending(ty, exc_value, tb);
                return -1;
            }
            Payload::Type(TypeKind::Exception(kind)) => {
                let value = new_exception(*kind, "");
                let ty = exc_type_object(*kind);
                ty.incref();
                let tb = none_value();
                tb.incref();
                exc_value.decref();
                exc::set_pending(ty, value, tb);
                return -1;
            }
            _ => {}
        }
    }
    exc_value.decref();
    exc::raise(
        ExcKind::TypeError,
        "exceptions must derive from BaseException",
    );
    -1
}

fn exc_kind_of(v: ValueRef) -> Option<ExcKind> {
    if v.is_null() || v.is_tagged() {
        return None;
    }
    match v.payload() {
        Payload::Exception(data) => Some(data.kind),
        Payload::Type(TypeKind::Exception(kind)) => Some(*kind),
        _ => None,
    }
}

/// Except-clause match test: does the raised value `v` match pattern `w`
/// (an exception type or tuple of exception types)?
pub extern "C" fn compare_exceptions(v: ValueRef, w: ValueRef) -> ValueRef {
    let raised = match exc_kind_of(v) {
        Some(k) => k,
        None => {
            v.decref();
            w.decref();
            return type_error("catching classes that do not inherit from BaseException is not allowed".to_string());
        }
    };
    let mut patterns: Vec<ValueRef> = Vec::new();
    if !w.is_null() && !w.is_tagged() {
        if let Payload::Tuple(items) = w.payload() {
            patterns.extend(items.iter().copied());
        } else {
            patterns.push(w);
        }
    } else {
        patterns.push(w);
    }
    let mut matched = false;
    for p in &patterns {
        match exc_kind_of(*p) {
            Some(k) if !matches!(p.payload(), Payload::Exception(_)) => {
                if raised.matches(k) {
                    matched = true;
                    break;
                }
            }
            _ => {
                v.decref();
                w.decref();
                return type_error("catching classes that do not inherit from BaseException is not allowed".to_string());
            }
        }
    }
    v.decref();
    w.decref();
    let res = bool_value(matched);
    res.incref();
    res
}

/// Re-install a saved exception triple as the pending exception.
pub extern "C" fn err_restore(tb: ValueRef, value: ValueRef, exc_type: ValueRef) {
    exc::set_pending(exc_type, value, tb);
}

/// # Safety
/// `name` must be a live pointer from the compiled method.
pub unsafe extern "C" fn unbound_local(name: *const String) {
    exc::raise(
        ExcKind::UnboundLocalError,
        format!(
            "local variable '{}' referenced before assignment",
            name_str(name)
        ),
    );
}

pub extern "C" fn raise_float_zero_division() {
    exc::raise(ExcKind::ZeroDivisionError, "float division by zero");
}

// ===== Frame bookkeeping =====

/// # Safety
/// `frame` must be a live frame pointer.
pub unsafe extern "C" fn push_frame(frame: *mut Frame) {
    crate::vm::frame::push_frame(frame);
}

/// # Safety
/// `frame` must be a live frame pointer.
pub unsafe extern "C" fn pop_frame(frame: *mut Frame) {
    crate::vm::frame::pop_frame(frame);
}

// ===== Formatting =====

pub extern "C" fn object_str(v: ValueRef) -> ValueRef {
    let res = new_str(value_str(v));
    v.decref();
    res
}

pub extern "C" fn object_repr(v: ValueRef) -> ValueRef {
    let res = new_str(value_repr(v));
    v.decref();
    res
}

pub extern "C" fn object_ascii(v: ValueRef) -> ValueRef {
    let repr = value_repr(v);
    let escaped: String = repr
        .chars()
        .map(|c| {
            if c.is_ascii() {
                c.to_string()
            } else {
                format!("\\u{:04x}", c as u32)
            }
        })
        .collect();
    v.decref();
    new_str(escaped)
}

pub extern "C" fn format_value(v: ValueRef) -> ValueRef {
    object_str(v)
}

fn apply_format_spec(text: &str, spec: &str, numeric: bool) -> Option<String> {
    let mut chars: Vec<char> = spec.chars().collect();
    let mut fill = ' ';
    let mut align: Option<char> = None;
    if chars.len() >= 2 && matches!(chars[1], '<' | '>' | '^') {
        fill = chars[0];
        align = Some(chars[1]);
        chars.drain(..2);
    } else if !chars.is_empty() && matches!(chars[0], '<' | '>' | '^') {
        align = Some(chars[0]);
        chars.remove(0);
    }
    if !chars.is_empty() && chars[0] == '0' && numeric {
        fill = '0';
        align = Some('>');
        chars.remove(0);
    }
    let digits: String = chars.iter().take_while(|c| c.is_ascii_digit()).collect();
    let rest: String = chars.iter().skip(digits.len()).collect();
    if !rest.is_empty() && rest != "d" && rest != "s" {
        return None;
    }
    let width: usize = digits.parse().unwrap_or(0);
    let align = align.unwrap_or(if numeric { '>' } else { '<' });
    let len = text.chars().count();
    if len >= width {
        return Some(text.to_string());
    }
    let pad = width - len;
    Some(match align {
        '<' => format!("{}{}", text, fill.to_string().repeat(pad)),
        '>' => format!("{}{}", fill.to_string().repeat(pad), text),
        _ => {
            let left = pad / 2;
            format!(
                "{}{}{}",
                fill.to_string().repeat(left),
                text,
                fill.to_string().repeat(pad - left)
            )
        }
    })
}

pub extern "C" fn format_object(v: ValueRef, spec: ValueRef) -> ValueRef {
    let spec_s = value_str(spec);
    let text = value_str(v);
    let numeric = v.int_value().is_some() || v.float_value().is_some();
    let res = match apply_format_spec(&text, &spec_s, numeric) {
        Some(s) => new_str(s),
        None => {
            v.decref();
            spec.decref();
            return type_error(format!("invalid format specifier '{}'", spec_s));
        }
    };
    v.decref();
    spec.decref();
    res
}

// ===== Imports =====

static MODULES: Lazy<Mutex<Vec<(String, ValueRef)>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Register a module under `name`, taking ownership of the reference.
/// Host-facing: tests and embedders populate the import table this way.
pub fn register_module(name: impl Into<String>, module: ValueRef) {
    let name = name.into();
    let mut modules = MODULES.lock();
    if let Some(slot) = modules.iter_mut().find(|(n, _)| *n == name) {
        let old = slot.1;
        slot.1 = module;
        old.decref();
    } else {
        modules.push((name, module));
    }
}

fn find_module(name: &str) -> Option<ValueRef> {
    MODULES
        .lock()
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, m)| {
            m.incref();
            *m
        })
}

/// # Safety
/// `frame` and `name` must be live pointers from the compiled method.
pub unsafe extern "C" fn import_name(
    level: ValueRef,
    fromlist: ValueRef,
    name: *const String,
    frame: *mut Frame,
) -> ValueRef {
    let _ = frame;
    level.decref();
    fromlist.decref();
    let name = name_str(name);
    match find_module(name) {
        Some(m) => m,
        None => {
            exc::raise(ExcKind::ImportError, format!("no module named '{}'", name));
            ValueRef::NULL
        }
    }
}

/// # Safety
/// `name` must be a live pointer from the compiled method.
pub unsafe extern "C" fn import_from(module: ValueRef, name: *const String) -> ValueRef {
    let name_s = name_str(name);
    if !module.is_null() && !module.is_tagged() {
        if let Payload::Module { dict, .. } = module.payload() {
            if let Some(v) = dict_get_str(*dict, name_s) {
                v.incref();
                return v;
            }
        }
    }
    exc::raise(
        ExcKind::ImportError,
        format!("cannot import name '{}'", name_s),
    );
    ValueRef::NULL
}

/// # Safety
/// `frame` must be a live pointer from the compiled method.
pub unsafe extern "C" fn import_star(module: ValueRef, frame: *mut Frame) -> i32 {
    let frame = &*frame;
    let pairs = if !module.is_null() && !module.is_tagged() {
        match module.payload() {
            Payload::Module { dict, .. } => dict_pairs(*dict),
            _ => None,
        }
    } else {
        None
    };
    module.decref();
    match pairs {
        Some(pairs) => {
            for (k, v) in pairs {
                let is_private = matches!(k.payload(), Payload::Str(s) if s.starts_with('_'));
                if is_private {
                    k.decref();
                    v.decref();
                } else {
                    dict_set(frame.globals, k, v);
                }
            }
            0
        }
        None => {
            exc::raise(ExcKind::ImportError, "import * target is not a module");
            -1
        }
    }
}

// ===== Diagnostics =====

/// # Safety
/// `msg` must be a live pointer from the compiled method.
pub unsafe extern "C" fn debug_trace(msg: *const String) {
    #[cfg(debug_assertions)]
    eprintln!("[molt-jit] {}", name_str(msg));
    #[cfg(not(debug_assertions))]
    let _ = msg;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::{new_dict, TAGGED_MAX};

    fn int(v: i64) -> ValueRef {
        ValueRef::from_int(v)
    }

    #[test]
    fn test_add_ints_and_strings() {
        let r = add(int(2), int(3));
        assert_eq!(r.int_value(), Some(5));
        r.decref();

        let r = add(new_str("ab"), new_str("cd"));
        assert_eq!(value_str(r), "abcd");
        r.decref();
    }

    #[test]
    fn test_add_type_error() {
        let r = add(new_str("a"), int(1));
        assert!(r.is_null());
        assert_eq!(exc::pending_kind(), Some(ExcKind::TypeError));
        exc::clear_pending();
    }

    #[test]
    fn test_true_divide_ints_promotes() {
        let r = true_divide(int(1), int(2));
        assert_eq!(r.float_value(), Some(0.5));
        r.decref();
    }

    #[test]
    fn test_divide_by_zero() {
        let r = true_divide(new_float(1.0), new_float(0.0));
        assert!(r.is_null());
        assert_eq!(exc::pending_kind(), Some(ExcKind::ZeroDivisionError));
        exc::clear_pending();
    }

    #[test]
    fn test_floor_and_mod_follow_divisor_sign() {
        let r = floor_divide(int(-7), int(2));
        assert_eq!(r.int_value(), Some(-4));
        let m = modulo(int(-7), int(2));
        assert_eq!(m.int_value(), Some(1));
    }

    #[test]
    fn test_tagged_boundary_roundtrip() {
        // TAGGED_MAX + 1 - 1 comes back tagged.
        let up = tagged_add(int(TAGGED_MAX), int(1));
        assert!(!up.is_tagged());
        assert_eq!(up.int_value(), Some(TAGGED_MAX + 1));
        let down = tagged_sub(up, int(1));
        assert!(down.is_tagged());
        assert_eq!(down.int_value(), Some(TAGGED_MAX));
    }

    #[test]
    fn test_sequence_repeat() {
        let r = multiply(new_str("ab"), int(3));
        assert_eq!(value_str(r), "ababab");
        r.decref();
        let t = multiply(int(2), new_tuple(vec![int(1)]));
        assert_eq!(value_repr(t), "(1, 1)");
        t.decref();
    }

    #[test]
    fn test_bool_bitwise_stays_bool() {
        let r = bit_and(bool_value_owned(true), bool_value_owned(false));
        assert_eq!(r.type_kind(), TypeKind::Bool);
        assert!(!value_is_true(r));
        r.decref();
    }

    fn bool_value_owned(b: bool) -> ValueRef {
        let v = bool_value(b);
        v.incref();
        v
    }

    #[test]
    fn test_subscr_string_and_slice() {
        let s = new_str("hello");
        s.incref();
        let c = subscr(s, int(1));
        assert_eq!(value_str(c), "e");
        c.decref();
        let sl = build_slice(int(1), int(4), none_owned());
        let part = subscr(s, sl);
        assert_eq!(value_str(part), "ell");
        part.decref();
    }

    fn none_owned() -> ValueRef {
        let n = none_value();
        n.incref();
        n
    }

    #[test]
    fn test_iter_next_sentinel() {
        let list = new_list(vec![int(1), int(2)]);
        let iter = get_iter(list);
        let a = iter_next(iter);
        assert_eq!(a.int_value(), Some(1));
        let b = iter_next(iter);
        assert_eq!(b.int_value(), Some(2));
        let end = iter_next(iter);
        assert_eq!(end, iter_sentinel());
        assert!(!exc::pending());
        iter.decref();
    }

    #[test]
    fn test_unpack_ex_middle_list() {
        let seq = new_tuple(vec![int(1), int(2), int(3), int(4)]);
        let mut storage = [ValueRef::NULL; 3];
        let rc = unsafe { unpack_ex(seq, 1, 1, storage.as_mut_ptr()) };
        assert_eq!(rc, 0);
        assert_eq!(storage[0].int_value(), Some(1));
        assert_eq!(value_repr(storage[1]), "[2, 3]");
        assert_eq!(storage[2].int_value(), Some(4));
        for v in storage {
            v.decref();
        }
    }

    #[test]
    fn test_compare_exceptions_matching() {
        let raised = new_exception(ExcKind::ZeroDivisionError, "x");
        let pattern = exc_type_object(ExcKind::Exception);
        pattern.incref();
        let res = compare_exceptions(raised, pattern);
        assert!(value_is_true(res));
        res.decref();
    }

    #[test]
    fn test_prepare_and_unwind_exception() {
        exc::raise(ExcKind::ValueError, "boom");
        let mut out = [ValueRef::NULL; 6];
        unsafe {
            prepare_exception(
                &mut out[0],
                &mut out[1],
                &mut out[2],
                &mut out[3],
                &mut out[4],
                &mut out[5],
            );
        }
        assert!(!exc::pending());
        assert!(!out[0].is_null());
        // A bare raise now resurrects the handled exception.
        assert_eq!(do_raise(ValueRef::NULL, ValueRef::NULL), -1);
        assert_eq!(exc::pending_kind(), Some(ExcKind::ValueError));
        exc::clear_pending();
        unwind_exception(out[3], out[4], out[5]);
        for v in &out[..3] {
            v.decref();
        }
    }

    #[test]
    fn test_format_object_width() {
        let r = format_object(int(42), new_str("3"));
        assert_eq!(value_str(r), " 42");
        r.decref();
        let s = format_object(new_str("ab"), new_str("4"));
        assert_eq!(value_str(s), "ab  ");
        s.decref();
    }

    #[test]
    fn test_percent_format() {
        let r = modulo(new_str("x=%s y=%d"), new_tuple(vec![new_str("a"), int(7)]));
        assert_eq!(value_str(r), "x=a y=7");
        r.decref();
    }

    #[test]
    fn test_globals_roundtrip() {
        use crate::vm::code::CodeBuilder;
        let code = Arc::new(CodeBuilder::new("g").build());
        let mut frame = Frame::new(code, new_dict(), new_dict());
        let name = "answer".to_string();
        unsafe {
            assert_eq!(store_global(int(42), &mut *frame, &name), 0);
            let v = load_global(&mut *frame, &name);
            assert_eq!(v.int_value(), Some(42));
            v.decref();
            let missing = "nope".to_string();
            let r = load_global(&mut *frame, &missing);
            assert!(r.is_null());
        }
        assert_eq!(exc::pending_kind(), Some(ExcKind::NameError));
        exc::clear_pending();
    }

    #[test]
    fn test_call_native_function() {
        fn double(args: &[ValueRef]) -> ValueRef {
            ValueRef::from_int(args[0].int_value().unwrap_or(0) * 2)
        }
        let f = alloc(Payload::Function(FunctionData {
            name: "double".to_string(),
            kind: FunctionKind::Native(double),
            defaults: Cell::new(ValueRef::NULL),
            kwdefaults: Cell::new(ValueRef::NULL),
            annotations: Cell::new(ValueRef::NULL),
            closure: Cell::new(ValueRef::NULL),
        }));
        let r = call1(f, int(21));
        assert_eq!(r.int_value(), Some(42));
    }
}
