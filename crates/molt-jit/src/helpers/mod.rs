//! Runtime helper catalog
//!
//! Maps stable numeric helper IDs to signatures and host function
//! addresses. The compiler driver emits `call <id>`; the backend resolves
//! the id through this catalog when generating the call. IDs are grouped
//! the way the emitted code uses them: core object-model helpers, call
//! shapes, allocation/iteration, name resolution, and float primitives.

pub mod intrins;

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::il::IlType;

/// Helper IDs. Stable: emitted IL embeds these values.
pub mod id {
    // Object model (0x0000_00xx)
    pub const ADD: u32 = 0x0000_0000;
    pub const MULTIPLY: u32 = 0x0000_0001;
    pub const SUBTRACT: u32 = 0x0000_0002;
    pub const TRUE_DIVIDE: u32 = 0x0000_0003;
    pub const FLOOR_DIVIDE: u32 = 0x0000_0004;
    pub const POWER: u32 = 0x0000_0005;
    pub const MODULO: u32 = 0x0000_0006;
    pub const SUBSCR: u32 = 0x0000_0007;
    pub const RICH_COMPARE: u32 = 0x0000_0009;
    pub const CONTAINS: u32 = 0x0000_000A;
    pub const NOT_CONTAINS: u32 = 0x0000_000B;
    pub const STORE_SUBSCR: u32 = 0x0000_000C;
    pub const DELETE_SUBSCR: u32 = 0x0000_000D;
    pub const NEW_FUNCTION: u32 = 0x0000_000E;
    pub const GET_ITER: u32 = 0x0000_000F;
    pub const DECREF: u32 = 0x0000_0010;
    pub const LOAD_BUILD_CLASS: u32 = 0x0000_0011;
    pub const UNPACK_SEQUENCE: u32 = 0x0000_0014;
    pub const UNPACK_EX: u32 = 0x0000_0015;
    pub const CELL_SET: u32 = 0x0000_0017;
    pub const SET_CLOSURE: u32 = 0x0000_0018;
    pub const BUILD_SLICE: u32 = 0x0000_0019;
    pub const UNARY_POSITIVE: u32 = 0x0000_001A;
    pub const UNARY_NEGATIVE: u32 = 0x0000_001B;
    pub const UNARY_NOT: u32 = 0x0000_001C;
    pub const UNARY_INVERT: u32 = 0x0000_001D;
    pub const MATRIX_MULTIPLY: u32 = 0x0000_001E;
    pub const LSHIFT: u32 = 0x0000_001F;
    pub const RSHIFT: u32 = 0x0000_0020;
    pub const BIT_AND: u32 = 0x0000_0021;
    pub const BIT_XOR: u32 = 0x0000_0022;
    pub const BIT_OR: u32 = 0x0000_0023;
    pub const LIST_APPEND: u32 = 0x0000_0024;
    pub const SET_ADD: u32 = 0x0000_0025;
    pub const INPLACE_ADD: u32 = 0x0000_002C;
    pub const MAP_ADD: u32 = 0x0000_0033;
    pub const LOAD_CLASSDEREF: u32 = 0x0000_0035;
    pub const PREPARE_EXCEPTION: u32 = 0x0000_0036;
    pub const DO_RAISE: u32 = 0x0000_0037;
    pub const COMPARE_EXCEPTIONS: u32 = 0x0000_0039;
    pub const UNBOUND_LOCAL: u32 = 0x0000_003A;
    pub const DEBUG_TRACE: u32 = 0x0000_003B;
    pub const UNWIND_EXCEPTION: u32 = 0x0000_003F;
    pub const PUSH_FRAME: u32 = 0x0000_0041;
    pub const POP_FRAME: u32 = 0x0000_0042;
    pub const IMPORT_NAME: u32 = 0x0000_0043;
    pub const IMPORT_FROM: u32 = 0x0000_0045;
    pub const IMPORT_STAR: u32 = 0x0000_0046;
    pub const IS: u32 = 0x0000_0049;
    pub const IS_NOT: u32 = 0x0000_004A;
    pub const IS_BOOL: u32 = 0x0000_004B;
    pub const IS_NOT_BOOL: u32 = 0x0000_004C;
    pub const UNARY_NOT_INT: u32 = 0x0000_0051;
    pub const FLOAT_FROM_DOUBLE: u32 = 0x0000_0053;
    pub const BOOL_FROM_I32: u32 = 0x0000_0054;
    pub const FLOAT_ZERO_DIVISION: u32 = 0x0000_0055;
    pub const TAGGED_EQ: u32 = 0x0000_0065;
    pub const TAGGED_LT: u32 = 0x0000_0066;
    pub const TAGGED_LE: u32 = 0x0000_0067;
    pub const TAGGED_NE: u32 = 0x0000_0068;
    pub const TAGGED_GT: u32 = 0x0000_0069;
    pub const TAGGED_GE: u32 = 0x0000_006A;
    pub const PERIODIC_WORK: u32 = 0x0000_006B;
    pub const LIST_EXTEND: u32 = 0x0000_006C;
    pub const LIST_TO_TUPLE: u32 = 0x0000_006D;
    pub const SET_UPDATE: u32 = 0x0000_006E;
    pub const DICT_UPDATE: u32 = 0x0000_006F;
    pub const INT_TO_FLOAT: u32 = 0x0000_0072;
    pub const FORMAT_VALUE: u32 = 0x0000_0074;
    pub const FORMAT_OBJECT: u32 = 0x0000_0075;
    pub const DICT_FROM_ARRAY: u32 = 0x0000_0076;
    pub const DICT_MERGE: u32 = 0x0000_0077;
    pub const SETUP_ANNOTATIONS: u32 = 0x0000_0078;
    pub const SET_DEFAULTS: u32 = 0x0000_0079;
    pub const SET_KW_DEFAULTS: u32 = 0x0000_007A;
    pub const SET_ANNOTATIONS: u32 = 0x0000_007B;
    pub const LOAD_ASSERTION_ERROR: u32 = 0x0000_007C;
    pub const CELL_CLEAR: u32 = 0x0000_007D;
    pub const FLOAT_TO_DOUBLE: u32 = 0x0000_007E;
    pub const TAGGED_ADD: u32 = 0x0000_0080;
    pub const TAGGED_SUB: u32 = 0x0000_0081;
    pub const TAGGED_MUL: u32 = 0x0000_0082;
    pub const TAGGED_LSHIFT: u32 = 0x0000_0083;
    pub const TAGGED_POWER: u32 = 0x0000_0084;

    // Call shapes (0x0001_xxxx)
    pub const CALL_0: u32 = 0x0001_0000;
    pub const CALL_1: u32 = 0x0001_0001;
    pub const CALL_2: u32 = 0x0001_0002;
    pub const CALL_3: u32 = 0x0001_0003;
    pub const CALL_4: u32 = 0x0001_0004;
    pub const CALL_ARGS: u32 = 0x0001_000A;
    pub const CALL_KWARGS: u32 = 0x0001_000B;
    pub const CALL_N: u32 = 0x0001_01FF;
    pub const KWCALL_N: u32 = 0x0001_03FF;
    pub const LOAD_METHOD: u32 = 0x0001_0400;
    pub const METH_CALL_0: u32 = 0x0001_1000;
    pub const METH_CALL_1: u32 = 0x0001_1001;
    pub const METH_CALL_2: u32 = 0x0001_1002;
    pub const METH_CALL_3: u32 = 0x0001_1003;
    pub const METH_CALL_4: u32 = 0x0001_1004;
    pub const METH_CALL_N: u32 = 0x0001_1005;

    // Allocation & iteration (0x0002_xxxx)
    pub const TUPLE_FROM_ARRAY: u32 = 0x0002_0000;
    pub const LIST_FROM_ARRAY: u32 = 0x0002_0001;
    pub const SET_FROM_ARRAY: u32 = 0x0002_0003;
    pub const IS_TRUE: u32 = 0x0002_0005;
    pub const ITER_NEXT: u32 = 0x0002_0006;
    pub const CELL_GET: u32 = 0x0002_0007;
    pub const ERR_RESTORE: u32 = 0x0002_0008;
    pub const OBJECT_STR: u32 = 0x0002_0009;
    pub const OBJECT_REPR: u32 = 0x0002_000A;
    pub const OBJECT_ASCII: u32 = 0x0002_000B;
    pub const UNICODE_JOIN_ARRAY: u32 = 0x0002_000C;

    // Name resolution (0x0003_xxxx); the name-scope opcodes share these.
    pub const LOAD_GLOBAL: u32 = 0x0003_0000;
    pub const LOAD_ATTR: u32 = 0x0003_0001;
    pub const STORE_ATTR: u32 = 0x0003_0002;
    pub const DELETE_ATTR: u32 = 0x0003_0003;
    pub const STORE_GLOBAL: u32 = 0x0003_0004;
    pub const DELETE_GLOBAL: u32 = 0x0003_0005;

    // Float primitives (0x0005_xxxx)
    pub const FLOAT_POWER: u32 = 0x0005_0000;
    pub const FLOAT_FLOOR: u32 = 0x0005_0001;
    pub const FLOAT_MODULUS: u32 = 0x0005_0002;
}

/// One catalog entry.
pub struct Helper {
    pub id: u32,
    pub name: &'static str,
    /// Host function address; emitted calls land here.
    pub addr: usize,
    pub ret: IlType,
    pub params: &'static [IlType],
    /// Parameter positions the helper borrows instead of consuming.
    pub borrows: &'static [usize],
}

const P: IlType = IlType::Ptr;
const I4: IlType = IlType::I32;
const R8: IlType = IlType::F64;

const P1: &[IlType] = &[P];
const P2: &[IlType] = &[P, P];
const P3: &[IlType] = &[P, P, P];
const P4: &[IlType] = &[P, P, P, P];
const P5: &[IlType] = &[P, P, P, P, P];
const P6: &[IlType] = &[P, P, P, P, P, P];
const NONE: &[usize] = &[];

static CATALOG: Lazy<FxHashMap<u32, Helper>> = Lazy::new(|| {
    use crate::helpers::intrins as f;
    use crate::vm::exc;

    fn entry(
        table: &mut FxHashMap<u32, Helper>,
        id: u32,
        name: &'static str,
        addr: usize,
        ret: IlType,
        params: &'static [IlType],
        borrows: &'static [usize],
    ) {
        let prev = table.insert(
            id,
            Helper {
                id,
                name,
                addr,
                ret,
                params,
                borrows,
            },
        );
        debug_assert!(prev.is_none(), "duplicate helper id {:#x}", id);
    }

    let mut t = FxHashMap::default();
    let e = &mut t;

    // Object model
    entry(e, id::ADD, "add", f::add as usize, P, P2, NONE);
    entry(e, id::MULTIPLY, "multiply", f::multiply as usize, P, P2, NONE);
    entry(e, id::SUBTRACT, "subtract", f::subtract as usize, P, P2, NONE);
    entry(e, id::TRUE_DIVIDE, "true_divide", f::true_divide as usize, P, P2, NONE);
    entry(e, id::FLOOR_DIVIDE, "floor_divide", f::floor_divide as usize, P, P2, NONE);
    entry(e, id::POWER, "power", f::power as usize, P, P2, NONE);
    entry(e, id::MODULO, "modulo", f::modulo as usize, P, P2, NONE);
    entry(e, id::MATRIX_MULTIPLY, "matrix_multiply", f::matrix_multiply as usize, P, P2, NONE);
    entry(e, id::LSHIFT, "lshift", f::lshift as usize, P, P2, NONE);
    entry(e, id::RSHIFT, "rshift", f::rshift as usize, P, P2, NONE);
    entry(e, id::BIT_AND, "bit_and", f::bit_and as usize, P, P2, NONE);
    entry(e, id::BIT_XOR, "bit_xor", f::bit_xor as usize, P, P2, NONE);
    entry(e, id::BIT_OR, "bit_or", f::bit_or as usize, P, P2, NONE);
    entry(e, id::INPLACE_ADD, "inplace_add", f::inplace_add as usize, P, P2, NONE);
    entry(e, id::SUBSCR, "subscr", f::subscr as usize, P, P2, NONE);
    entry(e, id::STORE_SUBSCR, "store_subscr", f::store_subscr as usize, I4, P3, NONE);
    entry(e, id::DELETE_SUBSCR, "delete_subscr", f::delete_subscr as usize, I4, P2, NONE);
    entry(e, id::RICH_COMPARE, "rich_compare", f::rich_compare as usize, P, &[P, P, I4], NONE);
    entry(e, id::CONTAINS, "contains", f::contains as usize, P, P2, NONE);
    entry(e, id::NOT_CONTAINS, "not_contains", f::not_contains as usize, P, P2, NONE);
    entry(e, id::IS, "is", f::is_ as usize, P, P2, NONE);
    entry(e, id::IS_NOT, "is_not", f::is_not as usize, P, P2, NONE);
    entry(e, id::IS_BOOL, "is_bool", f::is_bool as usize, I4, P2, NONE);
    entry(e, id::IS_NOT_BOOL, "is_not_bool", f::is_not_bool as usize, I4, P2, NONE);
    entry(e, id::UNARY_POSITIVE, "unary_positive", f::unary_positive as usize, P, P1, NONE);
    entry(e, id::UNARY_NEGATIVE, "unary_negative", f::unary_negative as usize, P, P1, NONE);
    entry(e, id::UNARY_NOT, "unary_not", f::unary_not as usize, P, P1, NONE);
    entry(e, id::UNARY_NOT_INT, "unary_not_int", f::unary_not_i32 as usize, I4, P1, NONE);
    entry(e, id::UNARY_INVERT, "unary_invert", f::unary_invert as usize, P, P1, NONE);
    entry(e, id::IS_TRUE, "is_true", f::is_true as usize, I4, P1, &[0]);
    entry(e, id::DECREF, "decref", f::decref_value as usize, IlType::Void, P1, NONE);

    // Tagged-integer fast paths
    entry(e, id::TAGGED_ADD, "tagged_add", f::tagged_add as usize, P, P2, NONE);
    entry(e, id::TAGGED_SUB, "tagged_sub", f::tagged_sub as usize, P, P2, NONE);
    entry(e, id::TAGGED_MUL, "tagged_mul", f::tagged_mul as usize, P, P2, NONE);
    entry(e, id::TAGGED_LSHIFT, "tagged_lshift", f::tagged_lshift as usize, P, P2, NONE);
    entry(e, id::TAGGED_POWER, "tagged_power", f::tagged_power as usize, P, P2, NONE);
    entry(e, id::TAGGED_EQ, "tagged_eq", f::tagged_eq as usize, I4, P2, NONE);
    entry(e, id::TAGGED_NE, "tagged_ne", f::tagged_ne as usize, I4, P2, NONE);
    entry(e, id::TAGGED_LT, "tagged_lt", f::tagged_lt as usize, I4, P2, NONE);
    entry(e, id::TAGGED_LE, "tagged_le", f::tagged_le as usize, I4, P2, NONE);
    entry(e, id::TAGGED_GT, "tagged_gt", f::tagged_gt as usize, I4, P2, NONE);
    entry(e, id::TAGGED_GE, "tagged_ge", f::tagged_ge as usize, I4, P2, NONE);

    // Conversions
    entry(e, id::FLOAT_FROM_DOUBLE, "float_from_double", f::float_from_double as usize, P, &[R8], NONE);
    entry(e, id::BOOL_FROM_I32, "bool_from_i32", f::bool_from_i32 as usize, P, &[I4], NONE);
    entry(e, id::INT_TO_FLOAT, "int_to_double", f::int_to_double as usize, R8, P1, NONE);
    entry(e, id::FLOAT_TO_DOUBLE, "float_to_double", f::float_to_double as usize, R8, P1, NONE);

    // Float primitives
    entry(e, id::FLOAT_POWER, "float_power", f::float_power as usize, R8, &[R8, R8], NONE);
    entry(e, id::FLOAT_FLOOR, "float_floor", f::float_floor as usize, R8, &[R8], NONE);
    entry(e, id::FLOAT_MODULUS, "float_modulus", f::float_modulus as usize, R8, &[R8, R8], NONE);
    entry(e, id::FLOAT_ZERO_DIVISION, "raise_float_zero_division", f::raise_float_zero_division as usize, IlType::Void, &[], NONE);

    // Iteration
    entry(e, id::GET_ITER, "get_iter", f::get_iter as usize, P, P1, NONE);
    entry(e, id::ITER_NEXT, "iter_next", f::iter_next as usize, P, P1, &[0]);

    // Containers
    entry(e, id::TUPLE_FROM_ARRAY, "tuple_from_array", f::tuple_from_array as usize, P, &[P, I4], NONE);
    entry(e, id::LIST_FROM_ARRAY, "list_from_array", f::list_from_array as usize, P, &[P, I4], NONE);
    entry(e, id::SET_FROM_ARRAY, "set_from_array", f::set_from_array as usize, P, &[P, I4], NONE);
    entry(e, id::DICT_FROM_ARRAY, "dict_from_array", f::dict_from_array as usize, P, &[P, I4], NONE);
    entry(e, id::UNICODE_JOIN_ARRAY, "unicode_join_array", f::unicode_join_array as usize, P, &[P, I4], NONE);
    entry(e, id::LIST_APPEND, "list_append", f::list_append as usize, P, P2, NONE);
    entry(e, id::SET_ADD, "set_add", f::set_add as usize, P, P2, NONE);
    entry(e, id::MAP_ADD, "map_add", f::map_add as usize, P, P3, NONE);
    entry(e, id::LIST_EXTEND, "list_extend", f::list_extend as usize, P, P2, NONE);
    entry(e, id::SET_UPDATE, "set_update", f::set_update as usize, P, P2, NONE);
    entry(e, id::DICT_UPDATE, "dict_update", f::dict_update as usize, P, P2, NONE);
    entry(e, id::DICT_MERGE, "dict_merge", f::dict_merge as usize, P, P2, NONE);
    entry(e, id::LIST_TO_TUPLE, "list_to_tuple", f::list_to_tuple as usize, P, P1, NONE);
    entry(e, id::BUILD_SLICE, "build_slice", f::build_slice as usize, P, P3, NONE);
    entry(e, id::UNPACK_SEQUENCE, "unpack_sequence", f::unpack_sequence as usize, I4, &[P, I4, P], NONE);
    entry(e, id::UNPACK_EX, "unpack_ex", f::unpack_ex as usize, I4, &[P, I4, I4, P], NONE);

    // Name resolution
    entry(e, id::LOAD_GLOBAL, "load_global", f::load_global as usize, P, P2, NONE);
    entry(e, id::STORE_GLOBAL, "store_global", f::store_global as usize, I4, P3, NONE);
    entry(e, id::DELETE_GLOBAL, "delete_global", f::delete_global as usize, I4, P2, NONE);
    entry(e, id::LOAD_ATTR, "load_attr", f::load_attr as usize, P, P2, NONE);
    entry(e, id::STORE_ATTR, "store_attr", f::store_attr as usize, I4, P3, NONE);
    entry(e, id::DELETE_ATTR, "delete_attr", f::delete_attr as usize, I4, P2, NONE);
    entry(e, id::CELL_GET, "cell_get", f::cell_get as usize, P, &[P, I4], NONE);
    entry(e, id::CELL_SET, "cell_set", f::cell_set as usize, IlType::Void, &[P, P, I4], NONE);
    entry(e, id::CELL_CLEAR, "cell_clear", f::cell_clear as usize, I4, &[P, I4], NONE);
    entry(e, id::LOAD_CLASSDEREF, "load_classderef", f::load_classderef as usize, P, &[P, I4], NONE);

    // Calls
    entry(e, id::CALL_0, "call0", f::call0 as usize, P, P1, NONE);
    entry(e, id::CALL_1, "call1", f::call1 as usize, P, P2, NONE);
    entry(e, id::CALL_2, "call2", f::call2 as usize, P, P3, NONE);
    entry(e, id::CALL_3, "call3", f::call3 as usize, P, P4, NONE);
    entry(e, id::CALL_4, "call4", f::call4 as usize, P, P5, NONE);
    entry(e, id::CALL_N, "call_n", f::call_n as usize, P, P2, NONE);
    entry(e, id::KWCALL_N, "kwcall_n", f::kwcall_n as usize, P, P3, NONE);
    entry(e, id::CALL_ARGS, "call_args", f::call_args as usize, P, P2, NONE);
    entry(e, id::CALL_KWARGS, "call_kwargs", f::call_kwargs as usize, P, P3, NONE);
    entry(e, id::LOAD_METHOD, "load_method", f::load_method as usize, P, P2, NONE);
    entry(e, id::METH_CALL_0, "meth_call0", f::meth_call0 as usize, P, P1, NONE);
    entry(e, id::METH_CALL_1, "meth_call1", f::meth_call1 as usize, P, P2, NONE);
    entry(e, id::METH_CALL_2, "meth_call2", f::meth_call2 as usize, P, P3, NONE);
    entry(e, id::METH_CALL_3, "meth_call3", f::meth_call3 as usize, P, P4, NONE);
    entry(e, id::METH_CALL_4, "meth_call4", f::meth_call4 as usize, P, P5, NONE);
    entry(e, id::METH_CALL_N, "meth_call_n", f::meth_call_n as usize, P, P2, NONE);

    // Function construction
    entry(e, id::NEW_FUNCTION, "new_function", f::new_function as usize, P, P3, NONE);
    entry(e, id::SET_CLOSURE, "set_closure", f::set_closure as usize, P, P2, NONE);
    entry(e, id::SET_DEFAULTS, "set_defaults", f::set_defaults as usize, P, P2, NONE);
    entry(e, id::SET_KW_DEFAULTS, "set_kw_defaults", f::set_kw_defaults as usize, P, P2, NONE);
    entry(e, id::SET_ANNOTATIONS, "set_annotations", f::set_annotations as usize, P, P2, NONE);
    entry(e, id::LOAD_BUILD_CLASS, "load_build_class", f::load_build_class as usize, P, P1, NONE);
    entry(e, id::SETUP_ANNOTATIONS, "setup_annotations", f::setup_annotations as usize, I4, P1, NONE);
    entry(e, id::LOAD_ASSERTION_ERROR, "load_assertion_error", f::load_assertion_error as usize, P, &[], NONE);

    // Exceptions
    entry(e, id::PREPARE_EXCEPTION, "prepare_exception", f::prepare_exception as usize, IlType::Void, P6, NONE);
    entry(e, id::UNWIND_EXCEPTION, "unwind_exception", f::unwind_exception as usize, IlType::Void, P3, NONE);
    entry(e, id::DO_RAISE, "do_raise", f::do_raise as usize, I4, P2, NONE);
    entry(e, id::COMPARE_EXCEPTIONS, "compare_exceptions", f::compare_exceptions as usize, P, P2, NONE);
    entry(e, id::ERR_RESTORE, "err_restore", f::err_restore as usize, IlType::Void, P3, NONE);
    entry(e, id::UNBOUND_LOCAL, "unbound_local", f::unbound_local as usize, IlType::Void, P1, NONE);

    // Frame bookkeeping & scheduling
    entry(e, id::PUSH_FRAME, "push_frame", f::push_frame as usize, IlType::Void, P1, NONE);
    entry(e, id::POP_FRAME, "pop_frame", f::pop_frame as usize, IlType::Void, P1, NONE);
    entry(e, id::PERIODIC_WORK, "periodic_work", exc::periodic_work as usize, I4, &[], NONE);

    // Formatting
    entry(e, id::FORMAT_VALUE, "format_value", f::format_value as usize, P, P1, NONE);
    entry(e, id::FORMAT_OBJECT, "format_object", f::format_object as usize, P, P2, NONE);
    entry(e, id::OBJECT_STR, "object_str", f::object_str as usize, P, P1, NONE);
    entry(e, id::OBJECT_REPR, "object_repr", f::object_repr as usize, P, P1, NONE);
    entry(e, id::OBJECT_ASCII, "object_ascii", f::object_ascii as usize, P, P1, NONE);

    // Imports
    entry(e, id::IMPORT_NAME, "import_name", f::import_name as usize, P, P4, NONE);
    entry(e, id::IMPORT_FROM, "import_from", f::import_from as usize, P, P2, &[0]);
    entry(e, id::IMPORT_STAR, "import_star", f::import_star as usize, I4, P2, NONE);

    // Diagnostics
    entry(e, id::DEBUG_TRACE, "debug_trace", f::debug_trace as usize, IlType::Void, P1, NONE);

    t
});

/// Look up a catalog entry.
pub fn lookup(helper_id: u32) -> Option<&'static Helper> {
    CATALOG.get(&helper_id)
}

/// Whether the helper pushes a result (anything but void).
pub fn returns_value(helper_id: u32) -> bool {
    lookup(helper_id).map(|h| h.ret != IlType::Void).unwrap_or(true)
}

/// Host address for a helper id (backends resolve calls through this).
pub fn address(helper_id: u32) -> Option<usize> {
    lookup(helper_id).map(|h| h.addr)
}

/// Number of parameters a helper pops.
pub fn param_count(helper_id: u32) -> Option<usize> {
    lookup(helper_id).map(|h| h.params.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_basics() {
        let h = lookup(id::ADD).unwrap();
        assert_eq!(h.name, "add");
        assert_eq!(h.params.len(), 2);
        assert_eq!(h.ret, IlType::Ptr);
        assert_ne!(h.addr, 0);
    }

    #[test]
    fn test_void_helpers_report_no_result() {
        assert!(!returns_value(id::DECREF));
        assert!(!returns_value(id::PUSH_FRAME));
        assert!(returns_value(id::ADD));
        assert!(returns_value(id::PERIODIC_WORK));
    }

    #[test]
    fn test_borrow_annotations() {
        assert_eq!(lookup(id::ITER_NEXT).unwrap().borrows, &[0]);
        assert_eq!(lookup(id::IS_TRUE).unwrap().borrows, &[0]);
        assert!(lookup(id::ADD).unwrap().borrows.is_empty());
    }

    #[test]
    fn test_call_shape_arities() {
        assert_eq!(param_count(id::CALL_0), Some(1));
        assert_eq!(param_count(id::CALL_4), Some(5));
        assert_eq!(param_count(id::METH_CALL_2), Some(3));
        assert_eq!(param_count(id::PREPARE_EXCEPTION), Some(6));
    }

    #[test]
    fn test_unknown_id() {
        assert!(lookup(0xDEAD_BEEF).is_none());
    }
}
