//! Host VM model: values, code objects, frames, and exception state
//!
//! The JIT compiles against these contracts. The value representation and
//! the frame layout are ABI for emitted code; everything else is the
//! minimal host surface the compiler, the runtime helpers, and the tests
//! need.

pub mod code;
pub mod exc;
pub mod frame;
pub mod opcode;
pub mod value;

pub use self::code::{CodeBuilder, CodeFlags, CodeId, CodeObject};
pub use self::frame::{pop_frame, push_frame, Frame};
pub use self::opcode::{decode, CompareKind, DecodeError, Instr, Opcode};
pub use self::value::{
    alloc, bool_value, dict_get, dict_get_str, dict_remove, dict_set, exc_type_object, new_bytes,
    new_dict, new_exception, new_float, new_list, new_str, new_tuple, none_value, type_object,
    value_is_true, value_repr, value_str, values_equal, ExcKind, NativeFn, Payload, TypeKind,
    ValueRef, TAGGED_MAX, TAGGED_MIN,
};
