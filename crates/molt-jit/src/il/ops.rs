//! IL opcode bytes
//!
//! The typed stack IL the emitter produces and the backend consumes. One
//! byte per opcode; operand widths are fixed per opcode (see the table in
//! `display::operand_width`).

pub const NOP: u8 = 0x00;
/// Debugger trap.
pub const BREAK: u8 = 0x01;
pub const POP: u8 = 0x02;
pub const DUP: u8 = 0x03;
/// Return; operand stack must hold exactly the returned values.
pub const RET: u8 = 0x04;

/// Load 32-bit integer constant (operand: i32).
pub const LDC_I4: u8 = 0x10;
/// Load 64-bit integer constant (operand: i64).
pub const LDC_I8: u8 = 0x11;
/// Load float constant (operand: f64 bits).
pub const LDC_R8: u8 = 0x12;
/// Load pointer constant (operand: 8 bytes).
pub const LDC_PTR: u8 = 0x13;
/// Load null pointer.
pub const LDNULL: u8 = 0x14;

pub const ADD: u8 = 0x18;
pub const SUB: u8 = 0x19;
pub const MUL: u8 = 0x1A;
pub const DIV: u8 = 0x1B;
pub const REM: u8 = 0x1C;
pub const NEG: u8 = 0x1D;
pub const AND: u8 = 0x1E;

/// Compare equal, push i32 0/1.
pub const CEQ: u8 = 0x20;
pub const CLT: u8 = 0x21;
pub const CGT: u8 = 0x22;
/// Unordered variants (NaN-aware float compares).
pub const CLT_UN: u8 = 0x23;
pub const CGT_UN: u8 = 0x24;

/// Load local (operand: u16 slot).
pub const LDLOC: u8 = 0x28;
pub const STLOC: u8 = 0x29;
/// Load address of local (operand: u16 slot).
pub const LDLOCA: u8 = 0x2A;
/// Load argument (operand: u16 index).
pub const LDARG: u8 = 0x2B;

pub const LDIND_PTR: u8 = 0x30;
pub const LDIND_I4: u8 = 0x31;
pub const LDIND_R8: u8 = 0x32;
pub const STIND_PTR: u8 = 0x33;
pub const STIND_I4: u8 = 0x34;
pub const STIND_R8: u8 = 0x35;

// Branches. Long forms carry a 4-byte little-endian displacement relative
// to the end of the 5-byte instruction; short forms carry one signed byte
// relative to the end of the 2-byte instruction.
pub const BR: u8 = 0x40;
pub const BRTRUE: u8 = 0x41;
pub const BRFALSE: u8 = 0x42;
pub const BEQ: u8 = 0x43;
pub const BNE: u8 = 0x44;
pub const BLE: u8 = 0x45;
/// Exception-context-aware leave.
pub const LEAVE: u8 = 0x46;

pub const BR_S: u8 = 0x48;
pub const BRTRUE_S: u8 = 0x49;
pub const BRFALSE_S: u8 = 0x4A;
pub const BEQ_S: u8 = 0x4B;
pub const BNE_S: u8 = 0x4C;
pub const BLE_S: u8 = 0x4D;
pub const LEAVE_S: u8 = 0x4E;

/// Call a runtime helper (operand: u32 helper id).
pub const CALL: u8 = 0x50;

/// Allocate a pointer array (operand: u32 length), push its address.
pub const NEWARR: u8 = 0x58;
/// Store into a pointer array: ..., base, index, value -> ...
pub const STELEM: u8 = 0x59;
/// Load from a pointer array: ..., base -> ..., value (operand: u32 index).
pub const LDELEM_PTR: u8 = 0x5A;
/// Load a float element: ..., base -> ..., value (operand: u32 index).
pub const LDELEM_R8: u8 = 0x5B;
/// Pop a byte size, push a pointer to fresh stack scratch space.
pub const ALLOCA: u8 = 0x5C;
