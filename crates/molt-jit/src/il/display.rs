//! IL disassembler
//!
//! Renders a serialized IL stream as one instruction per line, used by
//! `dump_il` consumers and the emission tests.

use crate::il::ops;

fn mnemonic(op: u8) -> &'static str {
    match op {
        ops::NOP => "nop",
        ops::BREAK => "break",
        ops::POP => "pop",
        ops::DUP => "dup",
        ops::RET => "ret",
        ops::LDC_I4 => "ldc.i4",
        ops::LDC_I8 => "ldc.i8",
        ops::LDC_R8 => "ldc.r8",
        ops::LDC_PTR => "ldc.ptr",
        ops::LDNULL => "ldnull",
        ops::ADD => "add",
        ops::SUB => "sub",
        ops::MUL => "mul",
        ops::DIV => "div",
        ops::REM => "rem",
        ops::NEG => "neg",
        ops::AND => "and",
        ops::CEQ => "ceq",
        ops::CLT => "clt",
        ops::CGT => "cgt",
        ops::CLT_UN => "clt.un",
        ops::CGT_UN => "cgt.un",
        ops::LDLOC => "ldloc",
        ops::STLOC => "stloc",
        ops::LDLOCA => "ldloca",
        ops::LDARG => "ldarg",
        ops::LDIND_PTR => "ldind.ptr",
        ops::LDIND_I4 => "ldind.i4",
        ops::LDIND_R8 => "ldind.r8",
        ops::STIND_PTR => "stind.ptr",
        ops::STIND_I4 => "stind.i4",
        ops::STIND_R8 => "stind.r8",
        ops::BR => "br",
        ops::BRTRUE => "brtrue",
        ops::BRFALSE => "brfalse",
        ops::BEQ => "beq",
        ops::BNE => "bne",
        ops::BLE => "ble",
        ops::LEAVE => "leave",
        ops::BR_S => "br.s",
        ops::BRTRUE_S => "brtrue.s",
        ops::BRFALSE_S => "brfalse.s",
        ops::BEQ_S => "beq.s",
        ops::BNE_S => "bne.s",
        ops::BLE_S => "ble.s",
        ops::LEAVE_S => "leave.s",
        ops::CALL => "call",
        ops::NEWARR => "newarr",
        ops::STELEM => "stelem",
        ops::LDELEM_PTR => "ldelem.ptr",
        ops::LDELEM_R8 => "ldelem.r8",
        ops::ALLOCA => "alloca",
        _ => "??",
    }
}

/// Bytes of operand following an opcode byte.
pub fn operand_width(op: u8) -> usize {
    match op {
        ops::LDC_I4 | ops::CALL | ops::NEWARR | ops::LDELEM_PTR | ops::LDELEM_R8 => 4,
        ops::LDC_I8 | ops::LDC_R8 | ops::LDC_PTR => 8,
        ops::LDLOC | ops::STLOC | ops::LDLOCA | ops::LDARG => 2,
        ops::BR | ops::BRTRUE | ops::BRFALSE | ops::BEQ | ops::BNE | ops::BLE | ops::LEAVE => 4,
        ops::BR_S | ops::BRTRUE_S | ops::BRFALSE_S | ops::BEQ_S | ops::BNE_S | ops::BLE_S
        | ops::LEAVE_S => 1,
        _ => 0,
    }
}

fn read_u32(il: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(il[at..at + 4].try_into().unwrap())
}

/// Render the IL stream. Truncated trailing operands render as `<trunc>`.
pub fn disassemble(il: &[u8]) -> String {
    let mut out = String::new();
    let mut pos = 0;
    while pos < il.len() {
        let op = il[pos];
        let width = operand_width(op);
        if pos + 1 + width > il.len() {
            out.push_str(&format!("{:05}: {} <trunc>\n", pos, mnemonic(op)));
            break;
        }
        let operand = match width {
            0 => String::new(),
            1 => format!(" {}", il[pos + 1] as i8),
            2 => format!(
                " {}",
                u16::from_le_bytes(il[pos + 1..pos + 3].try_into().unwrap())
            ),
            4 => {
                if op == ops::LDC_I4 {
                    format!(" {}", read_u32(il, pos + 1) as i32)
                } else if op == ops::CALL {
                    format!(" helper:{:#x}", read_u32(il, pos + 1))
                } else if matches!(
                    op,
                    ops::BR | ops::BRTRUE | ops::BRFALSE | ops::BEQ | ops::BNE | ops::BLE
                        | ops::LEAVE
                ) {
                    format!(" {:+}", read_u32(il, pos + 1) as i32)
                } else {
                    format!(" {}", read_u32(il, pos + 1))
                }
            }
            8 => {
                let bits = u64::from_le_bytes(il[pos + 1..pos + 9].try_into().unwrap());
                if op == ops::LDC_R8 {
                    format!(" {}", f64::from_bits(bits))
                } else {
                    format!(" {:#x}", bits)
                }
            }
            _ => unreachable!(),
        };
        out.push_str(&format!("{:05}: {}{}\n", pos, mnemonic(op), operand));
        pos += 1 + width;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{IlEmitter, IlType, MethodSig};

    #[test]
    fn test_disassemble_constants_and_call() {
        let mut il = IlEmitter::new(MethodSig {
            ret: IlType::Ptr,
            params: vec![IlType::Ptr],
        });
        il.ld_i4(-3);
        il.ld_r8(1.5);
        il.pop();
        il.pop();
        let text = disassemble(il.il());
        assert!(text.contains("ldc.i4 -3"));
        assert!(text.contains("ldc.r8 1.5"));
        assert!(text.contains("pop"));
    }

    #[test]
    fn test_disassemble_truncated() {
        let text = disassemble(&[ops::LDC_I4, 0x01]);
        assert!(text.contains("<trunc>"));
    }
}
