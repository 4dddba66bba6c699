//! GDB register-index transcoding for the two guest register file shapes.
//!
//! The debugger addresses registers by a flat index whose meaning depends on
//! the thread's execution mode; these tables map each index onto the
//! [`ExecutionContext`] field it names. Values travel as fixed-width
//! little-endian hex.

use crate::guest::ExecutionContext;
use crate::proto::scan::TextScanner;
use crate::proto::wire::to_hex;

pub const AARCH64_REGISTER_COUNT: u64 = 68;
pub const AARCH32_REGISTER_COUNT: u64 = 66;

/// Valid FPCR bits. FPSR and FPCR occupy disjoint bit ranges, so the
/// AArch32 combined FPSCR view splits a written word with this mask and
/// reassembles reads with an OR.
pub const FPCR_MASK: u32 = 0xfc1f_ffff;

/// Registers in the guest thread's current mode.
pub fn register_count(context: &dyn ExecutionContext) -> u64 {
    if context.is_aarch32() {
        AARCH32_REGISTER_COUNT
    } else {
        AARCH64_REGISTER_COUNT
    }
}

/// Fixed-width hex rendering of one register, `None` when the index is not
/// part of the mode's table.
pub fn read_register(context: &dyn ExecutionContext, index: u64) -> Option<String> {
    if context.is_aarch32() {
        read_register_aarch32(context, index)
    } else {
        read_register_aarch64(context, index)
    }
}

/// Consumes one fixed-width value from the command text and stores it.
/// False when the index is out of range or the field is malformed.
pub fn write_register(context: &dyn ExecutionContext, index: u64, ss: &mut TextScanner) -> bool {
    if context.is_aarch32() {
        write_register_aarch32(context, index, ss)
    } else {
        write_register_aarch64(context, index, ss)
    }
}

fn read_register_aarch64(context: &dyn ExecutionContext, index: u64) -> Option<String> {
    match index {
        0..=31 => Some(to_hex(&context.x(index as usize).to_le_bytes())),
        32 => Some(to_hex(&context.pc().to_le_bytes())),
        33 => Some(to_hex(&context.pstate().to_le_bytes())),
        34..=65 => Some(to_hex(&context.v(index as usize - 34).to_le_bytes())),
        66 => Some(to_hex(&context.fpsr().to_le_bytes())),
        67 => Some(to_hex(&context.fpcr().to_le_bytes())),
        _ => None,
    }
}

fn write_register_aarch64(context: &dyn ExecutionContext, index: u64, ss: &mut TextScanner) -> bool {
    match index {
        0..=31 => match ss.read_length_as_le_hex(16) {
            Ok(value) => {
                context.set_x(index as usize, value);
                true
            }
            Err(_) => false,
        },
        32 => match ss.read_length_as_le_hex(16) {
            Ok(value) => {
                context.set_pc(value);
                true
            }
            Err(_) => false,
        },
        33 => match ss.read_length_as_le_hex(8) {
            Ok(value) => {
                context.set_pstate(value as u32);
                true
            }
            Err(_) => false,
        },
        34..=65 => match read_v128(ss) {
            Some(value) => {
                context.set_v(index as usize - 34, value);
                true
            }
            None => false,
        },
        66 => match ss.read_length_as_le_hex(8) {
            Ok(value) => {
                context.set_fpsr(value as u32);
                true
            }
            Err(_) => false,
        },
        67 => match ss.read_length_as_le_hex(8) {
            Ok(value) => {
                context.set_fpcr(value as u32);
                true
            }
            Err(_) => false,
        },
        _ => false,
    }
}

fn read_register_aarch32(context: &dyn ExecutionContext, index: u64) -> Option<String> {
    match index {
        0..=14 => Some(to_hex(&(context.x(index as usize) as u32).to_le_bytes())),
        15 => Some(to_hex(&(context.pc() as u32).to_le_bytes())),
        16 => Some(to_hex(&context.pstate().to_le_bytes())),
        // Q registers, read as full 128 bits even in AArch32.
        17..=32 => Some(to_hex(&context.v(index as usize - 17).to_le_bytes())),
        // D registers: 64-bit halves of the same Q registers, two per Q.
        33..=64 => {
            let reg = index as usize - 33;
            let half = ((context.v(reg / 2) >> (64 * (reg % 2) as u32)) as u64).to_le_bytes();
            Some(to_hex(&half))
        }
        65 => {
            let fpscr = context.fpsr() | context.fpcr();
            Some(to_hex(&fpscr.to_le_bytes()))
        }
        _ => None,
    }
}

fn write_register_aarch32(context: &dyn ExecutionContext, index: u64, ss: &mut TextScanner) -> bool {
    match index {
        0..=14 => match ss.read_length_as_le_hex(8) {
            Ok(value) => {
                context.set_x(index as usize, value);
                true
            }
            Err(_) => false,
        },
        15 => match ss.read_length_as_le_hex(8) {
            Ok(value) => {
                context.set_pc(value);
                true
            }
            Err(_) => false,
        },
        16 => match ss.read_length_as_le_hex(8) {
            Ok(value) => {
                context.set_pstate(value as u32);
                true
            }
            Err(_) => false,
        },
        17..=32 => match read_v128(ss) {
            Some(value) => {
                context.set_v(index as usize - 17, value);
                true
            }
            None => false,
        },
        33..=64 => match ss.read_length_as_le_hex(16) {
            Ok(value) => {
                let reg = index as usize - 33;
                let shift = 64 * (reg % 2) as u32;
                let keep = !((u64::MAX as u128) << shift);
                let merged = (context.v(reg / 2) & keep) | ((value as u128) << shift);
                context.set_v(reg / 2, merged);
                true
            }
            Err(_) => false,
        },
        65 => match ss.read_length_as_le_hex(8) {
            Ok(value) => {
                let value = value as u32;
                context.set_fpcr(value & FPCR_MASK);
                context.set_fpsr(value & !FPCR_MASK);
                true
            }
            Err(_) => false,
        },
        _ => false,
    }
}

fn read_v128(ss: &mut TextScanner) -> Option<u128> {
    let low = ss.read_length_as_le_hex(16).ok()?;
    let high = ss.read_length_as_le_hex(16).ok()?;
    Some(low as u128 | ((high as u128) << 64))
}
