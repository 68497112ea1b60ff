// Copyright 2020 Joyent, Inc.

//! Capability bitmask handling. A client advertises the operations it is
//! prepared to request in the low byte of the handshake `exec_functions`
//! field; the server authorises each submission against that bitmask.

use crate::protocol::{MathOp, OpArgs, StrOp};

pub const CAP_ADD: u8 = 1 << 0;
pub const CAP_SUB: u8 = 1 << 1;
pub const CAP_MULT: u8 = 1 << 2;
pub const CAP_DIV: u8 = 1 << 3;
pub const CAP_CONCAT: u8 = 1 << 4;
pub const CAP_FIND_START: u8 = 1 << 5;

/// All six meaningful capability bits.
pub const CAP_ALL: u8 =
    CAP_ADD | CAP_SUB | CAP_MULT | CAP_DIV | CAP_CONCAT | CAP_FIND_START;

/// Returns true if the given bitmask is a valid capability advertisement:
/// non-zero and no bits outside the six defined flags.
pub fn verify_exec_caps(exec_fun_flags: u8) -> bool {
    exec_fun_flags & !CAP_ALL == 0 && exec_fun_flags > 0
}

/// The single capability flag a submission of the given operation requires.
pub fn required_cap(op: &OpArgs) -> u8 {
    match op {
        OpArgs::Math(math) => match math.op {
            MathOp::Add => CAP_ADD,
            MathOp::Sub => CAP_SUB,
            MathOp::Mul => CAP_MULT,
            MathOp::Div => CAP_DIV,
        },
        OpArgs::Str(s) => match s.op {
            StrOp::Concat => CAP_CONCAT,
            StrOp::FindStart => CAP_FIND_START,
        },
    }
}

/// Look up a capability flag by its user-facing name. Used by the client
/// binary to parse a `--caps` list.
pub fn cap_by_name(name: &str) -> Option<u8> {
    match name.to_ascii_lowercase().as_str() {
        "add" => Some(CAP_ADD),
        "sub" => Some(CAP_SUB),
        "mult" | "mul" => Some(CAP_MULT),
        "div" => Some(CAP_DIV),
        "concat" => Some(CAP_CONCAT),
        "find" | "find_start" => Some(CAP_FIND_START),
        _ => None,
    }
}
