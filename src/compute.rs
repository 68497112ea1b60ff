// Copyright 2020 Joyent, Inc.

//! The compute kernels behind the six operations. All kernels are pure
//! functions, safe to invoke concurrently, and must not trap: integer
//! arithmetic wraps on overflow and division by zero is reported as an
//! error rather than a fault.

use crate::protocol::{MathArgs, MathOp, OpArgs, ResultValue, Status, StrArgs, StrOp};

/// Concatenation results longer than this many octets are rejected.
pub const MAX_CONCAT_LEN: usize = 32;

/// The validation failures a kernel can report. Anything else a kernel
/// could do wrong is a bug and surfaces as `ERROR_INTERNAL` at the worker.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ComputeError {
    DivByZero,
    StringTooLong,
    SubstrNotFound,
}

impl ComputeError {
    pub fn status(self) -> Status {
        match self {
            ComputeError::DivByZero => Status::ErrorDivByZero,
            ComputeError::StringTooLong => Status::ErrorStringTooLong,
            ComputeError::SubstrNotFound => Status::ErrorSubstrNotFound,
        }
    }
}

/// Run the kernel for the given operation.
pub fn execute(op: &OpArgs) -> Result<ResultValue, ComputeError> {
    match op {
        OpArgs::Math(math) => execute_math(math),
        OpArgs::Str(s) => execute_str(s),
    }
}

fn execute_math(args: &MathArgs) -> Result<ResultValue, ComputeError> {
    let value = match args.op {
        MathOp::Add => args.a.wrapping_add(args.b),
        MathOp::Sub => args.a.wrapping_sub(args.b),
        MathOp::Mul => args.a.wrapping_mul(args.b),
        MathOp::Div => {
            if args.b == 0 {
                return Err(ComputeError::DivByZero);
            }
            args.a.wrapping_div(args.b)
        }
    };
    Ok(ResultValue::IntResult(value))
}

fn execute_str(args: &StrArgs) -> Result<ResultValue, ComputeError> {
    match args.op {
        StrOp::Concat => {
            if args.s1.len() + args.s2.len() > MAX_CONCAT_LEN {
                return Err(ComputeError::StringTooLong);
            }
            let mut r = String::with_capacity(args.s1.len() + args.s2.len());
            r.push_str(&args.s1);
            r.push_str(&args.s2);
            Ok(ResultValue::StrResult(r))
        }
        StrOp::FindStart => match args.s1.find(&args.s2) {
            Some(pos) => Ok(ResultValue::Position(pos as i32)),
            None => Err(ComputeError::SubstrNotFound),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn math(op: MathOp, a: i32, b: i32) -> OpArgs {
        OpArgs::Math(MathArgs { op, a, b })
    }

    fn string(op: StrOp, s1: &str, s2: &str) -> OpArgs {
        OpArgs::Str(StrArgs {
            op,
            s1: String::from(s1),
            s2: String::from(s2),
        })
    }

    #[test]
    fn add_sub_mul() {
        assert_eq!(
            execute(&math(MathOp::Add, 40, 2)),
            Ok(ResultValue::IntResult(42))
        );
        assert_eq!(
            execute(&math(MathOp::Sub, 5, 8)),
            Ok(ResultValue::IntResult(-3))
        );
        assert_eq!(
            execute(&math(MathOp::Mul, -6, 7)),
            Ok(ResultValue::IntResult(-42))
        );
    }

    #[test]
    fn add_wraps_on_overflow() {
        assert_eq!(
            execute(&math(MathOp::Add, i32::MAX, 1)),
            Ok(ResultValue::IntResult(i32::MIN))
        );
        assert_eq!(
            execute(&math(MathOp::Sub, i32::MIN, 1)),
            Ok(ResultValue::IntResult(i32::MAX))
        );
        assert_eq!(
            execute(&math(MathOp::Mul, i32::MAX, 2)),
            Ok(ResultValue::IntResult(-2))
        );
    }

    #[test]
    fn div_truncates_toward_zero() {
        assert_eq!(
            execute(&math(MathOp::Div, 7, 2)),
            Ok(ResultValue::IntResult(3))
        );
        assert_eq!(
            execute(&math(MathOp::Div, -7, 2)),
            Ok(ResultValue::IntResult(-3))
        );
    }

    #[test]
    fn div_by_zero() {
        assert_eq!(
            execute(&math(MathOp::Div, 10, 0)),
            Err(ComputeError::DivByZero)
        );
    }

    #[test]
    fn div_min_by_minus_one_does_not_trap() {
        assert_eq!(
            execute(&math(MathOp::Div, i32::MIN, -1)),
            Ok(ResultValue::IntResult(i32::MIN))
        );
    }

    #[test]
    fn concat() {
        assert_eq!(
            execute(&string(StrOp::Concat, "hello", "world")),
            Ok(ResultValue::StrResult(String::from("helloworld")))
        );
    }

    #[test]
    fn concat_length_boundary() {
        let s16 = "a".repeat(16);
        assert_eq!(
            execute(&string(StrOp::Concat, &s16, &s16)),
            Ok(ResultValue::StrResult("a".repeat(32)))
        );

        let s17 = "a".repeat(17);
        assert_eq!(
            execute(&string(StrOp::Concat, &s16, &s17)),
            Err(ComputeError::StringTooLong)
        );
    }

    #[test]
    fn find_start() {
        assert_eq!(
            execute(&string(StrOp::FindStart, "abcdef", "cd")),
            Ok(ResultValue::Position(2))
        );
        assert_eq!(
            execute(&string(StrOp::FindStart, "abcdef", "zz")),
            Err(ComputeError::SubstrNotFound)
        );
    }

    #[test]
    fn find_start_empty_needle_is_position_zero() {
        assert_eq!(
            execute(&string(StrOp::FindStart, "abcdef", "")),
            Ok(ResultValue::Position(0))
        );
        assert_eq!(
            execute(&string(StrOp::FindStart, "", "")),
            Ok(ResultValue::Position(0))
        );
    }

    #[test]
    fn error_statuses() {
        assert_eq!(ComputeError::DivByZero.status(), Status::ErrorDivByZero);
        assert_eq!(
            ComputeError::StringTooLong.status(),
            Status::ErrorStringTooLong
        );
        assert_eq!(
            ComputeError::SubstrNotFound.status(),
            Status::ErrorSubstrNotFound
        );
    }
}
