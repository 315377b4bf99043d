//! Fixnum/float arithmetic with overflow detection.
//!
//! Fixnum operations use checked arithmetic; overflow promotes the result to
//! float rather than wrapping. Mixed fixnum/float operands widen to float.
//! Anything non-numeric is the dispatcher's problem, not ours.

use crate::value::{Float, Int, Value};

/// Binary arithmetic operators with inline fast paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
}

impl ArithOp {
    pub fn name(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
        }
    }

    fn checked(self, x: Int, y: Int) -> Option<Int> {
        match self {
            ArithOp::Add => x.checked_add(y),
            ArithOp::Sub => x.checked_sub(y),
            ArithOp::Mul => x.checked_mul(y),
        }
    }

    fn float(self, x: Float, y: Float) -> Float {
        match self {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
        }
    }
}

/// Numeric fast path for `ADD`/`SUB`/`MUL`. `None` means "not numeric,
/// dispatch the operator as a method instead".
pub fn arith(op: ArithOp, x: Value, y: Value) -> Option<Value> {
    match (x, y) {
        (Value::Fixnum(a), Value::Fixnum(b)) => Some(match op.checked(a, b) {
            Some(z) => Value::Fixnum(z),
            // overflow promotes to float
            None => Value::Float(op.float(a as Float, b as Float)),
        }),
        (Value::Fixnum(a), Value::Float(b)) => Some(Value::Float(op.float(a as Float, b))),
        (Value::Float(a), Value::Fixnum(b)) => Some(Value::Float(op.float(a, b as Float))),
        (Value::Float(a), Value::Float(b)) => Some(Value::Float(op.float(a, b))),
        _ => None,
    }
}

/// Numeric fast path for `DIV`: always produces a float, with IEEE edges for
/// division by zero.
pub fn div(x: Value, y: Value) -> Option<Value> {
    let (a, b) = match (x, y) {
        (Value::Fixnum(a), Value::Fixnum(b)) => (a as Float, b as Float),
        (Value::Fixnum(a), Value::Float(b)) => (a as Float, b),
        (Value::Float(a), Value::Fixnum(b)) => (a, b as Float),
        (Value::Float(a), Value::Float(b)) => (a, b),
        _ => return None,
    };
    let f = if b == 0.0 {
        if a > 0.0 {
            Float::INFINITY
        } else if a < 0.0 {
            Float::NEG_INFINITY
        } else {
            Float::NAN
        }
    } else {
        a / b
    };
    Some(Value::Float(f))
}

/// Comparison operators with inline fast paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl CmpOp {
    pub fn name(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
        }
    }
}

/// Numeric comparison fast path. `None` means non-numeric operands
/// (dispatch the operator); NaN comparisons are simply false.
pub fn compare(op: CmpOp, x: Value, y: Value) -> Option<bool> {
    use std::cmp::Ordering;
    let both_numeric = matches!(x, Value::Fixnum(_) | Value::Float(_))
        && matches!(y, Value::Fixnum(_) | Value::Float(_));
    if !both_numeric {
        return None;
    }
    Some(match cmp(x, y) {
        Some(ord) => match op {
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
            CmpOp::Eq => ord == Ordering::Equal,
        },
        // NaN involved
        None => false,
    })
}

/// Numeric comparison fast path for `LT`/`LE`/`GT`/`GE`/`EQ`. `None` means
/// non-numeric operands.
pub fn cmp(x: Value, y: Value) -> Option<std::cmp::Ordering> {
    let (a, b) = match (x, y) {
        (Value::Fixnum(a), Value::Fixnum(b)) => return Some(a.cmp(&b)),
        (Value::Fixnum(a), Value::Float(b)) => (a as Float, b),
        (Value::Float(a), Value::Fixnum(b)) => (a, b as Float),
        (Value::Float(a), Value::Float(b)) => (a, b),
        _ => return None,
    };
    a.partial_cmp(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_fixnum_fast_path() {
        assert_eq!(
            arith(ArithOp::Add, Value::Fixnum(1), Value::Fixnum(2)),
            Some(Value::Fixnum(3))
        );
        assert_eq!(
            arith(ArithOp::Mul, Value::Fixnum(3), Value::Fixnum(3)),
            Some(Value::Fixnum(9))
        );
    }

    #[test]
    fn test_overflow_promotes_to_float() {
        let r = arith(ArithOp::Add, Value::Fixnum(Int::MAX), Value::Fixnum(1)).unwrap();
        match r {
            Value::Float(f) => assert_eq!(f, Int::MAX as Float + 1.0),
            other => panic!("expected float, got {other:?}"),
        }
        let r = arith(ArithOp::Mul, Value::Fixnum(Int::MAX), Value::Fixnum(2)).unwrap();
        assert!(matches!(r, Value::Float(_)));
    }

    #[test]
    fn test_mixed_widen() {
        assert_eq!(
            arith(ArithOp::Sub, Value::Fixnum(1), Value::Float(0.5)),
            Some(Value::Float(0.5))
        );
    }

    #[test]
    fn test_non_numeric_falls_through() {
        assert_eq!(arith(ArithOp::Add, Value::Nil, Value::Fixnum(1)), None);
        assert_eq!(div(Value::True, Value::Fixnum(1)), None);
        assert_eq!(cmp(Value::Nil, Value::Fixnum(1)), None);
    }

    #[test]
    fn test_div_by_zero_edges() {
        assert_eq!(
            div(Value::Fixnum(1), Value::Fixnum(0)),
            Some(Value::Float(Float::INFINITY))
        );
        assert_eq!(
            div(Value::Fixnum(-1), Value::Fixnum(0)),
            Some(Value::Float(Float::NEG_INFINITY))
        );
        match div(Value::Fixnum(0), Value::Fixnum(0)) {
            Some(Value::Float(f)) => assert!(f.is_nan()),
            other => panic!("expected NaN, got {other:?}"),
        }
        assert_eq!(
            div(Value::Fixnum(7), Value::Fixnum(2)),
            Some(Value::Float(3.5))
        );
    }

    #[test]
    fn test_cmp_matrix() {
        assert_eq!(cmp(Value::Fixnum(1), Value::Fixnum(2)), Some(Ordering::Less));
        assert_eq!(
            cmp(Value::Float(2.0), Value::Fixnum(2)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            cmp(Value::Fixnum(3), Value::Float(2.5)),
            Some(Ordering::Greater)
        );
        assert_eq!(cmp(Value::Float(Float::NAN), Value::Float(0.0)), None);
    }
}
