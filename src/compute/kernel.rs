use crate::compute::ledger::Value;
use std::ops::{Add, Div, Mul, Sub};
use wide::f64x4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Add,
    Sub,
    Mul,
    Div,
}

#[inline(always)]
fn apply(op: OpCode, l: f64, r: f64) -> f64 {
    match op {
        OpCode::Add => l + r,
        OpCode::Sub => l - r,
        OpCode::Mul => l * r,
        OpCode::Div => l / r,
    }
}

/// Element-wise binary operation. Scalar-scalar stays scalar; otherwise the
/// result has the length of the longer operand and the shorter one broadcasts.
pub fn binary(op: OpCode, lhs: &Value, rhs: &Value) -> Value {
    match (lhs, rhs) {
        (Value::Scalar(l), Value::Scalar(r)) => Value::Scalar(apply(op, *l, *r)),
        _ => {
            let len = lhs.len().max(rhs.len());
            let out = (0..len).map(|i| apply(op, lhs.get_at(i), rhs.get_at(i))).collect();
            Value::series(out)
        }
    }
}

/// Horizontal sum, four lanes at a time.
pub fn sum(values: &[f64]) -> f64 {
    let chunks = values.chunks_exact(4);
    let tail: f64 = chunks.remainder().iter().sum();
    let mut acc = f64x4::splat(0.0);
    for c in chunks {
        acc = acc + f64x4::from([c[0], c[1], c[2], c[3]]);
    }
    acc.to_array().iter().sum::<f64>() + tail
}

impl Value {
    /// Collapses a series to its total; a scalar is its own total.
    pub fn total(&self) -> f64 {
        match self {
            Value::Scalar(s) => *s,
            Value::Series(v) => sum(v),
        }
    }
}

macro_rules! value_op {
    ($tr:ident, $method:ident, $code:expr) => {
        impl $tr<&Value> for &Value {
            type Output = Value;
            fn $method(self, rhs: &Value) -> Value { binary($code, self, rhs) }
        }
        impl $tr<Value> for Value {
            type Output = Value;
            fn $method(self, rhs: Value) -> Value { binary($code, &self, &rhs) }
        }
        impl $tr<f64> for Value {
            type Output = Value;
            fn $method(self, rhs: f64) -> Value { binary($code, &self, &Value::Scalar(rhs)) }
        }
        impl $tr<f64> for &Value {
            type Output = Value;
            fn $method(self, rhs: f64) -> Value { binary($code, self, &Value::Scalar(rhs)) }
        }
    };
}

value_op!(Add, add, OpCode::Add);
value_op!(Sub, sub, OpCode::Sub);
value_op!(Mul, mul, OpCode::Mul);
value_op!(Div, div, OpCode::Div);
