use concordia_asm::{Builtin, ExprOp};

use crate::error::ConcordiaError;

/// A typed 64-bit evaluator slot (spec.md §4.2: "the stack is untyped
/// storage but every slot carries a runtime tag").
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Signed integer.
    I64(i64),
    /// Unsigned integer.
    U64(u64),
    /// Double-precision float.
    F64(f64),
    /// Boolean.
    Bool(bool),
}

impl Value {
    fn as_i64(self) -> Result<i64, ConcordiaError> {
        match self {
            Value::I64(v) => Ok(v),
            Value::U64(v) => Ok(v as i64),
            other => Err(ConcordiaError::ExprErr(format!("expected integer, found {other:?}"))),
        }
    }

    /// Widen to `f64`, the common currency for transform inputs/outputs.
    pub fn as_f64(self) -> Result<f64, ConcordiaError> {
        match self {
            Value::F64(v) => Ok(v),
            Value::I64(v) => Ok(v as f64),
            Value::U64(v) => Ok(v as f64),
            other => Err(ConcordiaError::ExprErr(format!("expected float, found {other:?}"))),
        }
    }

    fn as_bool(self) -> Result<bool, ConcordiaError> {
        match self {
            Value::Bool(v) => Ok(v),
            other => Err(ConcordiaError::ExprErr(format!("expected bool, found {other:?}"))),
        }
    }

    /// Truthiness for condition evaluation (`if`/`switch`): any nonzero
    /// numeric value or `true` boolean.
    pub fn truthy(self) -> Result<bool, ConcordiaError> {
        match self {
            Value::Bool(v) => Ok(v),
            Value::I64(v) => Ok(v != 0),
            Value::U64(v) => Ok(v != 0),
            Value::F64(v) => Ok(v != 0.0),
        }
    }

    /// Coerce to `u64`, used by dynamic array counts and switch discriminants.
    pub fn as_u64(self) -> Result<u64, ConcordiaError> {
        match self {
            Value::U64(v) => Ok(v),
            Value::I64(v) if v >= 0 => Ok(v as u64),
            other => Err(ConcordiaError::ExprErr(format!("expected non-negative integer, found {other:?}"))),
        }
    }
}

/// Queries the running value of a previously-decoded field by key, backing
/// `LoadCtx`. Encode and decode each supply their own implementation over
/// whatever scratch state they keep (spec.md §4.4's "context" concept).
pub trait CtxLookup {
    /// Return the current value bound to `key_id`, or an error if it hasn't
    /// been read/written yet in this pass.
    fn load(&self, key_id: u16) -> Result<Value, ConcordiaError>;
}

/// Evaluate a postfix expression program to a single [`Value`], rejecting a
/// program that would push past `max_stack_depth` (spec.md §4.2's "stack
/// overflow ... -> EXPR_ERR", sized by [`Limits::max_expr_stack`](crate::limits::Limits::max_expr_stack)).
///
/// `stack` is caller-owned scratch storage, reused across every `@expr`
/// field and `If`/`Switch` condition a single `execute()` evaluates, so this
/// function performs no heap allocation of its own (spec.md §5: "no dynamic
/// allocation occurs during execute").
pub fn eval(
    ops: &[ExprOp],
    ctx: &dyn CtxLookup,
    max_stack_depth: usize,
    stack: &mut Vec<Value>,
) -> Result<Value, ConcordiaError> {
    stack.clear();

    macro_rules! push {
        ($v:expr) => {{
            if stack.len() >= max_stack_depth {
                return Err(ConcordiaError::ExprErr("expression stack overflow".into()));
            }
            stack.push($v);
        }};
    }
    macro_rules! pop {
        () => {
            stack.pop().ok_or_else(|| ConcordiaError::ExprErr("expression stack underflow".into()))?
        };
    }

    for op in ops {
        match op {
            ExprOp::PushI64(v) => push!(Value::I64(*v)),
            ExprOp::PushU64(v) => push!(Value::U64(*v)),
            ExprOp::PushF64(v) => push!(Value::F64(*v)),
            ExprOp::PushBool(v) => push!(Value::Bool(*v)),
            ExprOp::LoadCtx(key) => push!(ctx.load(*key)?),
            ExprOp::Add => {
                let b = pop!();
                let a = pop!();
                push!(numeric_binop(a, b, |x, y| x.wrapping_add(y), |x, y| x.wrapping_add(y), |x, y| x + y)?)
            }
            ExprOp::Sub => {
                let b = pop!();
                let a = pop!();
                push!(numeric_binop(a, b, |x, y| x.wrapping_sub(y), |x, y| x.wrapping_sub(y), |x, y| x - y)?)
            }
            ExprOp::Mul => {
                let b = pop!();
                let a = pop!();
                push!(numeric_binop(a, b, |x, y| x.wrapping_mul(y), |x, y| x.wrapping_mul(y), |x, y| x * y)?)
            }
            ExprOp::Div => {
                let b = pop!();
                let a = pop!();
                push!(checked_div(a, b)?)
            }
            ExprOp::Rem => {
                let b = pop!();
                let a = pop!();
                push!(checked_rem(a, b)?)
            }
            ExprOp::Eq => {
                let b = pop!();
                let a = pop!();
                push!(Value::Bool(values_eq(a, b)?))
            }
            ExprOp::Ne => {
                let b = pop!();
                let a = pop!();
                push!(Value::Bool(!values_eq(a, b)?))
            }
            ExprOp::Lt => {
                let v = compare(stack)? == std::cmp::Ordering::Less;
                push!(Value::Bool(v))
            }
            ExprOp::Le => {
                let v = compare(stack)? != std::cmp::Ordering::Greater;
                push!(Value::Bool(v))
            }
            ExprOp::Gt => {
                let v = compare(stack)? == std::cmp::Ordering::Greater;
                push!(Value::Bool(v))
            }
            ExprOp::Ge => {
                let v = compare(stack)? != std::cmp::Ordering::Less;
                push!(Value::Bool(v))
            }
            ExprOp::Not => {
                let a = pop!();
                push!(Value::Bool(!a.as_bool()?))
            }
            ExprOp::And => {
                let b = pop!().as_bool()?;
                let a = pop!().as_bool()?;
                push!(Value::Bool(a && b))
            }
            ExprOp::Or => {
                let b = pop!().as_bool()?;
                let a = pop!().as_bool()?;
                push!(Value::Bool(a || b))
            }
            ExprOp::BitAnd => {
                let b = pop!().as_i64()?;
                let a = pop!().as_i64()?;
                push!(Value::I64(a & b))
            }
            ExprOp::BitOr => {
                let b = pop!().as_i64()?;
                let a = pop!().as_i64()?;
                push!(Value::I64(a | b))
            }
            ExprOp::BitXor => {
                let b = pop!().as_i64()?;
                let a = pop!().as_i64()?;
                push!(Value::I64(a ^ b))
            }
            ExprOp::BitNot => {
                let a = pop!().as_i64()?;
                push!(Value::I64(!a))
            }
            ExprOp::Shl => {
                let b = pop!().as_i64()?;
                let a = pop!().as_i64()?;
                push!(Value::I64(a.wrapping_shl(b as u32)))
            }
            ExprOp::Shr => {
                let b = pop!().as_i64()?;
                let a = pop!().as_i64()?;
                push!(Value::I64(a.wrapping_shr(b as u32)))
            }
            ExprOp::IntToFloat => {
                let a = pop!();
                push!(Value::F64(a.as_f64()?))
            }
            ExprOp::FloatToInt => {
                let a = pop!().as_f64()?;
                push!(Value::I64(a as i64))
            }
            ExprOp::Call(builtin) => {
                let v = call_builtin(*builtin, stack)?;
                push!(v)
            }
            _ => unreachable!("ExprOp is non_exhaustive but all variants are handled above"),
        }
    }

    if stack.len() != 1 {
        return Err(ConcordiaError::ExprErr(format!(
            "expression left {} values on the stack, expected 1",
            stack.len()
        )));
    }
    Ok(stack.pop().unwrap())
}

fn numeric_binop(
    a: Value,
    b: Value,
    fi: impl Fn(i64, i64) -> i64,
    fu: impl Fn(u64, u64) -> u64,
    ff: impl Fn(f64, f64) -> f64,
) -> Result<Value, ConcordiaError> {
    match (a, b) {
        (Value::F64(_), _) | (_, Value::F64(_)) => Ok(Value::F64(ff(a.as_f64()?, b.as_f64()?))),
        (Value::U64(x), Value::U64(y)) => Ok(Value::U64(fu(x, y))),
        _ => Ok(Value::I64(fi(a.as_i64()?, b.as_i64()?))),
    }
}

fn checked_div(a: Value, b: Value) -> Result<Value, ConcordiaError> {
    match (a, b) {
        (Value::F64(_), _) | (_, Value::F64(_)) => Ok(Value::F64(a.as_f64()? / b.as_f64()?)),
        (Value::U64(x), Value::U64(y)) => {
            if y == 0 {
                return Err(ConcordiaError::ExprErr("division by zero".into()));
            }
            Ok(Value::U64(x / y))
        }
        _ => {
            let y = b.as_i64()?;
            if y == 0 {
                return Err(ConcordiaError::ExprErr("division by zero".into()));
            }
            Ok(Value::I64(a.as_i64()? / y))
        }
    }
}

fn checked_rem(a: Value, b: Value) -> Result<Value, ConcordiaError> {
    match (a, b) {
        (Value::F64(_), _) | (_, Value::F64(_)) => Ok(Value::F64(a.as_f64()? % b.as_f64()?)),
        (Value::U64(x), Value::U64(y)) => {
            if y == 0 {
                return Err(ConcordiaError::ExprErr("division by zero".into()));
            }
            Ok(Value::U64(x % y))
        }
        _ => {
            let y = b.as_i64()?;
            if y == 0 {
                return Err(ConcordiaError::ExprErr("division by zero".into()));
            }
            Ok(Value::I64(a.as_i64()? % y))
        }
    }
}

fn values_eq(a: Value, b: Value) -> Result<bool, ConcordiaError> {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => Ok(x == y),
        _ => Ok((a.as_f64()? - b.as_f64()?).abs() == 0.0),
    }
}

fn compare(stack: &mut Vec<Value>) -> Result<std::cmp::Ordering, ConcordiaError> {
    let b = stack.pop().ok_or_else(|| ConcordiaError::ExprErr("expression stack underflow".into()))?;
    let a = stack.pop().ok_or_else(|| ConcordiaError::ExprErr("expression stack underflow".into()))?;
    a.as_f64()?
        .partial_cmp(&b.as_f64()?)
        .ok_or_else(|| ConcordiaError::ExprErr("comparison against NaN".into()))
}

fn call_builtin(builtin: Builtin, stack: &mut Vec<Value>) -> Result<Value, ConcordiaError> {
    let pop = |s: &mut Vec<Value>| s.pop().ok_or_else(|| ConcordiaError::ExprErr("expression stack underflow".into()));
    match builtin {
        Builtin::Sin => Ok(Value::F64(pop(stack)?.as_f64()?.sin())),
        Builtin::Cos => Ok(Value::F64(pop(stack)?.as_f64()?.cos())),
        Builtin::Sqrt => Ok(Value::F64(pop(stack)?.as_f64()?.sqrt())),
        Builtin::Abs => match pop(stack)? {
            Value::F64(v) => Ok(Value::F64(v.abs())),
            Value::I64(v) => Ok(Value::I64(v.abs())),
            Value::U64(v) => Ok(Value::U64(v)),
            other => Err(ConcordiaError::ExprErr(format!("abs() on non-numeric value {other:?}"))),
        },
        Builtin::Min => {
            let b = pop(stack)?.as_f64()?;
            let a = pop(stack)?.as_f64()?;
            Ok(Value::F64(a.min(b)))
        }
        Builtin::Max => {
            let b = pop(stack)?.as_f64()?;
            let a = pop(stack)?.as_f64()?;
            Ok(Value::F64(a.max(b)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoCtx;
    impl CtxLookup for NoCtx {
        fn load(&self, key_id: u16) -> Result<Value, ConcordiaError> {
            Err(ConcordiaError::ExprErr(format!("no such key {key_id}")))
        }
    }

    struct FixedCtx(u64);
    impl CtxLookup for FixedCtx {
        fn load(&self, _key_id: u16) -> Result<Value, ConcordiaError> {
            Ok(Value::U64(self.0))
        }
    }

    #[test]
    fn matches_bench_math_expr() {
        // @expr(x*2+5) with x = 10 -> 25
        let prog = vec![ExprOp::LoadCtx(0), ExprOp::PushU64(2), ExprOp::Mul, ExprOp::PushU64(5), ExprOp::Add];
        let mut stack = Vec::new();
        let v = eval(&prog, &FixedCtx(10), 32, &mut stack).unwrap();
        assert_eq!(v, Value::U64(25));
    }

    #[test]
    fn sin_cos_builtin_chain() {
        let prog = vec![
            ExprOp::LoadCtx(0),
            ExprOp::IntToFloat,
            ExprOp::Call(Builtin::Sin),
            ExprOp::LoadCtx(0),
            ExprOp::IntToFloat,
            ExprOp::Call(Builtin::Cos),
            ExprOp::Mul,
        ];
        let mut stack = Vec::new();
        let v = eval(&prog, &FixedCtx(1), 32, &mut stack).unwrap();
        let expected = (1.0f64).sin() * (1.0f64).cos();
        match v {
            Value::F64(f) => assert!((f - expected).abs() < 1e-12),
            other => panic!("expected f64, got {other:?}"),
        }
    }

    #[test]
    fn division_by_zero_is_expr_err() {
        let prog = vec![ExprOp::PushI64(1), ExprOp::PushI64(0), ExprOp::Div];
        let mut stack = Vec::new();
        assert!(eval(&prog, &NoCtx, 32, &mut stack).is_err());
    }

    #[test]
    fn leftover_stack_is_error() {
        let prog = vec![ExprOp::PushI64(1), ExprOp::PushI64(2)];
        let mut stack = Vec::new();
        assert!(eval(&prog, &NoCtx, 32, &mut stack).is_err());
    }

    #[test]
    fn comparison_drives_if_condition() {
        let prog = vec![ExprOp::LoadCtx(0), ExprOp::PushU64(0), ExprOp::Eq];
        let mut stack = Vec::new();
        let v = eval(&prog, &FixedCtx(0), 32, &mut stack).unwrap();
        assert!(v.truthy().unwrap());
    }

    #[test]
    fn reused_stack_does_not_leak_state_between_calls() {
        let mut stack = Vec::new();
        let leftover = vec![ExprOp::PushI64(1), ExprOp::PushI64(2), ExprOp::Add];
        eval(&leftover, &NoCtx, 32, &mut stack).unwrap();
        let prog = vec![ExprOp::PushI64(7)];
        let v = eval(&prog, &NoCtx, 32, &mut stack).unwrap();
        assert_eq!(v, Value::I64(7));
    }
}
