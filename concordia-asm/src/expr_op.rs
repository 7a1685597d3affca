use byteorder::{ByteOrder, LittleEndian};

use crate::error::ImageError;
use crate::KeyId;

/// Builtin function a `Call` expression op may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Builtin {
    /// `sin(x)`.
    Sin = 0x00,
    /// `cos(x)`.
    Cos = 0x01,
    /// `sqrt(x)`.
    Sqrt = 0x02,
    /// `abs(x)`.
    Abs = 0x03,
    /// `min(a, b)`.
    Min = 0x04,
    /// `max(a, b)`.
    Max = 0x05,
}

/// One instruction of the postfix expression sub-language used for `@expr`
/// fields, `if`/`switch` conditions, dynamic array counts, and transform
/// arguments (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub enum ExprOp {
    /// Push a signed 64-bit immediate.
    PushI64(i64),
    /// Push an unsigned 64-bit immediate.
    PushU64(u64),
    /// Push a double-precision immediate.
    PushF64(f64),
    /// Push a boolean immediate.
    PushBool(bool),
    /// Query the callback (`LOAD_CTX`) for the value of a previously-read
    /// field, identified by key.
    LoadCtx(KeyId),
    /// Pop two, push their sum.
    Add,
    /// Pop two (b, a), push `a - b`.
    Sub,
    /// Pop two, push their product.
    Mul,
    /// Pop two (b, a), push `a / b`; `b == 0` is `ExprErr`.
    Div,
    /// Pop two (b, a), push `a % b`; `b == 0` is `ExprErr`.
    Rem,
    /// Pop two, push `a == b`.
    Eq,
    /// Pop two, push `a != b`.
    Ne,
    /// Pop two (b, a), push `a < b`.
    Lt,
    /// Pop two (b, a), push `a <= b`.
    Le,
    /// Pop two (b, a), push `a > b`.
    Gt,
    /// Pop two (b, a), push `a >= b`.
    Ge,
    /// Pop one, push its logical negation.
    Not,
    /// Pop two, push their logical and.
    And,
    /// Pop two, push their logical or.
    Or,
    /// Pop two, push their bitwise and.
    BitAnd,
    /// Pop two, push their bitwise or.
    BitOr,
    /// Pop two, push their bitwise xor.
    BitXor,
    /// Pop one, push its bitwise complement.
    BitNot,
    /// Pop two (b, a), push `a << b`.
    Shl,
    /// Pop two (b, a), push `a >> b`.
    Shr,
    /// Pop one integer, push it converted to float.
    IntToFloat,
    /// Pop one float, push it converted to integer (truncating).
    FloatToInt,
    /// Invoke a builtin, consuming its arity's worth of operands.
    Call(Builtin),
}

fn tag_byte(op: &ExprOp) -> u8 {
    use ExprOp::*;
    match op {
        PushI64(_) => 0x00,
        PushU64(_) => 0x01,
        PushF64(_) => 0x02,
        PushBool(_) => 0x03,
        LoadCtx(_) => 0x04,
        Add => 0x05,
        Sub => 0x06,
        Mul => 0x07,
        Div => 0x08,
        Rem => 0x09,
        Eq => 0x0a,
        Ne => 0x0b,
        Lt => 0x0c,
        Le => 0x0d,
        Gt => 0x0e,
        Ge => 0x0f,
        Not => 0x10,
        And => 0x11,
        Or => 0x12,
        BitAnd => 0x13,
        BitOr => 0x14,
        BitXor => 0x15,
        BitNot => 0x16,
        Shl => 0x17,
        Shr => 0x18,
        IntToFloat => 0x19,
        FloatToInt => 0x1a,
        Call(_) => 0x1b,
    }
}

fn write_op(out: &mut Vec<u8>, op: &ExprOp) {
    out.push(tag_byte(op));
    match op {
        ExprOp::PushI64(v) => out.extend_from_slice(&v.to_le_bytes()),
        ExprOp::PushU64(v) => out.extend_from_slice(&v.to_le_bytes()),
        ExprOp::PushF64(v) => out.extend_from_slice(&v.to_le_bytes()),
        ExprOp::PushBool(v) => out.push(*v as u8),
        ExprOp::LoadCtx(key) => out.extend_from_slice(&key.to_le_bytes()),
        ExprOp::Call(b) => out.push(*b as u8),
        _ => {}
    }
}

fn read_op(bytes: &[u8], pos: &mut usize) -> Result<ExprOp, ImageError> {
    let tag = *bytes.get(*pos).ok_or(ImageError::Truncated {
        what: "expr opcode",
        offset: *pos,
    })?;
    *pos += 1;
    let op = match tag {
        0x00 => {
            let v = read_i64(bytes, *pos)?;
            *pos += 8;
            ExprOp::PushI64(v)
        }
        0x01 => {
            let v = read_u64(bytes, *pos)?;
            *pos += 8;
            ExprOp::PushU64(v)
        }
        0x02 => {
            let v = read_f64(bytes, *pos)?;
            *pos += 8;
            ExprOp::PushF64(v)
        }
        0x03 => {
            let v = *bytes.get(*pos).ok_or(ImageError::Truncated {
                what: "expr bool",
                offset: *pos,
            })? != 0;
            *pos += 1;
            ExprOp::PushBool(v)
        }
        0x04 => {
            let key = read_u16(bytes, *pos)?;
            *pos += 2;
            ExprOp::LoadCtx(key)
        }
        0x05 => ExprOp::Add,
        0x06 => ExprOp::Sub,
        0x07 => ExprOp::Mul,
        0x08 => ExprOp::Div,
        0x09 => ExprOp::Rem,
        0x0a => ExprOp::Eq,
        0x0b => ExprOp::Ne,
        0x0c => ExprOp::Lt,
        0x0d => ExprOp::Le,
        0x0e => ExprOp::Gt,
        0x0f => ExprOp::Ge,
        0x10 => ExprOp::Not,
        0x11 => ExprOp::And,
        0x12 => ExprOp::Or,
        0x13 => ExprOp::BitAnd,
        0x14 => ExprOp::BitOr,
        0x15 => ExprOp::BitXor,
        0x16 => ExprOp::BitNot,
        0x17 => ExprOp::Shl,
        0x18 => ExprOp::Shr,
        0x19 => ExprOp::IntToFloat,
        0x1a => ExprOp::FloatToInt,
        0x1b => {
            let b = *bytes.get(*pos).ok_or(ImageError::Truncated {
                what: "expr builtin",
                offset: *pos,
            })?;
            *pos += 1;
            let builtin = match b {
                0x00 => Builtin::Sin,
                0x01 => Builtin::Cos,
                0x02 => Builtin::Sqrt,
                0x03 => Builtin::Abs,
                0x04 => Builtin::Min,
                0x05 => Builtin::Max,
                other => return Err(ImageError::UnknownExprOp(other)),
            };
            ExprOp::Call(builtin)
        }
        other => return Err(ImageError::UnknownExprOp(other)),
    };
    Ok(op)
}

fn read_u16(bytes: &[u8], pos: usize) -> Result<u16, ImageError> {
    check(bytes, pos, 2)?;
    Ok(LittleEndian::read_u16(&bytes[pos..pos + 2]))
}
fn read_i64(bytes: &[u8], pos: usize) -> Result<i64, ImageError> {
    check(bytes, pos, 8)?;
    Ok(LittleEndian::read_i64(&bytes[pos..pos + 8]))
}
fn read_u64(bytes: &[u8], pos: usize) -> Result<u64, ImageError> {
    check(bytes, pos, 8)?;
    Ok(LittleEndian::read_u64(&bytes[pos..pos + 8]))
}
fn read_f64(bytes: &[u8], pos: usize) -> Result<f64, ImageError> {
    check(bytes, pos, 8)?;
    Ok(LittleEndian::read_f64(&bytes[pos..pos + 8]))
}
fn check(bytes: &[u8], pos: usize, len: usize) -> Result<(), ImageError> {
    if pos + len > bytes.len() {
        Err(ImageError::Truncated {
            what: "expr operand",
            offset: pos,
        })
    } else {
        Ok(())
    }
}

/// Write a length-prefixed (`cond_len: u16`) expression sub-program.
pub fn write_expr_program(out: &mut Vec<u8>, ops: &[ExprOp]) {
    let mut body = Vec::new();
    for op in ops {
        write_op(&mut body, op);
    }
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend_from_slice(&body);
}

/// Read a length-prefixed expression sub-program from `code` at `*pos`,
/// advancing `*pos` past it.
pub fn read_expr_program(code: &[u8], pos: &mut usize) -> Result<Vec<ExprOp>, ImageError> {
    let len = {
        check(code, *pos, 2)?;
        LittleEndian::read_u16(&code[*pos..*pos + 2]) as usize
    };
    *pos += 2;
    check(code, *pos, len)?;
    let body = &code[*pos..*pos + len];
    *pos += len;

    let mut ops = Vec::new();
    let mut p = 0;
    while p < body.len() {
        ops.push(read_op(body, &mut p)?);
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_program() {
        let program = vec![
            ExprOp::LoadCtx(0),
            ExprOp::PushU64(2),
            ExprOp::Mul,
            ExprOp::PushU64(5),
            ExprOp::Add,
        ];
        let mut out = Vec::new();
        write_expr_program(&mut out, &program);
        let mut pos = 0;
        let decoded = read_expr_program(&out, &mut pos).unwrap();
        assert_eq!(decoded, program);
        assert_eq!(pos, out.len());
    }

    #[test]
    fn round_trip_builtin_call() {
        let program = vec![ExprOp::LoadCtx(1), ExprOp::Call(Builtin::Sqrt)];
        let mut out = Vec::new();
        write_expr_program(&mut out, &program);
        let mut pos = 0;
        assert_eq!(read_expr_program(&out, &mut pos).unwrap(), program);
    }

    #[test]
    fn unknown_op_rejected() {
        let mut out = Vec::new();
        out.extend_from_slice(&1u16.to_le_bytes());
        out.push(0xff);
        let mut pos = 0;
        assert!(matches!(read_expr_program(&out, &mut pos), Err(ImageError::UnknownExprOp(0xff))));
    }
}
