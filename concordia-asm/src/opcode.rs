use byteorder::{ByteOrder, LittleEndian};

use crate::error::ImageError;
use crate::expr_op::{read_expr_program, write_expr_program, ExprOp};
use crate::KeyId;

/// Byte order a scalar field op is encoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Endian {
    /// Least-significant byte first.
    Little = 0x00,
    /// Most-significant byte first.
    Big = 0x01,
}

impl TryFrom<u8> for Endian {
    type Error = ImageError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0x00 => Ok(Endian::Little),
            0x01 => Ok(Endian::Big),
            other => Err(ImageError::InvalidWidth(other)),
        }
    }
}

/// String framing variant, mirroring spec.md's `STR_*` op-type taxonomy.
#[derive(Debug, Clone, PartialEq)]
pub enum StringKind {
    /// Null-terminated; the sentinel zero byte is part of the encoding.
    Null,
    /// Length-prefixed with a `u8` count.
    PrefixU8,
    /// Length-prefixed with a `u16` count.
    PrefixU16,
    /// Length-prefixed with a `u32` count.
    PrefixU32,
    /// Fixed width in bytes, padded with zeros if the value is shorter.
    Fixed(u16),
}

/// A scalar field's wire shape and optional value-producing attachments.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarField {
    /// The field's stable key id.
    pub key_id: KeyId,
    /// Byte order on the wire.
    pub endian: Endian,
    /// Width in bytes; must match the owning [`Opcode`] variant's natural size.
    pub width: u8,
    /// Index into the program's transform table, if this field is wrapped
    /// by an `@scale`/`@offset`, `@poly`, or `@spline` transform.
    pub transform: Option<u16>,
    /// If present, this field's value is computed by evaluating the
    /// expression rather than requested from the callback (the `@expr`
    /// annotation from `examples/original_source/benchmarks/bench_math.cpp`).
    /// The callback is still consulted for any `LoadCtx` the expression
    /// references, and on decode the computed value is still delivered to
    /// the callback for inspection, but never solicited from it.
    pub computed: Option<Vec<ExprOp>>,
}

/// A run of packed sub-byte bits, per spec.md's bitfield-run semantics.
#[derive(Debug, Clone, PartialEq)]
pub struct BitfieldField {
    /// The field's stable key id.
    pub key_id: KeyId,
    /// Width in bits, 1..=64.
    pub width: u8,
}

/// Payload of [`Opcode::Str`].
#[derive(Debug, Clone, PartialEq)]
pub struct StrField {
    /// The field's stable key id.
    pub key_id: KeyId,
    /// Framing variant.
    pub kind: StringKind,
    /// Declared maximum length in bytes; exceeding it is `StrTooLong`.
    pub max_len: u32,
}

/// A fixed-count array's element count: either a compile-time literal or an
/// expression the VM evaluates once (per spec.md §4.5: "or asks callback for
/// count if n is dynamic, via expression").
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayCount {
    /// The count is known at compile time.
    Literal(u32),
    /// The count must be computed by evaluating this expression.
    Expr(Vec<ExprOp>),
}

/// Payload of [`Opcode::ArrFixed`].
#[derive(Debug, Clone, PartialEq)]
pub struct ArrFixedHeader {
    /// Key id reported to the callback's `ARR_FIXED` advisory.
    pub key_id: KeyId,
    /// Number of times the bracketed body executes.
    pub count: ArrayCount,
    /// Index (in the decoded op vector) of the matching [`Opcode::ArrEnd`].
    pub end: u32,
}

/// Payload of [`Opcode::ArrUntil`].
#[derive(Debug, Clone, PartialEq)]
pub struct ArrUntilHeader {
    /// Key id reported to the callback's array advisories.
    pub key_id: KeyId,
    /// Index (in the decoded op vector) of the matching [`Opcode::ArrEnd`].
    pub end: u32,
}

/// Payload of [`Opcode::RawBytes`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawBytesField {
    /// The field's stable key id.
    pub key_id: KeyId,
    /// Length in bytes, resolved by the compiler from the schema's
    /// `@count`/array framing (spec.md §4.4: "size known from the
    /// surrounding array op"). The VM itself treats it as a plain fixed
    /// width, the same way it treats [`StringKind::Fixed`].
    pub len: u32,
}

/// Payload of [`Opcode::EnterStruct`].
#[derive(Debug, Clone, PartialEq)]
pub struct StructHeader {
    /// Key id of the parent field, per spec.md §4.5: "key_id on enter is the
    /// parent's field key so the callback can switch its substructure cursor."
    pub key_id: KeyId,
}

/// Payload of [`Opcode::If`].
#[derive(Debug, Clone, PartialEq)]
pub struct IfHeader {
    /// Condition expression; truthiness follows [`crate::ExprOp`] evaluation.
    pub cond: Vec<ExprOp>,
    /// Index to jump to when the condition is false: the matching `Else`
    /// body start, or the matching `EndIf` if there is no `Else`.
    pub jump_else: u32,
}

/// Payload of [`Opcode::Switch`].
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchHeader {
    /// Key id the discriminator is queried against via `CTX_QUERY`.
    pub disc_key: KeyId,
    /// Sorted `(case_value, arm_start_index)` table; the VM binary-searches it.
    pub cases: Vec<(u64, u32)>,
    /// Index of the `default:` arm's body start, if one was declared.
    pub default: Option<u32>,
    /// Index (in the decoded op vector) of the matching [`Opcode::EndSwitch`].
    pub end: u32,
}

/// Which CRC polynomial width a CRC region uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum CrcKind {
    /// CRC-8.
    Crc8 = 8,
    /// CRC-16/CCITT-FALSE.
    Crc16 = 16,
    /// CRC-32 (IEEE 802.3).
    Crc32 = 32,
}

impl TryFrom<u8> for CrcKind {
    type Error = ImageError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            8 => Ok(CrcKind::Crc8),
            16 => Ok(CrcKind::Crc16),
            32 => Ok(CrcKind::Crc32),
            other => Err(ImageError::InvalidWidth(other)),
        }
    }
}

/// One decoded opcode from the IL code stream.
///
/// Bracket-style ops (`ArrFixed`/`ArrUntil`/`ArrEnd`, `EnterStruct`/
/// `ExitStruct`, `If`/`Else`/`EndIf`, `Switch`/`EndSwitch`,
/// `Optional`/`OptionalEnd`, `CrcBegin`/`CrcEnd`) delimit a region of the
/// flat op stream the way the spec's prose describes them; jump targets are
/// indices into the decoded op vector, not byte offsets, which is this
/// crate's internal representation choice (see `DESIGN.md`).
#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    /// `IO_U8`.
    IoU8(ScalarField),
    /// `IO_U16`.
    IoU16(ScalarField),
    /// `IO_U32`.
    IoU32(ScalarField),
    /// `IO_U64`.
    IoU64(ScalarField),
    /// `IO_I8`.
    IoI8(ScalarField),
    /// `IO_I16`.
    IoI16(ScalarField),
    /// `IO_I32`.
    IoI32(ScalarField),
    /// `IO_I64`.
    IoI64(ScalarField),
    /// `IO_F32`.
    IoF32(ScalarField),
    /// `IO_F64`.
    IoF64(ScalarField),
    /// A bitfield-run member; width in bits, packed MSB-first.
    Bitfield(BitfieldField),
    /// A string field in one of the `STR_*` framing variants.
    Str(StrField),
    /// Opens a fixed- or expression-counted array.
    ArrFixed(ArrFixedHeader),
    /// Opens a sentinel-terminated array.
    ArrUntil(ArrUntilHeader),
    /// Closes the nearest open array.
    ArrEnd,
    /// Opens a nested struct scope.
    EnterStruct(StructHeader),
    /// Closes the nearest open struct scope.
    ExitStruct,
    /// Opens a conditional; body runs if `cond` is true.
    If(IfHeader),
    /// Marks the start of the else branch.
    Else,
    /// Closes the nearest open conditional.
    EndIf,
    /// Opens a tagged-union dispatch.
    Switch(SwitchHeader),
    /// Closes the nearest open switch.
    EndSwitch,
    /// Opens an optional field: one presence byte followed by a body that
    /// only runs (on decode) if the flag was set.
    Optional(KeyId),
    /// Closes the nearest open optional.
    OptionalEnd,
    /// Opens a CRC-checked region; records the starting cursor.
    CrcBegin(CrcKind),
    /// Closes a CRC region and writes/validates the checksum field.
    CrcEnd(ScalarField),
    /// `RAW_BYTES`: an opaque fixed-length byte blob, handed to the callback
    /// whole rather than decomposed into scalars (spec.md §4.4).
    RawBytes(RawBytesField),
}

fn read_u16(code: &[u8], pos: usize) -> Result<u16, ImageError> {
    if pos + 2 > code.len() {
        return Err(ImageError::Truncated { what: "u16", offset: pos });
    }
    Ok(LittleEndian::read_u16(&code[pos..pos + 2]))
}

fn read_u32(code: &[u8], pos: usize) -> Result<u32, ImageError> {
    if pos + 4 > code.len() {
        return Err(ImageError::Truncated { what: "u32", offset: pos });
    }
    Ok(LittleEndian::read_u32(&code[pos..pos + 4]))
}

fn read_u64(code: &[u8], pos: usize) -> Result<u64, ImageError> {
    if pos + 8 > code.len() {
        return Err(ImageError::Truncated { what: "u64", offset: pos });
    }
    Ok(LittleEndian::read_u64(&code[pos..pos + 8]))
}

fn read_byte(code: &[u8], pos: usize) -> Result<u8, ImageError> {
    code.get(pos).copied().ok_or(ImageError::Truncated { what: "byte", offset: pos })
}

/// Reads a `{key_id, endian, width, has_transform[, transform_idx], has_expr[, expr_len, expr]}`
/// scalar field payload, validating `width` against `expected_width`.
fn read_scalar(code: &[u8], pos: &mut usize, expected_width: u8) -> Result<ScalarField, ImageError> {
    let key_id = read_u16(code, *pos)?;
    *pos += 2;
    let endian = Endian::try_from(read_byte(code, *pos)?)?;
    *pos += 1;
    let width = read_byte(code, *pos)?;
    *pos += 1;
    if width != expected_width {
        return Err(ImageError::InvalidWidth(width));
    }
    let has_transform = read_byte(code, *pos)? != 0;
    *pos += 1;
    let transform = if has_transform {
        let idx = read_u16(code, *pos)?;
        *pos += 2;
        Some(idx)
    } else {
        None
    };
    let has_expr = read_byte(code, *pos)? != 0;
    *pos += 1;
    let computed = if has_expr {
        Some(read_expr_program(code, pos)?)
    } else {
        None
    };
    Ok(ScalarField {
        key_id,
        endian,
        width,
        transform,
        computed,
    })
}

fn write_scalar(out: &mut Vec<u8>, field: &ScalarField) {
    out.extend_from_slice(&field.key_id.to_le_bytes());
    out.push(field.endian as u8);
    out.push(field.width);
    match field.transform {
        Some(idx) => {
            out.push(1);
            out.extend_from_slice(&idx.to_le_bytes());
        }
        None => out.push(0),
    }
    match &field.computed {
        Some(expr) => {
            out.push(1);
            write_expr_program(out, expr);
        }
        None => out.push(0),
    }
}

/// Discriminant bytes for each [`Opcode`] variant in the code stream.
#[repr(u8)]
enum Tag {
    IoU8 = 0x01,
    IoU16 = 0x02,
    IoU32 = 0x03,
    IoU64 = 0x04,
    IoI8 = 0x05,
    IoI16 = 0x06,
    IoI32 = 0x07,
    IoI64 = 0x08,
    IoF32 = 0x09,
    IoF64 = 0x0a,
    Bitfield = 0x0b,
    Str = 0x0c,
    ArrFixed = 0x0d,
    ArrUntil = 0x0e,
    ArrEnd = 0x0f,
    EnterStruct = 0x10,
    ExitStruct = 0x11,
    If = 0x12,
    Else = 0x13,
    EndIf = 0x14,
    Switch = 0x15,
    EndSwitch = 0x16,
    Optional = 0x17,
    OptionalEnd = 0x18,
    CrcBegin = 0x19,
    CrcEnd = 0x1a,
    RawBytes = 0x1b,
}

impl Opcode {
    /// Decode one opcode starting at `code[pos]`, returning the opcode and
    /// the position just past it.
    pub fn decode(code: &[u8], pos: usize) -> Result<(Opcode, usize), ImageError> {
        let tag = read_byte(code, pos)?;
        let mut p = pos + 1;
        let op = match tag {
            t if t == Tag::IoU8 as u8 => Opcode::IoU8(read_scalar(code, &mut p, 1)?),
            t if t == Tag::IoU16 as u8 => Opcode::IoU16(read_scalar(code, &mut p, 2)?),
            t if t == Tag::IoU32 as u8 => Opcode::IoU32(read_scalar(code, &mut p, 4)?),
            t if t == Tag::IoU64 as u8 => Opcode::IoU64(read_scalar(code, &mut p, 8)?),
            t if t == Tag::IoI8 as u8 => Opcode::IoI8(read_scalar(code, &mut p, 1)?),
            t if t == Tag::IoI16 as u8 => Opcode::IoI16(read_scalar(code, &mut p, 2)?),
            t if t == Tag::IoI32 as u8 => Opcode::IoI32(read_scalar(code, &mut p, 4)?),
            t if t == Tag::IoI64 as u8 => Opcode::IoI64(read_scalar(code, &mut p, 8)?),
            t if t == Tag::IoF32 as u8 => Opcode::IoF32(read_scalar(code, &mut p, 4)?),
            t if t == Tag::IoF64 as u8 => Opcode::IoF64(read_scalar(code, &mut p, 8)?),
            t if t == Tag::Bitfield as u8 => {
                let key_id = read_u16(code, p)?;
                p += 2;
                let width = read_byte(code, p)?;
                p += 1;
                Opcode::Bitfield(BitfieldField { key_id, width })
            }
            t if t == Tag::Str as u8 => {
                let key_id = read_u16(code, p)?;
                p += 2;
                let kind_tag = read_byte(code, p)?;
                p += 1;
                let kind = match kind_tag {
                    0 => StringKind::Null,
                    1 => StringKind::PrefixU8,
                    2 => StringKind::PrefixU16,
                    3 => StringKind::PrefixU32,
                    4 => {
                        let len = read_u16(code, p)?;
                        p += 2;
                        StringKind::Fixed(len)
                    }
                    other => return Err(ImageError::UnknownOpcode(other, p)),
                };
                let max_len = read_u32(code, p)?;
                p += 4;
                Opcode::Str(StrField { key_id, kind, max_len })
            }
            t if t == Tag::ArrFixed as u8 => {
                let key_id = read_u16(code, p)?;
                p += 2;
                let is_expr = read_byte(code, p)? != 0;
                p += 1;
                let count = if is_expr {
                    ArrayCount::Expr(read_expr_program(code, &mut p)?)
                } else {
                    let n = read_u32(code, p)?;
                    p += 4;
                    ArrayCount::Literal(n)
                };
                let end = read_u32(code, p)?;
                p += 4;
                Opcode::ArrFixed(ArrFixedHeader { key_id, count, end })
            }
            t if t == Tag::ArrUntil as u8 => {
                let key_id = read_u16(code, p)?;
                p += 2;
                let end = read_u32(code, p)?;
                p += 4;
                Opcode::ArrUntil(ArrUntilHeader { key_id, end })
            }
            t if t == Tag::ArrEnd as u8 => Opcode::ArrEnd,
            t if t == Tag::EnterStruct as u8 => {
                let key_id = read_u16(code, p)?;
                p += 2;
                Opcode::EnterStruct(StructHeader { key_id })
            }
            t if t == Tag::ExitStruct as u8 => Opcode::ExitStruct,
            t if t == Tag::If as u8 => {
                let cond = read_expr_program(code, &mut p)?;
                let jump_else = read_u32(code, p)?;
                p += 4;
                Opcode::If(IfHeader { cond, jump_else })
            }
            t if t == Tag::Else as u8 => Opcode::Else,
            t if t == Tag::EndIf as u8 => Opcode::EndIf,
            t if t == Tag::Switch as u8 => {
                let disc_key = read_u16(code, p)?;
                p += 2;
                let n_cases = read_u16(code, p)? as usize;
                p += 2;
                let mut cases = Vec::with_capacity(n_cases);
                for _ in 0..n_cases {
                    let value = read_u64(code, p)?;
                    p += 8;
                    let arm = read_u32(code, p)?;
                    p += 4;
                    cases.push((value, arm));
                }
                let has_default = read_byte(code, p)? != 0;
                p += 1;
                let default = if has_default {
                    let d = read_u32(code, p)?;
                    p += 4;
                    Some(d)
                } else {
                    None
                };
                let end = read_u32(code, p)?;
                p += 4;
                Opcode::Switch(SwitchHeader {
                    disc_key,
                    cases,
                    default,
                    end,
                })
            }
            t if t == Tag::EndSwitch as u8 => Opcode::EndSwitch,
            t if t == Tag::Optional as u8 => {
                let key_id = read_u16(code, p)?;
                p += 2;
                Opcode::Optional(key_id)
            }
            t if t == Tag::OptionalEnd as u8 => Opcode::OptionalEnd,
            t if t == Tag::CrcBegin as u8 => {
                let kind = CrcKind::try_from(read_byte(code, p)?)?;
                p += 1;
                Opcode::CrcBegin(kind)
            }
            t if t == Tag::CrcEnd as u8 => {
                let width = read_byte(code, p)?;
                p += 1;
                let field = read_scalar(code, &mut p, width)?;
                Opcode::CrcEnd(field)
            }
            t if t == Tag::RawBytes as u8 => {
                let key_id = read_u16(code, p)?;
                p += 2;
                let len = read_u32(code, p)?;
                p += 4;
                Opcode::RawBytes(RawBytesField { key_id, len })
            }
            other => return Err(ImageError::UnknownOpcode(other, pos)),
        };
        Ok((op, p))
    }

    /// Encode this opcode and append it to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Opcode::IoU8(f) => {
                out.push(Tag::IoU8 as u8);
                write_scalar(out, f);
            }
            Opcode::IoU16(f) => {
                out.push(Tag::IoU16 as u8);
                write_scalar(out, f);
            }
            Opcode::IoU32(f) => {
                out.push(Tag::IoU32 as u8);
                write_scalar(out, f);
            }
            Opcode::IoU64(f) => {
                out.push(Tag::IoU64 as u8);
                write_scalar(out, f);
            }
            Opcode::IoI8(f) => {
                out.push(Tag::IoI8 as u8);
                write_scalar(out, f);
            }
            Opcode::IoI16(f) => {
                out.push(Tag::IoI16 as u8);
                write_scalar(out, f);
            }
            Opcode::IoI32(f) => {
                out.push(Tag::IoI32 as u8);
                write_scalar(out, f);
            }
            Opcode::IoI64(f) => {
                out.push(Tag::IoI64 as u8);
                write_scalar(out, f);
            }
            Opcode::IoF32(f) => {
                out.push(Tag::IoF32 as u8);
                write_scalar(out, f);
            }
            Opcode::IoF64(f) => {
                out.push(Tag::IoF64 as u8);
                write_scalar(out, f);
            }
            Opcode::Bitfield(b) => {
                out.push(Tag::Bitfield as u8);
                out.extend_from_slice(&b.key_id.to_le_bytes());
                out.push(b.width);
            }
            Opcode::Str(s) => {
                out.push(Tag::Str as u8);
                out.extend_from_slice(&s.key_id.to_le_bytes());
                match &s.kind {
                    StringKind::Null => out.push(0),
                    StringKind::PrefixU8 => out.push(1),
                    StringKind::PrefixU16 => out.push(2),
                    StringKind::PrefixU32 => out.push(3),
                    StringKind::Fixed(len) => {
                        out.push(4);
                        out.extend_from_slice(&len.to_le_bytes());
                    }
                }
                out.extend_from_slice(&s.max_len.to_le_bytes());
            }
            Opcode::ArrFixed(h) => {
                out.push(Tag::ArrFixed as u8);
                out.extend_from_slice(&h.key_id.to_le_bytes());
                match &h.count {
                    ArrayCount::Literal(n) => {
                        out.push(0);
                        out.extend_from_slice(&n.to_le_bytes());
                    }
                    ArrayCount::Expr(expr) => {
                        out.push(1);
                        write_expr_program(out, expr);
                    }
                }
                out.extend_from_slice(&h.end.to_le_bytes());
            }
            Opcode::ArrUntil(h) => {
                out.push(Tag::ArrUntil as u8);
                out.extend_from_slice(&h.key_id.to_le_bytes());
                out.extend_from_slice(&h.end.to_le_bytes());
            }
            Opcode::ArrEnd => out.push(Tag::ArrEnd as u8),
            Opcode::EnterStruct(h) => {
                out.push(Tag::EnterStruct as u8);
                out.extend_from_slice(&h.key_id.to_le_bytes());
            }
            Opcode::ExitStruct => out.push(Tag::ExitStruct as u8),
            Opcode::If(h) => {
                out.push(Tag::If as u8);
                write_expr_program(out, &h.cond);
                out.extend_from_slice(&h.jump_else.to_le_bytes());
            }
            Opcode::Else => out.push(Tag::Else as u8),
            Opcode::EndIf => out.push(Tag::EndIf as u8),
            Opcode::Switch(h) => {
                out.push(Tag::Switch as u8);
                out.extend_from_slice(&h.disc_key.to_le_bytes());
                out.extend_from_slice(&(h.cases.len() as u16).to_le_bytes());
                for (value, arm) in &h.cases {
                    out.extend_from_slice(&value.to_le_bytes());
                    out.extend_from_slice(&arm.to_le_bytes());
                }
                match h.default {
                    Some(d) => {
                        out.push(1);
                        out.extend_from_slice(&d.to_le_bytes());
                    }
                    None => out.push(0),
                }
                out.extend_from_slice(&h.end.to_le_bytes());
            }
            Opcode::EndSwitch => out.push(Tag::EndSwitch as u8),
            Opcode::Optional(key_id) => {
                out.push(Tag::Optional as u8);
                out.extend_from_slice(&key_id.to_le_bytes());
            }
            Opcode::OptionalEnd => out.push(Tag::OptionalEnd as u8),
            Opcode::CrcBegin(kind) => {
                out.push(Tag::CrcBegin as u8);
                out.push(*kind as u8);
            }
            Opcode::CrcEnd(field) => {
                out.push(Tag::CrcEnd as u8);
                out.push(field.width);
                write_scalar(out, field);
            }
            Opcode::RawBytes(f) => {
                out.push(Tag::RawBytes as u8);
                out.extend_from_slice(&f.key_id.to_le_bytes());
                out.extend_from_slice(&f.len.to_le_bytes());
            }
        }
    }
}

/// Decode an entire code stream into an indexable vector of opcodes.
///
/// This is the representation the VM executes over; the returned vector's
/// indices are what `jump_else`/`end`/arm offsets refer to.
pub fn decode_all(code: &[u8]) -> Result<Vec<Opcode>, ImageError> {
    let mut ops = Vec::new();
    let mut pos = 0;
    while pos < code.len() {
        let (op, next) = Opcode::decode(code, pos)?;
        ops.push(op);
        pos = next;
    }
    Ok(ops)
}

/// Encode a whole op vector back into a flat code stream.
pub fn encode_all(ops: &[Opcode]) -> Vec<u8> {
    let mut out = Vec::new();
    for op in ops {
        op.encode(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let op = Opcode::IoU32(ScalarField {
            key_id: 7,
            endian: Endian::Big,
            width: 4,
            transform: None,
            computed: None,
        });
        let mut bytes = Vec::new();
        op.encode(&mut bytes);
        let (decoded, used) = Opcode::decode(&bytes, 0).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, op);
    }

    #[test]
    fn scalar_with_transform_round_trip() {
        let op = Opcode::IoU16(ScalarField {
            key_id: 1,
            endian: Endian::Little,
            width: 2,
            transform: Some(3),
            computed: None,
        });
        let mut bytes = Vec::new();
        op.encode(&mut bytes);
        let (decoded, _) = Opcode::decode(&bytes, 0).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn wrong_width_rejected() {
        let op = Opcode::IoU32(ScalarField {
            key_id: 0,
            endian: Endian::Little,
            width: 8, // wrong for IoU32
            transform: None,
            computed: None,
        });
        let mut bytes = Vec::new();
        op.encode(&mut bytes);
        assert!(matches!(Opcode::decode(&bytes, 0), Err(ImageError::InvalidWidth(8))));
    }

    #[test]
    fn decode_all_sequence() {
        let ops = vec![
            Opcode::EnterStruct(StructHeader { key_id: 0 }),
            Opcode::IoU32(ScalarField {
                key_id: 1,
                endian: Endian::Little,
                width: 4,
                transform: None,
                computed: None,
            }),
            Opcode::ExitStruct,
        ];
        let bytes = encode_all(&ops);
        let decoded = decode_all(&bytes).unwrap();
        assert_eq!(decoded, ops);
    }

    #[test]
    fn unknown_opcode_rejected() {
        let bytes = [0xffu8];
        assert!(matches!(Opcode::decode(&bytes, 0), Err(ImageError::UnknownOpcode(0xff, 0))));
    }

    #[test]
    fn raw_bytes_round_trip() {
        let op = Opcode::RawBytes(RawBytesField { key_id: 42, len: 16 });
        let mut bytes = Vec::new();
        op.encode(&mut bytes);
        let (decoded, used) = Opcode::decode(&bytes, 0).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, op);
    }

    fn scalar_field_for_width(key_id: KeyId, endian: Endian, width: u8) -> Opcode {
        let field = ScalarField { key_id, endian, width, transform: None, computed: None };
        match width {
            1 => Opcode::IoU8(field),
            2 => Opcode::IoU16(field),
            4 => Opcode::IoU32(field),
            8 => Opcode::IoU64(field),
            other => panic!("no scalar opcode for width {other}"),
        }
    }

    #[rstest::rstest]
    fn scalar_field_round_trips_every_width(
        #[values(Endian::Little, Endian::Big)] endian: Endian,
        #[values(1u8, 2, 4, 8)] width: u8,
    ) {
        let op = scalar_field_for_width(99, endian, width);
        let mut bytes = Vec::new();
        op.encode(&mut bytes);
        let (decoded, used) = Opcode::decode(&bytes, 0).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, op);
    }
}
