//! Conditional control flow through the real interpreter: `If`/`Else`/
//! `EndIf`, including nesting, grounded in the original benchmark's
//! `BM_EncodeNestedIfElse` shape (two levels of `if` picking between three
//! distinct field layouts).

use std::collections::HashMap;

use concordia_asm::{Endian, ExprOp, IfHeader, ImageHeader, Opcode, ScalarField};
use concordia_vm::{IoCallback, Limits, Mode, Program, ScalarValue, StringFraming, Value, VmContext};

#[derive(Default)]
struct TestCallback {
    scalars: HashMap<u16, ScalarValue>,
}

impl IoCallback for TestCallback {
    fn scalar_encode(&mut self, key_id: u16) -> Result<ScalarValue, i32> {
        self.scalars.get(&key_id).copied().ok_or(1)
    }
    fn scalar_decode(&mut self, key_id: u16, value: ScalarValue) -> Result<(), i32> {
        self.scalars.insert(key_id, value);
        Ok(())
    }
    fn bits_encode(&mut self, _key_id: u16, _width: u8) -> Result<u64, i32> {
        Err(2)
    }
    fn bits_decode(&mut self, _key_id: u16, _width: u8, _value: u64) -> Result<(), i32> {
        Err(2)
    }
    fn string_encode(&mut self, _key_id: u16, _framing: StringFraming) -> Result<String, i32> {
        Err(2)
    }
    fn string_decode(&mut self, _key_id: u16, _framing: StringFraming, _value: &str) -> Result<(), i32> {
        Err(2)
    }
    fn arr_fixed(&mut self, _key_id: u16, _count: u32) -> Result<(), i32> {
        Err(2)
    }
    fn arr_end(&mut self, _key_id: u16) -> Result<(), i32> {
        Err(2)
    }
    fn arr_has_next_encode(&mut self, _key_id: u16) -> Result<bool, i32> {
        Err(2)
    }
    fn enter_struct(&mut self, _key_id: u16) -> Result<(), i32> {
        Err(2)
    }
    fn exit_struct(&mut self, _key_id: u16) -> Result<(), i32> {
        Err(2)
    }
    fn load_ctx(&mut self, key_id: u16) -> Result<Value, i32> {
        match self.scalars.get(&key_id) {
            Some(v) => Ok(Value::U64(v.as_u64())),
            None => Err(1),
        }
    }
    fn ctx_query(&mut self, _disc_key: u16) -> Result<u64, i32> {
        Err(2)
    }
    fn raw_bytes_encode(&mut self, _key_id: u16, _len: usize) -> Result<Vec<u8>, i32> {
        Err(2)
    }
    fn raw_bytes_decode(&mut self, _key_id: u16, _data: &[u8]) -> Result<(), i32> {
        Err(2)
    }
    fn optional_present_encode(&mut self, _key_id: u16) -> Result<bool, i32> {
        Err(2)
    }
    fn optional_present_decode(&mut self, _key_id: u16, _present: bool) -> Result<(), i32> {
        Err(2)
    }
}

fn build_image(ops: &[Opcode]) -> Vec<u8> {
    let code = concordia_asm::encode_all(ops);
    let key_table: Vec<u8> = 0u16.to_le_bytes().to_vec();
    let transform_table: Vec<u8> = Vec::new();

    let header_len = 40usize;
    let key_table_offset = header_len;
    let transform_table_offset = key_table_offset + key_table.len();
    let code_offset = transform_table_offset + transform_table.len();

    let header = ImageHeader {
        major: 1,
        minor: 0,
        flags: 0,
        key_table_offset: key_table_offset as u32,
        key_table_len: key_table.len() as u32,
        transform_table_offset: transform_table_offset as u32,
        transform_table_len: transform_table.len() as u32,
        code_offset: code_offset as u32,
        code_len: code.len() as u32,
    };

    let mut image = header.to_bytes().to_vec();
    image.extend_from_slice(&key_table);
    image.extend_from_slice(&transform_table);
    image.extend_from_slice(&code);
    image
}

fn scalar(key_id: u16, width: u8) -> ScalarField {
    ScalarField { key_id, endian: Endian::Little, width, transform: None, computed: None }
}

/// Scenario #5: `if (flag) u32 a; else u16 b;` -- picking one layout over
/// the other changes both which field is visited and the buffer's length.
#[test]
fn if_else_picks_the_taken_branch() {
    // 0: If(flag != 0 -> jump to Else at 2)
    // 1: IoU32(a)
    // 2: Else
    // 3: IoU16(b)
    // 4: EndIf
    let cond = vec![ExprOp::LoadCtx(0), ExprOp::PushU64(0), ExprOp::Ne];
    let ops = vec![
        Opcode::If(IfHeader { cond, jump_else: 3 }),
        Opcode::IoU32(scalar(1, 4)),
        Opcode::Else,
        Opcode::IoU16(scalar(2, 2)),
        Opcode::EndIf,
    ];
    let image = build_image(&ops);
    let program = Program::load(&image).unwrap();

    // flag = 1 -> takes the `if` branch, writes the u32 field
    let mut buf = [0u8; 4];
    let mut cb = TestCallback::default();
    cb.scalars.insert(0, ScalarValue::U64(1));
    cb.scalars.insert(1, ScalarValue::U32(0xaabbccdd));
    let mut ctx = VmContext::init(Mode::Encode, &mut buf, Limits::default());
    ctx.execute(&program, &mut cb).unwrap();
    assert_eq!(buf, 0xaabbccddu32.to_le_bytes());

    // flag = 0 -> takes the `else` branch, writes only the u16 field
    let mut buf2 = [0u8; 4];
    let mut cb2 = TestCallback::default();
    cb2.scalars.insert(0, ScalarValue::U64(0));
    cb2.scalars.insert(2, ScalarValue::U16(0x1234));
    let mut ctx2 = VmContext::init(Mode::Encode, &mut buf2, Limits::default());
    ctx2.execute(&program, &mut cb2).unwrap();
    assert_eq!(&buf2[..2], &0x1234u16.to_le_bytes());
}

/// `if (flag) u32 a;` with no `else` arm: the false branch must land
/// exactly on `EndIf` and continue, not fall into unrelated code.
#[test]
fn if_without_else_skips_cleanly_when_false() {
    let cond = vec![ExprOp::LoadCtx(0), ExprOp::PushU64(0), ExprOp::Ne];
    let ops = vec![
        Opcode::If(IfHeader { cond, jump_else: 2 }),
        Opcode::IoU32(scalar(1, 4)),
        Opcode::EndIf,
        Opcode::IoU8(scalar(2, 1)),
    ];
    let image = build_image(&ops);
    let program = Program::load(&image).unwrap();

    let mut buf = [0u8; 1];
    let mut cb = TestCallback::default();
    cb.scalars.insert(0, ScalarValue::U64(0));
    cb.scalars.insert(2, ScalarValue::U8(7));
    let mut ctx = VmContext::init(Mode::Encode, &mut buf, Limits::default());
    ctx.execute(&program, &mut cb).unwrap();
    assert_eq!(buf, [7]);
}

/// Nested if/else, per the original benchmark's `BM_EncodeNestedIfElse`:
/// an outer flag picks a branch, and the taken branch itself contains a
/// second, independent if/else choosing between two field layouts.
#[test]
fn nested_if_else_resolves_inner_branch_independently() {
    // if (outer) {
    //   if (inner) u32 a; else u16 b;
    // } else {
    //   u8 c;
    // }
    let inner_cond = vec![ExprOp::LoadCtx(1), ExprOp::PushU64(0), ExprOp::Ne];
    let outer_cond = vec![ExprOp::LoadCtx(0), ExprOp::PushU64(0), ExprOp::Ne];
    let ops = vec![
        // 0: outer If -> jump_else = 7 (the outer Else body's first op)
        Opcode::If(IfHeader { cond: outer_cond, jump_else: 7 }),
        // 1: inner If -> jump_else = 4 (the inner Else)
        Opcode::If(IfHeader { cond: inner_cond, jump_else: 4 }),
        // 2: IoU32(a)
        Opcode::IoU32(scalar(10, 4)),
        // 3: inner Else
        Opcode::Else,
        // 4: IoU16(b)
        Opcode::IoU16(scalar(11, 2)),
        // 5: inner EndIf
        Opcode::EndIf,
        // 6: outer Else
        Opcode::Else,
        // 7: IoU8(c)
        Opcode::IoU8(scalar(12, 1)),
        // 8: outer EndIf
        Opcode::EndIf,
    ];
    let image = build_image(&ops);
    let program = Program::load(&image).unwrap();

    // outer=1, inner=1 -> writes the u32 field
    let mut buf = [0u8; 4];
    let mut cb = TestCallback::default();
    cb.scalars.insert(0, ScalarValue::U64(1));
    cb.scalars.insert(1, ScalarValue::U64(1));
    cb.scalars.insert(10, ScalarValue::U32(111));
    let mut ctx = VmContext::init(Mode::Encode, &mut buf, Limits::default());
    ctx.execute(&program, &mut cb).unwrap();
    assert_eq!(buf, 111u32.to_le_bytes());

    // outer=1, inner=0 -> writes the u16 field
    let mut buf = [0u8; 4];
    let mut cb = TestCallback::default();
    cb.scalars.insert(0, ScalarValue::U64(1));
    cb.scalars.insert(1, ScalarValue::U64(0));
    cb.scalars.insert(11, ScalarValue::U16(222));
    let mut ctx = VmContext::init(Mode::Encode, &mut buf, Limits::default());
    ctx.execute(&program, &mut cb).unwrap();
    assert_eq!(&buf[..2], &222u16.to_le_bytes());

    // outer=0 -> inner branch never evaluated, writes the u8 field
    let mut buf = [0u8; 4];
    let mut cb = TestCallback::default();
    cb.scalars.insert(0, ScalarValue::U64(0));
    cb.scalars.insert(12, ScalarValue::U8(33));
    let mut ctx = VmContext::init(Mode::Encode, &mut buf, Limits::default());
    ctx.execute(&program, &mut cb).unwrap();
    assert_eq!(buf[0], 33);
}
