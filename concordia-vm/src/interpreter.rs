use concordia_asm::{ArrayCount, CrcKind, Endian, Opcode, RawBytesField, StringKind};
use crc::{Crc, Digest, CRC_16_IBM_3740, CRC_32_ISO_HDLC, CRC_8_SMBUS};

use crate::callback::{CallbackCtx, IoCallback, Mode, ScalarValue, StringFraming};
use crate::cursor::Cursor;
use crate::error::ConcordiaError;
use crate::expr::{self, Value};
use crate::limits::Limits;
use crate::program::Program;
use crate::state::VmState;

static CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);
static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A running checksum, fed incrementally as bytes pass through the cursor
/// rather than recomputed from a copied region on `CrcEnd` (spec.md §5: "no
/// dynamic allocation occurs during execute").
enum CrcDigest {
    Crc8(Digest<'static, u8>),
    Crc16(Digest<'static, u16>),
    Crc32(Digest<'static, u32>),
}

impl CrcDigest {
    fn new(kind: CrcKind) -> Self {
        match kind {
            CrcKind::Crc8 => CrcDigest::Crc8(CRC8.digest()),
            CrcKind::Crc16 => CrcDigest::Crc16(CRC16.digest()),
            CrcKind::Crc32 => CrcDigest::Crc32(CRC32.digest()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            CrcDigest::Crc8(d) => d.update(bytes),
            CrcDigest::Crc16(d) => d.update(bytes),
            CrcDigest::Crc32(d) => d.update(bytes),
        }
    }

    fn finalize(self) -> u64 {
        match self {
            CrcDigest::Crc8(d) => d.finalize() as u64,
            CrcDigest::Crc16(d) => d.finalize() as u64,
            CrcDigest::Crc32(d) => d.finalize() as u64,
        }
    }
}

struct CrcRegion {
    digest: CrcDigest,
}

/// Per-invocation mutable state (spec.md §3's "VM Context"): mode, cursor,
/// fixed-size struct-scope stack, and the open CRC region if any. Owned by
/// exactly one [`execute`] call; never shared.
pub struct VmContext<'buf> {
    mode: Mode,
    state: VmState,
    cursor: Cursor<'buf>,
    struct_stack: Vec<u16>,
    crc_stack: Vec<CrcRegion>,
    expr_stack: Vec<Value>,
    /// High-water mark of cursor bytes already fed to every region in
    /// `crc_stack`; `track_crc` is idempotent against it so it can be
    /// called redundantly (once per leaf op, and again by `CrcBegin`/
    /// `CrcEnd`) without double-counting.
    crc_fed_pos: usize,
    limits: Limits,
}

impl<'buf> VmContext<'buf> {
    /// `init()`: bind a mode, buffer, and limits to a fresh context
    /// (spec.md §4.5's state machine: `Idle` -> ready to `execute`). All
    /// scratch storage is pre-sized here so `execute` never reallocates.
    pub fn init(mode: Mode, buffer: &'buf mut [u8], limits: Limits) -> Self {
        Self {
            mode,
            state: VmState::Idle,
            cursor: Cursor::new(buffer),
            struct_stack: Vec::with_capacity(limits.max_struct_depth),
            crc_stack: Vec::with_capacity(limits.max_crc_depth),
            expr_stack: Vec::with_capacity(limits.max_expr_stack),
            crc_fed_pos: 0,
            limits,
        }
    }

    /// Bytes consumed (decode) or produced (encode) so far; valid even
    /// after a failed `execute`, for post-mortem reporting.
    pub fn cursor(&self) -> usize {
        self.cursor.pos()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VmState {
        self.state
    }

    /// `execute()`: run `program`'s op stream to completion against
    /// `callback`, or halt on the first error (spec.md §4.5's failure
    /// semantics: one error code per execute, cursor preserved).
    pub fn execute(&mut self, program: &Program, callback: &mut dyn IoCallback) -> Result<(), ConcordiaError> {
        if !self.state.can_execute() {
            return Err(ConcordiaError::BadImage("execute() called on a non-Idle context".into()));
        }
        self.state = VmState::Executing;
        tracing::debug!(mode = ?self.mode, n_ops = program.ops().len(), "execute start");

        match self.run(program, callback) {
            Ok(()) => {
                self.state = VmState::Done;
                tracing::debug!(cursor = self.cursor.pos(), "execute done");
                Ok(())
            }
            Err(err) => {
                self.state = VmState::Failed;
                tracing::warn!(cursor = self.cursor.pos(), error = %err, "execute failed");
                Err(err)
            }
        }
    }

    fn run(&mut self, program: &Program, callback: &mut dyn IoCallback) -> Result<(), ConcordiaError> {
        let ops = program.ops();
        let mut pc = 0usize;
        while pc < ops.len() {
            pc = self.step(program, ops, pc, callback)?;
        }
        Ok(())
    }

    /// Dispatch one op, then feed any bytes it produced/consumed to open CRC
    /// regions. Wrapping every dispatch (rather than just leaf ops) is safe
    /// because `track_crc` is idempotent: a compound op (`ArrFixed`,
    /// `Switch`, ...) that already fed its body's bytes via nested `step`
    /// calls leaves `crc_fed_pos` caught up, so the outer call here is a
    /// no-op.
    fn step(
        &mut self,
        program: &Program,
        ops: &[Opcode],
        pc: usize,
        callback: &mut dyn IoCallback,
    ) -> Result<usize, ConcordiaError> {
        let next = self.dispatch(program, ops, pc, callback)?;
        self.track_crc();
        Ok(next)
    }

    /// Feed bytes between the high-water mark and the current cursor
    /// position to every open CRC region, then advance the mark. A no-op
    /// when nothing has moved, or when no region is open.
    fn track_crc(&mut self) {
        let pos = self.cursor.pos();
        if self.crc_stack.is_empty() {
            self.crc_fed_pos = pos;
            return;
        }
        if pos > self.crc_fed_pos {
            let bytes = self.cursor.bytes_in(self.crc_fed_pos, pos);
            for region in &mut self.crc_stack {
                region.digest.update(bytes);
            }
        }
        self.crc_fed_pos = pos;
    }

    /// Execute one op at `pc`, returning the index of the next op to run
    /// (branches may jump ahead; everything else falls through to `pc+1`).
    fn dispatch(
        &mut self,
        program: &Program,
        ops: &[Opcode],
        pc: usize,
        callback: &mut dyn IoCallback,
    ) -> Result<usize, ConcordiaError> {
        match &ops[pc] {
            Opcode::IoU8(f) => self.scalar_op(program, f, 1, false, callback).map(|_| pc + 1),
            Opcode::IoU16(f) => self.scalar_op(program, f, 2, false, callback).map(|_| pc + 1),
            Opcode::IoU32(f) => self.scalar_op(program, f, 4, false, callback).map(|_| pc + 1),
            Opcode::IoU64(f) => self.scalar_op(program, f, 8, false, callback).map(|_| pc + 1),
            Opcode::IoI8(f) => self.scalar_op(program, f, 1, true, callback).map(|_| pc + 1),
            Opcode::IoI16(f) => self.scalar_op(program, f, 2, true, callback).map(|_| pc + 1),
            Opcode::IoI32(f) => self.scalar_op(program, f, 4, true, callback).map(|_| pc + 1),
            Opcode::IoI64(f) => self.scalar_op(program, f, 8, true, callback).map(|_| pc + 1),
            Opcode::IoF32(f) => self.float_op(f, 4, callback).map(|_| pc + 1),
            Opcode::IoF64(f) => self.float_op(f, 8, callback).map(|_| pc + 1),
            Opcode::Bitfield(b) => self.bitfield_op(b.key_id, b.width, callback).map(|_| pc + 1),
            Opcode::Str(s) => self.string_op(s, callback).map(|_| pc + 1),
            Opcode::ArrFixed(h) => self.arr_fixed_op(program, ops, pc, h, callback).map(|_| h.end as usize),
            Opcode::ArrUntil(h) => self.arr_until_op(program, ops, pc, h, callback).map(|_| h.end as usize),
            Opcode::ArrEnd => Ok(pc + 1),
            Opcode::EnterStruct(h) => {
                self.end_bitfield_run();
                if self.struct_stack.len() >= self.limits.max_struct_depth {
                    return Err(ConcordiaError::ExprErr("struct nesting exceeds configured limit".into()));
                }
                callback.enter_struct(h.key_id).map_err(ConcordiaError::UserErr)?;
                self.struct_stack.push(h.key_id);
                tracing::trace!(key_id = h.key_id, "enter struct");
                Ok(pc + 1)
            }
            Opcode::ExitStruct => {
                self.end_bitfield_run();
                let key_id = self
                    .struct_stack
                    .pop()
                    .ok_or_else(|| ConcordiaError::UnknownOp(pc))?;
                callback.exit_struct(key_id).map_err(ConcordiaError::UserErr)?;
                tracing::trace!(key_id, "exit struct");
                Ok(pc + 1)
            }
            Opcode::If(h) => {
                self.end_bitfield_run();
                let ctx = CallbackCtx::new(callback);
                let cond = expr::eval(&h.cond, &ctx, self.limits.max_expr_stack, &mut self.expr_stack)?;
                if cond.truthy()? {
                    Ok(pc + 1)
                } else {
                    Ok(h.jump_else as usize)
                }
            }
            Opcode::Else => {
                // Reached by falling off the end of a taken `if` body; skip
                // to the matching EndIf. The matching EndIf index isn't
                // carried on Else itself, so scan forward for it.
                let mut depth = 0usize;
                let mut i = pc;
                loop {
                    match &ops[i] {
                        Opcode::If(_) if i != pc => depth += 1,
                        Opcode::EndIf if depth == 0 => return Ok(i + 1),
                        Opcode::EndIf => depth -= 1,
                        _ => {}
                    }
                    i += 1;
                    if i >= ops.len() {
                        return Err(ConcordiaError::UnknownOp(pc));
                    }
                }
            }
            Opcode::EndIf => Ok(pc + 1),
            Opcode::Switch(h) => {
                self.end_bitfield_run();
                let disc = callback.ctx_query(h.disc_key).map_err(ConcordiaError::UserErr)?;
                let target = h
                    .cases
                    .binary_search_by_key(&disc, |(value, _)| *value)
                    .ok()
                    .map(|i| h.cases[i].1)
                    .or(h.default);
                tracing::trace!(disc_key = h.disc_key, disc, ?target, "switch dispatch");
                if let Some(start) = target {
                    let arm_end = switch_arm_end(h, start);
                    self.run_range(program, ops, start as usize, arm_end as usize, callback)?;
                }
                Ok(h.end as usize)
            }
            Opcode::EndSwitch => Ok(pc + 1),
            Opcode::Optional(key_id) => self.optional_op(*key_id, ops, pc, callback),
            Opcode::OptionalEnd => Ok(pc + 1),
            Opcode::CrcBegin(kind) => {
                self.end_bitfield_run();
                // Flush any bytes preceding this region to enclosing regions
                // before opening the new one, so it starts from a clean mark.
                self.track_crc();
                if self.crc_stack.len() >= self.limits.max_crc_depth {
                    return Err(ConcordiaError::ExprErr("CRC region nesting exceeds configured limit".into()));
                }
                self.crc_stack.push(CrcRegion { digest: CrcDigest::new(*kind) });
                tracing::trace!(kind = ?kind, start = self.cursor.pos(), "crc region begin");
                Ok(pc + 1)
            }
            Opcode::CrcEnd(field) => self.crc_end_op(field).map(|_| pc + 1),
            Opcode::RawBytes(field) => self.raw_bytes_op(field, callback).map(|_| pc + 1),
        }
    }

    fn end_bitfield_run(&mut self) {
        self.cursor.end_bitfield_run();
    }

    fn scalar_op(
        &mut self,
        program: &Program,
        field: &concordia_asm::ScalarField,
        width: u8,
        signed: bool,
        callback: &mut dyn IoCallback,
    ) -> Result<(), ConcordiaError> {
        self.end_bitfield_run();

        match self.mode {
            Mode::Encode => {
                let raw_value = if let Some(expr_ops) = &field.computed {
                    let ctx = CallbackCtx::new(callback);
                    let v = expr::eval(expr_ops, &ctx, self.limits.max_expr_stack, &mut self.expr_stack)?;
                    self.apply_transform_encode(program, field, v)?
                } else {
                    let v = callback.scalar_encode(field.key_id).map_err(ConcordiaError::UserErr)?;
                    if field.transform.is_some() {
                        self.apply_transform_encode(program, field, Value::F64(v.as_f64()))?
                    } else {
                        v.as_u64()
                    }
                };
                self.cursor.write_int(raw_value, width, field.endian)?;
            }
            Mode::Decode => {
                let raw = self.cursor.read_int(width, field.endian)?;
                let value = self.raw_to_scalar(program, field, raw, width, signed)?;
                callback.scalar_decode(field.key_id, value).map_err(ConcordiaError::UserErr)?;
            }
        }
        Ok(())
    }

    fn raw_to_scalar(
        &self,
        program: &Program,
        field: &concordia_asm::ScalarField,
        raw: u64,
        width: u8,
        signed: bool,
    ) -> Result<ScalarValue, ConcordiaError> {
        if let Some(idx) = field.transform {
            let transform = program.transform(idx)?;
            let raw_i = sign_extend(raw, width, signed);
            let eng = transform.decode(raw_i)?;
            return Ok(ScalarValue::F64(eng));
        }
        Ok(widen_raw(raw, width, signed))
    }

    fn apply_transform_encode(
        &self,
        program: &Program,
        field: &concordia_asm::ScalarField,
        value: Value,
    ) -> Result<u64, ConcordiaError> {
        match field.transform {
            Some(idx) => {
                let transform = program.transform(idx)?;
                let raw = transform.encode(value.as_f64()?)?;
                Ok(raw as u64)
            }
            None => Ok(value.as_u64().unwrap_or_else(|_| value.as_f64().map(|f| f as u64).unwrap_or(0))),
        }
    }

    fn float_op(
        &mut self,
        field: &concordia_asm::ScalarField,
        width: u8,
        callback: &mut dyn IoCallback,
    ) -> Result<(), ConcordiaError> {
        self.end_bitfield_run();
        match self.mode {
            Mode::Encode => {
                let v = if let Some(expr_ops) = &field.computed {
                    let ctx = CallbackCtx::new(callback);
                    expr::eval(expr_ops, &ctx, self.limits.max_expr_stack, &mut self.expr_stack)?.as_f64()?
                } else {
                    callback.scalar_encode(field.key_id).map_err(ConcordiaError::UserErr)?.as_f64()
                };
                self.cursor.write_float(v, width, field.endian)?;
            }
            Mode::Decode => {
                let v = self.cursor.read_float(width, field.endian)?;
                let value = if width == 4 { ScalarValue::F32(v as f32) } else { ScalarValue::F64(v) };
                callback.scalar_decode(field.key_id, value).map_err(ConcordiaError::UserErr)?;
            }
        }
        Ok(())
    }

    fn bitfield_op(&mut self, key_id: u16, width: u8, callback: &mut dyn IoCallback) -> Result<(), ConcordiaError> {
        match self.mode {
            Mode::Encode => {
                let v = callback.bits_encode(key_id, width).map_err(ConcordiaError::UserErr)?;
                self.cursor.write_bits(v, width)?;
            }
            Mode::Decode => {
                let v = self.cursor.read_bits(width)?;
                callback.bits_decode(key_id, width, v).map_err(ConcordiaError::UserErr)?;
            }
        }
        Ok(())
    }

    fn string_op(&mut self, field: &concordia_asm::StrField, callback: &mut dyn IoCallback) -> Result<(), ConcordiaError> {
        self.end_bitfield_run();
        let framing = match &field.kind {
            StringKind::Null => StringFraming::Null,
            StringKind::PrefixU8 => StringFraming::PrefixU8,
            StringKind::PrefixU16 => StringFraming::PrefixU16,
            StringKind::PrefixU32 => StringFraming::PrefixU32,
            StringKind::Fixed(n) => StringFraming::Fixed(*n),
        };
        match self.mode {
            Mode::Encode => {
                let s = callback.string_encode(field.key_id, framing).map_err(ConcordiaError::UserErr)?;
                let max = (field.max_len as usize).min(self.limits.max_string_len);
                if s.len() > max {
                    return Err(ConcordiaError::StrTooLong { len: s.len(), max });
                }
                self.write_framed_string(field, &s)?;
            }
            Mode::Decode => {
                let s = self.read_framed_string(field)?;
                let max = (field.max_len as usize).min(self.limits.max_string_len);
                if s.len() > max {
                    return Err(ConcordiaError::StrTooLong { len: s.len(), max });
                }
                callback.string_decode(field.key_id, framing, &s).map_err(ConcordiaError::UserErr)?;
            }
        }
        Ok(())
    }

    fn write_framed_string(&mut self, field: &concordia_asm::StrField, s: &str) -> Result<(), ConcordiaError> {
        match &field.kind {
            StringKind::Null => {
                self.cursor.write_bytes(s.as_bytes())?;
                self.cursor.write_bytes(&[0])?;
            }
            StringKind::PrefixU8 => {
                self.cursor.write_int(s.len() as u64, 1, Endian::Little)?;
                self.cursor.write_bytes(s.as_bytes())?;
            }
            StringKind::PrefixU16 => {
                self.cursor.write_int(s.len() as u64, 2, Endian::Little)?;
                self.cursor.write_bytes(s.as_bytes())?;
            }
            StringKind::PrefixU32 => {
                self.cursor.write_int(s.len() as u64, 4, Endian::Little)?;
                self.cursor.write_bytes(s.as_bytes())?;
            }
            StringKind::Fixed(n) => {
                let n = *n as usize;
                if s.len() > n {
                    return Err(ConcordiaError::StrTooLong { len: s.len(), max: n });
                }
                self.cursor.write_bytes(s.as_bytes())?;
                let pad = vec![0u8; n - s.len()];
                self.cursor.write_bytes(&pad)?;
            }
        }
        Ok(())
    }

    fn read_framed_string(&mut self, field: &concordia_asm::StrField) -> Result<String, ConcordiaError> {
        let bytes = match &field.kind {
            StringKind::Null => {
                let mut buf = Vec::new();
                loop {
                    let b = self.cursor.read_bytes(1)?[0];
                    if b == 0 {
                        break;
                    }
                    buf.push(b);
                    if buf.len() > self.limits.max_string_len {
                        return Err(ConcordiaError::StrTooLong { len: buf.len(), max: self.limits.max_string_len });
                    }
                }
                buf
            }
            StringKind::PrefixU8 => {
                let len = self.cursor.read_int(1, Endian::Little)? as usize;
                self.cursor.read_bytes(len)?.to_vec()
            }
            StringKind::PrefixU16 => {
                let len = self.cursor.read_int(2, Endian::Little)? as usize;
                self.cursor.read_bytes(len)?.to_vec()
            }
            StringKind::PrefixU32 => {
                let len = self.cursor.read_int(4, Endian::Little)? as usize;
                self.cursor.read_bytes(len)?.to_vec()
            }
            StringKind::Fixed(n) => {
                let raw = self.cursor.read_bytes(*n as usize)?;
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                raw[..end].to_vec()
            }
        };
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn arr_fixed_op(
        &mut self,
        program: &Program,
        ops: &[Opcode],
        pc: usize,
        header: &concordia_asm::ArrFixedHeader,
        callback: &mut dyn IoCallback,
    ) -> Result<(), ConcordiaError> {
        self.end_bitfield_run();
        let count = match &header.count {
            ArrayCount::Literal(n) => *n,
            ArrayCount::Expr(count_ops) => {
                let ctx = CallbackCtx::new(callback);
                expr::eval(count_ops, &ctx, self.limits.max_expr_stack, &mut self.expr_stack)?.as_u64()? as u32
            }
        };
        callback.arr_fixed(header.key_id, count).map_err(ConcordiaError::UserErr)?;
        // The body occupies the flat op stream between this header and its
        // `end` index; the VM re-walks that range `count` times, since the
        // decoded op vector carries no loop-back instruction of its own.
        let body_start = pc + 1;
        let body_end = header.end as usize;
        for _ in 0..count {
            self.run_range(program, ops, body_start, body_end, callback)?;
        }
        callback.arr_end(header.key_id).map_err(ConcordiaError::UserErr)?;
        Ok(())
    }

    /// Array-until-sentinel (spec.md §4.5): the body is a single bounded
    /// element (in practice a string field, matching the
    /// `@count(n) string items[] until 0;` usage this op was distilled
    /// from); a single zero byte -- distinct from any element -- marks the
    /// end of the array, checked by peeking before each iteration.
    fn arr_until_op(
        &mut self,
        program: &Program,
        ops: &[Opcode],
        pc: usize,
        header: &concordia_asm::ArrUntilHeader,
        callback: &mut dyn IoCallback,
    ) -> Result<(), ConcordiaError> {
        self.end_bitfield_run();
        let body_start = pc + 1;
        let body_end = header.end as usize;
        match self.mode {
            Mode::Encode => {
                while callback.arr_has_next_encode(header.key_id).map_err(ConcordiaError::UserErr)? {
                    self.run_range(program, ops, body_start, body_end, callback)?;
                }
                self.cursor.write_bytes(&[0])?;
            }
            Mode::Decode => loop {
                match self.cursor.peek_byte() {
                    Some(0) => {
                        self.cursor.read_bytes(1)?;
                        break;
                    }
                    Some(_) => self.run_range(program, ops, body_start, body_end, callback)?,
                    None => return Err(ConcordiaError::Oob { pos: self.cursor.pos(), len: self.cursor.len() }),
                }
            },
        }
        callback.arr_end(header.key_id).map_err(ConcordiaError::UserErr)?;
        Ok(())
    }

    fn run_range(
        &mut self,
        program: &Program,
        ops: &[Opcode],
        start: usize,
        end: usize,
        callback: &mut dyn IoCallback,
    ) -> Result<(), ConcordiaError> {
        let mut pc = start;
        while pc < end {
            pc = self.step(program, ops, pc, callback)?;
        }
        Ok(())
    }

    fn optional_op(
        &mut self,
        key_id: u16,
        ops: &[Opcode],
        pc: usize,
        callback: &mut dyn IoCallback,
    ) -> Result<usize, ConcordiaError> {
        self.end_bitfield_run();
        match self.mode {
            Mode::Encode => {
                let present = callback.optional_present_encode(key_id).map_err(ConcordiaError::UserErr)?;
                self.cursor.write_int(present as u64, 1, Endian::Little)?;
                if present {
                    Ok(pc + 1)
                } else {
                    Ok(matching_optional_end(ops, pc)? + 1)
                }
            }
            Mode::Decode => {
                let present = self.cursor.read_int(1, Endian::Little)? != 0;
                callback.optional_present_decode(key_id, present).map_err(ConcordiaError::UserErr)?;
                if present {
                    Ok(pc + 1)
                } else {
                    Ok(matching_optional_end(ops, pc)? + 1)
                }
            }
        }
    }

    /// CRC region close: the checksum field is VM-internal bookkeeping, not
    /// solicited from or delivered to the callback the way an ordinary
    /// scalar field is (spec.md §4.5: the closing op itself "computes
    /// CRC-{8,16,32} ... then encodes the result to the field").
    fn crc_end_op(&mut self, field: &concordia_asm::ScalarField) -> Result<(), ConcordiaError> {
        self.end_bitfield_run();
        // Feed the final flushed byte into the region about to close (and
        // any enclosing ones) before popping it.
        self.track_crc();
        let region = self.crc_stack.pop().ok_or_else(|| ConcordiaError::ExprErr("CRC_END without matching CRC_BEGIN".into()))?;
        let computed = region.digest.finalize();

        match self.mode {
            Mode::Encode => {
                self.cursor.write_int(computed, field.width, field.endian)?;
            }
            Mode::Decode => {
                let stored = self.cursor.read_int(field.width, field.endian)?;
                if computed != stored {
                    return Err(ConcordiaError::CrcErr { computed, expected: stored });
                }
            }
        }
        Ok(())
    }

    /// `RAW_BYTES`: an opaque fixed-length blob handed to the callback whole
    /// rather than decomposed into scalars. The decode path hands the
    /// callback a borrow straight out of the cursor's buffer instead of
    /// copying it into an owned `Vec`.
    fn raw_bytes_op(&mut self, field: &RawBytesField, callback: &mut dyn IoCallback) -> Result<(), ConcordiaError> {
        self.end_bitfield_run();
        let len = field.len as usize;
        match self.mode {
            Mode::Encode => {
                let data = callback.raw_bytes_encode(field.key_id, len).map_err(ConcordiaError::UserErr)?;
                if data.len() != len {
                    return Err(ConcordiaError::ExprErr(format!(
                        "raw_bytes_encode returned {} bytes, expected {len}",
                        data.len()
                    )));
                }
                self.cursor.write_bytes(&data)?;
            }
            Mode::Decode => {
                let data = self.cursor.read_bytes(len)?;
                callback.raw_bytes_decode(field.key_id, data).map_err(ConcordiaError::UserErr)?;
            }
        }
        Ok(())
    }
}

fn sign_extend(raw: u64, width: u8, signed: bool) -> i64 {
    if !signed {
        return raw as i64;
    }
    let bits = width as u32 * 8;
    if bits >= 64 {
        return raw as i64;
    }
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

fn widen_raw(raw: u64, width: u8, signed: bool) -> ScalarValue {
    match (width, signed) {
        (1, false) => ScalarValue::U8(raw as u8),
        (2, false) => ScalarValue::U16(raw as u16),
        (4, false) => ScalarValue::U32(raw as u32),
        (8, false) => ScalarValue::U64(raw),
        (1, true) => ScalarValue::I8(sign_extend(raw, 1, true) as i8),
        (2, true) => ScalarValue::I16(sign_extend(raw, 2, true) as i16),
        (4, true) => ScalarValue::I32(sign_extend(raw, 4, true) as i32),
        (8, true) => ScalarValue::I64(sign_extend(raw, 8, true)),
        _ => ScalarValue::U64(raw),
    }
}

/// Arms sit back-to-back in the flat op stream with no per-arm terminator;
/// the chosen arm's exclusive end is the next arm's start (by index), or
/// the switch's own `end` if `start` is the last arm.
fn switch_arm_end(header: &concordia_asm::SwitchHeader, start: u32) -> u32 {
    let mut bounds: Vec<u32> = header.cases.iter().map(|(_, arm)| *arm).collect();
    if let Some(default) = header.default {
        bounds.push(default);
    }
    bounds.push(header.end);
    bounds.into_iter().filter(|&b| b > start).min().unwrap_or(header.end)
}

fn matching_optional_end(ops: &[Opcode], pc: usize) -> Result<usize, ConcordiaError> {
    let mut depth = 0usize;
    let mut i = pc + 1;
    while i < ops.len() {
        match &ops[i] {
            Opcode::Optional(_) => depth += 1,
            Opcode::OptionalEnd if depth == 0 => return Ok(i),
            Opcode::OptionalEnd => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    Err(ConcordiaError::UnknownOp(pc))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use concordia_asm::{BitfieldField, ImageHeader, RawBytesField, ScalarField};

    use super::*;
    use crate::callback::Mode;

    /// Exercises just enough of [`IoCallback`] for these tests; any method a
    /// given scenario doesn't drive panics if reached.
    #[derive(Default)]
    struct FakeCallback {
        scalars: HashMap<u16, ScalarValue>,
        bits: HashMap<u16, u64>,
        raw_bytes: HashMap<u16, Vec<u8>>,
    }

    impl IoCallback for FakeCallback {
        fn scalar_encode(&mut self, key_id: u16) -> Result<ScalarValue, i32> {
            Ok(*self.scalars.get(&key_id).expect("scalar not staged for encode"))
        }
        fn scalar_decode(&mut self, key_id: u16, value: ScalarValue) -> Result<(), i32> {
            self.scalars.insert(key_id, value);
            Ok(())
        }
        fn bits_encode(&mut self, key_id: u16, _width: u8) -> Result<u64, i32> {
            Ok(*self.bits.get(&key_id).expect("bits not staged for encode"))
        }
        fn bits_decode(&mut self, key_id: u16, _width: u8, value: u64) -> Result<(), i32> {
            self.bits.insert(key_id, value);
            Ok(())
        }
        fn string_encode(&mut self, _key_id: u16, _framing: StringFraming) -> Result<String, i32> {
            unimplemented!()
        }
        fn string_decode(&mut self, _key_id: u16, _framing: StringFraming, _value: &str) -> Result<(), i32> {
            unimplemented!()
        }
        fn arr_fixed(&mut self, _key_id: u16, _count: u32) -> Result<(), i32> {
            Ok(())
        }
        fn arr_end(&mut self, _key_id: u16) -> Result<(), i32> {
            Ok(())
        }
        fn arr_has_next_encode(&mut self, _key_id: u16) -> Result<bool, i32> {
            unimplemented!()
        }
        fn enter_struct(&mut self, _key_id: u16) -> Result<(), i32> {
            Ok(())
        }
        fn exit_struct(&mut self, _key_id: u16) -> Result<(), i32> {
            Ok(())
        }
        fn load_ctx(&mut self, _key_id: u16) -> Result<Value, i32> {
            unimplemented!()
        }
        fn ctx_query(&mut self, _disc_key: u16) -> Result<u64, i32> {
            unimplemented!()
        }
        fn raw_bytes_encode(&mut self, key_id: u16, _len: usize) -> Result<Vec<u8>, i32> {
            Ok(self.raw_bytes.get(&key_id).expect("raw bytes not staged for encode").clone())
        }
        fn raw_bytes_decode(&mut self, key_id: u16, data: &[u8]) -> Result<(), i32> {
            self.raw_bytes.insert(key_id, data.to_vec());
            Ok(())
        }
        fn optional_present_encode(&mut self, _key_id: u16) -> Result<bool, i32> {
            unimplemented!()
        }
        fn optional_present_decode(&mut self, _key_id: u16, _present: bool) -> Result<(), i32> {
            unimplemented!()
        }
    }

    /// Assembles a minimal loadable image around `ops`, with an empty key
    /// table and transform table, mirroring `program.rs`'s test helper.
    fn build_program(ops: Vec<Opcode>) -> Program {
        let code = concordia_asm::encode_all(&ops);
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
        Program::load(&image).unwrap()
    }

    #[test]
    fn scalar_packet_round_trips() {
        let ops = vec![Opcode::IoU32(ScalarField {
            key_id: 1,
            endian: Endian::Little,
            width: 4,
            transform: None,
            computed: None,
        })];
        let program = build_program(ops);

        let mut buf = [0u8; 4];
        let mut cb = FakeCallback::default();
        cb.scalars.insert(1, ScalarValue::U32(0xdead_beef));
        let mut ctx = VmContext::init(Mode::Encode, &mut buf, Limits::default());
        ctx.execute(&program, &mut cb).unwrap();
        assert_eq!(buf, 0xdead_beefu32.to_le_bytes());

        let mut decode_cb = FakeCallback::default();
        let mut ctx = VmContext::init(Mode::Decode, &mut buf, Limits::default());
        ctx.execute(&program, &mut decode_cb).unwrap();
        assert_eq!(decode_cb.scalars[&1], ScalarValue::U32(0xdead_beef));
    }

    #[test]
    fn bitfield_packet_matches_spec_scenario() {
        // packet F { uint32 a:5; uint32 b:12; uint32 c:3; uint32 d:12; }
        let ops = vec![
            Opcode::Bitfield(BitfieldField { key_id: 1, width: 5 }),
            Opcode::Bitfield(BitfieldField { key_id: 2, width: 12 }),
            Opcode::Bitfield(BitfieldField { key_id: 3, width: 3 }),
            Opcode::Bitfield(BitfieldField { key_id: 4, width: 12 }),
        ];
        let program = build_program(ops);

        let mut buf = [0u8; 4];
        let mut cb = FakeCallback::default();
        cb.bits.insert(1, 0x1F);
        cb.bits.insert(2, 0xABC);
        cb.bits.insert(3, 0x7);
        cb.bits.insert(4, 0xFFF);
        let mut ctx = VmContext::init(Mode::Encode, &mut buf, Limits::default());
        ctx.execute(&program, &mut cb).unwrap();
        assert_eq!(buf, [0b1111_1101, 0b0101_1110, 0b0111_1111, 0b1111_1111]);

        let mut decode_cb = FakeCallback::default();
        let mut ctx = VmContext::init(Mode::Decode, &mut buf, Limits::default());
        ctx.execute(&program, &mut decode_cb).unwrap();
        assert_eq!(decode_cb.bits[&1], 0x1F);
        assert_eq!(decode_cb.bits[&2], 0xABC);
        assert_eq!(decode_cb.bits[&3], 0x7);
        assert_eq!(decode_cb.bits[&4], 0xFFF);
    }

    #[test]
    fn raw_bytes_round_trips() {
        let ops = vec![Opcode::RawBytes(RawBytesField { key_id: 5, len: 4 })];
        let program = build_program(ops);

        let mut buf = [0u8; 4];
        let mut cb = FakeCallback::default();
        cb.raw_bytes.insert(5, vec![0xde, 0xad, 0xbe, 0xef]);
        let mut ctx = VmContext::init(Mode::Encode, &mut buf, Limits::default());
        ctx.execute(&program, &mut cb).unwrap();
        assert_eq!(buf, [0xde, 0xad, 0xbe, 0xef]);

        let mut decode_cb = FakeCallback::default();
        let mut ctx = VmContext::init(Mode::Decode, &mut buf, Limits::default());
        ctx.execute(&program, &mut decode_cb).unwrap();
        assert_eq!(decode_cb.raw_bytes[&5], vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn raw_bytes_wrong_length_from_callback_is_rejected() {
        let ops = vec![Opcode::RawBytes(RawBytesField { key_id: 5, len: 4 })];
        let program = build_program(ops);

        let mut buf = [0u8; 4];
        let mut cb = FakeCallback::default();
        cb.raw_bytes.insert(5, vec![0xde, 0xad]);
        let mut ctx = VmContext::init(Mode::Encode, &mut buf, Limits::default());
        assert!(ctx.execute(&program, &mut cb).is_err());
    }

    #[test]
    fn oob_write_halts_execute_with_cursor_preserved() {
        let ops = vec![Opcode::IoU32(ScalarField {
            key_id: 1,
            endian: Endian::Little,
            width: 4,
            transform: None,
            computed: None,
        })];
        let program = build_program(ops);

        let mut buf = [0u8; 2];
        let mut cb = FakeCallback::default();
        cb.scalars.insert(1, ScalarValue::U32(1));
        let mut ctx = VmContext::init(Mode::Encode, &mut buf, Limits::default());
        let err = ctx.execute(&program, &mut cb).unwrap_err();
        assert!(err.is_oob());
        assert_eq!(ctx.state(), VmState::Failed);
    }
}
