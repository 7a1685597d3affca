use strum::EnumIter;

use crate::expr::Value;

/// Direction of value transfer for the current `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Application values are read from the callback and written to the buffer.
    Encode,
    /// Bytes are read from the buffer and delivered to the callback.
    Decode,
}

/// The op-type taxonomy the callback must recognise (spec.md §4.4),
/// carried as an enum for dispatch and `tracing` diagnostics rather than
/// the C original's numeric tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum OpType {
    /// `IO_U8`..`IO_U64`, `IO_I8`..`IO_I64`, `IO_F32`, `IO_F64`.
    ScalarIo,
    /// `IO_BITS`.
    BitfieldIo,
    /// `STR_NULL`, `STR_PRE_U8`, `STR_PRE_U16`, `STR_PRE_U32`, `STR_FIXED`.
    String,
    /// `ARR_FIXED`, `ARR_END`.
    ArrayFraming,
    /// `ENTER_STRUCT`, `EXIT_STRUCT`.
    StructFraming,
    /// `LOAD_CTX`.
    LoadCtx,
    /// `CTX_QUERY`.
    CtxQuery,
    /// `RAW_BYTES`.
    RawBytes,
    /// Presence flag for an `optional` field.
    Optional,
}

/// A scalar staging value, tagged by the field's declared width/signedness
/// so the callback sees the exact application type rather than a generic
/// 64-bit bag (the C original's `void*` cast target, made explicit).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    /// `u8`.
    U8(u8),
    /// `u16`.
    U16(u16),
    /// `u32`.
    U32(u32),
    /// `u64`.
    U64(u64),
    /// `i8`.
    I8(i8),
    /// `i16`.
    I16(i16),
    /// `i32`.
    I32(i32),
    /// `i64`.
    I64(i64),
    /// `f32`.
    F32(f32),
    /// `f64`.
    F64(f64),
}

impl ScalarValue {
    /// Widen to the 64-bit unsigned pattern the cursor writes for integer
    /// widths (the float variants use [`as_f64`](Self::as_f64) instead).
    pub fn as_u64(self) -> u64 {
        match self {
            ScalarValue::U8(v) => v as u64,
            ScalarValue::U16(v) => v as u64,
            ScalarValue::U32(v) => v as u64,
            ScalarValue::U64(v) => v,
            ScalarValue::I8(v) => v as i64 as u64,
            ScalarValue::I16(v) => v as i64 as u64,
            ScalarValue::I32(v) => v as i64 as u64,
            ScalarValue::I64(v) => v as u64,
            ScalarValue::F32(_) | ScalarValue::F64(_) => 0,
        }
    }

    /// Widen to `f64` for the float variants.
    pub fn as_f64(self) -> f64 {
        match self {
            ScalarValue::F32(v) => v as f64,
            ScalarValue::F64(v) => v,
            other => other.as_u64() as f64,
        }
    }
}

/// The string-framing variant of a decoded/encoded `STR_*` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFraming {
    /// Null-terminated.
    Null,
    /// `u8` length prefix.
    PrefixU8,
    /// `u16` length prefix.
    PrefixU16,
    /// `u32` length prefix.
    PrefixU32,
    /// Fixed-width, padded with trailing zero bytes.
    Fixed(u16),
}

/// The single extension point: brokers values between the VM and the
/// application's own data structures, keyed by stable key IDs
/// (spec.md §4.4). One method per op-type category replaces the C
/// original's `(key_id, op_type, ptr)` triple dispatched over a single
/// function pointer; the taxonomy in [`OpType`] documents the mapping.
///
/// All methods return `Result<T, i32>`: a non-zero code aborts `execute`
/// immediately with [`ConcordiaError::UserErr`](crate::error::ConcordiaError::UserErr)
/// carrying that code, mirroring the C callback's non-OK return contract.
pub trait IoCallback {
    /// Scalar field transfer (`IO_U8`..`IO_F64`). Encode: return the
    /// application's value. Decode: receive the value read from the buffer.
    fn scalar_encode(&mut self, key_id: u16) -> Result<ScalarValue, i32>;
    /// See [`scalar_encode`](Self::scalar_encode).
    fn scalar_decode(&mut self, key_id: u16, value: ScalarValue) -> Result<(), i32>;

    /// Bitfield transfer (`IO_BITS`); staging slot is always `u64`.
    fn bits_encode(&mut self, key_id: u16, width: u8) -> Result<u64, i32>;
    /// See [`bits_encode`](Self::bits_encode).
    fn bits_decode(&mut self, key_id: u16, width: u8, value: u64) -> Result<(), i32>;

    /// String field transfer. Encode: return the owned string to write.
    fn string_encode(&mut self, key_id: u16, framing: StringFraming) -> Result<String, i32>;
    /// String field transfer. Decode: receive a view borrowed from the
    /// buffer, valid only for the duration of this call (spec.md §5's
    /// "string pointers ... are invalid after execute returns").
    fn string_decode(&mut self, key_id: u16, framing: StringFraming, value: &str) -> Result<(), i32>;

    /// `ARR_FIXED` advisory: the array's element count, whether literal or
    /// evaluated from a dynamic-count expression.
    fn arr_fixed(&mut self, key_id: u16, count: u32) -> Result<(), i32>;
    /// `ARR_END` advisory.
    fn arr_end(&mut self, key_id: u16) -> Result<(), i32>;
    /// Array-until-sentinel, encode direction only: asks whether another
    /// element follows; `false` emits the sentinel and ends the array.
    fn arr_has_next_encode(&mut self, key_id: u16) -> Result<bool, i32>;

    /// `ENTER_STRUCT` advisory; `key_id` is the parent field's key.
    fn enter_struct(&mut self, key_id: u16) -> Result<(), i32>;
    /// `EXIT_STRUCT` advisory.
    fn exit_struct(&mut self, key_id: u16) -> Result<(), i32>;

    /// `LOAD_CTX`: the value of a previously-read field, for expression
    /// evaluation (branch conditions, dynamic array counts, `@expr` inputs).
    fn load_ctx(&mut self, key_id: u16) -> Result<Value, i32>;

    /// `CTX_QUERY`: the discriminator driving the current `switch`.
    fn ctx_query(&mut self, disc_key: u16) -> Result<u64, i32>;

    /// `RAW_BYTES`, encode direction: the source bytes to write; length is
    /// fixed by the surrounding array op.
    fn raw_bytes_encode(&mut self, key_id: u16, len: usize) -> Result<Vec<u8>, i32>;
    /// `RAW_BYTES`, decode direction: the bytes read from the buffer.
    fn raw_bytes_decode(&mut self, key_id: u16, data: &[u8]) -> Result<(), i32>;

    /// `optional` presence flag, encode direction: whether the field is present.
    fn optional_present_encode(&mut self, key_id: u16) -> Result<bool, i32>;
    /// `optional` presence flag, decode direction: advisory notification.
    fn optional_present_decode(&mut self, key_id: u16, present: bool) -> Result<(), i32>;
}

/// Adapts an [`IoCallback`] into the [`CtxLookup`](crate::expr::CtxLookup)
/// the expression evaluator needs, so `LOAD_CTX` resolves through the same
/// callback the rest of the VM uses.
pub struct CallbackCtx<'a> {
    callback: std::cell::RefCell<&'a mut dyn IoCallback>,
}

impl<'a> CallbackCtx<'a> {
    /// Wrap a callback reference for the duration of one expression evaluation.
    pub fn new(callback: &'a mut dyn IoCallback) -> Self {
        Self { callback: std::cell::RefCell::new(callback) }
    }
}

impl<'a> crate::expr::CtxLookup for CallbackCtx<'a> {
    fn load(&self, key_id: u16) -> Result<Value, crate::error::ConcordiaError> {
        self.callback
            .borrow_mut()
            .load_ctx(key_id)
            .map_err(crate::error::ConcordiaError::UserErr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn op_type_taxonomy_is_nine_categories() {
        assert_eq!(OpType::iter().count(), 9);
    }

    #[test]
    fn scalar_value_widening() {
        assert_eq!(ScalarValue::I8(-1).as_u64(), u64::MAX);
        assert_eq!(ScalarValue::U16(0x1234).as_u64(), 0x1234);
        assert!((ScalarValue::F32(1.5).as_f64() - 1.5).abs() < 1e-9);
    }
}
