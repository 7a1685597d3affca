use thiserror::Error;

/// Runtime error variants, matching the taxonomy in spec.md §7.
///
/// Every variant that can occur mid-buffer carries enough state (byte
/// position, lengths) that the caller never has to re-derive "what was the
/// machine doing" from a bare error code.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConcordiaError {
    /// A read or write would have crossed the buffer boundary.
    #[error("out of bounds at byte {pos} (buffer len {len})")]
    Oob {
        /// Byte cursor position at the time of the violation.
        pos: usize,
        /// Length of the buffer in use.
        len: usize,
    },
    /// The IL image failed to load: bad magic, version, or table bounds.
    #[error("malformed IL image: {0}")]
    BadImage(String),
    /// The op stream contained an opcode or op-graph shape this VM build
    /// doesn't support (e.g. a dangling jump target).
    #[error("unsupported or malformed op at index {0}")]
    UnknownOp(usize),
    /// The expression evaluator hit a stack over/underflow, type mismatch,
    /// or division by zero.
    #[error("expression evaluation error: {0}")]
    ExprErr(String),
    /// An engineering value was outside a lossless transform's invertible domain.
    #[error("transform error: {0}")]
    TransformErr(String),
    /// A CRC region's computed checksum did not match the stored field.
    #[error("CRC mismatch: computed 0x{computed:x}, expected 0x{expected:x}")]
    CrcErr {
        /// The checksum the VM computed over the region.
        computed: u64,
        /// The checksum recorded in (or supplied for) the field.
        expected: u64,
    },
    /// A string exceeded its schema-declared maximum length.
    #[error("string of length {len} exceeds declared max {max}")]
    StrTooLong {
        /// Actual length encountered.
        len: usize,
        /// Declared maximum.
        max: usize,
    },
    /// The IO callback returned a non-OK result; the code is preserved.
    #[error("callback returned error code {0}")]
    UserErr(i32),
}

impl ConcordiaError {
    /// Flag used by tests/tooling that want to distinguish "the encoded
    /// buffer was simply too short" from other failure shapes.
    pub fn is_oob(&self) -> bool {
        matches!(self, ConcordiaError::Oob { .. })
    }
}
