use thiserror::Error;

/// Errors that can occur while parsing a raw IL image into structured tables.
///
/// Mirrors the interpreter crate's split between "a well-formed but
/// unsupported value was found" and "the image is structurally malformed" —
/// both are reported as [`ImageError`] here since image parsing never halts
/// the process, only fails the load.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageError {
    /// The 4-byte magic at offset 0 did not read `"CNDI"`.
    #[error("bad magic: expected {expected:?}, found {found:?}")]
    BadMagic {
        /// The magic this crate expects.
        expected: [u8; 4],
        /// The magic actually found in the image.
        found: [u8; 4],
    },
    /// The image's major version is not supported by this crate.
    #[error("unsupported major version {0}")]
    UnsupportedVersion(u16),
    /// A table offset/length pair falls outside the image buffer.
    #[error("table {table} out of bounds: offset={offset} len={len} image_len={image_len}")]
    TableOutOfBounds {
        /// Name of the offending table, for diagnostics.
        table: &'static str,
        /// The offset read from the header.
        offset: u32,
        /// The length read from the header.
        len: u32,
        /// The total length of the image buffer.
        image_len: usize,
    },
    /// The image ended before a fixed-size record could be fully read.
    #[error("truncated {what} at offset {offset}")]
    Truncated {
        /// What was being read when the image ran out of bytes.
        what: &'static str,
        /// The offset the read started at.
        offset: usize,
    },
    /// A key table or string table offset pointed outside the string blob.
    #[error("string offset {offset} out of bounds (blob len {blob_len})")]
    StringOutOfBounds {
        /// The offset recorded in the key table entry.
        offset: u32,
        /// The size of the trailing string blob.
        blob_len: usize,
    },
    /// An opcode byte did not match any known [`crate::Opcode`] discriminant.
    #[error("unknown opcode byte 0x{0:02x} at offset {1}")]
    UnknownOpcode(u8, usize),
    /// An expression sub-program byte did not match any known [`crate::ExprOp`].
    #[error("unknown expression opcode byte 0x{0:02x}")]
    UnknownExprOp(u8),
    /// A scalar field declared a width other than 1, 2, 4 or 8 bytes.
    #[error("invalid scalar width {0}")]
    InvalidWidth(u8),
    /// A transform record declared a `kind` byte this crate does not recognize.
    #[error("unknown transform kind byte 0x{0:02x}")]
    UnknownTransformKind(u8),
    /// A key table entry declared a `type_tag` byte this crate does not recognize.
    #[error("unknown type tag byte 0x{0:02x}")]
    UnknownTypeTag(u8),
}
