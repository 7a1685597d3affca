//! Atomic types of the Concordia intermediate language (IL).
//!
//! This crate only describes the wire shape of a compiled schema image: the
//! header, key table, transform table and opcode stream, plus the byte-level
//! packing/unpacking between them and a `&[u8]` IL image. It does not
//! execute anything — that is `concordia-vm`'s job.

#![warn(missing_docs)]

mod error;
mod expr_op;
mod header;
mod key_table;
mod opcode;
mod transform_table;

pub use error::ImageError;
pub use expr_op::{Builtin, ExprOp};
pub use header::{ImageHeader, MAGIC};
pub use key_table::{parse_key_table, KeyEntry, TypeTag};
pub use opcode::{
    decode_all, encode_all, ArrFixedHeader, ArrUntilHeader, ArrayCount, BitfieldField, CrcKind, Endian, IfHeader,
    Opcode, RawBytesField, ScalarField, StrField, StringKind, StructHeader, SwitchHeader,
};
pub use transform_table::{parse_transform_table, write_transform_table, TransformKind, TransformRecord};

/// A 16-bit identifier for a named field, assigned by the compiler in
/// declaration order. Stable across loads of the same IL image.
pub type KeyId = u16;
