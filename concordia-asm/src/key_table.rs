use byteorder::{ByteOrder, LittleEndian};

use crate::error::ImageError;
use crate::KeyId;

/// Size in bytes of one packed key table entry.
const ENTRY_LEN: usize = 5;

/// Diagnostic-only type classification of a named field.
///
/// Never consulted by the VM at runtime — the opcode stream alone
/// determines execution — but carried through so tooling (error messages,
/// a future disassembler) can describe a key without re-deriving its type
/// from the op stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
#[non_exhaustive]
pub enum TypeTag {
    /// Unsigned 8-bit integer.
    U8 = 0x00,
    /// Unsigned 16-bit integer.
    U16 = 0x01,
    /// Unsigned 32-bit integer.
    U32 = 0x02,
    /// Unsigned 64-bit integer.
    U64 = 0x03,
    /// Signed 8-bit integer.
    I8 = 0x04,
    /// Signed 16-bit integer.
    I16 = 0x05,
    /// Signed 32-bit integer.
    I32 = 0x06,
    /// Signed 64-bit integer.
    I64 = 0x07,
    /// IEEE-754 single precision float.
    F32 = 0x08,
    /// IEEE-754 double precision float.
    F64 = 0x09,
    /// Sub-byte packed bitfield.
    Bitfield = 0x0a,
    /// String (any framing variant).
    String = 0x0b,
    /// Array (fixed or sentinel-terminated).
    Array = 0x0c,
    /// Nested struct.
    Struct = 0x0d,
    /// Named enum backed by an integer scalar; storage is identical to its
    /// backing integer type, this tag exists purely for diagnostics.
    Enum = 0x0e,
    /// Tagged-union switch.
    Switch = 0x0f,
    /// `@optional` wrapped field.
    Optional = 0x10,
}

impl TryFrom<u8> for TypeTag {
    type Error = ImageError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        use TypeTag::*;
        Ok(match b {
            0x00 => U8,
            0x01 => U16,
            0x02 => U32,
            0x03 => U64,
            0x04 => I8,
            0x05 => I16,
            0x06 => I32,
            0x07 => I64,
            0x08 => F32,
            0x09 => F64,
            0x0a => Bitfield,
            0x0b => String,
            0x0c => Array,
            0x0d => Struct,
            0x0e => Enum,
            0x0f => Switch,
            0x10 => Optional,
            other => return Err(ImageError::UnknownTypeTag(other)),
        })
    }
}

/// One entry of the key table: a stable key id paired with a diagnostic
/// name (resolved from the trailing string blob) and type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    /// The compiler-assigned stable key id.
    pub key_id: KeyId,
    /// Diagnostic field name, resolved from the table's trailing string blob.
    pub name: String,
    /// Diagnostic-only type classification.
    pub type_tag: TypeTag,
}

/// Parse the packed `(key_id, name_offset, type_tag)` entries and resolve
/// each `name_offset` against the trailing null-terminated string blob.
///
/// `table` is the full key table region as recorded in the header: a
/// `u16` entry count followed by `count * 5` bytes of entries, followed by
/// the string blob.
pub fn parse_key_table(table: &[u8]) -> Result<Vec<KeyEntry>, ImageError> {
    if table.is_empty() {
        return Ok(Vec::new());
    }
    if table.len() < 2 {
        return Err(ImageError::Truncated {
            what: "key_table count",
            offset: 0,
        });
    }
    let count = LittleEndian::read_u16(&table[0..2]) as usize;
    let entries_end = 2 + count * ENTRY_LEN;
    if table.len() < entries_end {
        return Err(ImageError::Truncated {
            what: "key_table entries",
            offset: 2,
        });
    }
    let blob = &table[entries_end..];

    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let base = 2 + i * ENTRY_LEN;
        let key_id = LittleEndian::read_u16(&table[base..base + 2]);
        let name_offset = LittleEndian::read_u16(&table[base + 2..base + 4]) as usize;
        let type_tag = TypeTag::try_from(table[base + 4])?;
        let name = read_cstr(blob, name_offset)?;
        out.push(KeyEntry { key_id, name, type_tag });
    }
    Ok(out)
}

fn read_cstr(blob: &[u8], offset: usize) -> Result<String, ImageError> {
    if offset > blob.len() {
        return Err(ImageError::StringOutOfBounds {
            offset: offset as u32,
            blob_len: blob.len(),
        });
    }
    let tail = &blob[offset..];
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_table(entries: &[(u16, &str, TypeTag)]) -> Vec<u8> {
        let mut blob = Vec::new();
        let mut offsets = Vec::new();
        for (_, name, _) in entries {
            offsets.push(blob.len() as u16);
            blob.extend_from_slice(name.as_bytes());
            blob.push(0);
        }

        let mut out = Vec::new();
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        for (i, (key_id, _, tag)) in entries.iter().enumerate() {
            out.extend_from_slice(&key_id.to_le_bytes());
            out.extend_from_slice(&offsets[i].to_le_bytes());
            out.push(*tag as u8);
        }
        out.extend_from_slice(&blob);
        out
    }

    #[test]
    fn empty_table() {
        assert_eq!(parse_key_table(&[]).unwrap(), Vec::new());
    }

    #[test]
    fn round_trip_names() {
        let raw = build_table(&[(0, "id", TypeTag::U32), (1, "val", TypeTag::F32), (2, "data", TypeTag::Array)]);
        let entries = parse_key_table(&raw).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "id");
        assert_eq!(entries[1].key_id, 1);
        assert_eq!(entries[2].type_tag, TypeTag::Array);
    }

    #[test]
    fn truncated_entries_rejected() {
        let raw = vec![1, 0, 0, 0]; // claims 1 entry, too short
        assert!(matches!(parse_key_table(&raw), Err(ImageError::Truncated { .. })));
    }
}
