use concordia_asm::{decode_all, parse_key_table, parse_transform_table, ImageHeader, KeyEntry, Opcode, TransformRecord};

use crate::error::ConcordiaError;
use crate::transform::Transform;

/// An immutable, loaded IL image (spec.md §3's "Program"): the decoded
/// header, key table, resolved transforms, and op stream. Safe to share
/// across any number of concurrent `execute` calls (spec.md §5).
#[derive(Debug, Clone)]
pub struct Program {
    header: ImageHeader,
    keys: Vec<KeyEntry>,
    transforms: Vec<Transform>,
    ops: Vec<Opcode>,
}

impl Program {
    /// Parse and validate a compiled IL image (spec.md §4.5's loader).
    /// Fails with [`ConcordiaError::BadImage`] on any malformed input;
    /// never panics on attacker-controlled bytes.
    pub fn load(image: &[u8]) -> Result<Self, ConcordiaError> {
        let header = ImageHeader::parse(image).map_err(|e| ConcordiaError::BadImage(e.to_string()))?;

        let key_table_start = header.key_table_offset as usize;
        let key_table_end = key_table_start + header.key_table_len as usize;
        let key_table = image
            .get(key_table_start..key_table_end)
            .ok_or_else(|| ConcordiaError::BadImage("key table out of bounds".into()))?;
        let keys = parse_key_table(key_table).map_err(|e| ConcordiaError::BadImage(e.to_string()))?;

        let transform_table_start = header.transform_table_offset as usize;
        let transform_table_end = transform_table_start + header.transform_table_len as usize;
        let transform_table = image
            .get(transform_table_start..transform_table_end)
            .ok_or_else(|| ConcordiaError::BadImage("transform table out of bounds".into()))?;
        let records: Vec<TransformRecord> =
            parse_transform_table(transform_table).map_err(|e| ConcordiaError::BadImage(e.to_string()))?;
        let transforms =
            records.iter().map(Transform::from_record).collect::<Result<Vec<_>, ConcordiaError>>()?;

        let code_start = header.code_offset as usize;
        let code_end = code_start + header.code_len as usize;
        let code = image
            .get(code_start..code_end)
            .ok_or_else(|| ConcordiaError::BadImage("code section out of bounds".into()))?;
        let ops = decode_all(code).map_err(|e| ConcordiaError::BadImage(e.to_string()))?;

        tracing::debug!(
            n_keys = keys.len(),
            n_transforms = transforms.len(),
            n_ops = ops.len(),
            "loaded IL image"
        );

        Ok(Self { header, keys, transforms, ops })
    }

    /// The parsed header (magic, version, table layout).
    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// The key table, in declaration order.
    pub fn keys(&self) -> &[KeyEntry] {
        &self.keys
    }

    /// Look up a key's declared name/type by key ID, for diagnostics.
    pub fn key(&self, key_id: u16) -> Option<&KeyEntry> {
        self.keys.iter().find(|k| k.key_id == key_id)
    }

    /// A resolved transform by its table index (referenced from a
    /// [`ScalarField::transform`](concordia_asm::ScalarField::transform) index).
    pub fn transform(&self, index: u16) -> Result<&Transform, ConcordiaError> {
        self.transforms
            .get(index as usize)
            .ok_or_else(|| ConcordiaError::BadImage(format!("transform index {index} out of range")))
    }

    /// The decoded op stream.
    pub fn ops(&self) -> &[Opcode] {
        &self.ops
    }
}
