use byteorder::{ByteOrder, LittleEndian};

use crate::error::ImageError;

/// Which invertible numeric map a [`TransformRecord`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum TransformKind {
    /// `raw = round((eng - offset) / scale)`, payload is `[scale, offset]`.
    Affine = 0x00,
    /// `eng = c0 + c1*raw + c2*raw^2 + ...`, payload is `[c0, c1, ..., cn]`.
    Polynomial = 0x01,
    /// Natural cubic spline over knots, payload is `[x0, y0, x1, y1, ...]`.
    Spline = 0x02,
}

impl TryFrom<u8> for TransformKind {
    type Error = ImageError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0x00 => Ok(TransformKind::Affine),
            0x01 => Ok(TransformKind::Polynomial),
            0x02 => Ok(TransformKind::Spline),
            other => Err(ImageError::UnknownTransformKind(other)),
        }
    }
}

/// One `{kind, n, payload}` record from the transform table, indexed by its
/// position in the table (transform ops reference it by that index).
#[derive(Debug, Clone, PartialEq)]
pub struct TransformRecord {
    /// Which transform this record describes.
    pub kind: TransformKind,
    /// The `f64` payload; its interpretation depends on `kind`.
    pub payload: Vec<f64>,
}

/// Parse the packed, variable-length transform table into records indexed
/// by their position (transform index 0 is the first record, etc).
pub fn parse_transform_table(table: &[u8]) -> Result<Vec<TransformRecord>, ImageError> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < table.len() {
        if offset + 2 > table.len() {
            return Err(ImageError::Truncated {
                what: "transform record header",
                offset,
            });
        }
        let kind = TransformKind::try_from(table[offset])?;
        let n = table[offset + 1] as usize;
        let payload_start = offset + 2;
        let payload_end = payload_start + n * 8;
        if payload_end > table.len() {
            return Err(ImageError::Truncated {
                what: "transform record payload",
                offset: payload_start,
            });
        }
        let mut payload = Vec::with_capacity(n);
        for i in 0..n {
            let base = payload_start + i * 8;
            payload.push(LittleEndian::read_f64(&table[base..base + 8]));
        }
        out.push(TransformRecord { kind, payload });
        offset = payload_end;
    }
    Ok(out)
}

/// Serialize transform records back into the packed on-disk format, in order.
pub fn write_transform_table(records: &[TransformRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        out.push(record.kind as u8);
        out.push(record.payload.len() as u8);
        for v in &record.payload {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}
