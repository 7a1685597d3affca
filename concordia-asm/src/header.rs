use byteorder::{ByteOrder, LittleEndian};

use crate::error::ImageError;

/// Magic bytes every Concordia IL image starts with.
pub const MAGIC: [u8; 4] = *b"CNDI";

/// Fixed-size header of a Concordia IL image, always little-endian on disk.
///
/// Layout (40 bytes): `magic[4], major:u16, minor:u16, flags:u32,
/// key_table_offset:u32, key_table_len:u32, transform_table_offset:u32,
/// transform_table_len:u32, code_offset:u32, code_len:u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    /// Major version. A major bump signals an ABI-incompatible IL format.
    pub major: u16,
    /// Minor version. Minor bumps only add opcodes/fields, never remove.
    pub minor: u16,
    /// Reserved for compiler feature flags; the VM ignores unknown bits.
    pub flags: u32,
    /// Byte offset of the key table within the image.
    pub key_table_offset: u32,
    /// Byte length of the key table.
    pub key_table_len: u32,
    /// Byte offset of the transform table within the image.
    pub transform_table_offset: u32,
    /// Byte length of the transform table.
    pub transform_table_len: u32,
    /// Byte offset of the opcode stream within the image.
    pub code_offset: u32,
    /// Byte length of the opcode stream.
    pub code_len: u32,
}

/// Size in bytes of the on-disk header, including the magic.
pub const HEADER_LEN: usize = 40;

/// Highest major version this crate understands.
const SUPPORTED_MAJOR: u16 = 1;

impl ImageHeader {
    /// Parse the header from the start of an IL image.
    ///
    /// Validates the magic and major version and checks that every table
    /// offset/length falls within `image`, but does not interpret the
    /// tables themselves.
    pub fn parse(image: &[u8]) -> Result<Self, ImageError> {
        if image.len() < HEADER_LEN {
            return Err(ImageError::Truncated {
                what: "header",
                offset: 0,
            });
        }

        let mut found = [0u8; 4];
        found.copy_from_slice(&image[0..4]);
        if found != MAGIC {
            return Err(ImageError::BadMagic {
                expected: MAGIC,
                found,
            });
        }

        let major = LittleEndian::read_u16(&image[4..6]);
        let minor = LittleEndian::read_u16(&image[6..8]);
        if major > SUPPORTED_MAJOR {
            return Err(ImageError::UnsupportedVersion(major));
        }

        let flags = LittleEndian::read_u32(&image[8..12]);
        let key_table_offset = LittleEndian::read_u32(&image[12..16]);
        let key_table_len = LittleEndian::read_u32(&image[16..20]);
        let transform_table_offset = LittleEndian::read_u32(&image[20..24]);
        let transform_table_len = LittleEndian::read_u32(&image[24..28]);
        let code_offset = LittleEndian::read_u32(&image[28..32]);
        let code_len = LittleEndian::read_u32(&image[32..36]);

        let header = Self {
            major,
            minor,
            flags,
            key_table_offset,
            key_table_len,
            transform_table_offset,
            transform_table_len,
            code_offset,
            code_len,
        };

        header.check_table("key_table", header.key_table_offset, header.key_table_len, image.len())?;
        header.check_table(
            "transform_table",
            header.transform_table_offset,
            header.transform_table_len,
            image.len(),
        )?;
        header.check_table("code", header.code_offset, header.code_len, image.len())?;

        Ok(header)
    }

    fn check_table(&self, table: &'static str, offset: u32, len: u32, image_len: usize) -> Result<(), ImageError> {
        let end = (offset as u64).saturating_add(len as u64);
        if end > image_len as u64 {
            return Err(ImageError::TableOutOfBounds {
                table,
                offset,
                len,
                image_len,
            });
        }
        Ok(())
    }

    /// Serialize the header back to its 40-byte on-disk form.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC);
        LittleEndian::write_u16(&mut out[4..6], self.major);
        LittleEndian::write_u16(&mut out[6..8], self.minor);
        LittleEndian::write_u32(&mut out[8..12], self.flags);
        LittleEndian::write_u32(&mut out[12..16], self.key_table_offset);
        LittleEndian::write_u32(&mut out[16..20], self.key_table_len);
        LittleEndian::write_u32(&mut out[20..24], self.transform_table_offset);
        LittleEndian::write_u32(&mut out[24..28], self.transform_table_len);
        LittleEndian::write_u32(&mut out[28..32], self.code_offset);
        LittleEndian::write_u32(&mut out[32..36], self.code_len);
        out
    }
}
