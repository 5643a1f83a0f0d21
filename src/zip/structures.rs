use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use anyhow::{bail, Result};

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }
}

/// Local File Header (LFH) signature
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
/// Fixed LFH size after the 4-byte signature
pub const LFH_FIXED_SIZE: usize = 26;

/// Central Directory File Header signature - seeing one in a forward
/// stream means all entry data has been passed
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";

/// End of Central Directory signature
pub const EOCD_SIGNATURE: &[u8] = b"PK\x05\x06";

/// Optional data descriptor signature
pub const DATA_DESCRIPTOR_SIGNATURE: &[u8] = b"PK\x07\x08";

/// General purpose flag bit 3: CRC and sizes live in a trailing data
/// descriptor instead of the header
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

/// Parsed local file header for one archive entry
#[derive(Debug, Clone)]
pub struct LocalFileHeader {
    pub file_name: String,
    pub compression_method: CompressionMethod,
    pub flags: u16,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub is_directory: bool,
    /// Entry carries a ZIP64 extended-information extra field. Its trailing
    /// data descriptor, if any, then uses 8-byte size fields.
    pub zip64_extra: bool,
}

impl LocalFileHeader {
    /// Parse the fixed portion of a local file header (the 26 bytes after
    /// the signature).
    ///
    /// Returns the header plus the lengths of the variable-length file name
    /// and extra field that follow it; those are read and applied separately
    /// via [`set_name`](Self::set_name) and
    /// [`apply_extra_field`](Self::apply_extra_field).
    pub fn from_fixed_bytes(data: &[u8]) -> Result<(Self, u16, u16)> {
        if data.len() < LFH_FIXED_SIZE {
            bail!("Invalid Local File Header");
        }

        let mut cursor = Cursor::new(data);

        let _version_needed = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let compression_method = cursor.read_u16::<LittleEndian>()?;
        let _last_mod_time = cursor.read_u16::<LittleEndian>()?;
        let _last_mod_date = cursor.read_u16::<LittleEndian>()?;
        let crc32 = cursor.read_u32::<LittleEndian>()?;
        let compressed_size = cursor.read_u32::<LittleEndian>()? as u64;
        let uncompressed_size = cursor.read_u32::<LittleEndian>()? as u64;
        let file_name_length = cursor.read_u16::<LittleEndian>()?;
        let extra_field_length = cursor.read_u16::<LittleEndian>()?;

        let header = Self {
            file_name: String::new(),
            compression_method: CompressionMethod::from_u16(compression_method),
            flags,
            compressed_size,
            uncompressed_size,
            crc32,
            is_directory: false,
            zip64_extra: false,
        };

        Ok((header, file_name_length, extra_field_length))
    }

    /// Apply the raw file name bytes read after the fixed header.
    pub fn set_name(&mut self, bytes: &[u8]) {
        // Use lossy conversion to handle non-UTF8 filenames gracefully
        self.file_name = String::from_utf8_lossy(bytes).to_string();
        // Directory entries end with '/'
        self.is_directory = self.file_name.ends_with('/');
    }

    /// Scan the extra field for ZIP64 extended information (header ID
    /// 0x0001) and widen any 32-bit sizes that were saturated to 0xFFFFFFFF.
    pub fn apply_extra_field(&mut self, extra: &[u8]) -> Result<()> {
        let mut cursor = Cursor::new(extra);

        while (cursor.position() as usize) + 4 <= extra.len() {
            let header_id = cursor.read_u16::<LittleEndian>()?;
            let field_size = cursor.read_u16::<LittleEndian>()? as u64;
            let field_end = (cursor.position() + field_size).min(extra.len() as u64);

            if header_id == 0x0001 {
                self.zip64_extra = true;
                // ZIP64 fields are present only if the corresponding header
                // field is 0xFFFFFFFF, in a fixed order
                if self.uncompressed_size == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                    self.uncompressed_size = cursor.read_u64::<LittleEndian>()?;
                }
                if self.compressed_size == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                    self.compressed_size = cursor.read_u64::<LittleEndian>()?;
                }
            }

            cursor.set_position(field_end);
        }

        Ok(())
    }

    /// Whether the CRC and sizes trail the entry data in a descriptor.
    pub fn has_data_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }
}

/// Trailing data descriptor, present when flag bit 3 is set
#[derive(Debug, Clone, Copy)]
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}
