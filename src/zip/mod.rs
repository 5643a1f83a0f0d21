//! Streaming ZIP archive decoding.
//!
//! A ZIP file consists of:
//! 1. Local file headers and compressed data for each file
//! 2. Central Directory with metadata for all files
//! 3. End of Central Directory (EOCD) record at the end
//!
//! Because the relay pulls archives as non-seekable byte streams, this
//! module parses forwards through the local file headers and decompresses
//! entry bodies inline, instead of walking the Central Directory from the
//! end of the file. Entry totals therefore grow incrementally as the stream
//! is consumed - the final count is unknown until the Central Directory
//! signature appears.
//!
//! ## Supported Features
//!
//! - Standard ZIP format (PKZIP APPNOTE 6.3.x compatible)
//! - ZIP64 size fields in the local-header extra field
//! - STORED (no compression) method
//! - DEFLATE compression method
//! - Trailing data descriptors (with or without signature) on DEFLATE entries
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk archive support
//! - No BZIP2, LZMA, or other compression methods
//! - STORED entries whose length only exists in a data descriptor are
//!   rejected (their end cannot be found in a forward stream)

mod stream;
mod structures;

pub use stream::{ZipEntry, ZipEntryStream};
pub use structures::{CompressionMethod, DataDescriptor, LocalFileHeader};
