//! Forward streaming ZIP parser.
//!
//! ZIP archives are usually read backwards from the Central Directory, but
//! the relay source is a non-seekable byte stream, so entries are parsed in
//! file order from their Local File Headers instead: `PK\x03\x04` records
//! until a Central Directory or End of Central Directory signature appears.
//! Sizes missing from a local header are recovered from the ZIP64 extra
//! field or the trailing data descriptor.
//!
//! Bodies are handed out in bounded chunks with DEFLATE inflation done
//! inline, so an entry of any size passes through a fixed amount of memory.

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use flate2::{Crc, Decompress, FlushDecompress, Status};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use super::structures::{
    CompressionMethod, DataDescriptor, LocalFileHeader, CDFH_SIGNATURE,
    DATA_DESCRIPTOR_SIGNATURE, EOCD_SIGNATURE, LFH_FIXED_SIZE, LFH_SIGNATURE,
};

/// Size of decompressed chunks handed to consumers.
const OUTPUT_CHUNK_SIZE: usize = 32 * 1024;

/// Read buffer over the source stream.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Lazy sequence of entries parsed from an archive byte stream.
pub struct ZipEntryStream<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Send + Unpin> ZipEntryStream<R> {
    pub fn new(source: R) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, source),
        }
    }

    /// Advance to the next entry header.
    ///
    /// Returns `None` once the Central Directory (or end-of-archive record)
    /// is reached. The returned entry borrows the stream; its body must be
    /// fully consumed before the next call.
    pub async fn next_entry(&mut self) -> Result<Option<ZipEntry<'_, R>>> {
        let mut sig = [0u8; 4];
        if let Err(e) = self.reader.read_exact(&mut sig).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                bail!("Archive truncated before the central directory");
            }
            return Err(e.into());
        }

        if &sig[..] == CDFH_SIGNATURE || &sig[..] == EOCD_SIGNATURE {
            return Ok(None);
        }
        if &sig[..] != LFH_SIGNATURE {
            bail!("Not a valid ZIP stream (bad local header signature)");
        }

        let mut fixed = [0u8; LFH_FIXED_SIZE];
        self.reader.read_exact(&mut fixed).await?;
        let (mut header, name_len, extra_len) = LocalFileHeader::from_fixed_bytes(&fixed)?;

        let mut name = vec![0u8; name_len as usize];
        self.reader.read_exact(&mut name).await?;
        header.set_name(&name);

        let mut extra = vec![0u8; extra_len as usize];
        self.reader.read_exact(&mut extra).await?;
        header.apply_extra_field(&extra)?;

        if header.compression_method == CompressionMethod::Stored
            && header.has_data_descriptor()
            && header.compressed_size == 0
            && !header.is_directory
        {
            // Without a compressed length a STORED body has no detectable
            // end in a forward stream
            bail!(
                "STORED entry {} uses a streaming data descriptor and cannot be parsed",
                header.file_name
            );
        }

        let body = match header.compression_method {
            CompressionMethod::Stored => BodyState::Stored {
                remaining: header.compressed_size,
            },
            CompressionMethod::Deflate => BodyState::Deflate {
                inflater: Box::new(Decompress::new(false)),
                remaining: if header.has_data_descriptor() && header.compressed_size == 0 {
                    None
                } else {
                    Some(header.compressed_size)
                },
                finished: false,
            },
            CompressionMethod::Unknown(method) => BodyState::Unsupported(method),
        };

        Ok(Some(ZipEntry {
            reader: &mut self.reader,
            header,
            body,
            crc: Crc::new(),
            descriptor_read: false,
            done: false,
        }))
    }
}

enum BodyState {
    Stored {
        remaining: u64,
    },
    Deflate {
        inflater: Box<Decompress>,
        /// Compressed bytes left, when the local header declared a size.
        remaining: Option<u64>,
        finished: bool,
    },
    Unsupported(u16),
}

/// One entry inside an archive stream.
///
/// Borrows the stream exclusively: entry bodies are interleaved with
/// headers in the source bytes, so only one entry can be read at a time.
pub struct ZipEntry<'a, R> {
    reader: &'a mut BufReader<R>,
    header: LocalFileHeader,
    body: BodyState,
    crc: Crc,
    descriptor_read: bool,
    done: bool,
}

impl<R: AsyncRead + Send + Unpin> ZipEntry<'_, R> {
    pub fn name(&self) -> &str {
        &self.header.file_name
    }

    pub fn is_directory(&self) -> bool {
        self.header.is_directory
    }

    pub fn header(&self) -> &LocalFileHeader {
        &self.header
    }

    /// Read the next decompressed chunk of the entry body.
    ///
    /// Returns `None` once the body and any trailing data descriptor have
    /// been consumed and the CRC has been verified. After `None` (or an
    /// error followed by [`skip_remaining`](Self::skip_remaining)) the
    /// stream is aligned on the next header.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        loop {
            if self.body_finished() {
                self.finish_body().await?;
                return Ok(None);
            }
            if let Some(chunk) = self.advance_body().await? {
                return Ok(Some(chunk));
            }
        }
    }

    /// Consume the body until exhaustion, discarding the bytes.
    pub async fn drain(&mut self) -> Result<()> {
        while self.read_chunk().await?.is_some() {}
        Ok(())
    }

    /// Recover stream alignment after a body error.
    ///
    /// Possible only when the compressed length is known: the rest of the
    /// entry (and its descriptor) is discarded so the next header can be
    /// parsed. Fails when the length is unknown, which makes the error
    /// fatal for the whole archive.
    pub async fn skip_remaining(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        let remaining = if self.body_finished() {
            0
        } else {
            match &self.body {
                BodyState::Stored { remaining } => *remaining,
                BodyState::Deflate {
                    remaining: Some(r), ..
                } => *r,
                // Nothing of an unsupported body has been consumed yet
                BodyState::Unsupported(_)
                    if !(self.header.has_data_descriptor()
                        && self.header.compressed_size == 0) =>
                {
                    self.header.compressed_size
                }
                BodyState::Deflate { remaining: None, .. } | BodyState::Unsupported(_) => {
                    bail!("entry length unknown; stream position unrecoverable")
                }
            }
        };

        let mut left = remaining;
        while left > 0 {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                bail!("Archive truncated inside entry data");
            }
            let take = buf.len().min(left as usize);
            self.reader.consume(take);
            left -= take as u64;
        }

        if self.header.has_data_descriptor() && !self.descriptor_read {
            self.read_data_descriptor().await?;
        }
        self.done = true;
        Ok(())
    }

    fn body_finished(&self) -> bool {
        match &self.body {
            BodyState::Stored { remaining } => *remaining == 0,
            BodyState::Deflate { finished, .. } => *finished,
            BodyState::Unsupported(_) => false,
        }
    }

    /// Make one step of progress through the body. Returns a chunk when
    /// output was produced; `None` means input was consumed without output
    /// (or the body just finished) and the caller should loop.
    async fn advance_body(&mut self) -> Result<Option<Bytes>> {
        match &mut self.body {
            BodyState::Unsupported(method) => {
                bail!("Unsupported compression method: {method}")
            }
            BodyState::Stored { remaining } => {
                let buf = self.reader.fill_buf().await?;
                if buf.is_empty() {
                    bail!("Archive truncated inside entry data");
                }
                let take = buf.len().min(*remaining as usize).min(OUTPUT_CHUNK_SIZE);
                let chunk = Bytes::copy_from_slice(&buf[..take]);
                self.reader.consume(take);
                *remaining -= take as u64;
                self.crc.update(&chunk);
                Ok(Some(chunk))
            }
            BodyState::Deflate {
                inflater,
                remaining,
                finished,
            } => {
                let buf = self.reader.fill_buf().await?;
                let input = match remaining {
                    Some(r) => {
                        if *r == 0 {
                            bail!("Deflate stream did not end within its declared size");
                        }
                        &buf[..buf.len().min(*r as usize)]
                    }
                    None => buf,
                };
                if input.is_empty() {
                    bail!("Archive truncated inside entry data");
                }

                let mut out = vec![0u8; OUTPUT_CHUNK_SIZE];
                let before_in = inflater.total_in();
                let before_out = inflater.total_out();
                let status = inflater
                    .decompress(input, &mut out, FlushDecompress::None)
                    .map_err(|e| anyhow!("Inflate error in entry data: {e}"))?;

                let consumed = (inflater.total_in() - before_in) as usize;
                let produced = (inflater.total_out() - before_out) as usize;
                self.reader.consume(consumed);
                if let Some(r) = remaining {
                    *r -= consumed as u64;
                }
                if status == Status::StreamEnd {
                    *finished = true;
                }

                if produced > 0 {
                    out.truncate(produced);
                    self.crc.update(&out);
                    return Ok(Some(Bytes::from(out)));
                }
                if !*finished && consumed == 0 {
                    bail!("Inflate made no progress on entry data");
                }
                Ok(None)
            }
        }
    }

    async fn finish_body(&mut self) -> Result<()> {
        let expected_crc = if self.header.has_data_descriptor() {
            self.read_data_descriptor().await?.crc32
        } else {
            self.header.crc32
        };

        let actual = self.crc.sum();
        if actual != expected_crc {
            bail!(
                "CRC mismatch in {}: expected {expected_crc:08x}, computed {actual:08x}",
                self.header.file_name
            );
        }
        self.done = true;
        Ok(())
    }

    /// Consume the trailing data descriptor. Its 4-byte signature is
    /// optional; when absent the first word is already the CRC. Size fields
    /// are 8 bytes instead of 4 on entries with a ZIP64 extra field.
    async fn read_data_descriptor(&mut self) -> Result<DataDescriptor> {
        let mut first = [0u8; 4];
        self.reader.read_exact(&mut first).await?;

        let crc32 = if &first[..] == DATA_DESCRIPTOR_SIGNATURE {
            self.reader.read_u32_le().await?
        } else {
            u32::from_le_bytes(first)
        };
        let (compressed_size, uncompressed_size) = if self.header.zip64_extra {
            (
                self.reader.read_u64_le().await?,
                self.reader.read_u64_le().await?,
            )
        } else {
            (
                self.reader.read_u32_le().await? as u64,
                self.reader.read_u32_le().await? as u64,
            )
        };

        self.descriptor_read = true;
        Ok(DataDescriptor {
            crc32,
            compressed_size,
            uncompressed_size,
        })
    }
}
