//! Streaming checkpoint codec
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! header    "SHRDCKPT" u32 version
//! leaf      0x01 u32 path_len path u8 dtype u32 rank u64 dims[rank] u64 nbytes bytes
//! metadata  0x02 u64 len json
//! end       0x03 u64 leaf_count [32] sha256(all preceding bytes)
//! ```
//!
//! Leaf records come first, in enumeration order, then exactly one metadata
//! record and the end record. A file without the end record is truncated.

use super::record::CheckpointMetadata;
use crate::tree::{DType, Leaf, LeafShape};
use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

pub const MAGIC: &[u8; 8] = b"SHRDCKPT";
pub const VERSION: u32 = 1;

const TAG_LEAF: u8 = 0x01;
const TAG_METADATA: u8 = 0x02;
const TAG_END: u8 = 0x03;
const DIGEST_LEN: usize = 32;

// Sanity caps so a damaged header cannot trigger huge allocations.
const MAX_PATH_LEN: u32 = 1 << 16;
const MAX_RANK: u32 = 32;
const MAX_METADATA_LEN: u64 = 1 << 30;

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Appends records to a checkpoint stream
pub struct CheckpointWriter<W: Write> {
    out: HashingWriter<W>,
    leaves: u64,
    payload_bytes: u64,
}

impl<W: Write> CheckpointWriter<W> {
    pub fn new(inner: W) -> io::Result<Self> {
        let mut out = HashingWriter {
            inner,
            hasher: Sha256::new(),
            written: 0,
        };
        out.write_all(MAGIC)?;
        out.write_u32::<LittleEndian>(VERSION)?;
        Ok(Self {
            out,
            leaves: 0,
            payload_bytes: 0,
        })
    }

    pub fn write_leaf(&mut self, path: &str, leaf: &Leaf) -> io::Result<()> {
        let nbytes = (leaf.numel() * leaf.dtype().size_of()) as u64;
        self.out.write_u8(TAG_LEAF)?;
        self.out.write_u32::<LittleEndian>(path.len() as u32)?;
        self.out.write_all(path.as_bytes())?;
        self.out.write_u8(leaf.dtype().tag())?;
        self.out.write_u32::<LittleEndian>(leaf.rank() as u32)?;
        for &dim in leaf.shape() {
            self.out.write_u64::<LittleEndian>(dim as u64)?;
        }
        self.out.write_u64::<LittleEndian>(nbytes)?;
        leaf.write_raw(&mut self.out)?;
        self.leaves += 1;
        self.payload_bytes += nbytes;
        Ok(())
    }

    pub fn write_metadata(&mut self, metadata: &CheckpointMetadata) -> Result<()> {
        let json = serde_json::to_vec(metadata)
            .map_err(|e| Error::Serialization(format!("checkpoint metadata: {e}")))?;
        self.out.write_u8(TAG_METADATA)?;
        self.out.write_u64::<LittleEndian>(json.len() as u64)?;
        self.out.write_all(&json)?;
        Ok(())
    }

    /// Write the end record and hand back the underlying writer
    pub fn finish(mut self) -> io::Result<W> {
        self.out.write_u8(TAG_END)?;
        self.out.write_u64::<LittleEndian>(self.leaves)?;
        let digest = self.out.hasher.clone().finalize();
        let mut inner = self.out.inner;
        inner.write_all(&digest)?;
        inner.flush()?;
        Ok(inner)
    }

    pub fn leaves_written(&self) -> u64 {
        self.leaves
    }

    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes
    }
}

struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    offset: u64,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.offset += n as u64;
        Ok(n)
    }
}

/// Header of a leaf record; the payload follows in the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafHeader {
    pub path: String,
    pub shape: LeafShape,
    pub nbytes: u64,
    /// Offset of the record tag
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Leaf(LeafHeader),
    Metadata(CheckpointMetadata),
    End,
}

/// Reads records from a checkpoint stream, verifying its digest
///
/// After [`Record::Leaf`] the caller must consume the payload with
/// [`CheckpointReader::read_leaf`] or [`CheckpointReader::skip_leaf`]
/// before asking for the next record.
pub struct CheckpointReader<R: Read> {
    input: HashingReader<R>,
    path: PathBuf,
    len: u64,
    leaves: u64,
    metadata_seen: bool,
    metadata_offset: Option<u64>,
}

impl<R: Read> CheckpointReader<R> {
    /// `len` is the total length of the stream; no record may claim more
    /// bytes than remain after its header.
    pub fn new(inner: R, path: &Path, len: u64) -> Result<Self> {
        let mut reader = Self {
            input: HashingReader {
                inner,
                hasher: Sha256::new(),
                offset: 0,
            },
            path: path.to_path_buf(),
            len,
            leaves: 0,
            metadata_seen: false,
            metadata_offset: None,
        };
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(reader.corrupt("not a shardtrain checkpoint"));
        }
        let version = reader.input.read_u32::<LittleEndian>().map_err(|e| reader.io(e))?;
        if version != VERSION {
            return Err(reader.corrupt(format!("unsupported format version {version}")));
        }
        Ok(reader)
    }

    /// Current byte offset in the stream
    pub fn offset(&self) -> u64 {
        self.input.offset
    }

    /// Offset of the metadata record, once it has been read
    pub fn metadata_offset(&self) -> Option<u64> {
        self.metadata_offset
    }

    fn truncated(&self, reason: impl Into<String>) -> Error {
        Error::TruncatedCheckpoint {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn corrupt(&self, reason: impl Into<String>) -> Error {
        Error::CorruptCheckpoint {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn io(&self, err: io::Error) -> Error {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            self.truncated(format!("unexpected end of file at offset {}", self.input.offset))
        } else {
            Error::Io(err)
        }
    }

    fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.input.offset)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.input.read_exact(buf).map_err(|e| self.io(e))
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.input.read_u32::<LittleEndian>().map_err(|e| self.io(e))
    }

    fn read_u64(&mut self) -> Result<u64> {
        self.input.read_u64::<LittleEndian>().map_err(|e| self.io(e))
    }

    pub fn next_record(&mut self) -> Result<Record> {
        let offset = self.input.offset;
        let tag = match self.input.read_u8() {
            Ok(tag) => tag,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(self.truncated(if self.metadata_seen {
                    "missing end record"
                } else {
                    "missing metadata record"
                }));
            }
            Err(e) => return Err(Error::Io(e)),
        };
        match tag {
            TAG_LEAF => {
                if self.metadata_seen {
                    return Err(self.corrupt(format!("leaf record after metadata at offset {offset}")));
                }
                self.read_leaf_header(offset).map(Record::Leaf)
            }
            TAG_METADATA => {
                if self.metadata_seen {
                    return Err(self.corrupt("duplicate metadata record"));
                }
                let len = self.read_u64()?;
                if len > MAX_METADATA_LEN {
                    return Err(self.corrupt(format!("metadata length {len} is implausible")));
                }
                if len > self.remaining() {
                    return Err(self.truncated(format!(
                        "metadata needs {len} bytes, only {} remain",
                        self.remaining()
                    )));
                }
                let mut json = vec![0u8; len as usize];
                self.read_exact(&mut json)?;
                let metadata = serde_json::from_slice(&json)
                    .map_err(|e| self.corrupt(format!("metadata is not valid JSON: {e}")))?;
                self.metadata_seen = true;
                self.metadata_offset = Some(offset);
                Ok(Record::Metadata(metadata))
            }
            TAG_END => {
                if !self.metadata_seen {
                    return Err(self.corrupt("end record before metadata"));
                }
                let count = self.read_u64()?;
                let expected = self.input.hasher.clone().finalize();
                let mut digest = [0u8; DIGEST_LEN];
                self.input
                    .inner
                    .read_exact(&mut digest)
                    .map_err(|e| match e.kind() {
                        io::ErrorKind::UnexpectedEof => self.truncated("incomplete end record"),
                        _ => Error::Io(e),
                    })?;
                if digest[..] != expected[..] {
                    return Err(self.corrupt("digest mismatch"));
                }
                if count != self.leaves {
                    return Err(self.corrupt(format!(
                        "end record counts {count} leaves, found {}",
                        self.leaves
                    )));
                }
                let mut trailing = [0u8; 1];
                if self.input.inner.read(&mut trailing)? != 0 {
                    return Err(self.corrupt("trailing bytes after end record"));
                }
                Ok(Record::End)
            }
            other => Err(self.corrupt(format!("unknown record tag {other:#04x} at offset {offset}"))),
        }
    }

    fn read_leaf_header(&mut self, offset: u64) -> Result<LeafHeader> {
        let path_len = self.read_u32()?;
        if path_len > MAX_PATH_LEN {
            return Err(self.corrupt(format!("path length {path_len} at offset {offset} is implausible")));
        }
        let mut path = vec![0u8; path_len as usize];
        self.read_exact(&mut path)?;
        let path = String::from_utf8(path)
            .map_err(|_| self.corrupt(format!("leaf path at offset {offset} is not UTF-8")))?;

        let mut tag = [0u8; 1];
        self.read_exact(&mut tag)?;
        let dtype = DType::from_tag(tag[0])
            .ok_or_else(|| self.corrupt(format!("unknown dtype tag {} for '{path}'", tag[0])))?;

        let rank = self.read_u32()?;
        if rank > MAX_RANK {
            return Err(self.corrupt(format!("rank {rank} for '{path}' is implausible")));
        }
        let mut dims = Vec::with_capacity(rank as usize);
        for _ in 0..rank {
            let dim = self.read_u64()?;
            let dim = usize::try_from(dim)
                .map_err(|_| self.corrupt(format!("dimension {dim} of '{path}' does not fit in memory")))?;
            dims.push(dim);
        }
        let shape = LeafShape::new(dims, dtype);
        let expected = shape.checked_nbytes().ok_or_else(|| {
            self.corrupt(format!("size of '{path}' {:?} overflows", shape.shape))
        })?;
        let nbytes = self.read_u64()?;
        if nbytes != expected as u64 {
            return Err(self.corrupt(format!(
                "'{path}' declares {nbytes} bytes for {dtype} {:?}",
                shape.shape
            )));
        }
        if nbytes > self.remaining() {
            return Err(self.truncated(format!(
                "payload of '{path}' needs {nbytes} bytes, only {} remain",
                self.remaining()
            )));
        }
        Ok(LeafHeader {
            path,
            shape,
            nbytes,
            offset,
        })
    }

    /// Read the payload announced by `header`
    pub fn read_leaf(&mut self, header: &LeafHeader) -> Result<Leaf> {
        let mut bytes = vec![0u8; header.nbytes as usize];
        self.read_exact(&mut bytes)?;
        self.leaves += 1;
        Leaf::from_raw(&header.shape, &bytes)
    }

    /// Consume the payload announced by `header` without keeping it
    pub fn skip_leaf(&mut self, header: &LeafHeader) -> Result<()> {
        let copied = io::copy(&mut (&mut self.input).take(header.nbytes), &mut io::sink())?;
        if copied < header.nbytes {
            return Err(self.truncated(format!("payload of '{}' is cut short", header.path)));
        }
        self.leaves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_file() -> Vec<u8> {
        let mut writer = CheckpointWriter::new(Vec::new()).unwrap();
        writer
            .write_leaf("params.a", &Leaf::f32(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap())
            .unwrap();
        writer.write_leaf("params.b", &Leaf::i64(&[1], vec![-7]).unwrap()).unwrap();
        writer.write_metadata(&CheckpointMetadata::new(12)).unwrap();
        writer.finish().unwrap()
    }

    fn read_all(bytes: &[u8]) -> Result<(Vec<(String, Leaf)>, CheckpointMetadata)> {
        let mut reader = CheckpointReader::new(Cursor::new(bytes), Path::new("mem"), bytes.len() as u64)?;
        let mut leaves = Vec::new();
        let mut metadata = None;
        loop {
            match reader.next_record()? {
                Record::Leaf(header) => {
                    let leaf = reader.read_leaf(&header)?;
                    leaves.push((header.path, leaf));
                }
                Record::Metadata(m) => metadata = Some(m),
                Record::End => break,
            }
        }
        Ok((leaves, metadata.unwrap()))
    }

    #[test]
    fn test_reads_back_leaves_in_order() {
        let (leaves, metadata) = read_all(&sample_file()).unwrap();
        assert_eq!(metadata.step, 12);
        assert_eq!(leaves[0].0, "params.a");
        assert_eq!(leaves[1].1, Leaf::i64(&[1], vec![-7]).unwrap());
    }

    #[test]
    fn test_header_layout() {
        let bytes = sample_file();
        assert_eq!(&bytes[..8], MAGIC);
        assert_eq!(&bytes[8..12], &VERSION.to_le_bytes());
        assert_eq!(bytes[12], TAG_LEAF);
    }

    #[test]
    fn test_every_truncation_is_detected() {
        let bytes = sample_file();
        for cut in 0..bytes.len() {
            match read_all(&bytes[..cut]) {
                Err(Error::TruncatedCheckpoint { .. }) => {}
                // A cut inside the magic looks like a foreign file.
                Err(Error::CorruptCheckpoint { .. }) if cut < 12 => {}
                other => panic!("cut at {cut}: unexpected {:?}", other.map(|_| ())),
            }
        }
    }

    /// A file holding only the header and one leaf record header
    fn lone_leaf_header(dtype: DType, dims: &[u64], nbytes: u64) -> Vec<u8> {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.push(TAG_LEAF);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(b'a');
        bytes.push(dtype.tag());
        bytes.extend_from_slice(&(dims.len() as u32).to_le_bytes());
        for dim in dims {
            bytes.extend_from_slice(&dim.to_le_bytes());
        }
        bytes.extend_from_slice(&nbytes.to_le_bytes());
        bytes
    }

    #[test]
    fn test_overflowing_dims_are_corrupt() {
        let bytes = lone_leaf_header(DType::F32, &[1 << 40, 1 << 40], 0);
        match read_all(&bytes) {
            Err(Error::CorruptCheckpoint { reason, .. }) => assert!(reason.contains("overflows"), "{reason}"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_payload_longer_than_file_is_truncated() {
        // 1 GiB of f32 announced by a file a few dozen bytes long
        let bytes = lone_leaf_header(DType::F32, &[1 << 28], 1 << 30);
        match read_all(&bytes) {
            Err(Error::TruncatedCheckpoint { reason, .. }) => assert!(reason.contains("only 0 remain"), "{reason}"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_missing_metadata_reported() {
        let mut writer = CheckpointWriter::new(Vec::new()).unwrap();
        writer.write_leaf("params.a", &Leaf::scalar_f32(1.0)).unwrap();
        let bytes = writer.out.inner.clone();
        match read_all(&bytes) {
            Err(Error::TruncatedCheckpoint { reason, .. }) => assert_eq!(reason, "missing metadata record"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_flipped_payload_byte_is_corrupt() {
        let mut bytes = sample_file();
        // first payload byte of params.a: header(12) + tag + len + path + dtype + rank + 2 dims + nbytes
        let payload = 12 + 1 + 4 + "params.a".len() + 1 + 4 + 16 + 8;
        bytes[payload] ^= 0xff;
        assert!(matches!(read_all(&bytes), Err(Error::CorruptCheckpoint { .. })));
    }

    #[test]
    fn test_trailing_garbage_is_corrupt() {
        let mut bytes = sample_file();
        bytes.push(0);
        assert!(matches!(read_all(&bytes), Err(Error::CorruptCheckpoint { .. })));
    }

    #[test]
    fn test_skip_leaf_keeps_digest_valid() {
        let bytes = sample_file();
        let mut reader =
            CheckpointReader::new(Cursor::new(&bytes[..]), Path::new("mem"), bytes.len() as u64).unwrap();
        loop {
            match reader.next_record().unwrap() {
                Record::Leaf(header) => reader.skip_leaf(&header).unwrap(),
                Record::Metadata(_) => assert!(reader.metadata_offset().is_some()),
                Record::End => break,
            }
        }
    }
}
