//! Binary artifact format.
//!
//! ```text
//! magic     4 bytes    per artifact ("QVXI", "QVXC", "QVXM")
//! version   u32 LE
//! generation u64 LE
//! count     u64 LE     number of records (rows for the index)
//! payload   ...
//! digest    32 bytes   blake3 of everything above
//! ```
//!
//! Payloads:
//! - index: `dimension u32`, `count * dimension` f32 LE, `tombstones u64`, positions `u64` each
//! - chunks: per record, length-prefixed (`u32`) chunk id then length-prefixed text
//! - metadata: per record, length-prefixed JSON `ChunkMetadata`

use super::{ArtifactKind, FORMAT_VERSION, StoredChunk};
use crate::error::{Result, RetrievalError};
use crate::retrieval::vector_index::FlatIndex;
use quarry_context::{ChunkId, ChunkMetadata};
use std::sync::Arc;

/// Magic, version, generation, and record count
pub const HEADER_LEN: usize = 4 + 4 + 8 + 8;
/// Length of the blake3 footer
pub const DIGEST_LEN: usize = 32;

fn magic(kind: ArtifactKind) -> &'static [u8; 4] {
    match kind {
        ArtifactKind::Index => b"QVXI",
        ArtifactKind::Chunks => b"QVXC",
        ArtifactKind::Metadata | ArtifactKind::Config => b"QVXM",
    }
}

/// Verified header of a binary artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub generation: u64,
    pub count: u64,
    pub checksum: String,
}

fn corrupt(kind: ArtifactKind, reason: impl Into<String>) -> RetrievalError {
    RetrievalError::corrupt(kind.file_name(), reason)
}

fn seal(kind: ArtifactKind, generation: u64, count: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + DIGEST_LEN);
    out.extend_from_slice(magic(kind));
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&generation.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(payload);
    let digest = blake3::hash(&out);
    out.extend_from_slice(digest.as_bytes());
    out
}

/// Check magic, version, and digest; return the header and the payload.
pub fn open(kind: ArtifactKind, bytes: &[u8]) -> Result<(Header, &[u8])> {
    if bytes.len() < HEADER_LEN + DIGEST_LEN {
        return Err(corrupt(kind, format!("truncated ({} bytes)", bytes.len())));
    }
    if &bytes[..4] != magic(kind) {
        return Err(corrupt(kind, "bad magic bytes"));
    }

    let (body, footer) = bytes.split_at(bytes.len() - DIGEST_LEN);
    verify_digest(kind, blake3::hash(body), footer)?;
    let header = parse_header(kind, &body[..HEADER_LEN], footer)?;
    Ok((header, &body[HEADER_LEN..]))
}

/// Decode the fixed-size header. `footer` is the digest already verified against the body.
pub fn parse_header(kind: ArtifactKind, header: &[u8], footer: &[u8]) -> Result<Header> {
    if header.len() != HEADER_LEN {
        return Err(corrupt(kind, format!("truncated header ({} bytes)", header.len())));
    }
    if &header[..4] != magic(kind) {
        return Err(corrupt(kind, "bad magic bytes"));
    }

    let mut reader = Reader::new(kind, &header[4..]);
    let version = reader.u32()?;
    if version != FORMAT_VERSION {
        return Err(corrupt(
            kind,
            format!("unsupported format version {version} (expected {FORMAT_VERSION})"),
        ));
    }
    Ok(Header {
        generation: reader.u64()?,
        count: reader.u64()?,
        checksum: hex::encode(footer),
    })
}

/// Compare a digest computed over header and payload with the stored footer.
pub fn verify_digest(kind: ArtifactKind, digest: blake3::Hash, footer: &[u8]) -> Result<()> {
    if digest.as_bytes().as_slice() != footer {
        return Err(corrupt(kind, "checksum mismatch"));
    }
    Ok(())
}

/// Vectors and tombstones read from `index.qvx`
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedVectors {
    pub dimension: usize,
    pub data: Vec<f32>,
    pub tombstones: Vec<usize>,
}

pub fn encode_index(index: &FlatIndex, generation: u64) -> Vec<u8> {
    let tombstones = index.tombstones();
    let value_count = index.len() * index.dimension();
    let mut payload = Vec::with_capacity(4 + value_count * 4 + 8 + tombstones.len() * 8);

    payload.extend_from_slice(&(index.dimension() as u32).to_le_bytes());
    for values in index.segments() {
        if cfg!(target_endian = "little") {
            payload.extend_from_slice(bytemuck::cast_slice(values));
        } else {
            for value in values {
                payload.extend_from_slice(&value.to_le_bytes());
            }
        }
    }
    payload.extend_from_slice(&(tombstones.len() as u64).to_le_bytes());
    for position in tombstones {
        payload.extend_from_slice(&(position as u64).to_le_bytes());
    }

    seal(ArtifactKind::Index, generation, index.len() as u64, &payload)
}

pub fn decode_index(bytes: &[u8]) -> Result<(Header, DecodedVectors)> {
    let kind = ArtifactKind::Index;
    let (header, payload) = open(kind, bytes)?;
    let mut reader = Reader::new(kind, payload);

    let dimension = reader.u32()? as usize;
    if dimension == 0 {
        return Err(corrupt(kind, "dimension is zero"));
    }
    let rows = usize::try_from(header.count).map_err(|_| corrupt(kind, "row count overflow"))?;
    let value_bytes = rows
        .checked_mul(dimension)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| corrupt(kind, "row count overflow"))?;
    let raw = reader.bytes(value_bytes)?;
    // The payload offset gives no alignment guarantee, so borrow only when aligned.
    let data: Vec<f32> = match bytemuck::try_cast_slice::<u8, f32>(raw) {
        Ok(values) if cfg!(target_endian = "little") => values.to_vec(),
        _ => raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    };

    let tombstone_count = reader.u64()?;
    let mut tombstones = Vec::new();
    for _ in 0..tombstone_count {
        let position = reader.u64()? as usize;
        if position >= rows {
            return Err(corrupt(kind, format!("tombstone {position} beyond {rows} rows")));
        }
        tombstones.push(position);
    }
    reader.finish()?;

    Ok((
        header,
        DecodedVectors {
            dimension,
            data,
            tombstones,
        },
    ))
}

pub fn encode_chunks(chunks: &[Arc<StoredChunk>], generation: u64) -> Vec<u8> {
    let mut payload = Vec::new();
    for chunk in chunks {
        put_bytes(&mut payload, chunk.chunk_id.as_str().as_bytes());
        put_bytes(&mut payload, chunk.text.as_bytes());
    }
    seal(ArtifactKind::Chunks, generation, chunks.len() as u64, &payload)
}

pub fn decode_chunks(bytes: &[u8]) -> Result<(Header, Vec<Arc<StoredChunk>>)> {
    let kind = ArtifactKind::Chunks;
    let (header, payload) = open(kind, bytes)?;
    let mut reader = Reader::new(kind, payload);

    let mut chunks = Vec::new();
    for _ in 0..header.count {
        let chunk_id = ChunkId::from(reader.string()?);
        let text = reader.string()?;
        chunks.push(Arc::new(StoredChunk { chunk_id, text }));
    }
    reader.finish()?;
    Ok((header, chunks))
}

pub fn encode_metadata(metadata: &[Arc<ChunkMetadata>], generation: u64) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    for record in metadata {
        put_bytes(&mut payload, &serde_json::to_vec(record.as_ref())?);
    }
    Ok(seal(
        ArtifactKind::Metadata,
        generation,
        metadata.len() as u64,
        &payload,
    ))
}

pub fn decode_metadata(bytes: &[u8]) -> Result<(Header, Vec<Arc<ChunkMetadata>>)> {
    let kind = ArtifactKind::Metadata;
    let (header, payload) = open(kind, bytes)?;
    let mut reader = Reader::new(kind, payload);

    let mut metadata = Vec::new();
    for position in 0..header.count {
        let record = reader.bytes_prefixed()?;
        let parsed: ChunkMetadata = serde_json::from_slice(record)
            .map_err(|e| corrupt(kind, format!("record {position}: {e}")))?;
        metadata.push(Arc::new(parsed));
    }
    reader.finish()?;
    Ok((header, metadata))
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// Bounds-checked little-endian reader; every failure is a corrupt artifact.
struct Reader<'a> {
    kind: ArtifactKind,
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(kind: ArtifactKind, bytes: &'a [u8]) -> Self {
        Self {
            kind,
            bytes,
            offset: 0,
        }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| corrupt(self.kind, format!("unexpected end of data at byte {}", self.offset)))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    fn bytes_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }

    fn string(&mut self) -> Result<String> {
        let kind = self.kind;
        let raw = self.bytes_prefixed()?;
        String::from_utf8(raw.to_vec()).map_err(|e| corrupt(kind, e.to_string()))
    }

    fn finish(&self) -> Result<()> {
        if self.offset != self.bytes.len() {
            return Err(corrupt(
                self.kind,
                format!("{} trailing bytes", self.bytes.len() - self.offset),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> FlatIndex {
        let mut index = FlatIndex::new(3).unwrap();
        index
            .add(
                vec![vec![1.0, 2.0, 3.0], vec![-1.0, 0.5, 0.0], vec![0.0, 0.0, 1.0]],
                vec!["a#0".into(), "a#1".into(), "b#0".into()],
            )
            .unwrap();
        index.remove(&[ChunkId::from("a#1")]);
        index
    }

    #[test]
    fn test_index_payload_preserves_bits() -> Result<()> {
        let index = sample_index();
        let (header, decoded) = decode_index(&encode_index(&index, 7))?;

        assert_eq!(header.generation, 7);
        assert_eq!(header.count, 3);
        assert_eq!(decoded.dimension, 3);
        assert_eq!(decoded.tombstones, vec![1]);
        let original: Vec<u32> = index.segments().flatten().map(|v| v.to_bits()).collect();
        let restored: Vec<u32> = decoded.data.iter().map(|v| v.to_bits()).collect();
        assert_eq!(original, restored);
        Ok(())
    }

    #[test]
    fn test_chunk_text_with_unicode() -> Result<()> {
        let chunks = vec![
            Arc::new(StoredChunk {
                chunk_id: "tender-12#0".into(),
                text: "Straßenbau – Los 2".to_string(),
            }),
            Arc::new(StoredChunk {
                chunk_id: "tender-12#1".into(),
                text: String::new(),
            }),
        ];
        let (header, decoded) = decode_chunks(&encode_chunks(&chunks, 1))?;
        assert_eq!(header.count, 2);
        assert_eq!(decoded, chunks);
        Ok(())
    }

    #[test]
    fn test_flipped_byte_fails_checksum() {
        let mut bytes = encode_index(&sample_index(), 1);
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xff;

        let err = decode_index(&bytes).unwrap_err();
        match err {
            RetrievalError::CorruptArtifact { artifact, reason } => {
                assert_eq!(artifact, "index.qvx");
                assert!(reason.contains("checksum"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_wrong_artifact_kind_rejected() {
        let bytes = encode_chunks(&[], 1);
        assert!(matches!(
            decode_index(&bytes),
            Err(RetrievalError::CorruptArtifact { .. })
        ));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let bytes = encode_index(&sample_index(), 1);
        assert!(decode_index(&bytes[..10]).is_err());
        assert!(decode_index(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_checksum_is_hex() -> Result<()> {
        let (header, _) = open(ArtifactKind::Chunks, &encode_chunks(&[], 3))?;
        assert_eq!(header.checksum.len(), 64);
        assert!(header.checksum.chars().all(|c| c.is_ascii_hexdigit()));
        Ok(())
    }
}
