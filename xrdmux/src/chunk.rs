//! Scatter/gather fragment descriptors.

use bytes::{Bytes, BytesMut};

/// One fragment of a scattered read: `len` bytes starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoChunk {
    /// Byte offset into the file.
    pub offset: u64,
    /// Number of bytes to read.
    pub len: u64,
}

impl IoChunk {
    /// Creates a fragment descriptor.
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// First byte past the end of the fragment.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// A fragment together with the data that was read for it.
#[derive(Debug, Clone)]
pub(crate) struct FilledChunk {
    pub offset: u64,
    pub data: Bytes,
}

/// Sum of the fragment sizes in `chunks`.
pub(crate) fn total_size(chunks: &[IoChunk]) -> u64 {
    chunks.iter().map(|c| c.len).sum()
}

/// Carves the results of a split read back into the caller's original
/// fragment layout.
///
/// `parts` must exactly cover the byte ranges of `original`, in any order;
/// the splitter guarantees this. Individual parts may be coalesced across
/// original fragment boundaries or capped below them, so an output buffer
/// is stitched from as many part slices as it spans. Slicing is zero-copy;
/// only buffers crossing part boundaries are reallocated.
pub(crate) fn reassemble(original: &[IoChunk], mut parts: Vec<FilledChunk>) -> Vec<Bytes> {
    parts.sort_by_key(|p| p.offset);

    let mut out = Vec::with_capacity(original.len());
    let mut part = 0usize;
    let mut consumed = 0usize;

    for chunk in original {
        if chunk.len == 0 {
            out.push(Bytes::new());
            continue;
        }
        let mut need = chunk.len as usize;
        let mut pieces: Vec<Bytes> = Vec::new();
        while need > 0 {
            assert!(
                part < parts.len(),
                "read results do not cover the requested ranges"
            );
            let p = &parts[part];
            debug_assert_eq!(
                p.offset + consumed as u64,
                chunk.end() - need as u64,
                "read results are not contiguous with the requested ranges"
            );
            let take = (p.data.len() - consumed).min(need);
            pieces.push(p.data.slice(consumed..consumed + take));
            consumed += take;
            need -= take;
            if consumed == p.data.len() {
                part += 1;
                consumed = 0;
            }
        }
        if pieces.len() == 1 {
            out.push(pieces.remove(0));
        } else {
            let mut buf = BytesMut::with_capacity(chunk.len as usize);
            for piece in &pieces {
                buf.extend_from_slice(piece);
            }
            out.push(buf.freeze());
        }
    }
    out
}
