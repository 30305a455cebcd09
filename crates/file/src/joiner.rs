use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::trace;
use voyager_localstore::{ModeGet, Storer};
use voyager_primitives::{Span, CHUNK_SIZE};

use crate::{crypto, FileError, Reference};

/// Prefetch window for spans up to 10 MB.
const SMALL_LOOKAHEAD: usize = 256 * 1024;
/// Prefetch window for larger spans.
const LARGE_LOOKAHEAD: usize = 512 * 1024;

/// The sequential-read window for a file of the given span.
pub fn lookahead_buffer_size(span: u64) -> usize {
    if span <= 10_000_000 {
        SMALL_LOOKAHEAD
    } else {
        LARGE_LOOKAHEAD
    }
}

/// Lazily resolves a hash tree back into its byte range.
pub struct Joiner {
    store: Arc<dyn Storer>,
    root: Reference,
    span: Span,
    ref_size: usize,
}

impl std::fmt::Debug for Joiner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Joiner")
            .field("root", &self.root.address)
            .field("span", &self.span)
            .finish_non_exhaustive()
    }
}

impl Joiner {
    /// Opens the tree at `root`, reading the root chunk to learn the total
    /// span.
    pub async fn open(store: Arc<dyn Storer>, root: Reference) -> Result<Self, FileError> {
        let ref_size = root.size();
        let chunk = store.get(ModeGet::Request, &root.address).await?;
        let span = chunk.span();
        trace!(root = %root.address, span, "joiner open");
        Ok(Self {
            store,
            root,
            span,
            ref_size,
        })
    }

    /// Total number of content bytes under the root.
    pub fn size(&self) -> u64 {
        self.span
    }

    /// Reads up to `buf.len()` bytes at `offset` into `buf`; returns the
    /// number of bytes read, 0 at or past the end.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FileError> {
        if offset >= self.span {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.span - offset) as usize;
        self.read_chunk(self.root, self.span, offset, &mut buf[..want])
            .await?;
        Ok(want)
    }

    /// Reads `buf.len()` bytes at `offset` from the subtree at `reference`
    /// covering `span` bytes. Caller bounds `buf` within the subtree.
    fn read_chunk<'a>(
        &'a self,
        reference: Reference,
        span: Span,
        offset: u64,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<(), FileError>> {
        Box::pin(async move {
            let payload = self.fetch_payload(&reference).await?;

            // A subtree fitting one chunk's worth of bytes is a leaf.
            if span <= CHUNK_SIZE as u64 {
                let start = offset as usize;
                let end = start + buf.len();
                if end > payload.len() {
                    return Err(FileError::OutOfBounds { offset, span });
                }
                buf.copy_from_slice(&payload[start..end]);
                return Ok(());
            }

            if payload.len() % self.ref_size != 0 || payload.is_empty() {
                return Err(FileError::MalformedBranch);
            }
            let capacity = child_capacity(span, self.ref_size);
            let children = payload.len() / self.ref_size;

            let mut child = (offset / capacity) as usize;
            let mut offset = offset - child as u64 * capacity;
            let mut filled = 0usize;
            while filled < buf.len() {
                if child >= children {
                    return Err(FileError::MalformedBranch);
                }
                let child_span = capacity.min(span - child as u64 * capacity);
                let reference = Reference::from_bytes(
                    &payload[child * self.ref_size..(child + 1) * self.ref_size],
                )?;
                let take = ((child_span - offset) as usize).min(buf.len() - filled);
                self.read_chunk(
                    reference,
                    child_span,
                    offset,
                    &mut buf[filled..filled + take],
                )
                .await?;
                filled += take;
                offset = 0;
                child += 1;
            }
            Ok(())
        })
    }

    async fn fetch_payload(&self, reference: &Reference) -> Result<Bytes, FileError> {
        let chunk = self.store.get(ModeGet::Request, &reference.address).await?;
        let payload = chunk.data().slice(voyager_primitives::SPAN_SIZE..);
        match &reference.key {
            None => Ok(payload),
            Some(key) => {
                let mut decrypted = payload.to_vec();
                crypto::apply_keystream(key, &mut decrypted);
                Ok(Bytes::from(decrypted))
            }
        }
    }
}

/// Bytes covered by each child of an interior chunk spanning `span` bytes:
/// the largest power of the branching factor times the chunk size that
/// still needs multiple children for `span`.
fn child_capacity(span: Span, ref_size: usize) -> u64 {
    let branches = (CHUNK_SIZE / ref_size) as u64;
    let mut capacity = CHUNK_SIZE as u64;
    while capacity * branches < span {
        capacity *= branches;
    }
    capacity
}

/// Sequential reader over a [`Joiner`], refilling a lookahead-sized window
/// to amortize chunk fetches.
pub struct JoinReader {
    joiner: Joiner,
    window: Vec<u8>,
    window_pos: usize,
    pos: u64,
}

impl std::fmt::Debug for JoinReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinReader")
            .field("pos", &self.pos)
            .finish_non_exhaustive()
    }
}

impl JoinReader {
    /// Creates a reader positioned at the start.
    pub fn new(joiner: Joiner) -> Self {
        Self {
            joiner,
            window: Vec::new(),
            window_pos: 0,
            pos: 0,
        }
    }

    /// Reads up to `out.len()` bytes, 0 at the end of content.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize, FileError> {
        if self.window_pos >= self.window.len() {
            let want = lookahead_buffer_size(self.joiner.size())
                .min((self.joiner.size() - self.pos.min(self.joiner.size())) as usize);
            if want == 0 {
                return Ok(0);
            }
            self.window.resize(want, 0);
            let got = self.joiner.read_at(&mut self.window, self.pos).await?;
            self.window.truncate(got);
            self.window_pos = 0;
            self.pos += got as u64;
            if got == 0 {
                return Ok(0);
            }
        }
        let take = out.len().min(self.window.len() - self.window_pos);
        out[..take].copy_from_slice(&self.window[self.window_pos..self.window_pos + take]);
        self.window_pos += take;
        Ok(take)
    }
}

/// Joins the whole tree at `root` into one buffer.
pub async fn join_all(store: Arc<dyn Storer>, root: Reference) -> Result<Vec<u8>, FileError> {
    let joiner = Joiner::open(store, root).await?;
    let size = joiner.size() as usize;
    let mut out = vec![0u8; size];
    let mut reader = JoinReader::new(joiner);
    let mut filled = 0;
    while filled < size {
        let n = reader.read(&mut out[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    out.truncate(filled);
    Ok(out)
}
