use std::sync::Arc;

use futures::{AsyncRead, AsyncReadExt};
use tracing::trace;
use voyager_localstore::{ModePut, Storer};
use voyager_primitives::{ContentChunk, Span, SwarmAddress, BRANCHES, CHUNK_SIZE,
    ENCRYPTED_BRANCHES};
use voyager_tags::{Tag, TagState};

use crate::{crypto, FileError, Reference};

/// Splits byte streams into hash trees of chunks.
///
/// Leaves are cut every [`CHUNK_SIZE`] bytes regardless of how the input
/// arrives, so the root reference depends only on content.
pub struct Splitter {
    store: Arc<dyn Storer>,
    mode: ModePut,
    encrypt: bool,
}

impl std::fmt::Debug for Splitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Splitter")
            .field("mode", &self.mode)
            .field("encrypt", &self.encrypt)
            .finish_non_exhaustive()
    }
}

/// One level of the tree under construction: buffered child references and
/// the byte count they cover.
#[derive(Default)]
struct Level {
    refs: Vec<Vec<u8>>,
    spans: Vec<Span>,
}

impl Level {
    fn push(&mut self, reference: &Reference, span: Span) {
        self.refs.push(reference.to_bytes());
        self.spans.push(span);
    }

    fn drain(&mut self) -> (Vec<u8>, Span) {
        let payload = self.refs.concat();
        let span = self.spans.iter().sum();
        self.refs.clear();
        self.spans.clear();
        (payload, span)
    }
}

impl Splitter {
    /// Creates a splitter storing chunks with the given put mode.
    pub fn new(store: Arc<dyn Storer>, mode: ModePut, encrypt: bool) -> Self {
        Self {
            store,
            mode,
            encrypt,
        }
    }

    fn branches(&self) -> usize {
        if self.encrypt {
            ENCRYPTED_BRANCHES
        } else {
            BRANCHES
        }
    }

    /// Splits exactly `length` bytes of `reader` into chunks and returns
    /// the root reference. The tag, when present, counts every chunk and
    /// is stamped with the root.
    pub async fn split(
        &self,
        mut reader: impl AsyncRead + Unpin + Send,
        length: u64,
        tag: Option<&Tag>,
    ) -> Result<Reference, FileError> {
        let mut levels: Vec<Level> = vec![Level::default()];
        let mut remaining = length;
        let mut leaf = vec![0u8; CHUNK_SIZE];

        while remaining > 0 {
            let take = remaining.min(CHUNK_SIZE as u64) as usize;
            // Fill the whole leaf no matter how the reader fragments its
            // output; addresses must not depend on pipe buffering.
            reader
                .read_exact(&mut leaf[..take])
                .await
                .map_err(|err| match err.kind() {
                    std::io::ErrorKind::UnexpectedEof => FileError::UnexpectedEof {
                        expected: length,
                        got: length - remaining,
                    },
                    _ => FileError::Io(err),
                })?;
            remaining -= take as u64;

            let reference = self
                .create_chunk(take as Span, leaf[..take].to_vec(), tag)
                .await?;
            self.append(&mut levels, 0, reference, take as Span, tag)
                .await?;
        }

        if length == 0 {
            // An empty stream is one empty chunk.
            let root = self.create_chunk(0, Vec::new(), tag).await?;
            if let Some(tag) = tag {
                tag.done_split(root.address);
            }
            return Ok(root);
        }

        let root = self.finish(levels, tag).await?;
        if let Some(tag) = tag {
            tag.done_split(root.address);
        }
        trace!(root = %root.address, length, "split done");
        Ok(root)
    }

    /// Adds a reference at `level`, packing full levels into parent chunks
    /// as they fill up.
    async fn append(
        &self,
        levels: &mut Vec<Level>,
        level: usize,
        reference: Reference,
        span: Span,
        tag: Option<&Tag>,
    ) -> Result<(), FileError> {
        let mut level = level;
        let mut reference = reference;
        let mut span = span;
        loop {
            if levels.len() <= level {
                levels.push(Level::default());
            }
            levels[level].push(&reference, span);
            if levels[level].refs.len() < self.branches() {
                return Ok(());
            }
            let (payload, level_span) = levels[level].drain();
            reference = self.create_chunk(level_span, payload, tag).await?;
            span = level_span;
            level += 1;
        }
    }

    /// Folds the partial levels into the root once the input is consumed.
    async fn finish(
        &self,
        mut levels: Vec<Level>,
        tag: Option<&Tag>,
    ) -> Result<Reference, FileError> {
        let mut level = 0;
        loop {
            let is_top = level + 1 >= levels.len();
            let count = levels[level].refs.len();

            if count == 0 {
                level += 1;
                continue;
            }
            if count == 1 {
                let reference = Reference::from_bytes(&levels[level].refs[0])?;
                let span = levels[level].spans[0];
                if is_top {
                    return Ok(reference);
                }
                // A lone subtree is carried upward as-is; short branches
                // are allowed, single-child chains are not.
                levels[level].refs.clear();
                levels[level].spans.clear();
                levels[level + 1].push(&reference, span);
                level += 1;
                continue;
            }

            let (payload, span) = levels[level].drain();
            let reference = self.create_chunk(span, payload, tag).await?;
            if is_top {
                levels.push(Level::default());
            }
            levels[level + 1].push(&reference, span);
            level += 1;
        }
    }

    /// Builds, optionally encrypts, and stores one chunk.
    async fn create_chunk(
        &self,
        span: Span,
        mut payload: Vec<u8>,
        tag: Option<&Tag>,
    ) -> Result<Reference, FileError> {
        let key = match self.encrypt {
            true => {
                let key = crypto::random_key();
                crypto::apply_keystream(&key, &mut payload);
                Some(key)
            }
            false => None,
        };

        let chunk = ContentChunk::new_with_span(span, payload)?;
        let address: SwarmAddress = chunk.address();
        let seen = self.store.put(self.mode, &[chunk.into()]).await?;

        if let Some(tag) = tag {
            tag.inc(TagState::Split);
            tag.inc(TagState::Stored);
            if seen.first().copied().unwrap_or(false) {
                tag.inc(TagState::Seen);
            }
        }
        Ok(Reference { address, key })
    }
}
