/// Put modes control which indexes a stored chunk enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModePut {
    /// A locally split chunk destined for the network: queued for push.
    Upload,
    /// Like [`ModePut::Upload`], and additionally pinned.
    UploadPin,
    /// A chunk fetched on behalf of a request: a garbage-collectable cache
    /// entry.
    Request,
    /// A chunk received through sync: stored without scheduling any push.
    Sync,
}

/// Get modes control whether a read refreshes the eviction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeGet {
    /// A user-facing read: refreshes the access timestamp and GC position.
    Request,
    /// A protocol-facing read: no index updates.
    Sync,
    /// A purely observational read with no side effects.
    Lookup,
    /// A read of pinned content: no index updates.
    Pin,
}

/// Set modes mutate index state without touching chunk data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSet {
    /// The chunk was propagated: leave the push queue, become GC-eligible.
    Sync,
    /// Drop the chunk and all its index entries.
    Remove,
    /// Increment the pin counter, excluding the chunk from GC.
    Pin,
    /// Decrement the pin counter; at zero the chunk is GC-eligible again.
    Unpin,
}
