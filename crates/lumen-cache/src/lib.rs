#![forbid(unsafe_code)]

//! Client-visible caches of the lumen display server.
//!
//! - [`pixmap`]: the process-wide pixmap cache, shared by every channel
//!   client that belongs to the same logical remote party, with
//!   freeze/thaw semantics for migration.
//! - [`palette`]: the small per-client palette cache.
//! - [`dictionary`]: shared image-encoder dictionary handles (the codec
//!   internals live elsewhere; only identity and lifecycle are managed
//!   here).

pub mod dictionary;
pub mod palette;
pub mod pixmap;

pub use dictionary::{
    dictionary_get, dictionary_restore, DictRestoreData, DictionaryError, EncoderDictionary,
};
pub use palette::{PaletteCache, CLIENT_PALETTE_CACHE_SIZE};
pub use pixmap::{
    merge_sync, pixmap_cache_get, AddOutcome, Eviction, PixmapCache, MAX_CACHE_CLIENTS, SyncVector,
};
