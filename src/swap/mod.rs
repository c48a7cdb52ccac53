//! Swap store: persistence for evicted chunks.
//!
//! One store instance is shared by every grid registered with a cache
//! environment. Evicted dirty chunks are written under a key derived from
//! (grid identity, chunk coordinates) and reloaded on fault-in.

mod codec;
mod path;
mod store;

pub use codec::{decode_chunk, encode_chunk};
pub use path::{grid_directory, row_directory, swap_path};
pub use store::SwapStore;
