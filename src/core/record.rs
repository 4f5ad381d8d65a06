use std::path::{Path, PathBuf};

use crate::core::Result;

/// An item a [`Store`](crate::core::store::Store) can persist: one item per
/// file, encoded as text.
pub trait Record: Sized + Send {
    fn encode(&self) -> String;

    fn decode(text: &str) -> Result<Self>;

    /// Called by the store whenever the item's backing file changes.
    fn set_backing_file(&mut self, _path: Option<PathBuf>) {}

    fn backing_file(&self) -> Option<&Path> {
        None
    }
}
