use crate::frame::Frame;
use crate::store::Store;

/// Engine operations are total, so executing a parsed command always
/// produces a reply frame.
pub trait Executable {
    fn exec(self, store: &Store) -> Frame;
}
