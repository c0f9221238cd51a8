//! L0 collection primitives: an intrusive doubly-linked list and the three
//! queue flavours the rest of the runtime builds on (normal, SPSC, MPSC).

pub mod list;
pub mod mpsc;
pub mod queue;
pub mod spsc;

pub use list::{IntrusiveList, ListToken};
pub use mpsc::MpscQueue;
pub use queue::Queue;
pub use spsc::SpscQueue;
