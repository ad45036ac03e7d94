extern crate libc;

pub mod block;
pub mod config;
pub mod layout;
pub mod notifier;
pub mod platform;
pub mod queue;
pub mod sync;
pub mod util;
pub mod zebra;

pub use block::{
    BlockAllocError, BlockAllocation, CompactBlockInfo, PopResult, PushResult, TrimColor,
};
pub use notifier::{MemoryNotifier, NullMemoryNotifier};
pub use zebra::ZebraBlockHeap;
