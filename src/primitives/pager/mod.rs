#![forbid(unsafe_code)]

mod frame;
mod pager;

pub use pager::{PageCursor, PageIntent, PageStore, Pager, PagerOptions, PagerStats};
