pub use self::addr::{PageRound, is_page_aligned, page_rounddown, page_roundup};

mod addr;
