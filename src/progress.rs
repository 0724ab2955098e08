//! Upload progress reporting

/// Page-level feedback while a strategy writes flash.
///
/// A driver announces the write once, reports after every page (STK500) or
/// 4 KiB chunk (SAM-BA) that lands, and closes the report when the last one
/// is on the device — including pages it skipped as blank, so the count
/// always reaches the announced total.
pub trait ProgressCallbacks {
    /// A write of `total_pages` pages is starting at `address`.
    fn started(&mut self, address: u32, total_pages: usize);
    /// `pages_done` pages of the announced total have been handled.
    fn page_done(&mut self, pages_done: usize);
    /// The write finished; no further page reports will arrive.
    fn completed(&mut self);
}

/// Discards all progress; for hosts that only want the final report.
#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressCallbacks for NoProgress {
    fn started(&mut self, _address: u32, _total_pages: usize) {}
    fn page_done(&mut self, _pages_done: usize) {}
    fn completed(&mut self) {}
}
