use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng as _;

/// Range of result pages a search may pick from.
///
/// Picking a random page spreads photo variety across pins and across
/// refreshes. The window starts at one page and follows the page count the
/// service last reported, capped at `max_page`, so a pick never lands past the
/// end of the results for a typical area.
#[derive(Debug)]
pub struct PageWindow {
    window: AtomicU32,
    max_page: u32,
}

impl PageWindow {
    pub fn new(max_page: u32) -> Self {
        Self {
            window: AtomicU32::new(1),
            max_page: max_page.max(1),
        }
    }

    /// Pick a 1-based page uniformly from the current window.
    pub fn choose(&self) -> u32 {
        let window = self.window.load(Ordering::Relaxed);
        rand::thread_rng().gen_range(1..=window)
    }

    /// Record the page count of a completed search.
    pub fn observe(&self, page_count: u32) {
        self.window
            .store(page_count.clamp(1, self.max_page), Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn current(&self) -> u32 {
        self.window.load(Ordering::Relaxed)
    }
}
