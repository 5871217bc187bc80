//! Per-instance engine configuration (spec §6).

/// Construction-time configuration shared by both engines.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlotMapConfig {
    /// Capacity of each page; must be a power of two in `[1, 2^30]`.
    pub page_size: u32,
    /// Free-key queue threshold. Values above `page_size` are clamped (with
    /// a logged warning) since the queue can never hold more retired keys
    /// than a single page can retire.
    pub free_indices_limit: u32,
}

impl Default for SlotMapConfig {
    /// `page_size = 1024`, `free_indices_limit = 32` (spec §6's suggested
    /// default).
    fn default() -> Self {
        SlotMapConfig {
            page_size: 1024,
            free_indices_limit: 32,
        }
    }
}

impl SlotMapConfig {
    pub fn new(page_size: u32, free_indices_limit: u32) -> Self {
        SlotMapConfig {
            page_size,
            free_indices_limit,
        }
    }
}
