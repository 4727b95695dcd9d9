use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use crate::types::PageNo;

/// Stable index of a page slot inside the cache arena.
pub type SlotId = usize;

/// In-memory header of one cached page.
///
/// A header sits in three index-linked structures at once: its hash bucket
/// chain, the all-pages list, and the free list while `ref_count == 0`.
pub struct PgHdr {
    pub page_no: PageNo,
    pub ref_count: u32,
    pub hash_prev: Option<SlotId>,
    pub hash_next: Option<SlotId>,
    pub free_prev: Option<SlotId>,
    pub free_next: Option<SlotId>,
    pub all_prev: Option<SlotId>,
    pub all_next: Option<SlotId>,
    pub dirty: bool,
    pub in_journal: bool,
    pub in_checkpoint: bool,
    pub data: Arc<RwLock<Box<[u8]>>>,
    pub extra: Arc<Mutex<Box<[u8]>>>,
}

impl PgHdr {
    pub fn new(page_no: PageNo, data: Box<[u8]>, extra_bytes: usize) -> Self {
        Self {
            page_no,
            ref_count: 1,
            hash_prev: None,
            hash_next: None,
            free_prev: None,
            free_next: None,
            all_prev: None,
            all_next: None,
            dirty: false,
            in_journal: false,
            in_checkpoint: false,
            data: Arc::new(RwLock::new(data)),
            extra: Arc::new(Mutex::new(vec![0u8; extra_bytes].into_boxed_slice())),
        }
    }
}
