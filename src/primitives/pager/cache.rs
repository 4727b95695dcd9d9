//! Arena of page headers linked by slot index.
//!
//! Hash chains, the free list and the all-pages list store neighbours as
//! `Option<SlotId>`, so insert and unlink are O(1) without aliasing.

use super::frame::{PgHdr, SlotId};
use crate::types::PageNo;

/// Number of hash buckets; a page lives in bucket `page_no % PAGE_HASH_BUCKETS`.
pub const PAGE_HASH_BUCKETS: usize = 373;

pub struct PageCache {
    slots: Vec<Option<PgHdr>>,
    vacant: Vec<SlotId>,
    buckets: Box<[Option<SlotId>]>,
    free_head: Option<SlotId>,
    free_tail: Option<SlotId>,
    all_head: Option<SlotId>,
    cached: usize,
    outstanding: usize,
}

impl PageCache {
    pub fn new() -> Self {
        Self::with_buckets(PAGE_HASH_BUCKETS)
    }

    pub fn with_buckets(buckets: usize) -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            buckets: vec![None; buckets.max(1)].into_boxed_slice(),
            free_head: None,
            free_tail: None,
            all_head: None,
            cached: 0,
            outstanding: 0,
        }
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.cached
    }

    /// Number of pages with a non-zero reference count.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn hdr(&self, slot: SlotId) -> &PgHdr {
        self.slots[slot].as_ref().expect("cache slot vacant")
    }

    pub fn hdr_mut(&mut self, slot: SlotId) -> &mut PgHdr {
        self.slots[slot].as_mut().expect("cache slot vacant")
    }

    fn bucket(&self, page_no: PageNo) -> usize {
        page_no.0 as usize % self.buckets.len()
    }

    pub fn find(&self, page_no: PageNo) -> Option<SlotId> {
        let mut cursor = self.buckets[self.bucket(page_no)];
        while let Some(slot) = cursor {
            let hdr = self.hdr(slot);
            if hdr.page_no == page_no {
                return Some(slot);
            }
            cursor = hdr.hash_next;
        }
        None
    }

    /// Inserts a freshly loaded page holding one reference.
    pub fn insert(&mut self, mut hdr: PgHdr) -> SlotId {
        debug_assert!(self.find(hdr.page_no).is_none());
        hdr.ref_count = 1;
        let bucket = self.bucket(hdr.page_no);
        hdr.hash_prev = None;
        hdr.hash_next = self.buckets[bucket];
        hdr.all_prev = None;
        hdr.all_next = self.all_head;
        hdr.free_prev = None;
        hdr.free_next = None;
        let slot = match self.vacant.pop() {
            Some(slot) => {
                self.slots[slot] = Some(hdr);
                slot
            }
            None => {
                self.slots.push(Some(hdr));
                self.slots.len() - 1
            }
        };
        if let Some(next) = self.buckets[bucket] {
            self.hdr_mut(next).hash_prev = Some(slot);
        }
        self.buckets[bucket] = Some(slot);
        if let Some(next) = self.all_head {
            self.hdr_mut(next).all_prev = Some(slot);
        }
        self.all_head = Some(slot);
        self.cached += 1;
        self.outstanding += 1;
        slot
    }

    /// Adds a reference. A page leaving the free list counts as outstanding again.
    pub fn pin(&mut self, slot: SlotId) {
        let was_idle = self.hdr(slot).ref_count == 0;
        if was_idle {
            self.unlink_free(slot);
            self.outstanding += 1;
        }
        self.hdr_mut(slot).ref_count += 1;
    }

    /// Drops a reference. Returns true when the page became idle and was
    /// appended to the free-list tail.
    pub fn unpin(&mut self, slot: SlotId) -> bool {
        let hdr = self.hdr_mut(slot);
        debug_assert!(hdr.ref_count > 0, "unpin of idle page");
        hdr.ref_count = hdr.ref_count.saturating_sub(1);
        if hdr.ref_count > 0 {
            return false;
        }
        self.append_free(slot);
        self.outstanding = self.outstanding.saturating_sub(1);
        true
    }

    /// Oldest idle page: the eviction victim.
    pub fn oldest_idle(&self) -> Option<SlotId> {
        self.free_head
    }

    /// Unlinks an idle page from every structure and frees its slot.
    pub fn remove(&mut self, slot: SlotId) -> PgHdr {
        debug_assert_eq!(self.hdr(slot).ref_count, 0, "removing referenced page");
        self.unlink_free(slot);
        self.unlink_hash(slot);
        self.unlink_all(slot);
        self.cached -= 1;
        self.vacant.push(slot);
        self.slots[slot].take().expect("cache slot vacant")
    }

    /// Discards every page and resets all counters.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.vacant.clear();
        self.buckets.iter_mut().for_each(|bucket| *bucket = None);
        self.free_head = None;
        self.free_tail = None;
        self.all_head = None;
        self.cached = 0;
        self.outstanding = 0;
    }

    /// Slots of every cached page, walking the all-pages list.
    pub fn all_slots(&self) -> Vec<SlotId> {
        let mut out = Vec::with_capacity(self.cached);
        let mut cursor = self.all_head;
        while let Some(slot) = cursor {
            out.push(slot);
            cursor = self.hdr(slot).all_next;
        }
        out
    }

    /// Idle pages, oldest first.
    pub fn idle_pages(&self) -> Vec<PageNo> {
        let mut out = Vec::new();
        let mut cursor = self.free_head;
        while let Some(slot) = cursor {
            let hdr = self.hdr(slot);
            out.push(hdr.page_no);
            cursor = hdr.free_next;
        }
        out
    }

    fn is_on_free_list(&self, slot: SlotId) -> bool {
        let hdr = self.hdr(slot);
        hdr.free_prev.is_some() || self.free_head == Some(slot)
    }

    fn append_free(&mut self, slot: SlotId) {
        let tail = self.free_tail;
        {
            let hdr = self.hdr_mut(slot);
            hdr.free_prev = tail;
            hdr.free_next = None;
        }
        match tail {
            Some(tail) => self.hdr_mut(tail).free_next = Some(slot),
            None => self.free_head = Some(slot),
        }
        self.free_tail = Some(slot);
    }

    fn unlink_free(&mut self, slot: SlotId) {
        if !self.is_on_free_list(slot) {
            return;
        }
        let (prev, next) = {
            let hdr = self.hdr_mut(slot);
            (hdr.free_prev.take(), hdr.free_next.take())
        };
        match prev {
            Some(prev) => self.hdr_mut(prev).free_next = next,
            None => self.free_head = next,
        }
        match next {
            Some(next) => self.hdr_mut(next).free_prev = prev,
            None => self.free_tail = prev,
        }
    }

    fn unlink_hash(&mut self, slot: SlotId) {
        let (page_no, prev, next) = {
            let hdr = self.hdr_mut(slot);
            (hdr.page_no, hdr.hash_prev.take(), hdr.hash_next.take())
        };
        match prev {
            Some(prev) => self.hdr_mut(prev).hash_next = next,
            None => {
                let bucket = self.bucket(page_no);
                self.buckets[bucket] = next;
            }
        }
        if let Some(next) = next {
            self.hdr_mut(next).hash_prev = prev;
        }
    }

    fn unlink_all(&mut self, slot: SlotId) {
        let (prev, next) = {
            let hdr = self.hdr_mut(slot);
            (hdr.all_prev.take(), hdr.all_next.take())
        };
        match prev {
            Some(prev) => self.hdr_mut(prev).all_next = next,
            None => self.all_head = next,
        }
        if let Some(next) = next {
            self.hdr_mut(next).all_prev = prev;
        }
    }
}
