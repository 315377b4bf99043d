//! Heap pages and the slot allocator.
//!
//! Objects live in fixed-size slots grouped into pages. Each page keeps an
//! intrusive free list threaded through its free slots; pages that still have
//! free slots are additionally linked into the heap's free-page ring so
//! allocation never scans. Object handles are plain slot indices
//! (`page * HEAP_PAGE_SIZE + slot`), so a page can be returned to the system
//! without disturbing any other page's handles.

use crate::object::{ObjBody, ObjFlags, ObjHeader};
use crate::value::{ObjId, Vtype};

/// Object slots per heap page.
pub const HEAP_PAGE_SIZE: usize = 1024;

/// One object slot: common header plus the per-kind payload.
#[derive(Debug)]
pub struct Slot {
    pub header: ObjHeader,
    pub body: ObjBody,
}

/// A fixed array of object slots with its own free list.
#[derive(Debug)]
pub struct Page {
    pub slots: Vec<Slot>,
    /// Head of the intrusive free list (slot index within this page).
    pub freelist: Option<u32>,
    /// Linked into the heap's free-page ring.
    pub linked: bool,
    /// Generational mode: no young object lives on this page.
    pub old: bool,
}

impl Page {
    fn new() -> Box<Page> {
        let mut slots = Vec::with_capacity(HEAP_PAGE_SIZE);
        for i in 0..HEAP_PAGE_SIZE {
            let next = if i + 1 < HEAP_PAGE_SIZE {
                Some(i as u32 + 1)
            } else {
                None
            };
            slots.push(Slot {
                header: ObjHeader {
                    tt: Vtype::Free,
                    color: 0,
                    flags: ObjFlags::empty(),
                    cls: None,
                    gc_next: None,
                },
                body: ObjBody::Free { next },
            });
        }
        Box::new(Page {
            slots,
            freelist: Some(0),
            linked: false,
            old: false,
        })
    }
}

/// The object heap: a vector of pages plus the free-page ring.
#[derive(Debug, Default)]
pub struct Heap {
    pages: Vec<Option<Box<Page>>>,
    free_pages: Vec<u32>,
    live_pages: usize,
    /// Optional hard cap on page count; exceeding it starves allocation.
    pub max_pages: Option<usize>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of page slots ever created (including released holes).
    pub fn pages_len(&self) -> usize {
        self.pages.len()
    }

    /// Number of live pages.
    pub fn live_pages(&self) -> usize {
        self.live_pages
    }

    pub fn page(&self, idx: usize) -> Option<&Page> {
        self.pages.get(idx).and_then(|p| p.as_deref())
    }

    pub fn page_mut(&mut self, idx: usize) -> Option<&mut Page> {
        self.pages.get_mut(idx).and_then(|p| p.as_deref_mut())
    }

    /// Adds a fresh page, reusing a released page slot when one exists.
    /// Returns `None` when `max_pages` would be exceeded.
    pub fn add_page(&mut self) -> Option<u32> {
        if let Some(max) = self.max_pages {
            if self.live_pages >= max {
                return None;
            }
        }
        let idx = match self.pages.iter().position(|p| p.is_none()) {
            Some(hole) => {
                self.pages[hole] = Some(Page::new());
                hole as u32
            }
            None => {
                self.pages.push(Some(Page::new()));
                (self.pages.len() - 1) as u32
            }
        };
        self.live_pages += 1;
        self.link_free_page(idx);
        Some(idx)
    }

    /// Whether any page has a free slot.
    pub fn has_free_slot(&self) -> bool {
        !self.free_pages.is_empty()
    }

    /// Pops a slot from the free-page ring. The caller initializes the slot.
    pub fn alloc_raw(&mut self) -> Option<ObjId> {
        let &page_idx = self.free_pages.last()?;
        let page = self.pages[page_idx as usize].as_deref_mut()?;
        let slot_idx = page.freelist?;
        page.freelist = match &page.slots[slot_idx as usize].body {
            ObjBody::Free { next } => *next,
            _ => unreachable!("free list entry is not a free slot"),
        };
        if page.freelist.is_none() {
            page.linked = false;
            self.free_pages.pop();
        }
        Some(ObjId(page_idx * HEAP_PAGE_SIZE as u32 + slot_idx))
    }

    /// Pushes a slot back onto its page's free list. Does not relink the
    /// page; the sweep decides that.
    pub fn free_raw(&mut self, id: ObjId) {
        let (page_idx, slot_idx) = Self::split(id);
        let page = self.pages[page_idx].as_deref_mut().expect("freed page");
        let old_head = page.freelist;
        let slot = &mut page.slots[slot_idx];
        slot.header.tt = Vtype::Free;
        slot.header.cls = None;
        slot.header.gc_next = None;
        slot.header.flags = ObjFlags::empty();
        slot.body = ObjBody::Free { next: old_head };
        page.freelist = Some(slot_idx as u32);
    }

    /// Links a page into the free-page ring if it is not already there.
    pub fn link_free_page(&mut self, idx: u32) {
        if let Some(page) = self.pages[idx as usize].as_deref_mut() {
            if !page.linked {
                page.linked = true;
                self.free_pages.push(idx);
            }
        }
    }

    /// Returns a wholly free page to the system.
    pub fn release_page(&mut self, idx: u32) {
        if let Some(page) = self.pages[idx as usize].as_deref() {
            if page.linked {
                if let Some(pos) = self.free_pages.iter().position(|&p| p == idx) {
                    self.free_pages.swap_remove(pos);
                }
            }
            self.pages[idx as usize] = None;
            self.live_pages -= 1;
        }
    }

    fn split(id: ObjId) -> (usize, usize) {
        (
            id.index() / HEAP_PAGE_SIZE,
            id.index() % HEAP_PAGE_SIZE,
        )
    }

    pub fn slot(&self, id: ObjId) -> &Slot {
        let (p, s) = Self::split(id);
        &self.pages[p].as_deref().expect("dangling object id").slots[s]
    }

    pub fn slot_mut(&mut self, id: ObjId) -> &mut Slot {
        let (p, s) = Self::split(id);
        &mut self.pages[p]
            .as_deref_mut()
            .expect("dangling object id")
            .slots[s]
    }

    pub fn header(&self, id: ObjId) -> &ObjHeader {
        &self.slot(id).header
    }

    pub fn header_mut(&mut self, id: ObjId) -> &mut ObjHeader {
        &mut self.slot_mut(id).header
    }

    pub fn body(&self, id: ObjId) -> &ObjBody {
        &self.slot(id).body
    }

    pub fn body_mut(&mut self, id: ObjId) -> &mut ObjBody {
        &mut self.slot_mut(id).body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_alloc_exhaustion() {
        let mut heap = Heap::new();
        heap.add_page().unwrap();
        for _ in 0..HEAP_PAGE_SIZE {
            assert!(heap.alloc_raw().is_some());
        }
        assert!(heap.alloc_raw().is_none());
        assert!(!heap.has_free_slot());
    }

    #[test]
    fn test_free_and_realloc() {
        let mut heap = Heap::new();
        heap.add_page().unwrap();
        let a = heap.alloc_raw().unwrap();
        let b = heap.alloc_raw().unwrap();
        assert_ne!(a, b);
        heap.free_raw(b);
        heap.link_free_page(0);
        // LIFO free list hands back the same slot
        assert_eq!(heap.alloc_raw().unwrap(), b);
    }

    #[test]
    fn test_max_pages() {
        let mut heap = Heap::new();
        heap.max_pages = Some(1);
        assert!(heap.add_page().is_some());
        assert!(heap.add_page().is_none());
    }

    #[test]
    fn test_release_page_leaves_holes() {
        let mut heap = Heap::new();
        heap.add_page().unwrap();
        heap.add_page().unwrap();
        assert_eq!(heap.live_pages(), 2);
        heap.release_page(0);
        assert_eq!(heap.live_pages(), 1);
        assert_eq!(heap.pages_len(), 2);
        // the hole is reused
        let idx = heap.add_page().unwrap();
        assert_eq!(idx, 0);
    }
}
