#![forbid(unsafe_code)]
//! The page store: a capped table of fixed-size in-memory pages.
//!
//! Every higher layer is built on this one primitive. Pages are allocated
//! zeroed, addressed by a stable [`BlockId`], and freed back to the table.
//! Allocation is first-free scan: the lowest free id wins, which guarantees
//! the very first allocation of a fresh store is id 0 (reserved by
//! convention for the root inode's own page).

use pagefs_error::{PfsError, Result};
use pagefs_types::{BlockId, MAX_BLOCKS, PAGE_SIZE};
use tracing::trace;

type PageBuf = Box<[u8; PAGE_SIZE]>;

fn zeroed_page() -> PageBuf {
    Box::new([0_u8; PAGE_SIZE])
}

/// Capped table of page slots.
///
/// Slots are never shrunk; a freed slot is reused by a later allocation.
#[derive(Debug, Default)]
pub struct PageStore {
    slots: Vec<Option<PageBuf>>,
    /// Lowest index that might be free; everything below it is live.
    scan_floor: usize,
    live: usize,
}

impl PageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently allocated pages.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.live
    }

    /// Iterate over the ids of all currently allocated pages.
    pub fn live_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| BlockId(i as u64))
    }

    /// Reserve a free slot and hand out a zeroed page.
    ///
    /// The lowest free id wins. Fails with `OutOfBlocks` once `MAX_BLOCKS`
    /// pages are live.
    pub fn alloc(&mut self) -> Result<BlockId> {
        let mut idx = self.scan_floor;
        while idx < self.slots.len() && self.slots[idx].is_some() {
            idx += 1;
        }
        if idx == self.slots.len() {
            if self.slots.len() == MAX_BLOCKS {
                return Err(PfsError::OutOfBlocks);
            }
            self.slots.push(Some(zeroed_page()));
        } else {
            self.slots[idx] = Some(zeroed_page());
        }
        self.scan_floor = idx + 1;
        self.live += 1;
        trace!(target: "pagefs::store", event = "page_alloc", block = idx);
        Ok(BlockId(idx as u64))
    }

    /// Release a page back to the table.
    ///
    /// Freeing an id that is not allocated is an internal invariant
    /// violation and reported as corruption.
    pub fn free(&mut self, id: BlockId) -> Result<()> {
        let idx = self.index_of(id)?;
        if self.slots[idx].take().is_none() {
            return Err(PfsError::Corruption {
                block: id.0,
                detail: "free of unallocated page".into(),
            });
        }
        self.live -= 1;
        self.scan_floor = self.scan_floor.min(idx);
        trace!(target: "pagefs::store", event = "page_free", block = idx);
        Ok(())
    }

    /// Full-page copy out of the store; copies `min(buf.len(), PAGE_SIZE)`
    /// bytes and returns the count.
    pub fn read(&self, id: BlockId, buf: &mut [u8]) -> Result<usize> {
        let page = self.page(id)?;
        let n = buf.len().min(PAGE_SIZE);
        buf[..n].copy_from_slice(&page[..n]);
        Ok(n)
    }

    /// Full-page copy into the store; copies `min(data.len(), PAGE_SIZE)`
    /// bytes and returns the count.
    pub fn write(&mut self, id: BlockId, data: &[u8]) -> Result<usize> {
        let page = self.page_mut(id)?;
        let n = data.len().min(PAGE_SIZE);
        page[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// Positional copy out of the page; the transfer is clamped to the page
    /// boundary. Returns the count copied (0 when `off >= PAGE_SIZE`).
    pub fn read_at(&self, id: BlockId, off: usize, buf: &mut [u8]) -> Result<usize> {
        let page = self.page(id)?;
        if off >= PAGE_SIZE {
            return Ok(0);
        }
        let n = buf.len().min(PAGE_SIZE - off);
        buf[..n].copy_from_slice(&page[off..off + n]);
        Ok(n)
    }

    /// Positional copy into the page, clamped to the page boundary.
    pub fn write_at(&mut self, id: BlockId, off: usize, data: &[u8]) -> Result<usize> {
        let page = self.page_mut(id)?;
        if off >= PAGE_SIZE {
            return Ok(0);
        }
        let n = data.len().min(PAGE_SIZE - off);
        page[off..off + n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// Borrow a page for zero-copy decoding.
    pub fn page(&self, id: BlockId) -> Result<&[u8; PAGE_SIZE]> {
        let idx = self.index_of(id)?;
        self.slots[idx].as_deref().ok_or_else(|| PfsError::Corruption {
            block: id.0,
            detail: "access to unallocated page".into(),
        })
    }

    /// Borrow a page mutably for in-place encoding.
    pub fn page_mut(&mut self, id: BlockId) -> Result<&mut [u8; PAGE_SIZE]> {
        let idx = self.index_of(id)?;
        self.slots[idx]
            .as_deref_mut()
            .ok_or_else(|| PfsError::Corruption {
                block: id.0,
                detail: "access to unallocated page".into(),
            })
    }

    fn index_of(&self, id: BlockId) -> Result<usize> {
        let idx = usize::try_from(id.0).map_err(|_| PfsError::Corruption {
            block: id.0,
            detail: "page id out of range".into(),
        })?;
        if idx >= self.slots.len() {
            return Err(PfsError::Corruption {
                block: id.0,
                detail: "page id beyond table".into(),
            });
        }
        Ok(idx)
    }
}
