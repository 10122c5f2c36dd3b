#![forbid(unsafe_code)]
//! File data engine.
//!
//! A file's content chain is a two-level index: payload slots of the
//! index pages point at raw data pages. Byte offsets decompose into
//! (index page ordinal, payload slot, byte-in-page); transfers walk the
//! chain across slot and page boundaries. Data pages are allocated
//! lazily on write and freed eagerly on shrink; a zero slot inside
//! `[0, size)` reads as a zero-filled hole.
//!
//! `realloc` reshapes the index chain to the coarse capacity
//! `ceil(size / INDEX_SPAN)` and persists the new size; it is the only
//! place `size` changes. The namespace layer calls it before delegating
//! a growing write here.

use pagefs_chain::{self as chain, IndexPage};
use pagefs_error::{PfsError, Result};
use pagefs_inode::{Inode, NodeKind};
use pagefs_store::PageStore;
use pagefs_types::{data_pages_for, index_pages_for, BlockId, FilePos, PAGE_SIZE, PAYLOAD_SLOTS};
use tracing::trace;

fn require_file(inode: &Inode) -> Result<()> {
    if inode.kind != NodeKind::File {
        return Err(PfsError::IsDirectory);
    }
    Ok(())
}

/// Walk `ordinal` forward links from the chain head.
fn seek_index_page(store: &PageStore, head: BlockId, ordinal: u64) -> Result<BlockId> {
    let mut cur = head;
    for _ in 0..ordinal {
        let ip = IndexPage::load(store, cur)?;
        cur = ip.next().ok_or_else(|| PfsError::Corruption {
            block: cur.0,
            detail: "content chain shorter than the file size requires".into(),
        })?;
    }
    Ok(cur)
}

/// Read up to `buf.len()` bytes at `off`, clamped to the file size.
///
/// Returns the byte count actually read; zero when `off` is at or past
/// the end of the file.
pub fn read(store: &PageStore, inode: &Inode, off: u64, buf: &mut [u8]) -> Result<usize> {
    require_file(inode)?;
    if off >= inode.size || buf.is_empty() {
        return Ok(0);
    }
    let len = usize::try_from((inode.size - off).min(buf.len() as u64))
        .map_err(|_| PfsError::InvalidArgument("read length overflows usize"))?;

    let pos = FilePos::of(off);
    let mut page_id = seek_index_page(store, inode.content_head, pos.index_ordinal)?;
    let mut ip = IndexPage::load(store, page_id)?;
    let mut slot = pos.slot;
    let mut byte = pos.byte;
    let mut done = 0;

    while done < len {
        if slot == PAYLOAD_SLOTS {
            page_id = ip.next().ok_or_else(|| PfsError::Corruption {
                block: page_id.0,
                detail: "content chain ends inside the file".into(),
            })?;
            ip = IndexPage::load(store, page_id)?;
            slot = 0;
        }
        let n = (PAGE_SIZE - byte).min(len - done);
        match ip.slot(slot) {
            Some(data_page) => {
                store.read_at(data_page, byte, &mut buf[done..done + n])?;
            }
            // Unwritten hole: reads as zeros.
            None => buf[done..done + n].fill(0),
        }
        done += n;
        byte = 0;
        slot += 1;
    }
    Ok(len)
}

/// Write `data` at `off` through the index, allocating missing data
/// pages as they are touched.
///
/// Does not change the file size: the caller reshapes the file with
/// [`realloc`] first, so the chain is guaranteed to cover the range.
pub fn write(store: &mut PageStore, inode: &Inode, off: u64, data: &[u8]) -> Result<usize> {
    require_file(inode)?;
    if data.is_empty() {
        return Ok(0);
    }
    let end = off
        .checked_add(data.len() as u64)
        .ok_or(PfsError::InvalidArgument("write range overflows u64"))?;
    if end > inode.size {
        return Err(PfsError::Corruption {
            block: inode.self_block.0,
            detail: "write past the reallocated size".into(),
        });
    }

    let pos = FilePos::of(off);
    let mut page_id = seek_index_page(store, inode.content_head, pos.index_ordinal)?;
    let mut ip = IndexPage::load(store, page_id)?;
    let mut slot = pos.slot;
    let mut byte = pos.byte;
    let mut done = 0;

    while done < data.len() {
        if slot == PAYLOAD_SLOTS {
            page_id = ip.next().ok_or_else(|| PfsError::Corruption {
                block: page_id.0,
                detail: "content chain ends inside the write range".into(),
            })?;
            ip = IndexPage::load(store, page_id)?;
            slot = 0;
        }
        let data_page = match ip.slot(slot) {
            Some(existing) => existing,
            None => {
                let fresh = store.alloc()?;
                ip.set_slot(slot, Some(fresh));
                ip.flush(store, page_id)?;
                fresh
            }
        };
        let n = (PAGE_SIZE - byte).min(data.len() - done);
        store.write_at(data_page, byte, &data[done..done + n])?;
        done += n;
        byte = 0;
        slot += 1;
    }
    Ok(data.len())
}

/// Reshape the file's backing storage for a new logical size.
///
/// Grows by linking fresh index pages after the tail; shrinks by
/// truncating the chain to the needed page count, then freeing data
/// pages beyond the last page the new size reaches into. Persists
/// `size = new_size` on the inode page.
pub fn realloc(store: &mut PageStore, inode: &mut Inode, new_size: u64) -> Result<()> {
    require_file(inode)?;
    let old_size = inode.size;
    let old_pages = index_pages_for(old_size);
    let new_pages = index_pages_for(new_size);

    if new_pages > old_pages {
        let mut tail = inode.content_tail;
        for _ in old_pages..new_pages {
            let fresh = store.alloc()?;
            IndexPage::new().flush(store, fresh)?;
            let mut ip = IndexPage::load(store, tail)?;
            ip.set_next(Some(fresh));
            ip.flush(store, tail)?;
            tail = fresh;
        }
        inode.content_tail = tail;
    } else if new_pages < old_pages {
        inode.content_tail = chain::truncate_after(store, inode.content_head, new_pages)?;
    }

    if new_size < old_size {
        // Data pages past the new end inside the kept tail.
        let tail_base = (new_pages - 1) * PAYLOAD_SLOTS as u64;
        let keep_in_tail = data_pages_for(new_size).saturating_sub(tail_base);
        #[allow(clippy::cast_possible_truncation)] // bounded by PAYLOAD_SLOTS
        chain::clear_payload_from(store, inode.content_tail, keep_in_tail as usize)?;
    }

    trace!(
        target: "pagefs::file",
        event = "realloc",
        node = inode.node_id.0,
        old_size,
        new_size,
        index_pages = new_pages
    );
    inode.size = new_size;
    inode.flush(store)
}

/// Data pages currently allocated to the file (for accounting and the
/// invariant checker).
pub fn data_pages(store: &PageStore, inode: &Inode) -> Result<Vec<BlockId>> {
    require_file(inode)?;
    let mut out = Vec::new();
    let mut cur = Some(inode.content_head);
    while let Some(page) = cur {
        let ip = IndexPage::load(store, page)?;
        for (_, block) in ip.occupied() {
            out.push(block);
        }
        cur = ip.next();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagefs_inode::{create_inode, CreateAttrs, NodeIds};
    use pagefs_types::{NodeId, INDEX_SPAN};

    fn new_file(store: &mut PageStore) -> Inode {
        let mut ids = NodeIds::new();
        create_inode(
            store,
            &mut ids,
            NodeKind::File,
            "blob",
            NodeId::ROOT,
            CreateAttrs {
                mode: None,
                uid: 0,
                gid: 0,
                rdev: 0,
                now: 0,
            },
        )
        .unwrap()
    }

    /// Deterministic pseudo-random payload.
    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    fn write_all(store: &mut PageStore, inode: &mut Inode, off: u64, data: &[u8]) {
        let end = off + data.len() as u64;
        if end > inode.size {
            realloc(store, inode, end).unwrap();
        }
        assert_eq!(write(store, inode, off, data).unwrap(), data.len());
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut store = PageStore::new();
        let mut f = new_file(&mut store);
        let data = b"hello, page world";
        write_all(&mut store, &mut f, 0, data);
        assert_eq!(f.size, data.len() as u64);

        let mut buf = vec![0_u8; data.len()];
        assert_eq!(read(&store, &f, 0, &mut buf).unwrap(), data.len());
        assert_eq!(&buf, data);
    }

    #[test]
    fn read_clamps_at_file_size() {
        let mut store = PageStore::new();
        let mut f = new_file(&mut store);
        write_all(&mut store, &mut f, 0, b"12345");

        let mut buf = [0_u8; 10];
        assert_eq!(read(&store, &f, 3, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"45");
        assert_eq!(read(&store, &f, 5, &mut buf).unwrap(), 0);
        assert_eq!(read(&store, &f, 100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn transfer_crosses_data_page_boundary() {
        let mut store = PageStore::new();
        let mut f = new_file(&mut store);
        let data = vec![0xAB_u8; PAGE_SIZE + 1];
        write_all(&mut store, &mut f, 0, &data);
        assert_eq!(f.size, PAGE_SIZE as u64 + 1);
        // One data page for the full page, one for the spill byte.
        assert_eq!(data_pages(&store, &f).unwrap().len(), 2);

        let mut buf = [0_u8; 2];
        assert_eq!(read(&store, &f, PAGE_SIZE as u64 - 1, &mut buf).unwrap(), 2);
        assert_eq!(buf, [0xAB, 0xAB]);
    }

    #[test]
    fn exactly_one_page_allocates_one_data_page() {
        let mut store = PageStore::new();
        let mut f = new_file(&mut store);
        write_all(&mut store, &mut f, 0, &vec![7_u8; PAGE_SIZE]);
        assert_eq!(data_pages(&store, &f).unwrap().len(), 1);
    }

    #[test]
    fn transfer_crosses_index_page_boundary() {
        let mut store = PageStore::new();
        let mut f = new_file(&mut store);
        // Straddle the first index page's span by 8 bytes either side.
        let off = INDEX_SPAN - 8;
        let data = pattern(16, 3);
        write_all(&mut store, &mut f, off, &data);

        // The chain needed a second index page.
        assert_ne!(f.content_head, f.content_tail);

        let mut buf = vec![0_u8; 16];
        assert_eq!(read(&store, &f, off, &mut buf).unwrap(), 16);
        assert_eq!(buf, data);
    }

    #[test]
    fn growth_past_index_span_adds_an_index_page() {
        let mut store = PageStore::new();
        let mut f = new_file(&mut store);
        realloc(&mut store, &mut f, INDEX_SPAN).unwrap();
        assert_eq!(f.content_head, f.content_tail);
        realloc(&mut store, &mut f, INDEX_SPAN + 1).unwrap();
        assert_ne!(f.content_head, f.content_tail);
    }

    #[test]
    fn holes_read_as_zeros() {
        let mut store = PageStore::new();
        let mut f = new_file(&mut store);
        // Grow without writing: no data pages exist yet.
        realloc(&mut store, &mut f, 3 * PAGE_SIZE as u64).unwrap();
        assert_eq!(data_pages(&store, &f).unwrap().len(), 0);

        let mut buf = vec![0xFF_u8; 2 * PAGE_SIZE];
        assert_eq!(read(&store, &f, 10, &mut buf).unwrap(), 2 * PAGE_SIZE);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn shrink_frees_data_pages_beyond_the_new_end() {
        let mut store = PageStore::new();
        let mut f = new_file(&mut store);
        write_all(&mut store, &mut f, 0, &pattern(5 * PAGE_SIZE, 1));
        assert_eq!(data_pages(&store, &f).unwrap().len(), 5);
        let before = store.allocated();

        realloc(&mut store, &mut f, 2 * PAGE_SIZE as u64 + 1).unwrap();
        assert_eq!(data_pages(&store, &f).unwrap().len(), 3);
        assert_eq!(store.allocated(), before - 2);

        // Content up to the new size is intact.
        let expect = pattern(5 * PAGE_SIZE, 1);
        let mut buf = vec![0_u8; 2 * PAGE_SIZE + 1];
        assert_eq!(read(&store, &f, 0, &mut buf).unwrap(), buf.len());
        assert_eq!(buf, expect[..2 * PAGE_SIZE + 1]);
    }

    #[test]
    fn shrink_to_zero_leaves_a_bare_head() {
        let mut store = PageStore::new();
        let mut f = new_file(&mut store);
        // Large enough for two index pages.
        write_all(&mut store, &mut f, 0, &pattern(100 * PAGE_SIZE, 2));
        realloc(&mut store, &mut f, INDEX_SPAN + 10 * PAGE_SIZE as u64).unwrap();

        realloc(&mut store, &mut f, 0).unwrap();
        assert_eq!(f.size, 0);
        assert_eq!(f.content_head, f.content_tail);
        assert_eq!(data_pages(&store, &f).unwrap().len(), 0);
        // Just the inode page and the bare chain head remain.
        assert_eq!(store.allocated(), 2);

        let mut buf = [0_u8; 10];
        assert_eq!(read(&store, &f, 0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn shrink_across_index_pages_frees_the_suffix() {
        let mut store = PageStore::new();
        let mut f = new_file(&mut store);
        let big = INDEX_SPAN + 50 * PAGE_SIZE as u64;
        realloc(&mut store, &mut f, big).unwrap();
        // Touch a byte in the second index page's span so a data page
        // exists there.
        write(&mut store, &f, INDEX_SPAN + 100, &[9]).unwrap();
        assert_ne!(f.content_head, f.content_tail);

        realloc(&mut store, &mut f, PAGE_SIZE as u64).unwrap();
        assert_eq!(f.content_head, f.content_tail);
        // inode + head + the one data page of the first span... but that
        // data page was never written, so: inode + head only.
        assert_eq!(store.allocated(), 2);
    }

    #[test]
    fn rewrite_in_place_reuses_data_pages() {
        let mut store = PageStore::new();
        let mut f = new_file(&mut store);
        write_all(&mut store, &mut f, 0, &pattern(2 * PAGE_SIZE, 1));
        let pages_before = data_pages(&store, &f).unwrap();

        write(&mut store, &f, 100, b"patch").unwrap();
        assert_eq!(data_pages(&store, &f).unwrap(), pages_before);

        let mut buf = [0_u8; 5];
        read(&store, &f, 100, &mut buf).unwrap();
        assert_eq!(&buf, b"patch");
    }

    #[test]
    fn write_past_capacity_is_rejected() {
        let mut store = PageStore::new();
        let f = new_file(&mut store);
        assert!(matches!(
            write(&mut store, &f, 0, b"x"),
            Err(PfsError::Corruption { .. })
        ));
    }

    #[test]
    fn directories_are_rejected() {
        let mut store = PageStore::new();
        let mut ids = NodeIds::new();
        let mut d = create_inode(
            &mut store,
            &mut ids,
            NodeKind::Dir,
            "d",
            NodeId::ROOT,
            CreateAttrs {
                mode: None,
                uid: 0,
                gid: 0,
                rdev: 0,
                now: 0,
            },
        )
        .unwrap();
        let mut buf = [0_u8; 4];
        assert!(matches!(read(&store, &d, 0, &mut buf), Err(PfsError::IsDirectory)));
        assert!(matches!(
            realloc(&mut store, &mut d, 10),
            Err(PfsError::IsDirectory)
        ));
    }
}
