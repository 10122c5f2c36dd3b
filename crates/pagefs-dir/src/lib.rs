#![forbid(unsafe_code)]
//! Directory operations.
//!
//! A directory's content chain holds the block ids of its children's
//! inode pages, in insertion order. Lookup is a linear scan with
//! byte-exact name comparison; insertion appends at the chain tail;
//! removal compacts the chain. Name uniqueness is the caller's
//! responsibility (the namespace layer checks before inserting).

use pagefs_chain as chain;
use pagefs_error::{PfsError, Result};
use pagefs_inode::{Inode, NodeKind};
use pagefs_store::PageStore;
use pagefs_types::BlockId;

fn require_dir(dir: &Inode) -> Result<()> {
    if dir.kind != NodeKind::Dir {
        return Err(PfsError::NotDirectory);
    }
    Ok(())
}

/// Find a child by name; `Ok(None)` when absent.
pub fn lookup(store: &PageStore, dir: &Inode, name: &str) -> Result<Option<Inode>> {
    require_dir(dir)?;
    for entry in chain::iter(store, dir.content_head) {
        let (_, child_block) = entry?;
        let child = Inode::load(store, child_block)?;
        if child.name == name {
            return Ok(Some(child));
        }
    }
    Ok(None)
}

/// Link a child inode page into the directory.
///
/// Updates `content_tail` (and persists the directory inode) when the
/// append grew the chain.
pub fn insert(store: &mut PageStore, dir: &mut Inode, child_block: BlockId) -> Result<()> {
    require_dir(dir)?;
    if let Some(new_tail) = chain::append(store, dir.content_tail, child_block)? {
        dir.content_tail = new_tail;
        dir.flush(store)?;
    }
    Ok(())
}

/// Unlink a child inode page from the directory.
pub fn remove(store: &mut PageStore, dir: &mut Inode, child_block: BlockId) -> Result<()> {
    require_dir(dir)?;
    let at = chain::find(store, dir.content_head, child_block)?.ok_or_else(|| {
        PfsError::NotFound(format!(
            "block {child_block} is not an entry of directory {}",
            dir.name
        ))
    })?;
    let outcome = chain::remove_at(store, dir.content_head, at)?;
    if let Some(new_tail) = outcome.new_tail {
        dir.content_tail = new_tail;
        dir.flush(store)?;
    }
    Ok(())
}

/// Load every child inode, in insertion order.
pub fn children(store: &PageStore, dir: &Inode) -> Result<Vec<Inode>> {
    require_dir(dir)?;
    let mut out = Vec::new();
    for entry in chain::iter(store, dir.content_head) {
        let (_, child_block) = entry?;
        out.push(Inode::load(store, child_block)?);
    }
    Ok(out)
}

/// True when the directory has no entries.
pub fn is_empty(store: &PageStore, dir: &Inode) -> Result<bool> {
    require_dir(dir)?;
    let head = chain::IndexPage::load(store, dir.content_head)?;
    Ok(head.is_payload_empty() && head.next().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagefs_inode::{create_inode, CreateAttrs, NodeIds};
    use pagefs_types::{NodeId, PAYLOAD_SLOTS};

    struct Fixture {
        store: PageStore,
        ids: NodeIds,
        root: Inode,
    }

    fn fixture() -> Fixture {
        let mut store = PageStore::new();
        let mut ids = NodeIds::new();
        let root = create_inode(&mut store, &mut ids, NodeKind::Dir, "/", NodeId::ROOT, attrs())
            .unwrap();
        Fixture { store, ids, root }
    }

    fn attrs() -> CreateAttrs {
        CreateAttrs {
            mode: None,
            uid: 0,
            gid: 0,
            rdev: 0,
            now: 1_700_000_000,
        }
    }

    fn add_child(fx: &mut Fixture, kind: NodeKind, name: &str) -> Inode {
        let child = create_inode(
            &mut fx.store,
            &mut fx.ids,
            kind,
            name,
            fx.root.node_id,
            attrs(),
        )
        .unwrap();
        insert(&mut fx.store, &mut fx.root, child.self_block).unwrap();
        child
    }

    #[test]
    fn lookup_finds_by_exact_name() {
        let mut fx = fixture();
        add_child(&mut fx, NodeKind::File, "alpha");
        add_child(&mut fx, NodeKind::Dir, "beta");

        let hit = lookup(&fx.store, &fx.root, "beta").unwrap().unwrap();
        assert_eq!(hit.name, "beta");
        assert_eq!(hit.kind, NodeKind::Dir);
        assert!(lookup(&fx.store, &fx.root, "bet").unwrap().is_none());
        assert!(lookup(&fx.store, &fx.root, "betaa").unwrap().is_none());
    }

    #[test]
    fn children_preserve_insertion_order() {
        let mut fx = fixture();
        for name in ["one", "two", "three"] {
            add_child(&mut fx, NodeKind::File, name);
        }
        let names: Vec<_> = children(&fx.store, &fx.root)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["one", "two", "three"]);
    }

    #[test]
    fn remove_unlinks_and_keeps_the_rest() {
        let mut fx = fixture();
        add_child(&mut fx, NodeKind::File, "a");
        let b = add_child(&mut fx, NodeKind::File, "b");
        add_child(&mut fx, NodeKind::File, "c");

        remove(&mut fx.store, &mut fx.root, b.self_block).unwrap();
        let names: Vec<_> = children(&fx.store, &fx.root)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["a", "c"]);

        let err = remove(&mut fx.store, &mut fx.root, b.self_block).unwrap_err();
        assert!(matches!(err, PfsError::NotFound(_)));
    }

    #[test]
    fn large_directory_spans_chain_pages() {
        let mut fx = fixture();
        let count = PAYLOAD_SLOTS + 5;
        for i in 0..count {
            add_child(&mut fx, NodeKind::File, &format!("f{i}"));
        }
        // The directory inode now records a grown tail.
        assert_ne!(fx.root.content_head, fx.root.content_tail);
        let kids = children(&fx.store, &fx.root).unwrap();
        assert_eq!(kids.len(), count);
        assert_eq!(kids[count - 1].name, format!("f{}", count - 1));

        // Lookup still works past the page boundary.
        let name = format!("f{}", PAYLOAD_SLOTS + 1);
        assert!(lookup(&fx.store, &fx.root, &name).unwrap().is_some());
    }

    #[test]
    fn draining_the_second_page_shrinks_the_tail() {
        let mut fx = fixture();
        let count = PAYLOAD_SLOTS + 1;
        let mut blocks = Vec::new();
        for i in 0..count {
            blocks.push(add_child(&mut fx, NodeKind::File, &format!("f{i}")).self_block);
        }
        assert_ne!(fx.root.content_head, fx.root.content_tail);
        remove(&mut fx.store, &mut fx.root, blocks[0]).unwrap();
        // The lone entry of the second page was pulled up and the page
        // freed; the tail is the head again.
        assert_eq!(fx.root.content_head, fx.root.content_tail);
        assert_eq!(children(&fx.store, &fx.root).unwrap().len(), count - 1);
    }

    #[test]
    fn emptiness() {
        let mut fx = fixture();
        assert!(is_empty(&fx.store, &fx.root).unwrap());
        let a = add_child(&mut fx, NodeKind::File, "a");
        assert!(!is_empty(&fx.store, &fx.root).unwrap());
        remove(&mut fx.store, &mut fx.root, a.self_block).unwrap();
        assert!(is_empty(&fx.store, &fx.root).unwrap());
    }

    #[test]
    fn file_inodes_are_not_directories() {
        let mut fx = fixture();
        let f = add_child(&mut fx, NodeKind::File, "f");
        assert!(matches!(
            lookup(&fx.store, &f, "x"),
            Err(PfsError::NotDirectory)
        ));
    }
}
