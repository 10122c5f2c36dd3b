//! Invariant checker: a full sweep of the filesystem's page graph.
//!
//! Walks every inode from the root, re-validates the structural
//! invariants (dense packing, chain tails, size accounting, the
//! node-table cross-check against a ground-truth depth-first search),
//! and compares the set of reachable pages against the store's
//! allocation table. Any disagreement is an orphan or a leak.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use crate::FsInner;
use pagefs_chain::{self as chain, IndexPage};
use pagefs_error::Result;
use pagefs_inode::{Inode, NodeKind};
use pagefs_store::PageStore;
use pagefs_types::{data_pages_for, index_pages_for, BlockId, NodeId, PAYLOAD_SLOTS};

/// Outcome of one verification sweep.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub nodes: u64,
    pub index_pages: u64,
    pub data_pages: u64,
    pub allocated_pages: u64,
    pub errors: Vec<String>,
}

impl CheckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Resolve a node id to its inode page by depth-first search from
/// `from`, payload order first, then the forward link.
///
/// This is the slow ground truth the node table is checked against.
pub fn block_of_node(store: &PageStore, from: BlockId, target: NodeId) -> Result<Option<BlockId>> {
    let inode = Inode::load(store, from)?;
    if inode.node_id == target {
        return Ok(Some(from));
    }
    if inode.kind == NodeKind::Dir {
        for entry in chain::iter(store, inode.content_head) {
            let (_, child) = entry?;
            if let Some(hit) = block_of_node(store, child, target)? {
                return Ok(Some(hit));
            }
        }
    }
    Ok(None)
}

struct Frame {
    block: BlockId,
    expected_parent: NodeId,
}

pub(crate) fn verify(inner: &FsInner) -> CheckReport {
    let mut report = CheckReport {
        nodes: 0,
        index_pages: 0,
        data_pages: 0,
        allocated_pages: inner.store.allocated() as u64,
        errors: Vec::new(),
    };

    let Some(&root_block) = inner.nodes.get(&NodeId::ROOT) else {
        report.errors.push("node table has no root entry".to_owned());
        return report;
    };

    let mut reachable: BTreeSet<BlockId> = BTreeSet::new();
    let mut seen: HashMap<NodeId, BlockId> = HashMap::new();
    let mut stack = vec![Frame {
        block: root_block,
        expected_parent: NodeId::ROOT,
    }];

    while let Some(frame) = stack.pop() {
        let inode = match Inode::load(&inner.store, frame.block) {
            Ok(inode) => inode,
            Err(e) => {
                report.errors.push(format!("inode page {}: {e}", frame.block));
                continue;
            }
        };
        if let Some(prior) = seen.insert(inode.node_id, frame.block) {
            report.errors.push(format!(
                "node {} appears at pages {prior} and {}",
                inode.node_id, frame.block
            ));
            continue;
        }
        if inode.parent != frame.expected_parent {
            report.errors.push(format!(
                "node {} records parent {} but is linked under {}",
                inode.node_id, inode.parent, frame.expected_parent
            ));
        }
        if !reachable.insert(frame.block) {
            report.errors.push(format!("page {} reached twice", frame.block));
        }

        // Walk the content chain once, collecting its pages.
        let mut chain_pages = Vec::new();
        let mut cur = Some(inode.content_head);
        let mut chain_broken = false;
        while let Some(page) = cur {
            if !reachable.insert(page) {
                report.errors.push(format!("page {page} reached twice"));
                chain_broken = true;
                break;
            }
            chain_pages.push(page);
            match IndexPage::load(&inner.store, page) {
                Ok(ip) => cur = ip.next(),
                Err(e) => {
                    report.errors.push(format!("index page {page}: {e}"));
                    chain_broken = true;
                    break;
                }
            }
        }
        report.index_pages += chain_pages.len() as u64;
        if chain_broken {
            continue;
        }
        if chain_pages.last() != Some(&inode.content_tail) {
            report.errors.push(format!(
                "node {}: content_tail {} is not the chain's last page",
                inode.node_id, inode.content_tail
            ));
        }

        match inode.kind {
            NodeKind::Dir => {
                check_dir(inner, &inode, &chain_pages, &mut stack, &mut report);
            }
            NodeKind::File => {
                check_file(inner, &inode, &chain_pages, &mut reachable, &mut report);
            }
        }

        // The node table and the DFS must both agree with the walk.
        match inner.nodes.get(&inode.node_id) {
            Some(&mapped) if mapped == frame.block => {}
            Some(&mapped) => report.errors.push(format!(
                "node table maps {} to {mapped}, walk found {}",
                inode.node_id, frame.block
            )),
            None => report
                .errors
                .push(format!("node {} missing from the node table", inode.node_id)),
        }
        match block_of_node(&inner.store, root_block, inode.node_id) {
            Ok(Some(found)) if found == frame.block => {}
            Ok(found) => report.errors.push(format!(
                "tree search for node {} found {found:?}, walk found {}",
                inode.node_id, frame.block
            )),
            Err(e) => report
                .errors
                .push(format!("tree search for node {}: {e}", inode.node_id)),
        }
    }

    report.nodes = seen.len() as u64;

    for (node, block) in &inner.nodes {
        if !seen.contains_key(node) {
            report.errors.push(format!(
                "node table entry {node} -> {block} is unreachable from the root"
            ));
        }
    }
    for id in inner.store.live_ids() {
        if !reachable.contains(&id) {
            report.errors.push(format!("orphan page {id}"));
        }
    }

    report
}

/// Dense packing plus child bookkeeping for one directory.
fn check_dir(
    inner: &FsInner,
    dir: &Inode,
    chain_pages: &[BlockId],
    stack: &mut Vec<Frame>,
    report: &mut CheckReport,
) {
    for (i, &page) in chain_pages.iter().enumerate() {
        let Ok(ip) = IndexPage::load(&inner.store, page) else {
            continue;
        };
        let is_tail = i + 1 == chain_pages.len();
        let mut seen_empty = false;
        for slot in 0..PAYLOAD_SLOTS {
            match ip.slot(slot) {
                Some(_) if seen_empty => {
                    report.errors.push(format!(
                        "directory {}: page {page} violates dense packing at slot {slot}",
                        dir.node_id
                    ));
                    break;
                }
                Some(_) => {}
                None => seen_empty = true,
            }
        }
        if !is_tail && seen_empty {
            report.errors.push(format!(
                "directory {}: interior page {page} is not full",
                dir.node_id
            ));
        }
    }

    let mut names = BTreeSet::new();
    for entry in chain::iter(&inner.store, dir.content_head) {
        match entry {
            Ok((_, child_block)) => {
                stack.push(Frame {
                    block: child_block,
                    expected_parent: dir.node_id,
                });
                match Inode::load(&inner.store, child_block) {
                    Ok(child) => {
                        if !names.insert(child.name.clone()) {
                            report.errors.push(format!(
                                "directory {}: duplicate child name {:?}",
                                dir.node_id, child.name
                            ));
                        }
                    }
                    Err(e) => report
                        .errors
                        .push(format!("directory {}: child {child_block}: {e}", dir.node_id)),
                }
            }
            Err(e) => report
                .errors
                .push(format!("directory {} chain: {e}", dir.node_id)),
        }
    }
}

/// Size accounting for one file: chain length matches the size, data
/// pages sit only below the size boundary, and none is shared.
fn check_file(
    inner: &FsInner,
    file: &Inode,
    chain_pages: &[BlockId],
    reachable: &mut BTreeSet<BlockId>,
    report: &mut CheckReport,
) {
    let expect_chain = index_pages_for(file.size);
    if chain_pages.len() as u64 != expect_chain {
        report.errors.push(format!(
            "file {}: {} index pages for size {} (expected {expect_chain})",
            file.node_id,
            chain_pages.len(),
            file.size
        ));
    }

    let data_limit = data_pages_for(file.size);
    let mut data_count: u64 = 0;
    for (ord, &page) in chain_pages.iter().enumerate() {
        let Ok(ip) = IndexPage::load(&inner.store, page) else {
            continue;
        };
        for (slot, data_page) in ip.occupied() {
            let global_slot = ord as u64 * PAYLOAD_SLOTS as u64 + slot as u64;
            if global_slot >= data_limit {
                report.errors.push(format!(
                    "file {}: data page {data_page} at slot {global_slot} lies past the file end",
                    file.node_id
                ));
            }
            if !reachable.insert(data_page) {
                report.errors.push(format!("page {data_page} reached twice"));
            }
            data_count += 1;
        }
    }
    report.data_pages += data_count;
    if data_count > data_limit {
        report.errors.push(format!(
            "file {}: {data_count} data pages exceed the {data_limit} its size allows",
            file.node_id
        ));
    }
}
