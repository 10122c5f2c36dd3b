#![forbid(unsafe_code)]
//! Algebraic laws and boundary behaviors of the namespace surface.

use pagefs_core::{FsConfig, PageFs};
use pagefs_types::{data_pages_for, INDEX_SPAN, PAGE_SIZE};

fn fs() -> PageFs {
    PageFs::new(FsConfig::default()).unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(97).wrapping_add(seed))
        .collect()
}

#[test]
fn write_then_read_is_identity() {
    let fs = fs();
    fs.mknod("f", 0o644, 0).unwrap();

    for (off, len) in [(0_u64, 17_usize), (4000, 200), (9000, PAGE_SIZE * 3)] {
        let data = pattern(len, off as u8);
        assert_eq!(fs.write("f", off, &data).unwrap(), len);
        let mut buf = vec![0_u8; len];
        assert_eq!(fs.read("f", off, &mut buf).unwrap(), len);
        assert_eq!(buf, data, "mismatch at off={off} len={len}");
    }
}

#[test]
fn double_truncate_leaves_exact_page_count() {
    let fs = fs();
    fs.mknod("f", 0o644, 0).unwrap();
    fs.write("f", 0, &pattern(20 * PAGE_SIZE, 1)).unwrap();

    let s1 = 11 * PAGE_SIZE as u64 + 5;
    let s2 = 3 * PAGE_SIZE as u64 + 1;
    fs.truncate("f", s1).unwrap();
    fs.truncate("f", s2).unwrap();

    let report = fs.check();
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.data_pages, data_pages_for(s2));
    assert_eq!(report.data_pages, 4);
}

#[test]
fn create_then_unlink_restores_the_allocation_count() {
    let fs = fs();
    let baseline = fs.stats().pages_allocated;
    fs.mknod("tmp", 0o644, 0).unwrap();
    fs.write("tmp", 0, &pattern(6 * PAGE_SIZE, 2)).unwrap();
    fs.unlink("tmp").unwrap();
    assert_eq!(fs.stats().pages_allocated, baseline);
}

#[test]
fn create_and_remove_leave_an_empty_root() {
    let fs = fs();
    fs.mkdir("a", 0o755).unwrap();
    fs.mknod("a/b", 0o644, 0).unwrap();
    fs.unlink("a/b").unwrap();
    fs.rmdir("a").unwrap();

    let mut names = Vec::new();
    fs.readdir("", &mut |name, _| names.push(name.to_owned()))
        .unwrap();
    assert_eq!(names, vec![".", ".."]);
    assert_eq!(fs.stats().pages_allocated, 2);
    assert!(fs.check().is_clean());
}

#[test]
fn read_past_the_end_clamps_to_zero() {
    let fs = fs();
    fs.mknod("f", 0o644, 0).unwrap();
    fs.write("f", 0, b"0123456789").unwrap();

    let mut buf = [0_u8; 32];
    assert_eq!(fs.read("f", 4, &mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], b"456789");
    assert_eq!(fs.read("f", 10, &mut buf).unwrap(), 0);
    assert_eq!(fs.read("f", 11, &mut buf).unwrap(), 0);
    assert_eq!(fs.read("f", u64::MAX, &mut buf).unwrap(), 0);
}

#[test]
fn write_across_the_index_page_seam_follows_the_link() {
    let fs = fs();
    fs.mknod("f", 0o644, 0).unwrap();

    let off = INDEX_SPAN - 100;
    let data = pattern(300, 7);
    assert_eq!(fs.write("f", off, &data).unwrap(), 300);
    assert_eq!(fs.getattr("f").unwrap().size, off + 300);

    let mut buf = vec![0_u8; 300];
    assert_eq!(fs.read("f", off, &mut buf).unwrap(), 300);
    assert_eq!(buf, data);
    assert!(fs.check().is_clean());
}

#[test]
fn data_page_allocation_steps_at_page_size() {
    let fs = fs();
    fs.mknod("f", 0o644, 0).unwrap();

    fs.write("f", 0, &pattern(PAGE_SIZE, 1)).unwrap();
    assert_eq!(fs.check().data_pages, 1);

    fs.write("f", 0, &pattern(PAGE_SIZE + 1, 1)).unwrap();
    assert_eq!(fs.check().data_pages, 2);
}

#[test]
fn growth_past_the_index_span_adds_an_index_page() {
    let fs = fs();
    fs.mknod("f", 0o644, 0).unwrap();

    fs.truncate("f", INDEX_SPAN).unwrap();
    // Root chain head + root inode + file inode + one index page.
    assert_eq!(fs.check().index_pages, 2);

    fs.truncate("f", INDEX_SPAN + 1).unwrap();
    assert_eq!(fs.check().index_pages, 3);
    assert!(fs.check().is_clean());
}

#[test]
fn sizes_survive_shrink_grow_cycles() {
    let fs = fs();
    fs.mknod("f", 0o644, 0).unwrap();
    let data = pattern(5 * PAGE_SIZE, 9);
    fs.write("f", 0, &data).unwrap();

    fs.truncate("f", 2 * PAGE_SIZE as u64).unwrap();
    fs.truncate("f", 4 * PAGE_SIZE as u64).unwrap();

    // The re-grown tail reads as zeros, the kept prefix is intact.
    let mut buf = vec![0xEE_u8; 4 * PAGE_SIZE];
    assert_eq!(fs.read("f", 0, &mut buf).unwrap(), 4 * PAGE_SIZE);
    assert_eq!(&buf[..2 * PAGE_SIZE], &data[..2 * PAGE_SIZE]);
    assert!(buf[2 * PAGE_SIZE..].iter().all(|b| *b == 0));
    assert!(fs.check().is_clean());
}
