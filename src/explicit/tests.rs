use core::mem::MaybeUninit;
use std::{prelude::v1::*, string::String, vec::Vec};

use super::*;
use crate::tests::{assert_filled, fill, write_header, Align};

fn layout<T>(heap: &ExplicitHeap<'_, T>) -> Vec<(usize, usize, bool)> {
    heap.region
        .as_ref()
        .unwrap()
        .blocks()
        .map(|(offset, header)| (offset, header.size(), header.is_used()))
        .collect()
}

fn free_list<T>(heap: &ExplicitHeap<'_, T>) -> Vec<usize> {
    let region = heap.region.as_ref().unwrap();
    let mut nodes = Vec::new();
    let mut cursor = heap.free.head;
    while let Some(offset) = cursor {
        assert!(nodes.len() < 1000, "runaway free list: {:?}", nodes);
        nodes.push(offset);
        cursor = free_block_at(region, offset).links(region).next;
    }
    nodes
}

fn offset_of<T>(heap: &ExplicitHeap<'_, T>, ptr: NonNull<u8>) -> usize {
    heap.region.as_ref().unwrap().block_of(ptr).unwrap()
}

fn block_size(request: usize) -> usize {
    block_size_for(request, MIN_PAYLOAD).unwrap()
}

#[test]
fn min_block_holds_links() {
    assert!(MIN_PAYLOAD >= 2 * WORD_SIZE);
    assert_eq!(MIN_PAYLOAD % ALIGNMENT, 0);
    assert_eq!(ExplicitHeap::<NoTrap>::MIN_BLOCK, HEADER_SIZE + MIN_PAYLOAD);
}

#[test]
fn most_recently_freed_block_is_reused_first() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(200).unwrap();
    assert_eq!(offset_of(&heap, a), 0);
    assert_eq!(offset_of(&heap, b), block_size(100));

    heap.release(a);
    let c = heap.allocate(50).unwrap();
    assert_eq!(c, a);
    assert_eq!(heap.validate(), Ok(()));
}

#[test]
fn free_list_is_lifo() {
    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    let a = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    let c = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    let tail = 4 * block_size(100);

    heap.release(a);
    heap.release(c);
    assert_eq!(
        free_list(&heap),
        [offset_of(&heap, c), offset_of(&heap, a), tail]
    );

    assert_eq!(heap.allocate(100), Some(c));
    assert_eq!(heap.allocate(100), Some(a));
    assert_eq!(free_list(&heap), [tail]);
    assert_eq!(heap.validate(), Ok(()));
}

#[test]
fn release_coalesces_with_both_neighbors() {
    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    let bs = block_size(100);
    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(100).unwrap();
    let c = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();

    heap.release(a);
    heap.release(c);
    assert_eq!(heap.validate(), Ok(()));

    heap.release(b);
    assert_eq!(
        layout(&heap),
        [
            (0, 3 * bs, false),
            (3 * bs, bs, true),
            (4 * bs, 4096 - 4 * bs, false)
        ]
    );
    assert_eq!(free_list(&heap), [0, 4 * bs]);
    assert_eq!(heap.validate(), Ok(()));
}

#[test]
fn release_coalesces_with_the_tail() {
    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(100).unwrap();
    heap.release(b);
    heap.release(a);

    assert_eq!(layout(&heap), [(0, 4096, false)]);
    assert_eq!(free_list(&heap), [0]);
    assert_eq!(heap.validate(), Ok(()));
}

#[test]
fn coalescing_serves_fragmented_request() {
    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    let total = block_size(100) + block_size(200);
    heap.init(&mut pool.0[..total]).unwrap();

    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(200).unwrap();
    assert_eq!(heap.allocate(1), None);

    heap.release(a);
    heap.release(b);
    assert!(heap.allocate(100 + 200 + HEADER_SIZE).is_some());
    assert_eq!(heap.validate(), Ok(()));
}

#[test]
fn grow_in_place_absorbs_free_neighbor() {
    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    let bs = block_size(100);
    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(100).unwrap();
    let c = heap.allocate(100).unwrap();
    fill(a, 100, 0x42);
    heap.release(b);

    assert_eq!(heap.resize(Some(a), 150), Some(a));
    assert_filled(a, 100, 0x42);

    let grown = block_size(150);
    let mut expected = Vec::new();
    expected.push((0, grown, true));
    if 2 * bs - grown >= MIN_BLOCK_SIZE {
        expected.push((grown, 2 * bs - grown, false));
    } else {
        expected[0].1 = 2 * bs;
    }
    expected.push((offset_of(&heap, c), bs, true));
    expected.push((3 * bs, 4096 - 3 * bs, false));
    assert_eq!(layout(&heap), expected);
    assert_eq!(heap.validate(), Ok(()));
}

#[test]
fn growth_relocates_when_neighbor_is_used() {
    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    let bs = block_size(100);
    let a = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    fill(a, 100, 0x77);

    let new_a = heap.resize(Some(a), 300).unwrap();
    assert_eq!(offset_of(&heap, new_a), 2 * bs);
    assert_filled(new_a, 100, 0x77);

    // The old block is back in the free list
    assert_eq!(layout(&heap)[0], (0, bs, false));
    assert!(free_list(&heap).contains(&0));
    assert_eq!(heap.validate(), Ok(()));
}

#[test]
fn shrink_merges_tail_with_following_free_block() {
    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    let a = heap.allocate(1000).unwrap();
    assert_eq!(heap.resize(Some(a), 16), Some(a));

    let bs = block_size(16);
    assert_eq!(layout(&heap), [(0, bs, true), (bs, 4096 - bs, false)]);
    assert_eq!(free_list(&heap), [bs]);
    assert_eq!(heap.validate(), Ok(()));
}

#[test]
fn shrink_keeps_remainder_too_small_to_split() {
    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    let a = heap.allocate(ALIGNMENT * 4).unwrap();
    heap.allocate(1).unwrap();
    let before = layout(&heap);

    assert_eq!(heap.resize(Some(a), ALIGNMENT * 3), Some(a));
    assert_eq!(layout(&heap), before);
    assert_eq!(heap.validate(), Ok(()));
}

#[test]
fn release_rejects_fake_header_inside_payload() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    let a = heap.allocate(1000).unwrap();
    fill(a, 1000, 0);
    let fake = NonNull::new(unsafe { a.as_ptr().add(4 * ALIGNMENT + HEADER_SIZE) }).unwrap();
    write_header(fake, Header::new(MIN_BLOCK_SIZE, true));

    let before = layout(&heap);
    let free_before = free_list(&heap);
    heap.release(fake);
    assert_eq!(layout(&heap), before);
    assert_eq!(free_list(&heap), free_before);
    assert_eq!(heap.validate(), Ok(()));
}

#[test]
fn resize_rejects_fake_header_inside_payload() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    let a = heap.allocate(1000).unwrap();
    heap.allocate(100).unwrap();
    fill(a, 1000, 0);
    let fake = NonNull::new(unsafe { a.as_ptr().add(4 * ALIGNMENT + HEADER_SIZE) }).unwrap();
    write_header(fake, Header::new(ALIGNMENT * 40, true));
    let fake_header = unsafe { a.as_ptr().add(4 * ALIGNMENT).cast::<usize>().read() };

    let before = layout(&heap);
    let free_before = free_list(&heap);

    assert_eq!(heap.usable_size(fake), None);
    assert_eq!(heap.resize(Some(fake), 8), None);
    assert_eq!(heap.resize(Some(fake), 2000), None);
    heap.release(fake);

    assert_eq!(layout(&heap), before);
    assert_eq!(free_list(&heap), free_before);
    // The payload of `a` is left alone
    assert_eq!(
        unsafe { a.as_ptr().add(4 * ALIGNMENT).cast::<usize>().read() },
        fake_header
    );
    assert_filled(a, 4 * ALIGNMENT, 0);
    assert_eq!(heap.validate(), Ok(()));
}

#[test]
fn validator_detects_free_list_cycle() {
    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    let a = heap.allocate(100).unwrap();
    heap.allocate(4096 - block_size(100) - HEADER_SIZE).unwrap();
    heap.release(a);
    assert_eq!(free_list(&heap), [0]);

    let region = heap.region.as_mut().unwrap();
    free_block_at(region, 0).set_next(region, Some(0));
    assert_eq!(heap.validate(), Err(Corruption::FreeListCycle { node: 0 }));
}

#[test]
fn validator_detects_broken_prev_link() {
    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    let a = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    let c = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    heap.release(a);
    heap.release(c);

    let region = heap.region.as_mut().unwrap();
    free_block_at(region, 0).set_prev(region, None);
    assert_eq!(heap.validate(), Err(Corruption::BrokenFreeLink { node: 0 }));
}

#[test]
fn validator_detects_adjacent_free_blocks() {
    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    let bs = block_size(100);
    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    heap.release(a);
    write_header(b, Header::new(bs, false));

    assert_eq!(
        heap.validate(),
        Err(Corruption::AdjacentFree {
            offset: 0,
            next: bs
        })
    );
}

#[test]
fn validator_detects_unlisted_free_block() {
    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    let a = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    write_header(a, Header::new(block_size(100), false));

    assert_eq!(
        heap.validate(),
        Err(Corruption::FreeCountMismatch {
            linear: 2,
            listed: 1
        })
    );
}

#[test]
fn validator_detects_used_block_in_free_list() {
    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    let bs = block_size(100);
    heap.allocate(100).unwrap();
    let b = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    heap.release(b);
    write_header(b, Header::new(bs, true));

    assert_eq!(
        heap.validate(),
        Err(Corruption::UsedBlockInFreeList { node: bs })
    );
}

#[test]
fn validator_detects_stray_free_node() {
    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    heap.free.head = Some(8192);
    assert_eq!(
        heap.validate(),
        Err(Corruption::StrayFreeNode { node: 8192 })
    );
}

#[test]
fn trap_receives_corruption() {
    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut seen = Vec::new();
    {
        let mut heap = ExplicitHeap::with_trap(|c: &Corruption| seen.push(*c));
        heap.init(&mut pool.0).unwrap();
        heap.free.head = None;
        assert_eq!(
            heap.validate(),
            Err(Corruption::FreeCountMismatch {
                linear: 1,
                listed: 0
            })
        );
    }
    assert_eq!(
        seen,
        [Corruption::FreeCountMismatch {
            linear: 1,
            listed: 0
        }]
    );
}

#[test]
fn dump_shows_free_links() {
    let mut pool = Align([MaybeUninit::uninit(); 4096]);
    let mut heap: ExplicitHeap = ExplicitHeap::INIT;
    heap.init(&mut pool.0).unwrap();

    let a = heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    heap.release(a);

    let mut out = String::new();
    heap.dump(&mut out).unwrap();
    log::trace!("{}", out);

    let base = heap.region.as_ref().unwrap().address(0);
    assert!(
        out.contains(&std::format!("free_head=0x{:x}", base)),
        "{}",
        out
    );
    assert!(out.contains("prev=None"), "{}", out);
    assert_eq!(out.matches("ALLOC").count(), 1);
    assert_eq!(out.matches("FREE").count(), 2);
}
