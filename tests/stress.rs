//! Randomised fill / drain cycles over arenas of several sizes.

use rand::{Rng, SeedableRng, rngs::StdRng};
use segfit::{Arena, Word};
use std::ptr::NonNull;
use test_log::test;

struct Fixture {
  arena_bytes: usize,
  rounds: usize,
  max_request: usize,
}

const FIXTURES: [Fixture; 4] = [
  Fixture { arena_bytes: 8 << 10, rounds: 400, max_request: 513 },
  Fixture { arena_bytes: 128 << 10, rounds: 100, max_request: 1025 },
  Fixture { arena_bytes: 1 << 20, rounds: 20, max_request: 16385 },
  Fixture { arena_bytes: 16 << 20, rounds: 4, max_request: 32769 },
];

struct Live {
  ptr: NonNull<u8>,
  len: usize,
  tag: u8,
}

fn fill(arena: &mut Arena<'_, impl Word>, rng: &mut StdRng, max: usize, live: &mut Vec<Live>) {
  loop {
    let len = rng.random_range(0..max);
    let Some(ptr) = arena.allocate(len) else {
      return;
    };
    assert!(unsafe { arena.usable_size(ptr) } >= len);
    let tag = rng.random();
    unsafe { ptr.as_ptr().write_bytes(tag, len) };
    live.push(Live { ptr, len, tag });
  }
}

fn release(arena: &mut Arena<'_, impl Word>, entry: Live) {
  let payload = unsafe { std::slice::from_raw_parts(entry.ptr.as_ptr(), entry.len) };
  assert!(
    payload.iter().all(|&b| b == entry.tag),
    "payload at {:p} was overwritten",
    entry.ptr
  );
  unsafe { arena.release(entry.ptr) };
}

fn run<W: Word>(fixture: &Fixture, seed: u64) {
  let mut memory = vec![0u8; fixture.arena_bytes];
  let mut arena = Arena::<W>::from_slice(&mut memory).unwrap();
  let pristine = arena.metadata().to_vec();
  let first = arena.blocks().next().unwrap();

  let mut rng = StdRng::seed_from_u64(seed);
  let mut live = Vec::new();

  for _ in 0..fixture.rounds {
    fill(&mut arena, &mut rng, fixture.max_request, &mut live);
    assert_eq!(arena.check(), Ok(()));

    for _ in 0..live.len() / 2 {
      let entry = live.swap_remove(rng.random_range(0..live.len()));
      release(&mut arena, entry);
    }
    assert_eq!(arena.check(), Ok(()));
  }

  for entry in live.drain(..) {
    release(&mut arena, entry);
  }
  assert_eq!(arena.check(), Ok(()));
  assert_eq!(arena.metadata(), &pristine[..]);
  assert_eq!(arena.blocks().collect::<Vec<_>>(), vec![first]);
}

#[test]
fn fill_and_drain_32bit_words() {
  for (i, fixture) in FIXTURES.iter().enumerate() {
    run::<u32>(fixture, 0x32 + i as u64);
  }
}

#[test]
fn fill_and_drain_native_words() {
  for (i, fixture) in FIXTURES.iter().enumerate() {
    run::<usize>(fixture, 0x64 + i as u64);
  }
}
