//! Two-level segregated-fit allocator for a single caller-provided memory extent.
//!
//! All bookkeeping (presence bitmaps, free-list bucket table, block headers) lives inside the
//! extent itself, so the allocator needs nothing but a `(base, length)` pair:
//!
//! ```text
//!   base ┌──────────┬─────────────────┬──────────────────────────┬────────────────────────┐
//!        │ FL word  │ SL words [FL]   │ bucket heads [FL][32]    │ blocks ...             │
//!        └──────────┴─────────────────┴──────────────────────────┴────────────────────────┘
//!
//!   block ┌────────────────┬───────────────────┬─────────────┬─────────────┬──────────────┐
//!         │ size | flags   │ physical previous │ list prev   │ list next   │ payload ...  │
//!         └────────────────┴───────────────────┴─────────────┴─────────────┴──────────────┘
//!                                              ▲ payload starts here while allocated
//! ```
//!
//! `allocate` and `release` run in bounded time: the free block is located by bit scanning the
//! two presence bitmaps, never by walking lists.
//!
//! ```
//! use segfit::Arena;
//!
//! let mut memory = [0u8; 4096];
//! let mut arena = Arena::<u32>::from_slice(&mut memory).unwrap();
//!
//! let ptr = arena.allocate(100).unwrap();
//! assert!(unsafe { arena.usable_size(ptr) } >= 100);
//! unsafe { arena.release(ptr) };
//! assert!(arena.check().is_ok());
//! ```

#![no_std]

#[cfg(test)]
extern crate std;

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::UnsafeCell,
  fmt,
  hint,
  marker::PhantomData,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};

// Forwards to the `log` facade when the feature is enabled.
macro_rules! log_event {
  ($level:ident, $($arg:tt)+) => {{
    #[cfg(feature = "log")]
    ::log::$level!($($arg)+);
  }};
}

// =============================================================================
// Constants
// =============================================================================

/// Second-level subdivisions of every first-level class.
pub const SL_COUNT: usize = 32;
const SL_COUNT_LOG2: u32 = SL_COUNT.trailing_zeros();

/// Sizes below this limit all live in first-level class 0, split linearly.
pub const SMALL_BLOCK_LIMIT: usize = 128;

/// `fl = highest_set_bit(size) - FL_SHIFT` for sizes at or above `SMALL_BLOCK_LIMIT`.
const FL_SHIFT: u32 = SMALL_BLOCK_LIMIT.trailing_zeros() - 1;

/// Width of one linear second-level slot in class 0.
const CLASS_GRANULE: usize = SMALL_BLOCK_LIMIT / SL_COUNT;

const BLOCK_FREE: usize = 0x1;
const BLOCK_LAST: usize = 0x2;
const BLOCK_FLAGS: usize = BLOCK_FREE | BLOCK_LAST;

/// The first-level bitmap always sits at offset 0, so no block can ever live there.
const FL_BITMAP_OFFSET: usize = 0;
const NO_BLOCK: usize = 0;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(SL_COUNT.is_power_of_two());
const _: () = assert!(SMALL_BLOCK_LIMIT.is_power_of_two());
const _: () = assert!(SMALL_BLOCK_LIMIT == 1 << (FL_SHIFT + 1));
const _: () = assert!(CLASS_GRANULE == 4);
const _: () = assert!(CLASS_GRANULE > BLOCK_FLAGS);
const _: () = assert!(SL_COUNT <= u32::BITS as usize);

// =============================================================================
// Bit Primitives
// =============================================================================

/// Stateless word helpers used by the size-class math and bitmap scans.
pub mod bits {
  /// Index of the most significant set bit. `value` must be non-zero.
  #[inline(always)]
  pub const fn highest_set_bit(value: usize) -> u32 {
    debug_assert!(value != 0, "highest_set_bit of zero");
    usize::BITS - 1 - value.leading_zeros()
  }

  /// Index of the least significant set bit. `value` must be non-zero.
  #[inline(always)]
  pub const fn lowest_set_bit(value: usize) -> u32 {
    debug_assert!(value != 0, "lowest_set_bit of zero");
    value.trailing_zeros()
  }

  /// Smallest power of two `>= value`, or `None` if it does not fit a word.
  /// Powers of two map to themselves.
  #[inline]
  pub const fn next_power_of_two(value: usize) -> Option<usize> {
    value.checked_next_power_of_two()
  }

  #[inline(always)]
  pub const fn is_power_of_two(value: usize) -> bool {
    value.is_power_of_two()
  }

  /// A word with only bit `pos` set.
  #[inline(always)]
  pub const fn bit(pos: usize) -> usize {
    1 << pos
  }

  #[inline(always)]
  pub const fn set_bit(value: usize, pos: usize) -> usize {
    value | bit(pos)
  }

  #[inline(always)]
  pub const fn clear_bit(value: usize, pos: usize) -> usize {
    value & !bit(pos)
  }

  #[inline(always)]
  pub const fn test_bit(value: usize, pos: usize) -> bool {
    value & bit(pos) != 0
  }

  /// All bits strictly below `pos`.
  #[inline(always)]
  pub const fn mask_below(pos: usize) -> usize {
    match 1usize.checked_shl(pos as u32) {
      Some(b) => b - 1,
      None => usize::MAX,
    }
  }

  /// All bits strictly above `pos`.
  #[inline(always)]
  pub const fn mask_above(pos: usize) -> usize {
    match usize::MAX.checked_shl(pos as u32 + 1) {
      Some(m) => m,
      None => 0,
    }
  }

  #[inline(always)]
  pub const fn rotate_left(value: usize, shift: u32) -> usize {
    value.rotate_left(shift)
  }

  #[inline(always)]
  pub const fn rotate_right(value: usize, shift: u32) -> usize {
    value.rotate_right(shift)
  }

  /// Rounds `value` up to a multiple of the power-of-two `align`.
  #[inline(always)]
  pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    let mask = align - 1;
    match value.checked_add(mask) {
      Some(v) => Some(v & !mask),
      None => None,
    }
  }

  /// Rounds `value` down to a multiple of the power-of-two `align`.
  #[inline(always)]
  pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
  }
}

// =============================================================================
// Metadata Word
// =============================================================================

mod sealed {
  pub trait Sealed {}
  impl Sealed for u32 {}
  impl Sealed for u64 {}
  impl Sealed for usize {}
}

/// Storage type of every metadata word inside the arena: bitmaps, size words and block links.
///
/// `usize` matches the host; `u32` reproduces the 32-bit layout on any host, which keeps raw
/// arena dumps comparable across targets.
pub trait Word: sealed::Sealed + Copy + Eq + fmt::Debug + 'static {
  /// Width in bytes; also the arena's alignment granularity.
  const BYTES: usize;
  /// Largest value storable, expressed as `usize`.
  const LIMIT: usize;

  /// Truncating conversion; callers keep `value <= LIMIT`.
  fn from_usize(value: usize) -> Self;
  fn to_usize(self) -> usize;
}

impl Word for u32 {
  const BYTES: usize = 4;
  const LIMIT: usize = if usize::BITS > u32::BITS { u32::MAX as usize } else { usize::MAX };

  #[inline(always)]
  fn from_usize(value: usize) -> Self {
    value as u32
  }

  #[inline(always)]
  fn to_usize(self) -> usize {
    self as usize
  }
}

impl Word for u64 {
  const BYTES: usize = 8;
  const LIMIT: usize = usize::MAX;

  #[inline(always)]
  fn from_usize(value: usize) -> Self {
    value as u64
  }

  #[inline(always)]
  fn to_usize(self) -> usize {
    self as usize
  }
}

impl Word for usize {
  const BYTES: usize = size_of::<usize>();
  const LIMIT: usize = usize::MAX;

  #[inline(always)]
  fn from_usize(value: usize) -> Self {
    value
  }

  #[inline(always)]
  fn to_usize(self) -> usize {
    self
  }
}

// =============================================================================
// Size Classes
// =============================================================================

/// A `(first level, second level)` size-class pair.
///
/// Computed fresh for every insert, extract and search; never stored in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Level {
  pub fl: usize,
  pub sl: usize,
}

impl Level {
  /// Class containing `size`, rounded down to the class granule.
  ///
  /// Sizes below [`SMALL_BLOCK_LIMIT`] map linearly onto `fl = 0` in steps of 4 bytes. Larger
  /// sizes use `fl = highest_set_bit(size) - 6` and split `[2^(fl+6), 2^(fl+7))` into
  /// [`SL_COUNT`] equal slots.
  #[inline]
  pub const fn classify(size: usize) -> Self {
    let size = bits::align_down(size, CLASS_GRANULE);
    if size < SMALL_BLOCK_LIMIT {
      Self { fl: 0, sl: size / CLASS_GRANULE }
    } else {
      let fl = (bits::highest_set_bit(size) - FL_SHIFT) as usize;
      let base = 1usize << (fl as u32 + FL_SHIFT);
      let slot_shift = fl as u32 + FL_SHIFT - SL_COUNT_LOG2;
      Self { fl, sl: (size - base) >> slot_shift }
    }
  }

  /// The class just above `classify(size)`.
  ///
  /// Any block found at or above this class is at least `size` bytes, whereas a block merely
  /// sharing `size`'s class may be smaller. `None` if the first level overflows the word.
  #[inline]
  pub const fn classify_for_search(size: usize) -> Option<Self> {
    let level = Self::classify(size);
    if level.sl + 1 < SL_COUNT {
      Some(Self { fl: level.fl, sl: level.sl + 1 })
    } else if level.fl + 1 + (FL_SHIFT as usize) < usize::BITS as usize {
      Some(Self { fl: level.fl + 1, sl: 0 })
    } else {
      None
    }
  }

  /// Byte range `[lo, hi)` covered by this class (`hi` saturates at `usize::MAX`).
  pub const fn range(self) -> (usize, usize) {
    if self.fl == 0 {
      let lo = self.sl * CLASS_GRANULE;
      (lo, lo + CLASS_GRANULE)
    } else {
      let slot_shift = self.fl as u32 + FL_SHIFT - SL_COUNT_LOG2;
      let lo = (1usize << (self.fl as u32 + FL_SHIFT)) + (self.sl << slot_shift);
      (lo, lo.saturating_add(1 << slot_shift))
    }
  }

  #[inline(always)]
  pub const fn fl_bit(self) -> usize {
    bits::bit(self.fl)
  }

  #[inline(always)]
  pub const fn sl_bit(self) -> usize {
    bits::bit(self.sl)
  }
}

// =============================================================================
// Errors
// =============================================================================

/// Why an extent could not be turned into an arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitError {
  /// The aligned extent cannot hold the metadata plus one minimum-size block.
  ArenaTooSmall { required: usize, available: usize },
  /// The extent has offsets that the metadata word type cannot represent.
  ExtentTooLarge { length: usize, limit: usize },
}

impl fmt::Display for InitError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      InitError::ArenaTooSmall { required, available } => write!(
        f,
        "arena too small: need at least {required} bytes, extent provides {available}"
      ),
      InitError::ExtentTooLarge { length, limit } => write!(
        f,
        "extent of {length} bytes exceeds the {limit}-byte limit of the metadata word"
      ),
    }
  }
}

impl core::error::Error for InitError {}

/// A structural inconsistency found by [`Arena::check`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Corruption {
  /// A block header runs past the end of the extent, or the chain does not end exactly there.
  Tiling { offset: usize },
  /// A block's physical back-link does not name its predecessor.
  BackLink { offset: usize },
  /// Two physically adjacent blocks are both free.
  AdjacentFree { offset: usize },
  /// A block is too small to hold the free-list links, or is not word-sized.
  Undersized { offset: usize, size: usize },
  /// A presence bit disagrees with the bucket or bitmap word it summarises.
  Bitmap { fl: usize, sl: usize },
  /// A bucket holds a block that is not free, is in the wrong class or has a broken back-link.
  FreeList { fl: usize, sl: usize, offset: usize },
  /// Free blocks in the chain and blocks linked into buckets do not match up.
  Membership { free_blocks: usize, listed: usize },
}

impl fmt::Display for Corruption {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match *self {
      Corruption::Tiling { offset } => write!(f, "block chain breaks at offset {offset:#x}"),
      Corruption::BackLink { offset } => {
        write!(f, "block at {offset:#x} has a wrong physical back-link")
      }
      Corruption::AdjacentFree { offset } => {
        write!(f, "block at {offset:#x} and its predecessor are both free")
      }
      Corruption::Undersized { offset, size } => {
        write!(f, "block at {offset:#x} has invalid size {size}")
      }
      Corruption::Bitmap { fl, sl } => write!(f, "presence bitmap mismatch at [{fl}][{sl}]"),
      Corruption::FreeList { fl, sl, offset } => {
        write!(f, "bucket [{fl}][{sl}] holds invalid block {offset:#x}")
      }
      Corruption::Membership { free_blocks, listed } => write!(
        f,
        "{free_blocks} free blocks in the chain but {listed} linked into buckets"
      ),
    }
  }
}

impl core::error::Error for Corruption {}

// =============================================================================
// Arena
// =============================================================================

/// One managed extent: presence bitmaps, bucket table and the block chain, all stored in place.
///
/// The descriptor itself only remembers where the extent is; every other piece of state can be
/// re-derived from the extent's bytes. Not internally synchronised: wrap it in a
/// [`LockedArena`] or serialise access externally.
pub struct Arena<'pool, W: Word = usize> {
  base: NonNull<u8>,
  len: usize,
  fl_count: usize,
  _pool: PhantomData<(&'pool mut [u8], W)>,
}

// The arena exclusively owns its extent for `'pool`.
unsafe impl<W: Word> Send for Arena<'_, W> {}

impl<'pool, W: Word> Arena<'pool, W> {
  /// Header kept while a block is allocated: size word and physical back-link.
  pub const HEADER_SIZE: usize = 2 * W::BYTES;
  /// Smallest block footprint; room for the full free header.
  pub const MIN_BLOCK_SIZE: usize = 4 * W::BYTES;

  /// Lays out an arena over `length` bytes starting at `base`.
  ///
  /// `base` is rounded up and `length` down to word boundaries. Nothing is written on failure.
  ///
  /// # Safety
  ///
  /// `base..base + length` must be valid for reads and writes and must not be accessed other
  /// than through the returned arena (and the payloads it hands out) for `'pool`.
  pub unsafe fn new(base: NonNull<u8>, length: usize) -> Result<Self, InitError> {
    let addr = base.as_ptr() as usize;
    let skipped = match bits::align_up(addr, W::BYTES) {
      Some(aligned) => aligned - addr,
      None => usize::MAX,
    };
    let too_small = |available| InitError::ArenaTooSmall {
      required: Self::metadata_size_for(1) + Self::MIN_BLOCK_SIZE,
      available,
    };

    let Some(length) = length.checked_sub(skipped) else {
      log_event!(debug, "extent at {:p} of {} bytes vanishes after alignment", base, length);
      return Err(too_small(0));
    };
    let length = bits::align_down(length, W::BYTES);
    if length > W::LIMIT {
      return Err(InitError::ExtentTooLarge { length, limit: W::LIMIT });
    }

    let ceil_log2 = match bits::next_power_of_two(length) {
      Some(p) => bits::highest_set_bit(p),
      None => usize::BITS,
    };
    let fl_count = match ceil_log2.checked_sub(FL_SHIFT) {
      Some(n) if n > 0 => n as usize,
      _ => return Err(too_small(length)),
    };
    debug_assert!(fl_count <= W::BYTES * 8, "first-level bitmap overflows its word");

    let metadata = Self::metadata_size_for(fl_count);
    let required = metadata + Self::MIN_BLOCK_SIZE;
    if required > length {
      log_event!(debug, "extent of {} bytes rejected, {} required", length, required);
      return Err(InitError::ArenaTooSmall { required, available: length });
    }

    let mut arena = Self {
      // SAFETY: `skipped <= length` was checked above, so the aligned base is in the extent.
      base: unsafe { base.add(skipped) },
      len: length,
      fl_count,
      _pool: PhantomData,
    };

    // SAFETY: the metadata area lies inside the extent we now own.
    unsafe { ptr::write_bytes(arena.base.as_ptr(), 0, metadata) };

    let first = metadata;
    arena.store(first, length - metadata - Self::HEADER_SIZE);
    arena.set_phys_prev(first, None);
    arena.set_flag(first, BLOCK_LAST);
    arena.insert(first);

    log_event!(
      debug,
      "arena at {:p}: {} bytes, {} first-level classes, {} bytes of metadata",
      arena.base,
      length,
      fl_count,
      metadata
    );
    Ok(arena)
  }

  /// Lays out an arena over a borrowed buffer.
  pub fn from_slice(memory: &'pool mut [u8]) -> Result<Self, InitError> {
    let len = memory.len();
    // SAFETY: the exclusive borrow is held for `'pool`.
    unsafe { Self::new(NonNull::from(memory).cast(), len) }
  }

  /// Bytes taken by the bitmaps and bucket table for `fl_count` first-level classes.
  #[inline]
  pub const fn metadata_size_for(fl_count: usize) -> usize {
    W::BYTES * (1 + fl_count * (1 + SL_COUNT))
  }

  /// Aligned start of the extent.
  #[inline]
  pub fn base(&self) -> NonNull<u8> {
    self.base
  }

  /// Aligned length of the extent.
  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn fl_count(&self) -> usize {
    self.fl_count
  }

  #[inline]
  pub fn metadata_size(&self) -> usize {
    Self::metadata_size_for(self.fl_count)
  }

  /// Size of the block region: every block footprint (header plus payload) sums to this.
  #[inline]
  pub fn capacity(&self) -> usize {
    self.len - self.metadata_size()
  }

  /// Raw bytes of the presence bitmaps and bucket table.
  pub fn metadata(&self) -> &[u8] {
    // SAFETY: the metadata area is in the extent and never handed out as payload.
    unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.metadata_size()) }
  }

  // ---------------------------------------------------------------------------
  // Raw word access
  // ---------------------------------------------------------------------------

  #[inline(always)]
  fn load(&self, offset: usize) -> usize {
    debug_assert!(
      offset % W::BYTES == 0 && offset + W::BYTES <= self.len,
      "load: offset {offset:#x} outside arena of {} bytes",
      self.len
    );
    // SAFETY: in bounds and word aligned; the arena owns the extent.
    unsafe { self.base.as_ptr().add(offset).cast::<W>().read() }.to_usize()
  }

  #[inline(always)]
  fn store(&mut self, offset: usize, value: usize) {
    debug_assert!(
      offset % W::BYTES == 0 && offset + W::BYTES <= self.len,
      "store: offset {offset:#x} outside arena of {} bytes",
      self.len
    );
    debug_assert!(value <= W::LIMIT);
    // SAFETY: as in `load`.
    unsafe { self.base.as_ptr().add(offset).cast::<W>().write(W::from_usize(value)) }
  }

  #[inline(always)]
  fn load_link(&self, offset: usize) -> Option<usize> {
    match self.load(offset) {
      NO_BLOCK => None,
      block => Some(block),
    }
  }

  #[inline(always)]
  fn store_link(&mut self, offset: usize, link: Option<usize>) {
    self.store(offset, link.unwrap_or(NO_BLOCK));
  }

  // ---------------------------------------------------------------------------
  // Block header fields
  // ---------------------------------------------------------------------------

  #[inline(always)]
  fn region_start(&self) -> usize {
    self.metadata_size()
  }

  #[inline(always)]
  fn size(&self, block: usize) -> usize {
    self.load(block) & !BLOCK_FLAGS
  }

  #[inline(always)]
  fn set_size(&mut self, block: usize, size: usize) {
    debug_assert!(size & BLOCK_FLAGS == 0, "block size {size} is not word-sized");
    let flags = self.load(block) & BLOCK_FLAGS;
    self.store(block, size | flags);
  }

  #[inline(always)]
  fn is_free(&self, block: usize) -> bool {
    self.load(block) & BLOCK_FREE != 0
  }

  #[inline(always)]
  fn is_last(&self, block: usize) -> bool {
    self.load(block) & BLOCK_LAST != 0
  }

  #[inline(always)]
  fn set_flag(&mut self, block: usize, flag: usize) {
    let word = self.load(block);
    self.store(block, word | flag);
  }

  #[inline(always)]
  fn clear_flag(&mut self, block: usize, flag: usize) {
    let word = self.load(block);
    self.store(block, word & !flag);
  }

  #[inline(always)]
  fn phys_prev(&self, block: usize) -> Option<usize> {
    self.load_link(block + W::BYTES)
  }

  #[inline(always)]
  fn set_phys_prev(&mut self, block: usize, prev: Option<usize>) {
    self.store_link(block + W::BYTES, prev);
  }

  /// Block following `block` in address order. Only meaningful if `block` is not last.
  #[inline(always)]
  fn phys_next(&self, block: usize) -> usize {
    block + Self::HEADER_SIZE + self.size(block)
  }

  // List links overlay the payload, so they may only be touched while the block is free.

  #[inline(always)]
  fn free_prev(&self, block: usize) -> Option<usize> {
    debug_assert!(self.is_free(block), "free_prev of allocated block {block:#x}");
    self.load_link(block + 2 * W::BYTES)
  }

  #[inline(always)]
  fn free_next(&self, block: usize) -> Option<usize> {
    debug_assert!(self.is_free(block), "free_next of allocated block {block:#x}");
    self.load_link(block + 3 * W::BYTES)
  }

  #[inline(always)]
  fn set_free_prev(&mut self, block: usize, prev: Option<usize>) {
    debug_assert!(self.is_free(block), "set_free_prev of allocated block {block:#x}");
    self.store_link(block + 2 * W::BYTES, prev);
  }

  #[inline(always)]
  fn set_free_next(&mut self, block: usize, next: Option<usize>) {
    debug_assert!(self.is_free(block), "set_free_next of allocated block {block:#x}");
    self.store_link(block + 3 * W::BYTES, next);
  }

  #[inline(always)]
  fn payload(&self, block: usize) -> NonNull<u8> {
    // SAFETY: every block header is followed by its payload inside the extent.
    unsafe { self.base.add(block + Self::HEADER_SIZE) }
  }

  #[inline(always)]
  fn block_of(&self, ptr: NonNull<u8>) -> usize {
    (ptr.as_ptr() as usize)
      .wrapping_sub(self.base.as_ptr() as usize)
      .wrapping_sub(Self::HEADER_SIZE)
  }

  // =============================================================================
  // Free-List Bucket Store
  // =============================================================================

  #[inline(always)]
  fn fl_bitmap(&self) -> usize {
    self.load(FL_BITMAP_OFFSET)
  }

  #[inline(always)]
  fn sl_bitmap_offset(fl: usize) -> usize {
    W::BYTES * (1 + fl)
  }

  #[inline(always)]
  fn sl_bitmap(&self, fl: usize) -> usize {
    self.load(Self::sl_bitmap_offset(fl))
  }

  #[inline(always)]
  fn bucket_offset(&self, level: Level) -> usize {
    debug_assert!(level.fl < self.fl_count && level.sl < SL_COUNT);
    W::BYTES * (1 + self.fl_count + level.fl * SL_COUNT + level.sl)
  }

  #[inline(always)]
  fn bucket_head(&self, level: Level) -> Option<usize> {
    self.load_link(self.bucket_offset(level))
  }

  #[inline(always)]
  fn set_bucket_head(&mut self, level: Level, head: Option<usize>) {
    let offset = self.bucket_offset(level);
    self.store_link(offset, head);
  }

  /// Pushes `block` onto the head of its class bucket and marks it free.
  fn insert(&mut self, block: usize) {
    let level = Level::classify(self.size(block));
    debug_assert!(
      level.fl < self.fl_count,
      "insert: block {block:#x} of {} bytes has no bucket",
      self.size(block)
    );

    let fl_map = self.fl_bitmap() | level.fl_bit();
    self.store(FL_BITMAP_OFFSET, fl_map);
    let sl_map = self.sl_bitmap(level.fl) | level.sl_bit();
    self.store(Self::sl_bitmap_offset(level.fl), sl_map);

    let head = self.bucket_head(level);
    self.set_flag(block, BLOCK_FREE);
    self.set_free_prev(block, None);
    self.set_free_next(block, head);
    if let Some(head) = head {
      self.set_free_prev(head, Some(block));
    }
    self.set_bucket_head(level, Some(block));
  }

  /// Unlinks `block` from its bucket, clearing presence bits the bucket no longer earns.
  /// The free flag is left for the caller.
  fn extract(&mut self, block: usize) {
    match (self.free_prev(block), self.free_next(block)) {
      (None, None) => {
        let level = Level::classify(self.size(block));
        self.set_bucket_head(level, None);
        let sl_map = bits::clear_bit(self.sl_bitmap(level.fl), level.sl);
        self.store(Self::sl_bitmap_offset(level.fl), sl_map);
        if sl_map == 0 {
          let fl_map = bits::clear_bit(self.fl_bitmap(), level.fl);
          self.store(FL_BITMAP_OFFSET, fl_map);
        }
      }
      (None, Some(next)) => {
        let level = Level::classify(self.size(block));
        self.set_free_prev(next, None);
        self.set_bucket_head(level, Some(next));
      }
      (Some(prev), None) => self.set_free_next(prev, None),
      (Some(prev), Some(next)) => {
        self.set_free_prev(next, Some(prev));
        self.set_free_next(prev, Some(next));
      }
    }
    self.set_free_prev(block, None);
    self.set_free_next(block, None);
  }

  // =============================================================================
  // Search
  // =============================================================================

  /// Head of the first non-empty bucket at or above `level`, together with that bucket's level.
  ///
  /// Tries the exact bucket, then larger second-level slots of the same first level, then the
  /// smallest populated larger first level. Each tier is a single bit scan.
  fn find(&self, level: Level) -> Option<(Level, usize)> {
    if level.fl >= self.fl_count {
      return None;
    }

    let mut found = level;
    let sl_map = self.sl_bitmap(level.fl);
    if !bits::test_bit(sl_map, level.sl) {
      let larger_sl = sl_map & bits::mask_above(level.sl);
      if larger_sl != 0 {
        found.sl = bits::lowest_set_bit(larger_sl) as usize;
      } else {
        let larger_fl = self.fl_bitmap() & bits::mask_above(level.fl);
        if larger_fl == 0 {
          return None;
        }
        found.fl = bits::lowest_set_bit(larger_fl) as usize;
        found.sl = bits::lowest_set_bit(self.sl_bitmap(found.fl)) as usize;
      }
    }

    self.bucket_head(found).map(|block| (found, block))
  }

  // =============================================================================
  // Split / Merge
  // =============================================================================

  /// Shrinks the extracted `block` to `size` and frees the tail when it can stand alone;
  /// otherwise the whole block is handed over. Either way `block` ends up allocated.
  fn split(&mut self, block: usize, size: usize) {
    let total = self.size(block);
    debug_assert!(total >= size, "split: block of {total} bytes cannot serve {size}");

    let remainder = total - size;
    if remainder >= Self::MIN_BLOCK_SIZE {
      let rest = block + Self::HEADER_SIZE + size;
      self.store(rest, remainder - Self::HEADER_SIZE);
      self.set_phys_prev(rest, Some(block));
      self.set_size(block, size);

      if self.is_last(block) {
        self.clear_flag(block, BLOCK_LAST);
        self.set_flag(rest, BLOCK_LAST);
      } else {
        let next = self.phys_next(rest);
        self.set_phys_prev(next, Some(rest));
      }

      self.clear_flag(block, BLOCK_FREE);
      self.insert(rest);
    } else {
      self.clear_flag(block, BLOCK_FREE);
    }
  }

  /// Absorbs the physical successor if it is free. Returns the surviving block.
  fn merge_right(&mut self, block: usize) -> usize {
    if self.is_last(block) {
      return block;
    }

    let right = self.phys_next(block);
    if self.is_free(right) {
      if self.is_last(right) {
        self.set_flag(block, BLOCK_LAST);
      } else {
        let next = self.phys_next(right);
        self.set_phys_prev(next, Some(block));
      }
      self.extract(right);
      let grown = self.size(block) + self.size(right) + Self::HEADER_SIZE;
      self.set_size(block, grown);
    }
    block
  }

  /// Lets a free physical predecessor absorb `block`. Returns the surviving block.
  fn merge_left(&mut self, block: usize) -> usize {
    let Some(left) = self.phys_prev(block) else {
      return block;
    };
    if !self.is_free(left) {
      return block;
    }

    if self.is_last(block) {
      self.set_flag(left, BLOCK_LAST);
    } else {
      let next = self.phys_next(block);
      self.set_phys_prev(next, Some(left));
    }
    self.extract(left);
    let grown = self.size(left) + self.size(block) + Self::HEADER_SIZE;
    self.set_size(left, grown);
    left
  }

  // =============================================================================
  // Public API
  // =============================================================================

  /// Allocates at least `size` bytes, word aligned. `None` if no free block is large enough.
  pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
    let (size, level) = if size > Self::MIN_BLOCK_SIZE {
      let size = bits::align_up(size, W::BYTES)?;
      (size, Level::classify_for_search(size)?)
    } else {
      // Linear classes hold a single size each, so the exact class already suffices.
      (Self::MIN_BLOCK_SIZE, Level::classify(Self::MIN_BLOCK_SIZE))
    };

    let Some((_, block)) = self.find(level) else {
      log_event!(trace, "allocate: no free block for {} bytes", size);
      return None;
    };

    self.extract(block);
    self.split(block, size);
    Some(self.payload(block))
  }

  /// Returns an allocation to the arena, coalescing it with free neighbours.
  ///
  /// Releasing a block that is still marked free is a no-op.
  ///
  /// # Safety
  ///
  /// `ptr` must have been returned by [`Arena::allocate`] on this arena. A pointer whose block
  /// has since been absorbed into a neighbour is not detected.
  pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
    let block = self.block_of(ptr);

    #[cfg(feature = "debug-tripwire")]
    self.tripwire(block);

    if self.is_free(block) {
      log_event!(trace, "release: block at {:#x} is already free", block);
      return;
    }

    let block = self.merge_right(block);
    let block = self.merge_left(block);
    self.insert(block);
  }

  /// Payload bytes actually reserved behind `ptr`, at least the size requested.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation from this arena.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    self.size(self.block_of(ptr))
  }

  #[cfg(feature = "debug-tripwire")]
  fn tripwire(&self, block: usize) {
    let start = self.region_start();
    let last_header = self.len - Self::HEADER_SIZE;
    assert!(
      block >= start && block % W::BYTES == 0 && block <= last_header,
      "release: {block:#x} is not a block header inside the arena"
    );
    match self.phys_prev(block) {
      Some(prev) => assert!(
        prev >= start && prev < block && self.checked_phys_next(prev) == Some(block),
        "release: block {block:#x} is not linked from its predecessor"
      ),
      None => assert!(block == start, "release: block {block:#x} is not linked as the first block"),
    }
    if !self.is_last(block) {
      let next = self.checked_phys_next(block);
      assert!(
        next.is_some_and(|next| next <= last_header && self.phys_prev(next) == Some(block)),
        "release: block {block:#x} is not linked from its successor"
      );
    }
  }

  /// `phys_next` for a header that may hold a garbage size.
  #[cfg(feature = "debug-tripwire")]
  fn checked_phys_next(&self, block: usize) -> Option<usize> {
    block.checked_add(Self::HEADER_SIZE)?.checked_add(self.size(block))
  }

  // =============================================================================
  // Introspection
  // =============================================================================

  /// Walks the physical block chain in address order.
  pub fn blocks(&self) -> Blocks<'_, 'pool, W> {
    Blocks {
      arena: self,
      next: Some(self.region_start()),
    }
  }

  pub fn stats(&self) -> Stats {
    self.blocks().fold(Stats::default(), |mut stats, block| {
      if block.free {
        stats.free_blocks += 1;
        stats.free_bytes += block.size;
        stats.largest_free = stats.largest_free.max(block.size);
      } else {
        stats.used_blocks += 1;
        stats.used_bytes += block.size;
      }
      stats
    })
  }

  /// Per-block listing, one line each.
  pub fn dump(&self) -> Dump<'_, 'pool, W> {
    Dump(self)
  }

  /// Verifies the block chain, presence bitmaps and bucket lists against each other.
  pub fn check(&self) -> Result<(), Corruption> {
    let free_blocks = self.check_chain()?;
    let listed = self.check_buckets(free_blocks)?;
    if listed != free_blocks {
      return Err(Corruption::Membership { free_blocks, listed });
    }
    Ok(())
  }

  /// Checks tiling, back-links, coalescing and minimum sizes. Returns the free block count.
  fn check_chain(&self) -> Result<usize, Corruption> {
    let mut offset = self.region_start();
    let mut prev: Option<usize> = None;
    let mut prev_free = false;
    let mut free_blocks = 0;

    loop {
      if offset + Self::HEADER_SIZE > self.len {
        return Err(Corruption::Tiling { offset });
      }
      let size = self.size(offset);
      if size < 2 * W::BYTES || size % W::BYTES != 0 {
        return Err(Corruption::Undersized { offset, size });
      }
      let end = offset + Self::HEADER_SIZE + size;
      if end > self.len {
        return Err(Corruption::Tiling { offset });
      }
      if self.phys_prev(offset) != prev {
        return Err(Corruption::BackLink { offset });
      }

      let free = self.is_free(offset);
      if free && prev_free {
        return Err(Corruption::AdjacentFree { offset });
      }
      free_blocks += free as usize;

      if self.is_last(offset) {
        return if end == self.len {
          Ok(free_blocks)
        } else {
          Err(Corruption::Tiling { offset: end })
        };
      }
      prev = Some(offset);
      prev_free = free;
      offset = end;
    }
  }

  /// Checks bitmap fidelity and every bucket's membership. Returns the number of listed blocks.
  fn check_buckets(&self, free_blocks: usize) -> Result<usize, Corruption> {
    let fl_map = self.fl_bitmap();
    if fl_map & !bits::mask_below(self.fl_count) != 0 {
      return Err(Corruption::Bitmap { fl: self.fl_count, sl: 0 });
    }

    let start = self.region_start();
    let mut listed = 0;
    for fl in 0..self.fl_count {
      let sl_map = self.sl_bitmap(fl);
      if sl_map & !bits::mask_below(SL_COUNT) != 0 || bits::test_bit(fl_map, fl) != (sl_map != 0) {
        return Err(Corruption::Bitmap { fl, sl: SL_COUNT });
      }

      for sl in 0..SL_COUNT {
        let level = Level { fl, sl };
        let head = self.bucket_head(level);
        if bits::test_bit(sl_map, sl) != head.is_some() {
          return Err(Corruption::Bitmap { fl, sl });
        }

        let mut prev = None;
        let mut cursor = head;
        while let Some(block) = cursor {
          let bad = Corruption::FreeList { fl, sl, offset: block };
          // A cycle would list more blocks than the chain holds.
          if listed >= free_blocks
            || block < start
            || block % W::BYTES != 0
            || block + Self::MIN_BLOCK_SIZE > self.len
            || !self.is_free(block)
            || Level::classify(self.size(block)) != level
            || self.free_prev(block) != prev
          {
            return Err(bad);
          }
          listed += 1;
          prev = Some(block);
          cursor = self.free_next(block);
        }
      }
    }
    Ok(listed)
  }
}

impl<W: Word> fmt::Debug for Arena<'_, W> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Arena")
      .field("base", &self.base)
      .field("len", &self.len)
      .field("fl_count", &self.fl_count)
      .field("word_bytes", &W::BYTES)
      .field("capacity", &self.capacity())
      .finish()
  }
}

/// One entry of the physical block chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  /// Header offset from the arena base.
  pub offset: usize,
  /// Payload bytes, excluding the header.
  pub size: usize,
  pub free: bool,
  pub last: bool,
}

/// Iterator returned by [`Arena::blocks`].
pub struct Blocks<'a, 'pool, W: Word> {
  arena: &'a Arena<'pool, W>,
  next: Option<usize>,
}

impl<W: Word> Iterator for Blocks<'_, '_, W> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let offset = self.next?;
    let arena = self.arena;
    let info = BlockInfo {
      offset,
      size: arena.size(offset),
      free: arena.is_free(offset),
      last: arena.is_last(offset),
    };
    let next = arena.phys_next(offset);
    self.next = (!info.last && next + Arena::<W>::HEADER_SIZE <= arena.len).then_some(next);
    Some(info)
  }
}

/// Occupancy summary returned by [`Arena::stats`]. Byte counts exclude headers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
  pub free_blocks: usize,
  pub used_blocks: usize,
  pub free_bytes: usize,
  pub used_bytes: usize,
  pub largest_free: usize,
}

/// Display adapter returned by [`Arena::dump`].
pub struct Dump<'a, 'pool, W: Word>(&'a Arena<'pool, W>);

impl<W: Word> fmt::Display for Dump<'_, '_, W> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for block in self.0.blocks() {
      writeln!(
        f,
        "block {:#08x} {} size: {}{}",
        block.offset,
        if block.free { "F" } else { "U" },
        block.size,
        if block.last { " (last)" } else { "" }
      )?;
    }
    Ok(())
  }
}

// =============================================================================
// Locked Arena
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  /// Spins until the lock is taken. Released when the guard drops, including on unwind.
  #[inline]
  fn lock(&self) -> SpinLockGuard<'_> {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
    SpinLockGuard { lock: self }
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

struct SpinLockGuard<'a> {
  lock: &'a SpinLock,
}

impl Drop for SpinLockGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    self.lock.unlock();
  }
}

/// A statically constructible arena slot serialised by a spin lock.
///
/// The engine itself never locks; this is the caller-side serialisation for sharing one arena
/// process-wide, e.g. as `#[global_allocator]`. Do not call it from an interrupt that may
/// preempt a holder of the lock.
pub struct LockedArena<W: Word = usize> {
  lock: SpinLock,
  arena: UnsafeCell<Option<Arena<'static, W>>>,
}

unsafe impl<W: Word> Sync for LockedArena<W> {}

impl<W: Word> LockedArena<W> {
  pub const fn new() -> Self {
    Self {
      lock: SpinLock::new(),
      arena: UnsafeCell::new(None),
    }
  }

  /// Lays out a fresh arena, replacing any previous one. On error the slot is left empty.
  ///
  /// # Safety
  ///
  /// As for [`Arena::new`] with a `'static` extent. Allocations from a replaced arena must no
  /// longer be used.
  pub unsafe fn init(&self, base: NonNull<u8>, length: usize) -> Result<(), InitError> {
    let arena = unsafe { Arena::new(base, length) };
    self.with_slot(|slot| {
      let (installed, result) = match arena {
        Ok(arena) => (Some(arena), Ok(())),
        Err(err) => (None, Err(err)),
      };
      *slot = installed;
      result
    })
  }

  pub fn init_from_slice(&self, memory: &'static mut [u8]) -> Result<(), InitError> {
    let len = memory.len();
    // SAFETY: the exclusive `'static` borrow is handed over to the arena.
    unsafe { self.init(NonNull::from(memory).cast(), len) }
  }

  /// Runs `f` on the arena under the lock. `None` if no arena has been initialised.
  pub fn with<R>(&self, f: impl FnOnce(&mut Arena<'static, W>) -> R) -> Option<R> {
    self.with_slot(|slot| slot.as_mut().map(f))
  }

  fn with_slot<R>(&self, f: impl FnOnce(&mut Option<Arena<'static, W>>) -> R) -> R {
    let _guard = self.lock.lock();
    // SAFETY: the guard grants exclusive access to the slot until it drops.
    f(unsafe { &mut *self.arena.get() })
  }
}

impl<W: Word> Default for LockedArena<W> {
  fn default() -> Self {
    Self::new()
  }
}

unsafe impl<W: Word> GlobalAlloc for LockedArena<W> {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    // Payloads are only ever word aligned.
    if layout.align() > W::BYTES {
      return null_mut();
    }
    self
      .with(|arena| arena.allocate(layout.size()))
      .flatten()
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    let Some(ptr) = NonNull::new(ptr) else {
      return;
    };
    self.with(|arena| unsafe { arena.release(ptr) });
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let Some(old) = NonNull::new(ptr) else {
      return unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };
    };

    self
      .with(|arena| unsafe {
        if arena.usable_size(old) >= new_size {
          return old.as_ptr();
        }
        let Some(new) = arena.allocate(new_size) else {
          return null_mut();
        };
        ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), layout.size().min(new_size));
        arena.release(old);
        new.as_ptr()
      })
      .unwrap_or(null_mut())
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
static C_ARENA: LockedArena = LockedArena::new();

/// Lays out the process-wide arena over `length` bytes at `base`. Returns 1 on success, 0 if
/// the extent is unusable.
///
/// # Safety
///
/// `base..base + length` must stay valid and otherwise untouched for the rest of the process.
/// Pointers from a previous `segfit_init` become invalid.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn segfit_init(base: *mut libc::c_void, length: libc::size_t) -> libc::c_int {
  let Some(base) = NonNull::new(base.cast::<u8>()) else {
    return 0;
  };
  match unsafe { C_ARENA.init(base, length) } {
    Ok(()) => 1,
    Err(_) => 0,
  }
}

/// Allocates at least `size` bytes from the process-wide arena, or returns null.
///
/// # Safety
///
/// Always sound to call; marked unsafe to match the rest of the C surface.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn segfit_alloc(size: libc::size_t) -> *mut libc::c_void {
  C_ARENA
    .with(|arena| arena.allocate(size))
    .flatten()
    .map_or(null_mut(), |p| p.as_ptr().cast())
}

/// # Safety
///
/// `ptr` must be null or a live pointer from `segfit_alloc` since the last `segfit_init`.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn segfit_free(ptr: *mut libc::c_void) {
  let Some(ptr) = NonNull::new(ptr.cast::<u8>()) else {
    return;
  };
  C_ARENA.with(|arena| unsafe { arena.release(ptr) });
}

/// # Safety
///
/// `ptr` must be null or a live pointer from `segfit_alloc` since the last `segfit_init`.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn segfit_usable_size(ptr: *mut libc::c_void) -> libc::size_t {
  let Some(ptr) = NonNull::new(ptr.cast::<u8>()) else {
    return 0;
  };
  C_ARENA
    .with(|arena| unsafe { arena.usable_size(ptr) })
    .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
