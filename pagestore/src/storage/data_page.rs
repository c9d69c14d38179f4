//! Slotted layout of data pages.
//!
//! ```text
//! +----------------+------------------+ . . . +---------------------------+
//! | page header 24 | data header 8    | slots | free gap | items (grow <-) |
//! +----------------+------------------+ . . . +---------------------------+
//! ```
//!
//! Data header: item slot count (u16), live item count (u16), offset of the
//! lowest item byte (u16), free-list bucket (u8), reserved (u8).
//!
//! Each slot is `(offset u16, len u16)`; an offset of 0 marks a free slot.
//! Each item starts with a 13-byte fragment header: flags (u8), next link
//! (u64), total row length (u32), followed by the fragment bytes. Items are
//! kept packed at the end of the page: removing one compacts the rest, so the
//! free space of a page is always one contiguous gap.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{Result, StoreError};
use crate::storage::page::{Link, Page, PageHeader, PageId, PageType};

const ITEM_COUNT_OFFSET: usize = PageHeader::SIZE;
const LIVE_COUNT_OFFSET: usize = PageHeader::SIZE + 2;
const DATA_START_OFFSET: usize = PageHeader::SIZE + 4;
const LISTING_OFFSET: usize = PageHeader::SIZE + 6;
const SLOTS_OFFSET: usize = PageHeader::SIZE + 8;

/// Size of one slot entry.
pub const SLOT_SIZE: usize = 4;

/// Size of the per-item fragment header.
pub const ITEM_HEADER_SIZE: usize = 13;

/// Maximum number of slots on one page (slot index must fit a link's item byte).
pub const MAX_ITEMS: usize = 255;

/// Item flag: this item is the head of a row.
pub const FLAG_HEAD: u8 = 0x01;

/// Listing value for a page that is in no free-list bucket.
pub const UNLISTED: u8 = u8::MAX;

/// One stored fragment.
#[derive(Debug, Clone, Copy)]
pub struct Item<'a> {
    pub flags: u8,
    pub next: Link,
    pub total_len: u32,
    pub data: &'a [u8],
}

impl Item<'_> {
    #[must_use]
    pub const fn is_head(&self) -> bool {
        self.flags & FLAG_HEAD != 0
    }
}

/// Largest fragment that fits on an empty page of `page_size` bytes.
#[must_use]
pub const fn max_fragment(page_size: usize) -> usize {
    page_size - SLOTS_OFFSET - SLOT_SIZE - ITEM_HEADER_SIZE
}

/// Format `page` as an empty, unlisted data page.
pub fn init(page: &mut Page, page_id: PageId) {
    page.format(page_id, PageType::Data, 0);
    page.write_u16(ITEM_COUNT_OFFSET, 0);
    page.write_u16(LIVE_COUNT_OFFSET, 0);
    page.write_u16(DATA_START_OFFSET, page.size() as u16);
    page.write_u8(LISTING_OFFSET, UNLISTED);
}

#[must_use]
pub fn item_count(page: &Page) -> usize {
    usize::from(page.read_u16(ITEM_COUNT_OFFSET))
}

#[must_use]
pub fn live_count(page: &Page) -> usize {
    usize::from(page.read_u16(LIVE_COUNT_OFFSET))
}

fn data_start(page: &Page) -> usize {
    let start = usize::from(page.read_u16(DATA_START_OFFSET));
    // A page of 64 KiB would store 0 here; supported sizes never do.
    if start == 0 { page.size() } else { start }
}

/// Bucket the page is currently listed in, or [`UNLISTED`].
#[must_use]
pub fn listing(page: &Page) -> u8 {
    page.read_u8(LISTING_OFFSET)
}

pub fn set_listing(page: &mut Page, bucket: u8) {
    page.write_u8(LISTING_OFFSET, bucket);
}

fn slot(page: &Page, index: usize) -> (usize, usize) {
    let at = SLOTS_OFFSET + index * SLOT_SIZE;
    (
        usize::from(page.read_u16(at)),
        usize::from(page.read_u16(at + 2)),
    )
}

fn set_slot(page: &mut Page, index: usize, offset: usize, len: usize) {
    let at = SLOTS_OFFSET + index * SLOT_SIZE;
    page.write_u16(at, offset as u16);
    page.write_u16(at + 2, len as u16);
}

/// Fragment bytes that can still be stored on the page as one new item.
#[must_use]
pub fn free_space(page: &Page) -> usize {
    let count = item_count(page);
    let has_free_slot = live_count(page) < count;
    if !has_free_slot && count >= MAX_ITEMS {
        return 0;
    }
    let slots_end = SLOTS_OFFSET + count * SLOT_SIZE;
    let gap = data_start(page).saturating_sub(slots_end);
    let slot_cost = if has_free_slot { 0 } else { SLOT_SIZE };
    gap.saturating_sub(slot_cost + ITEM_HEADER_SIZE)
}

/// Store a fragment and return its slot.
///
/// # Pre-conditions
/// - `data.len() <= free_space(page)`
pub fn insert(page: &mut Page, flags: u8, next: Link, total_len: u32, data: &[u8]) -> u8 {
    debug_assert!(data.len() <= free_space(page));

    let count = item_count(page);
    let index = (0..count).find(|&i| slot(page, i).0 == 0).unwrap_or(count);
    if index == count {
        page.write_u16(ITEM_COUNT_OFFSET, (count + 1) as u16);
    }

    let len = ITEM_HEADER_SIZE + data.len();
    let offset = data_start(page) - len;
    page.write_u8(offset, flags);
    page.write_u64(offset + 1, next.as_raw());
    page.write_u32(offset + 9, total_len);
    page.write_bytes(offset + ITEM_HEADER_SIZE, data);

    set_slot(page, index, offset, len);
    page.write_u16(DATA_START_OFFSET, offset as u16);
    page.write_u16(LIVE_COUNT_OFFSET, (live_count(page) + 1) as u16);
    index as u8
}

/// Read the item in `slot`, `None` if the slot is not live.
///
/// # Errors
/// - [`StoreError::StructureCorruption`] if the slot points outside the item area
pub fn read(page: &Page, slot_index: u8) -> Result<Option<Item<'_>>> {
    let index = usize::from(slot_index);
    if index >= item_count(page) {
        return Ok(None);
    }
    let (offset, len) = slot(page, index);
    if offset == 0 {
        return Ok(None);
    }
    if offset < data_start(page) || len < ITEM_HEADER_SIZE || offset + len > page.size() {
        return Err(StoreError::corruption(
            page.page_id(),
            format!("slot {index} points at {offset}+{len}"),
        ));
    }

    Ok(Some(Item {
        flags: page.read_u8(offset),
        next: Link::from_raw(page.read_u64(offset + 1)),
        total_len: page.read_u32(offset + 9),
        data: page.read_bytes(offset + ITEM_HEADER_SIZE, len - ITEM_HEADER_SIZE),
    }))
}

/// Remove the item in `slot`, compacting the item area.
///
/// Returns the removed item's flags and next link, `None` if the slot was not live.
pub fn remove(page: &mut Page, slot_index: u8) -> Option<(u8, Link)> {
    let index = usize::from(slot_index);
    let mut count = item_count(page);
    if index >= count {
        return None;
    }
    let (offset, len) = slot(page, index);
    if offset == 0 {
        return None;
    }

    let flags = page.read_u8(offset);
    let next = Link::from_raw(page.read_u64(offset + 1));

    let start = data_start(page);
    page.as_bytes_mut().copy_within(start..offset, start + len);
    for i in 0..count {
        let (other, other_len) = slot(page, i);
        if other != 0 && other < offset {
            set_slot(page, i, other + len, other_len);
        }
    }
    set_slot(page, index, 0, 0);
    page.write_u16(DATA_START_OFFSET, (start + len) as u16);
    page.write_u16(LIVE_COUNT_OFFSET, (live_count(page) - 1) as u16);

    while count > 0 && slot(page, count - 1).0 == 0 {
        count -= 1;
    }
    page.write_u16(ITEM_COUNT_OFFSET, count as u16);

    Some((flags, next))
}
