//! Fixed-layout page format and the typed views over mapped pages.
//!
//! Every page starts with a 16-byte header; the body is interpreted by one
//! of three views depending on the header flag. All numeric fields are
//! host-native-endian, so data files are not portable across endianness.

use crate::error::{DbError, Result};

pub type Pgid = u64;

pub const PAGE_FLAG_ELEMENT: u16 = 0x02;
pub const PAGE_FLAG_META: u16 = 0x04;
pub const PAGE_FLAG_FREELIST: u16 = 0x10;

pub const ELE_FLAG_TOMBSTONE: u8 = 0x01;

/// Page header: id u64, flags u16, count u16, overflow u32.
pub const PAGE_HDR_SIZE: usize = 16;

/// On-disk element slot size; see [`Ele`] for the field offsets.
pub const ELE_SIZE: usize = 24;

/// Fixed slot-array length per element page.
pub const ELES_PER_PAGE: usize = 256;

/// Header plus the full slot array; the KV arena starts here.
pub const ELEMENT_OVERHEAD: usize = PAGE_HDR_SIZE + ELES_PER_PAGE * ELE_SIZE;

/// On-disk index slot size: pgid u64, at u16, 6 bytes reserved.
pub const INDEX_SLOT_SIZE: usize = 16;

/// Direct-mapped hash directory size (2^16 buckets).
pub const INDEX_SLOT_COUNT: usize = 1 << 16;

pub const META_SCHEMA_VERSION: u32 = 100;

/// Pages occupied by the index directory for a given page size.
pub fn index_page_count(page_size: usize) -> u64 {
    ((INDEX_SLOT_COUNT * INDEX_SLOT_SIZE) as u64).div_ceil(page_size as u64)
}

/// Reserved continuation pages behind an ordinary element page: the
/// smallest count that leaves at least one full page of KV arena beyond
/// the header and slot array.
pub fn ordinary_overflow(page_size: usize) -> u32 {
    (ELEMENT_OVERHEAD as u64).div_ceil(page_size as u64) as u32
}

/// Reserved continuation pages behind a batch head that must absorb a
/// pending first element of `first_ele_len` bytes.
pub fn head_overflow(page_size: usize, first_ele_len: usize) -> u32 {
    ((ELEMENT_OVERHEAD + first_ele_len) as u64).div_ceil(page_size as u64) as u32
}

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_ne_bytes(buf[off..off + 2].try_into().unwrap())
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap())
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_ne_bytes(buf[off..off + 8].try_into().unwrap())
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_ne_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_ne_bytes());
}

/// A cell of the hash directory, and the `next` pointer inside element
/// slots. `pgid == 0` marks an empty cell / end of chain (page 0 is the
/// meta page and can never hold elements).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexRef {
    pub pgid: Pgid,
    pub at: u16,
}

impl IndexRef {
    pub fn is_null(&self) -> bool {
        self.pgid == 0
    }

    pub fn read(buf: &[u8], off: usize) -> IndexRef {
        IndexRef {
            pgid: get_u64(buf, off),
            at: get_u16(buf, off + 8),
        }
    }

    pub fn write(&self, buf: &mut [u8], off: usize) {
        put_u64(buf, off, self.pgid);
        put_u16(buf, off + 8, self.at);
    }
}

/// One element slot. `pos` is relative to the slot's own byte offset
/// within the page, so appending to the arena never touches earlier
/// slots.
///
/// On-disk layout (24 bytes): flags u8 @0, next.at u16 @2, pos u32 @4,
/// next.pgid u64 @8, ksize u32 @16, vsize u32 @20.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ele {
    pub flags: u8,
    pub next: IndexRef,
    pub pos: u32,
    pub ksize: u32,
    pub vsize: u32,
}

impl Ele {
    pub fn is_tombstoned(&self) -> bool {
        self.flags & ELE_FLAG_TOMBSTONE != 0
    }

    fn read(buf: &[u8], off: usize) -> Ele {
        Ele {
            flags: buf[off],
            next: IndexRef {
                at: get_u16(buf, off + 2),
                pgid: get_u64(buf, off + 8),
            },
            pos: get_u32(buf, off + 4),
            ksize: get_u32(buf, off + 16),
            vsize: get_u32(buf, off + 20),
        }
    }

    fn write(&self, buf: &mut [u8], off: usize) {
        buf[off] = self.flags;
        buf[off + 1] = 0;
        put_u16(buf, off + 2, self.next.at);
        put_u32(buf, off + 4, self.pos);
        put_u64(buf, off + 8, self.next.pgid);
        put_u32(buf, off + 16, self.ksize);
        put_u32(buf, off + 20, self.vsize);
    }
}

/// Header field access shared by every view. `buf` spans the page plus
/// its `overflow` continuation pages.
fn hdr_flags(buf: &[u8]) -> u16 {
    get_u16(buf, 8)
}

fn hdr_count(buf: &[u8]) -> u16 {
    get_u16(buf, 10)
}

fn hdr_overflow(buf: &[u8]) -> u32 {
    get_u32(buf, 12)
}

pub fn read_header(buf: &[u8]) -> (Pgid, u16, u16, u32) {
    (get_u64(buf, 0), hdr_flags(buf), hdr_count(buf), hdr_overflow(buf))
}

pub fn write_header(buf: &mut [u8], id: Pgid, flags: u16, count: u16, overflow: u32) {
    put_u64(buf, 0, id);
    put_u16(buf, 8, flags);
    put_u16(buf, 10, count);
    put_u32(buf, 12, overflow);
}

pub fn write_count(buf: &mut [u8], count: u16) {
    put_u16(buf, 10, count);
}

fn expect_flags(buf: &[u8], want: u16) -> Result<()> {
    let got = hdr_flags(buf);
    if got != want {
        return Err(DbError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("page flag mismatch: want {want:#06x}, got {got:#06x}"),
        )));
    }
    Ok(())
}

// Meta body offsets, relative to the page body.
const META_VERSION_OFF: usize = 0;
const META_FREELIST_OFF: usize = 8;
const META_ELE_COUNT_OFF: usize = 16;
const META_CHECKPOINT_OFF: usize = 24;

/// Read view over the meta page.
pub struct MetaView<'a> {
    buf: &'a [u8],
}

impl<'a> MetaView<'a> {
    pub fn new(buf: &'a [u8]) -> Result<MetaView<'a>> {
        expect_flags(buf, PAGE_FLAG_META)?;
        Ok(MetaView { buf })
    }

    pub fn version(&self) -> u32 {
        get_u32(self.buf, PAGE_HDR_SIZE + META_VERSION_OFF)
    }

    pub fn freelist_pgid(&self) -> Pgid {
        get_u64(self.buf, PAGE_HDR_SIZE + META_FREELIST_OFF)
    }

    pub fn ele_page_count(&self) -> u64 {
        get_u64(self.buf, PAGE_HDR_SIZE + META_ELE_COUNT_OFF)
    }

    pub fn checkpoint(&self) -> u64 {
        get_u64(self.buf, PAGE_HDR_SIZE + META_CHECKPOINT_OFF)
    }
}

/// Write view over the meta page.
pub struct MetaViewMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> MetaViewMut<'a> {
    pub fn new(buf: &'a mut [u8]) -> Result<MetaViewMut<'a>> {
        expect_flags(buf, PAGE_FLAG_META)?;
        Ok(MetaViewMut { buf })
    }

    pub fn set_version(&mut self, v: u32) {
        put_u32(self.buf, PAGE_HDR_SIZE + META_VERSION_OFF, v);
    }

    pub fn set_freelist_pgid(&mut self, pgid: Pgid) {
        put_u64(self.buf, PAGE_HDR_SIZE + META_FREELIST_OFF, pgid);
    }

    pub fn set_ele_page_count(&mut self, n: u64) {
        put_u64(self.buf, PAGE_HDR_SIZE + META_ELE_COUNT_OFF, n);
    }

    pub fn set_checkpoint(&mut self, off: u64) {
        put_u64(self.buf, PAGE_HDR_SIZE + META_CHECKPOINT_OFF, off);
    }
}

/// Read view over the free-list page: a packed `u64` array of candidate
/// element-page IDs, length in the header count field.
pub struct FreelistView<'a> {
    buf: &'a [u8],
}

impl<'a> FreelistView<'a> {
    pub fn new(buf: &'a [u8]) -> Result<FreelistView<'a>> {
        expect_flags(buf, PAGE_FLAG_FREELIST)?;
        Ok(FreelistView { buf })
    }

    pub fn count(&self) -> usize {
        hdr_count(self.buf) as usize
    }

    pub fn id(&self, i: usize) -> Pgid {
        debug_assert!(i < self.count());
        get_u64(self.buf, PAGE_HDR_SIZE + i * 8)
    }

    pub fn ids(&self) -> Vec<Pgid> {
        (0..self.count()).map(|i| self.id(i)).collect()
    }

    /// Maximum entries the page can hold.
    pub fn max_len(&self) -> usize {
        (self.buf.len() - PAGE_HDR_SIZE) / 8
    }
}

/// Write view over the free-list page.
pub struct FreelistViewMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> FreelistViewMut<'a> {
    pub fn new(buf: &'a mut [u8]) -> Result<FreelistViewMut<'a>> {
        expect_flags(buf, PAGE_FLAG_FREELIST)?;
        Ok(FreelistViewMut { buf })
    }

    pub fn count(&self) -> usize {
        hdr_count(self.buf) as usize
    }

    pub fn id(&self, i: usize) -> Pgid {
        get_u64(self.buf, PAGE_HDR_SIZE + i * 8)
    }

    pub fn max_len(&self) -> usize {
        (self.buf.len() - PAGE_HDR_SIZE) / 8
    }

    pub fn set(&mut self, ids: &[Pgid]) {
        debug_assert!(ids.len() <= self.max_len());
        for (i, id) in ids.iter().enumerate() {
            put_u64(self.buf, PAGE_HDR_SIZE + i * 8, *id);
        }
        write_count(self.buf, ids.len() as u16);
    }

    pub fn push(&mut self, id: Pgid) {
        let count = self.count();
        debug_assert!(count < self.max_len());
        put_u64(self.buf, PAGE_HDR_SIZE + count * 8, id);
        write_count(self.buf, (count + 1) as u16);
    }

    /// Remove one occurrence of `pgid`, shifting later entries left.
    pub fn remove(&mut self, pgid: Pgid) -> bool {
        let count = self.count();
        for i in 0..count {
            if self.id(i) == pgid {
                for j in i..count - 1 {
                    let next = self.id(j + 1);
                    put_u64(self.buf, PAGE_HDR_SIZE + j * 8, next);
                }
                write_count(self.buf, (count - 1) as u16);
                return true;
            }
        }
        false
    }
}

/// Read view over an element page span (page plus overflow pages).
pub struct ElementsView<'a> {
    buf: &'a [u8],
}

impl<'a> ElementsView<'a> {
    pub fn new(buf: &'a [u8]) -> Result<ElementsView<'a>> {
        expect_flags(buf, PAGE_FLAG_ELEMENT)?;
        Ok(ElementsView { buf })
    }

    pub fn count(&self) -> usize {
        hdr_count(self.buf) as usize
    }

    pub fn is_full(&self) -> bool {
        self.count() >= ELES_PER_PAGE
    }

    /// Total bytes the span may hold: `(1 + overflow) * page_size`.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn slot(&self, at: u16) -> Ele {
        debug_assert!((at as usize) < ELES_PER_PAGE);
        Ele::read(self.buf, PAGE_HDR_SIZE + at as usize * ELE_SIZE)
    }

    fn kv_offset(&self, at: u16, ele: &Ele) -> usize {
        PAGE_HDR_SIZE + at as usize * ELE_SIZE + ele.pos as usize
    }

    pub fn key(&self, at: u16) -> &'a [u8] {
        let ele = self.slot(at);
        let off = self.kv_offset(at, &ele);
        &self.buf[off..off + ele.ksize as usize]
    }

    pub fn val(&self, at: u16) -> &'a [u8] {
        let ele = self.slot(at);
        let off = self.kv_offset(at, &ele) + ele.ksize as usize;
        &self.buf[off..off + ele.vsize as usize]
    }

    /// High-water mark of the KV arena measured from the page origin.
    /// The fixed slot array always counts, so an accepted insert can
    /// never extend past the span.
    pub fn used_size(&self) -> usize {
        let count = self.count();
        if count == 0 {
            return ELEMENT_OVERHEAD;
        }
        let last = self.slot((count - 1) as u16);
        self.kv_offset((count - 1) as u16, &last) + (last.ksize + last.vsize) as usize
    }
}

/// Write view over an element page span.
pub struct ElementsViewMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> ElementsViewMut<'a> {
    pub fn new(buf: &'a mut [u8]) -> Result<ElementsViewMut<'a>> {
        expect_flags(buf, PAGE_FLAG_ELEMENT)?;
        Ok(ElementsViewMut { buf })
    }

    fn view(&self) -> ElementsView<'_> {
        ElementsView { buf: &*self.buf }
    }

    pub fn count(&self) -> usize {
        self.view().count()
    }

    pub fn is_full(&self) -> bool {
        self.view().is_full()
    }

    pub fn slot(&self, at: u16) -> Ele {
        self.view().slot(at)
    }

    pub fn write_slot(&mut self, at: u16, ele: &Ele) {
        debug_assert!((at as usize) < ELES_PER_PAGE);
        ele.write(self.buf, PAGE_HDR_SIZE + at as usize * ELE_SIZE);
    }

    pub fn set_next(&mut self, at: u16, next: IndexRef) {
        let mut ele = self.slot(at);
        ele.next = next;
        self.write_slot(at, &ele);
    }

    pub fn set_tombstone(&mut self, at: u16) {
        let mut ele = self.slot(at);
        ele.flags |= ELE_FLAG_TOMBSTONE;
        self.write_slot(at, &ele);
    }

    /// Append a new element at slot index `count`, its KV bytes going to
    /// the arena tail. Returns the slot index.
    pub fn append(&mut self, key: &[u8], val: &[u8], next: IndexRef) -> Result<u16> {
        let count = self.count();
        if count >= ELES_PER_PAGE {
            return Err(DbError::InsufficientFreeSpace);
        }
        let need = key.len() + val.len();
        let used = self.view().used_size();
        if used + need > self.buf.len() {
            return Err(DbError::InsufficientFreeSpace);
        }

        let pos = if count == 0 {
            (ELES_PER_PAGE * ELE_SIZE) as u32
        } else {
            let last = self.slot((count - 1) as u16);
            last.pos + last.ksize + last.vsize - ELE_SIZE as u32
        };

        let ele = Ele {
            flags: 0,
            next,
            pos,
            ksize: key.len() as u32,
            vsize: val.len() as u32,
        };
        let kv_off = PAGE_HDR_SIZE + count * ELE_SIZE + pos as usize;
        self.write_slot(count as u16, &ele);
        self.buf[kv_off..kv_off + key.len()].copy_from_slice(key);
        self.buf[kv_off + key.len()..kv_off + need].copy_from_slice(val);
        write_count(self.buf, (count + 1) as u16);
        Ok(count as u16)
    }

    /// Rewrite slot `at` in place. Trailing KV bytes shift by the size
    /// delta and later slots' `pos` fields are adjusted to match.
    pub fn update(&mut self, at: u16, key: &[u8], val: &[u8]) -> Result<()> {
        let count = self.count();
        debug_assert!((at as usize) < count);
        let ele = self.slot(at);
        let old = (ele.ksize + ele.vsize) as usize;
        let new = key.len() + val.len();
        let used = self.view().used_size();
        if new > old && used + (new - old) > self.buf.len() {
            return Err(DbError::InsufficientFreeSpace);
        }

        let kv_off = PAGE_HDR_SIZE + at as usize * ELE_SIZE + ele.pos as usize;
        self.buf.copy_within(kv_off + old..used, kv_off + new);
        self.buf[kv_off..kv_off + key.len()].copy_from_slice(key);
        self.buf[kv_off + key.len()..kv_off + new].copy_from_slice(val);

        let delta = new as i64 - old as i64;
        for j in at + 1..count as u16 {
            let mut later = self.slot(j);
            later.pos = (later.pos as i64 + delta) as u32;
            self.write_slot(j, &later);
        }

        let mut ele = ele;
        ele.ksize = key.len() as u32;
        ele.vsize = val.len() as u32;
        self.write_slot(at, &ele);
        Ok(())
    }
}
