//! The data file and its memory map.
//!
//! The pager owns the file handle and the `memmap2` mapping, hands out
//! bounds-checked page spans to the typed views in [`super::page`], and
//! performs the extend-and-remap dance during element-page growth. Any
//! page span borrowed from the pager dies before the next remap.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{DbError, Result};
use crate::storage::page::{
    self, FreelistView, FreelistViewMut, IndexRef, MetaView, MetaViewMut, Pgid,
    INDEX_SLOT_SIZE, PAGE_FLAG_FREELIST, PAGE_FLAG_META, PAGE_HDR_SIZE,
};
use crate::storage::{FREELIST_PAGE_COUNT, FREELIST_PGID, META_PAGE_COUNT, META_PGID};

#[cfg(unix)]
fn os_page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 { 4096 } else { n as usize }
}

#[cfg(not(unix))]
fn os_page_size() -> usize {
    4096
}

pub struct Pager {
    file: File,
    map: MmapMut,
    page_size: usize,
}

impl Pager {
    /// Open the data file at `path`, creating and initializing it on
    /// first use, and map it read-write.
    pub fn open(path: &Path) -> Result<Pager> {
        let page_size = os_page_size();
        if !path.exists() {
            init_file(path, page_size)?;
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut pager = Pager { file, map, page_size };

        if len < pager.element_base_pgid() * page_size as u64 {
            return Err(bounds_error("data file shorter than its fixed prefix"));
        }

        // Schema version and free-list pointer are stamped on every open.
        {
            let mut meta = pager.meta_mut()?;
            meta.set_version(page::META_SCHEMA_VERSION);
            meta.set_freelist_pgid(FREELIST_PGID);
        }
        pager.flush()?;
        Ok(pager)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Mapped file length in bytes.
    pub fn size(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn index_page_count(&self) -> u64 {
        page::index_page_count(self.page_size)
    }

    /// First pgid of the element-page region.
    pub fn element_base_pgid(&self) -> Pgid {
        META_PAGE_COUNT + FREELIST_PAGE_COUNT + self.index_page_count()
    }

    /// Byte span of the page plus its overflow continuation pages.
    fn span(&self, pgid: Pgid) -> Result<(usize, usize)> {
        let start = (pgid as usize).checked_mul(self.page_size)
            .ok_or_else(|| bounds_error("pgid overflow"))?;
        if start + self.page_size > self.map.len() {
            return Err(bounds_error("page beyond end of map"));
        }
        let (_, _, _, overflow) = page::read_header(&self.map[start..start + PAGE_HDR_SIZE]);
        let len = (1 + overflow as usize) * self.page_size;
        if start + len > self.map.len() {
            return Err(bounds_error("page span beyond end of map"));
        }
        Ok((start, len))
    }

    pub fn page(&self, pgid: Pgid) -> Result<&[u8]> {
        let (start, len) = self.span(pgid)?;
        Ok(&self.map[start..start + len])
    }

    pub fn page_mut(&mut self, pgid: Pgid) -> Result<&mut [u8]> {
        let (start, len) = self.span(pgid)?;
        Ok(&mut self.map[start..start + len])
    }

    pub fn meta(&self) -> Result<MetaView<'_>> {
        MetaView::new(self.page(META_PGID)?)
    }

    pub fn meta_mut(&mut self) -> Result<MetaViewMut<'_>> {
        MetaViewMut::new(self.page_mut(META_PGID)?)
    }

    pub fn freelist(&self) -> Result<FreelistView<'_>> {
        let pgid = self.meta()?.freelist_pgid();
        FreelistView::new(self.page(pgid)?)
    }

    pub fn freelist_mut(&mut self) -> Result<FreelistViewMut<'_>> {
        let pgid = self.meta()?.freelist_pgid();
        FreelistViewMut::new(self.page_mut(pgid)?)
    }

    fn index_off(&self, bucket: u16) -> usize {
        ((META_PAGE_COUNT + FREELIST_PAGE_COUNT) as usize) * self.page_size
            + bucket as usize * INDEX_SLOT_SIZE
    }

    /// Read the hash-directory cell for `bucket`.
    pub fn index_ref(&self, bucket: u16) -> IndexRef {
        IndexRef::read(&self.map, self.index_off(bucket))
    }

    pub fn set_index_ref(&mut self, bucket: u16, r: IndexRef) {
        let off = self.index_off(bucket);
        r.write(&mut self.map, off);
    }

    /// Extend the file by `pages` whole pages and remap. All outstanding
    /// page spans must be dead by now; the new map replaces the old one.
    pub fn grow(&mut self, pages: u64) -> Result<()> {
        let new_len = self.size() + pages * self.page_size as u64;
        self.map.flush()?;
        self.file.set_len(new_len)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    /// msync the whole map.
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

fn bounds_error(msg: &str) -> DbError {
    DbError::Io(io::Error::new(io::ErrorKind::InvalidData, msg.to_string()))
}

/// Lay down the fixed prefix: meta page, free-list page, and the zeroed
/// index directory.
fn init_file(path: &Path, page_size: usize) -> Result<()> {
    let prefix_pages =
        (META_PAGE_COUNT + FREELIST_PAGE_COUNT + page::index_page_count(page_size)) as usize;
    let mut buf = vec![0u8; prefix_pages * page_size];

    page::write_header(&mut buf[..page_size], META_PGID, PAGE_FLAG_META, 0, 0);
    let fl_start = page_size;
    page::write_header(
        &mut buf[fl_start..fl_start + page_size],
        FREELIST_PGID,
        PAGE_FLAG_FREELIST,
        0,
        0,
    );

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(())
}
