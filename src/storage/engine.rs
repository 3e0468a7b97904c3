//! The engine façade over the pager, free-list and WAL.
//!
//! Keys hash into a 2^16-bucket directory by the big-endian first two
//! bytes of their MD5 digest; collisions chain through the `next` field
//! of element slots. All public operations run under one exclusive lock:
//! chain walk, page mutation, map sync, WAL append and checkpoint
//! advance are a single critical section.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use md5::{Digest, Md5};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::Config;
use crate::error::{DbError, Result};
use crate::metrics::Registry;
use crate::net::protocol::{Frame, FrameParser};
use crate::storage::freelist;
use crate::storage::page::{
    self, ElementsView, ElementsViewMut, IndexRef, Pgid, PAGE_FLAG_ELEMENT,
};
use crate::storage::pager::Pager;
use crate::storage::wal::Wal;
use crate::storage::{ELE_PAGE_INCREMENT, MAX_INSERT_ATTEMPTS, WAL_ROTATE_THRESHOLD};

pub const DB_FILE: &str = "db";
pub const WAL_FILE: &str = "wal";
pub const UNDO_FILE: &str = "undo";

/// Hash directory bucket for a key.
pub(crate) fn bucket(key: &[u8]) -> u16 {
    let digest = Md5::digest(key);
    u16::from_be_bytes([digest[0], digest[1]])
}

/// A location holding an `IndexRef`: either a cell of the hash
/// directory or the `next` field of an element slot. The chain walk
/// returns one of these so inserts can link the new tail by writing
/// straight through it.
#[derive(Debug, Clone, Copy)]
enum ChainLoc {
    Index(u16),
    EleNext { pgid: Pgid, at: u16 },
}

/// Result of a chain walk: `loc` is the location whose contents are
/// `target`. On a hit, `target` identifies the live matching slot; on a
/// miss it is null and `loc` is the terminal cell a new link goes into.
struct ChainEnd {
    loc: ChainLoc,
    target: IndexRef,
}

pub struct Db {
    pager: Pager,
    wal: Wal,
    serving: bool,
    rng: StdRng,
    crash_key: Option<Vec<u8>>,
}

impl Db {
    /// Open (or create) the data directory and replay any WAL tail past
    /// the stored checkpoint.
    pub fn open(dir: &Path, rng_seed: Option<u64>) -> Result<Db> {
        fs::create_dir_all(dir)?;
        let pager = Pager::open(&dir.join(DB_FILE))?;
        let wal = Wal::open(&dir.join(WAL_FILE))?;
        // Reserved for a future rollback facility.
        let undo = dir.join(UNDO_FILE);
        if !undo.exists() {
            OpenOptions::new().create(true).write(true).open(&undo)?;
        }

        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut db = Db {
            pager,
            wal,
            serving: false,
            rng,
            crash_key: None,
        };
        db.recover()?;
        db.serving = true;
        Ok(db)
    }

    /// Apply WAL commands past the checkpoint, then truncate the log.
    /// Replay is idempotent, so a crash anywhere in here just replays a
    /// longer tail on the next open.
    fn recover(&mut self) -> Result<()> {
        let checkpoint = self.pager.meta()?.checkpoint();
        if self.wal.len() > checkpoint {
            let tail = self.wal.read_from(checkpoint)?;
            let mut parser = FrameParser::new();
            parser.feed(&tail);
            let mut replayed = 0u64;
            loop {
                match parser.next_frame() {
                    Ok(Some(frame)) => {
                        self.apply_frame(&frame)?;
                        replayed += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "stopping replay at malformed frame");
                        break;
                    }
                }
            }
            tracing::info!(replayed, from = checkpoint, "replayed WAL tail");
        }
        self.wal.reset()?;
        self.pager.meta_mut()?.set_checkpoint(0);
        self.pager.flush()?;
        Ok(())
    }

    fn apply_frame(&mut self, frame: &Frame) -> Result<()> {
        match frame.args[0].as_slice() {
            b"set" if frame.args.len() == 3 => {
                self.set(&frame.raw, &frame.args[1], &frame.args[2])
            }
            b"del" if frame.args.len() >= 2 => {
                self.delete(&frame.raw, &frame.args[1..]).map(|_| ())
            }
            verb => {
                tracing::warn!(verb = %String::from_utf8_lossy(verb), "skipping non-mutating frame in WAL");
                Ok(())
            }
        }
    }

    pub fn set(&mut self, cmd: &[u8], key: &[u8], val: &[u8]) -> Result<()> {
        let end = self.find_chain(key)?;
        if end.target.is_null() {
            self.create_ele(key, val, end.loc, IndexRef::default())?;
        } else {
            match self.update_ele(end.target, key, val) {
                Err(DbError::InsufficientFreeSpace) => {
                    // No room to grow in place: tombstone and re-insert.
                    // The new element inherits the old slot's next so the
                    // chain tail stays reachable.
                    let inherited = {
                        let buf = self.pager.page_mut(end.target.pgid)?;
                        let mut es = ElementsViewMut::new(buf)?;
                        let next = es.slot(end.target.at).next;
                        es.set_tombstone(end.target.at);
                        next
                    };
                    self.create_ele(key, val, end.loc, inherited)?;
                }
                other => other?,
            }
        }
        self.pager.flush()?;
        self.log_command(cmd)
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let end = self.find_chain(key)?;
        if end.target.is_null() {
            return Err(DbError::NotFound);
        }
        let es = ElementsView::new(self.pager.page(end.target.pgid)?)?;
        Ok(es.val(end.target.at).to_vec())
    }

    /// Tombstone each key; the chain node stays linked so walkers can
    /// still follow its `next`. Returns per-key liveness at deletion.
    pub fn delete(&mut self, cmd: &[u8], keys: &[Vec<u8>]) -> Result<Vec<bool>> {
        let mut deleted = Vec::with_capacity(keys.len());
        for key in keys {
            let end = self.find_chain(key)?;
            if end.target.is_null() {
                deleted.push(false);
                continue;
            }
            let buf = self.pager.page_mut(end.target.pgid)?;
            ElementsViewMut::new(buf)?.set_tombstone(end.target.at);
            deleted.push(true);
        }
        self.pager.flush()?;
        self.log_command(cmd)?;
        Ok(deleted)
    }

    /// Walk the bucket chain for `key`.
    fn find_chain(&self, key: &[u8]) -> Result<ChainEnd> {
        let b = bucket(key);
        let mut loc = ChainLoc::Index(b);
        let mut cur = self.pager.index_ref(b);
        while !cur.is_null() {
            let es = ElementsView::new(self.pager.page(cur.pgid)?)?;
            let ele = es.slot(cur.at);
            if !ele.is_tombstoned() && es.key(cur.at) == key {
                return Ok(ChainEnd { loc, target: cur });
            }
            loc = ChainLoc::EleNext {
                pgid: cur.pgid,
                at: cur.at,
            };
            cur = ele.next;
        }
        Ok(ChainEnd {
            loc,
            target: IndexRef::default(),
        })
    }

    fn update_ele(&mut self, target: IndexRef, key: &[u8], val: &[u8]) -> Result<()> {
        let buf = self.pager.page_mut(target.pgid)?;
        ElementsViewMut::new(buf)?.update(target.at, key, val)
    }

    /// Place a new element and link it through `loc`. The page of the
    /// chain predecessor is tried first, then random free-list
    /// candidates; the final attempt forces a growth whose batch head is
    /// sized for the element.
    fn create_ele(
        &mut self,
        key: &[u8],
        val: &[u8],
        loc: ChainLoc,
        inherit: IndexRef,
    ) -> Result<()> {
        let first_len = key.len() + val.len();
        let mut candidate = match loc {
            ChainLoc::EleNext { pgid, .. } => pgid,
            ChainLoc::Index(_) => 0,
        };
        let mut attempts = 0u32;

        loop {
            if candidate == 0 {
                if attempts >= MAX_INSERT_ATTEMPTS {
                    tracing::error!("insert retry budget exhausted");
                    return Err(DbError::UnreachableRetry);
                }
                candidate = if attempts == MAX_INSERT_ATTEMPTS - 1 {
                    self.grow_pages(first_len)?
                } else {
                    match freelist::pick_unfull(&self.pager, &mut self.rng) {
                        Ok(pgid) => pgid,
                        Err(DbError::NoUnfullPage) => self.grow_pages(first_len)?,
                        Err(e) => return Err(e),
                    }
                };
                attempts += 1;
            }

            if ElementsView::new(self.pager.page(candidate)?)?.is_full() {
                freelist::remove(&mut self.pager, candidate)?;
                candidate = 0;
                continue;
            }

            let placed = {
                let buf = self.pager.page_mut(candidate)?;
                match ElementsViewMut::new(buf)?.append(key, val, inherit) {
                    Ok(at) => Some(at),
                    Err(DbError::InsufficientFreeSpace) => None,
                    Err(e) => return Err(e),
                }
            };
            match placed {
                Some(at) => {
                    let r = IndexRef {
                        pgid: candidate,
                        at,
                    };
                    self.write_chain_loc(loc, r)?;
                    tracing::debug!(pgid = candidate, at, "created element");
                    return Ok(());
                }
                None => candidate = 0,
            }
        }
    }

    fn write_chain_loc(&mut self, loc: ChainLoc, r: IndexRef) -> Result<()> {
        match loc {
            ChainLoc::Index(b) => {
                self.pager.set_index_ref(b, r);
            }
            ChainLoc::EleNext { pgid, at } => {
                let buf = self.pager.page_mut(pgid)?;
                ElementsViewMut::new(buf)?.set_next(at, r);
            }
        }
        Ok(())
    }

    /// Allocate a batch of element pages. The batch head absorbs the
    /// pending element (reserving `head_overflow` continuation pages);
    /// the remainder is carved into ordinary units whose heads join the
    /// free-list. Returns the batch head pgid.
    fn grow_pages(&mut self, first_ele_len: usize) -> Result<Pgid> {
        let ps = self.pager.page_size();
        let head_ovf = page::head_overflow(ps, first_ele_len) as u64;
        let head_span = 1 + head_ovf;
        let batch = head_span.div_ceil(ELE_PAGE_INCREMENT).max(1) * ELE_PAGE_INCREMENT;

        let before = self.pager.meta()?.ele_page_count();
        tracing::debug!(before, batch, head_span, "growing element pages");
        self.pager.grow(batch)?;

        let base = self.pager.element_base_pgid() + before;
        {
            let buf = self.pager.page_mut(base)?;
            page::write_header(buf, base, PAGE_FLAG_ELEMENT, 0, head_ovf as u32);
        }

        let ord_ovf = page::ordinary_overflow(ps) as u64;
        let stride = 1 + ord_ovf;
        let mut fresh: Vec<Pgid> = Vec::new();
        let mut pgid = base + head_span;
        while pgid + stride <= base + batch {
            let buf = self.pager.page_mut(pgid)?;
            page::write_header(buf, pgid, PAGE_FLAG_ELEMENT, 0, ord_ovf as u32);
            fresh.push(pgid);
            pgid += stride;
        }
        freelist::append_with_eviction(&mut self.pager, &fresh)?;

        self.pager.meta_mut()?.set_ele_page_count(before + batch);
        self.pager.flush()?;
        Ok(base)
    }

    /// Append the verbatim command to the WAL and advance the
    /// checkpoint; the meta page itself is only synchronized lazily.
    /// Suppressed while recovery replays.
    fn log_command(&mut self, cmd: &[u8]) -> Result<()> {
        if !self.serving {
            return Ok(());
        }
        let len = self.wal.append(cmd)?;
        if let Some(marker) = &self.crash_key {
            if !marker.is_empty() && contains(cmd, marker) {
                tracing::error!("crash marker hit after WAL sync; aborting");
                std::process::abort();
            }
        }
        self.pager.meta_mut()?.set_checkpoint(len);
        if len > WAL_ROTATE_THRESHOLD {
            let checkpoint = self.pager.meta()?.checkpoint();
            self.wal.rotate(checkpoint)?;
            self.pager.meta_mut()?.set_checkpoint(0);
        }
        Ok(())
    }

    pub fn checkpoint(&self) -> u64 {
        self.pager.meta().map(|m| m.checkpoint()).unwrap_or(0)
    }

    pub fn wal_len(&self) -> u64 {
        self.wal.len()
    }

    pub fn data_len(&self) -> u64 {
        self.pager.size()
    }

    pub fn close(&mut self) -> Result<()> {
        self.pager.flush()?;
        Ok(())
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Thread-safe façade: one exclusive lock around the whole engine, plus
/// the metrics observer. Workers share a `Store` behind an `Arc`.
pub struct Store {
    db: Mutex<Db>,
    metrics: Arc<Registry>,
}

impl Store {
    pub fn open(config: &Config) -> Result<Store> {
        let db = Db::open(&config.data_dir, config.rng_seed)?;
        Ok(Store {
            db: Mutex::new(db),
            metrics: Arc::new(Registry::new()),
        })
    }

    pub fn metrics(&self) -> Arc<Registry> {
        self.metrics.clone()
    }

    pub fn set(&self, cmd: &[u8], key: &[u8], val: &[u8]) -> Result<()> {
        let started = Instant::now();
        let mut db = self.db.lock();
        let locked = Instant::now();
        let result = db.set(cmd, key, val);
        drop(db);
        self.metrics
            .pure_set_duration
            .set(locked.elapsed().as_secs_f64());
        self.metrics
            .lock_set_duration
            .set(started.elapsed().as_secs_f64());
        result
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let started = Instant::now();
        let db = self.db.lock();
        let locked = Instant::now();
        let result = db.get(key);
        drop(db);
        self.metrics
            .pure_get_duration
            .set(locked.elapsed().as_secs_f64());
        self.metrics
            .lock_get_duration
            .set(started.elapsed().as_secs_f64());
        result
    }

    pub fn delete(&self, cmd: &[u8], keys: &[Vec<u8>]) -> Result<Vec<bool>> {
        let started = Instant::now();
        let mut db = self.db.lock();
        let locked = Instant::now();
        let result = db.delete(cmd, keys);
        drop(db);
        self.metrics
            .pure_del_duration
            .set(locked.elapsed().as_secs_f64());
        self.metrics
            .lock_del_duration
            .set(started.elapsed().as_secs_f64());
        result
    }

    /// Test hook: abort the process after the WAL sync of any command
    /// containing `marker`, before the checkpoint advances.
    pub fn set_crash_key(&self, marker: &[u8]) {
        self.db.lock().crash_key = Some(marker.to_vec());
    }

    pub fn checkpoint(&self) -> u64 {
        self.db.lock().checkpoint()
    }

    pub fn wal_len(&self) -> u64 {
        self.db.lock().wal_len()
    }

    pub fn data_len(&self) -> u64 {
        self.db.lock().data_len()
    }

    pub fn close(&self) -> Result<()> {
        self.db.lock().close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::encode_command;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn open_db(dir: &Path) -> Db {
        Db::open(dir, Some(7)).unwrap()
    }

    fn set_cmd(db: &mut Db, key: &[u8], val: &[u8]) {
        let cmd = encode_command(&[b"set", key, val]);
        db.set(&cmd, key, val).unwrap();
    }

    fn del_cmd(db: &mut Db, keys: &[&[u8]]) -> Vec<bool> {
        let mut args: Vec<&[u8]> = vec![b"del"];
        args.extend_from_slice(keys);
        let cmd = encode_command(&args);
        let owned: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
        db.delete(&cmd, &owned).unwrap()
    }

    /// Brute-force `n` distinct keys sharing one hash bucket.
    fn colliding_keys(n: usize) -> Vec<Vec<u8>> {
        let mut groups: HashMap<u16, Vec<Vec<u8>>> = HashMap::new();
        for i in 0u64.. {
            let key = format!("chain-key-{i}").into_bytes();
            let group = groups.entry(bucket(&key)).or_default();
            group.push(key);
            if group.len() >= n {
                let b = bucket(&group[0]);
                return groups.remove(&b).unwrap();
            }
        }
        unreachable!()
    }

    #[test]
    fn set_get_delete_round_trip() {
        let dir = tempdir().unwrap();
        let mut db = open_db(dir.path());
        set_cmd(&mut db, b"hello0", b"world0");
        set_cmd(&mut db, b"hello1", b"world1");
        assert_eq!(db.get(b"hello0").unwrap(), b"world0");
        assert_eq!(del_cmd(&mut db, &[b"hello0"]), vec![true]);
        assert!(matches!(db.get(b"hello0"), Err(DbError::NotFound)));
        assert_eq!(db.get(b"hello1").unwrap(), b"world1");
    }

    #[test]
    fn tombstone_then_reinsert_is_observable() {
        let dir = tempdir().unwrap();
        let mut db = open_db(dir.path());
        set_cmd(&mut db, b"k", b"v1");
        del_cmd(&mut db, &[b"k"]);
        set_cmd(&mut db, b"k", b"v2");
        assert_eq!(db.get(b"k").unwrap(), b"v2");
    }

    #[test]
    fn collision_chain_walks_and_relinks() {
        let keys = colliding_keys(3);
        let dir = tempdir().unwrap();
        let mut db = open_db(dir.path());

        for (i, key) in keys.iter().enumerate() {
            set_cmd(&mut db, key, format!("val-{i}").as_bytes());
        }
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(db.get(key).unwrap(), format!("val-{i}").as_bytes());
        }

        // Delete the middle link; its node stays in the chain as a
        // tombstone, so the tail must remain reachable.
        assert_eq!(del_cmd(&mut db, &[&keys[1]]), vec![true]);
        assert!(matches!(db.get(&keys[1]), Err(DbError::NotFound)));
        assert_eq!(db.get(&keys[0]).unwrap(), b"val-0");
        assert_eq!(db.get(&keys[2]).unwrap(), b"val-2");

        // Re-inserting appends a fresh node at the chain tail.
        set_cmd(&mut db, &keys[1], b"val-1-again");
        for (key, want) in keys.iter().zip([&b"val-0"[..], b"val-1-again", b"val-2"]) {
            assert_eq!(db.get(key).unwrap(), want);
        }
    }

    #[test]
    fn relocating_update_preserves_chain_tail() {
        let keys = colliding_keys(2);
        let dir = tempdir().unwrap();
        let mut db = open_db(dir.path());

        set_cmd(&mut db, &keys[0], b"small");
        set_cmd(&mut db, &keys[1], b"tail-value");

        // Too big for any ordinary page span, forcing tombstone-and-insert.
        let big = vec![b'x'; 256 * 1024];
        set_cmd(&mut db, &keys[0], &big);

        assert_eq!(db.get(&keys[0]).unwrap(), big);
        assert_eq!(db.get(&keys[1]).unwrap(), b"tail-value");
    }

    #[test]
    fn batch_delete_reports_per_key_liveness() {
        let dir = tempdir().unwrap();
        let mut db = open_db(dir.path());
        set_cmd(&mut db, b"key1", b"value1");
        assert_eq!(del_cmd(&mut db, &[b"key1", b"key2"]), vec![true, false]);
        assert!(matches!(db.get(b"key1"), Err(DbError::NotFound)));
        assert!(matches!(db.get(b"key2"), Err(DbError::NotFound)));
    }

    #[test]
    fn wal_suppressed_until_serving() {
        let dir = tempdir().unwrap();
        let mut db = open_db(dir.path());
        db.serving = false;
        set_cmd(&mut db, b"k", b"v");
        assert_eq!(db.wal_len(), 0);
        db.serving = true;
        set_cmd(&mut db, b"k", b"v2");
        assert!(db.wal_len() > 0);
        assert_eq!(db.checkpoint(), db.wal_len());
    }

    #[test]
    fn free_list_is_used_after_first_growth() {
        let dir = tempdir().unwrap();
        let mut db = open_db(dir.path());
        for i in 0..64 {
            let key = format!("fill-{i}");
            set_cmd(&mut db, key.as_bytes(), b"payload");
        }
        for i in 0..64 {
            let key = format!("fill-{i}");
            assert_eq!(db.get(key.as_bytes()).unwrap(), b"payload");
        }
        // 64 small inserts fit in the first batch's pages.
        let grown = db.pager.meta().unwrap().ele_page_count();
        assert_eq!(grown, ELE_PAGE_INCREMENT);
    }
}
