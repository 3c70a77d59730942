//! Flash-backed Data Object pool: allocation, release and copying GC.
//!
//! The pool is two erasable pages (`SPEC_FULL.md` §4.1). Each page starts
//! with a 2-byte little-endian generation counter; whichever page holds the
//! higher generation (or the only non-blank one) is "active" and everything
//! is allocated by bumping a pointer from its start. Programming a flash
//! half-word can only clear bits, never set them, so "freeing" a record
//! means zero-filling it in place rather than reclaiming its space — actual
//! reclamation happens in [`FlashStore::compact`], which copies every live
//! record into the other page and erases the old one.
//!
//! Records are tagged with a one-byte `nr` (record number) followed by a
//! one-byte length, mirroring the wire format Data Objects already use on
//! the card (`do_store`) so the two layers share one allocator.
//!
//! A single half-word program failure outside of GC is recoverable: it's
//! logged and surfaced as [`GnukError::DoWriteError`], and the record being
//! written is simply abandoned. Only a failure inside [`FlashStore::compact`]
//! itself, or exhausting both pages even after compaction runs, is fatal —
//! those leave no safe way to keep going.

use gnuk_hal::FlashInterface;
use log::warn;

use crate::constants::DATA_POOL_HEADER_SIZE;
use crate::{FatalCause, GnukError, Result};

/// Record number reserved to mark the unwritten tail of a page.
pub const NR_EMPTY: u8 = 0xff;
/// Record number of a released (zero-filled) slot.
const NR_RELEASED: u8 = 0x00;

/// A single half-word program failed outside of GC. Recoverable: logged and
/// surfaced as `DO WRITE ERROR`, not fatal (`SPEC_FULL.md` §4.1).
fn write_failed() -> GnukError {
    warn!("flash_store: half-word program failed");
    GnukError::DoWriteError
}

/// A handle to one record's payload, valid until the next [`FlashStore::compact`].
///
/// Opaque on purpose: the address is a byte offset into the logical pool,
/// not a pointer, so it stays meaningful across host-side testing and real
/// firmware builds alike (`SPEC_FULL.md` §9, "addresses are offsets").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Addr(pub usize);

/// One live record found while [`FlashStore::scan`] walks the pool.
pub struct ScanRecord<'a> {
    pub nr: u8,
    pub addr: Addr,
    pub data: &'a [u8],
}

/// Flash-backed allocator for the two-page rotating Data Object pool.
///
/// Generic over the board's [`FlashInterface`] so host-side tests can run
/// against an in-memory fake with the exact same allocation logic firmware
/// uses.
pub struct FlashStore<F: FlashInterface> {
    flash: F,
    /// Byte offset of page 0's first byte within the flash address space
    /// the `FlashInterface` addresses.
    base: usize,
    page_size: usize,
    /// 0 or 1: which of the two pages is currently active.
    active: u8,
    /// Offset (from `base`) of the first unwritten byte in the active page.
    last: usize,
}

impl<F: FlashInterface> FlashStore<F> {
    /// Scans both pages' generation headers and picks the active one,
    /// mirroring `flash_init`'s gen0/gen1 comparison.
    pub fn mount(flash: F, base: usize) -> Result<Self> {
        let page_size = flash.page_size();
        let mut gen = [0u8; 2];
        flash.hal_flash_read(base, &mut gen);
        let gen0 = u16::from_le_bytes(gen);
        flash.hal_flash_read(base + page_size, &mut gen);
        let gen1 = u16::from_le_bytes(gen);

        let active = if gen0 == 0xffff {
            1
        } else if gen1 == 0xffff {
            0
        } else if gen1 > gen0 {
            1
        } else {
            0
        };

        let mut store = FlashStore {
            flash,
            base,
            page_size,
            active,
            last: DATA_POOL_HEADER_SIZE,
        };
        store.last = store.find_tail();
        Ok(store)
    }

    fn page_base(&self, which: u8) -> usize {
        self.base + which as usize * self.page_size
    }

    fn active_base(&self) -> usize {
        self.page_base(self.active)
    }

    /// Walks the active page once to find the first unwritten halfword,
    /// the same traversal `gpg_data_scan` performs at boot before handing
    /// control to `do_store`.
    fn find_tail(&self) -> usize {
        let base = self.active_base();
        let mut off = DATA_POOL_HEADER_SIZE;
        loop {
            let mut hdr = [0u8; 2];
            self.flash.hal_flash_read(base + off, &mut hdr);
            let nr = hdr[0];
            if nr == NR_EMPTY {
                return off;
            }
            let len = hdr[1] as usize;
            off += 2;
            if nr != NR_RELEASED {
                off += (len + 1) & !1;
            }
        }
    }

    /// Invokes `visit` once per live record in the active page, in storage
    /// order. Used by `do_store` to rebuild its in-RAM index on mount.
    pub fn scan(&self, mut visit: impl FnMut(ScanRecord)) {
        let base = self.active_base();
        let mut off = DATA_POOL_HEADER_SIZE;
        let mut buf = [0u8; 256];
        while off < self.last {
            let mut hdr = [0u8; 2];
            self.flash.hal_flash_read(base + off, &mut hdr);
            let nr = hdr[0];
            let len = hdr[1] as usize;
            off += 2;
            if nr != NR_RELEASED && nr != NR_EMPTY {
                self.flash.hal_flash_read(base + off, &mut buf[..len]);
                visit(ScanRecord {
                    nr,
                    addr: Addr(off),
                    data: &buf[..len],
                });
            }
            if nr != NR_RELEASED {
                off += (len + 1) & !1;
            }
        }
    }

    fn is_full(&self, size: usize) -> bool {
        self.last + size > self.page_size
    }

    /// Allocates `2 + len` bytes (rounded up to a halfword) at the tail of
    /// the active page, running [`compact`](Self::compact) first if there
    /// isn't room.
    fn allocate(&mut self, len: usize, gc: impl FnOnce(&mut Self) -> Result<()>) -> Result<Addr> {
        let size = (2 + len + 1) & !1;
        if self.is_full(size) {
            gc(self)?;
            if self.is_full(size) {
                return Err(GnukError::Fatal(FatalCause::FlashExhausted));
            }
        }
        let off = self.last;
        self.last += size;
        Ok(Addr(off))
    }

    /// Writes a `nr`/`len`/`data` record at a previously allocated `addr`.
    fn write_record(&mut self, addr: Addr, nr: u8, data: &[u8]) -> Result<()> {
        let base = self.active_base();
        let hdr = [nr, data.len() as u8];
        self.flash.hal_flash_write(base + addr.0, &hdr).map_err(|_| write_failed())?;

        let mut off = addr.0 + 2;
        let mut chunks = data.chunks_exact(2);
        for pair in &mut chunks {
            self.flash.hal_flash_write(base + off, pair).map_err(|_| write_failed())?;
            off += 2;
        }
        if let [last] = *chunks.remainder() {
            self.flash.hal_flash_write(base + off, &[last, 0xff]).map_err(|_| write_failed())?;
        }
        Ok(())
    }

    /// Allocates and writes a new record, running `gc` if the active page
    /// is full. Returns the address of the record's payload (past the
    /// two-byte header), matching `flash_do_write`'s return convention.
    pub fn put(
        &mut self,
        nr: u8,
        data: &[u8],
        gc: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<Addr> {
        let addr = self.allocate(data.len(), gc)?;
        self.write_record(addr, nr, data)?;
        Ok(Addr(addr.0 + 2))
    }

    /// Zero-fills a live record's header and body in place. The space is
    /// not reclaimed until the next [`compact`](Self::compact).
    pub fn release(&mut self, payload_addr: Addr, len: usize) -> Result<()> {
        let base = self.active_base();
        let tag_addr = payload_addr.0 - 2;
        let mut off = payload_addr.0;
        for _ in 0..len / 2 {
            self.flash.hal_flash_write(base + off, &[0, 0]).map_err(|_| write_failed())?;
            off += 2;
        }
        if len & 1 != 0 {
            self.flash.hal_flash_write(base + off, &[0, 0]).map_err(|_| write_failed())?;
        }
        self.flash.hal_flash_write(base + tag_addr, &[0, 0]).map_err(|_| write_failed())?;
        Ok(())
    }

    /// Copies every live record into the other page via `rewrite`, erases
    /// the page that was active, and bumps the new page's generation.
    /// `rewrite` is supplied by `do_store`, which alone knows which records
    /// are still live and must update its own address index as it copies
    /// them (mirroring `gpg_data_copy` updating `do_ptr[]` in the same
    /// pass). It's handed a [`Compactor`], which reads old-page data by the
    /// addresses `do_store`'s index already holds and allocates fresh ones
    /// in the new page.
    pub fn compact(&mut self, rewrite: impl FnOnce(&mut Compactor<F>) -> Result<()>) -> Result<()> {
        let old_active = self.active;
        let old_base = self.page_base(old_active);
        let mut gen = [0u8; 2];
        self.flash.hal_flash_read(old_base, &mut gen);
        let generation = u16::from_le_bytes(gen);

        self.active = 1 - old_active;
        self.last = DATA_POOL_HEADER_SIZE;

        let mut ctx = Compactor { store: self, old_base };
        rewrite(&mut ctx)?;

        self.flash
            .hal_flash_erase_page(old_base)
            .map_err(|_| GnukError::Fatal(FatalCause::GcFailed))?;
        let new_gen = (generation.wrapping_add(1)).to_le_bytes();
        self.flash
            .hal_flash_write(self.page_base(self.active), &new_gen)
            .map_err(|_| GnukError::Fatal(FatalCause::GcFailed))?;
        Ok(())
    }

    /// Reads `len` bytes of a live record's payload.
    pub fn read(&self, payload_addr: Addr, out: &mut [u8]) {
        self.flash
            .hal_flash_read(self.active_base() + payload_addr.0, out);
    }
}

/// Handed to the [`FlashStore::compact`] callback: reads still-live data
/// out of the page being retired and appends it to the page taking over.
pub struct Compactor<'a, F: FlashInterface> {
    store: &'a mut FlashStore<F>,
    old_base: usize,
}

impl<'a, F: FlashInterface> Compactor<'a, F> {
    /// Reads `len` bytes of a record's payload from the page being retired,
    /// at the address `do_store`'s index recorded when the record was
    /// last written or copied.
    pub fn read_old(&self, payload_addr: Addr, out: &mut [u8]) {
        self.store
            .flash
            .hal_flash_read(self.old_base + payload_addr.0, out);
    }

    /// Appends a record to the page taking over, returning its new payload
    /// address. `do_store` must overwrite its index entry with this value.
    pub fn put_new(&mut self, nr: u8, data: &[u8]) -> Result<Addr> {
        let addr = self.store.allocate(data.len(), |_| {
            Err(GnukError::Fatal(FatalCause::GcFailed))
        })?;
        self.store.write_record(addr, nr, data)?;
        Ok(Addr(addr.0 + 2))
    }
}

/// Decodes the "1-2-3" retry-counter encoding: after a page erase a
/// halfword reads `0xffff`; programming it once can only clear bits, so
/// three distinct values (`0xff`, `0xc3c3`, `0x0000`) encode three
/// successive states without ever needing a fourth program.
pub fn cnt123_decode(low_byte: Option<u8>) -> u8 {
    match low_byte {
        None => 0,
        Some(0xff) => 1,
        Some(0x00) => 3,
        Some(_) => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::vec::Vec;

    struct FakeFlash {
        mem: RefCell<Vec<u8>>,
        page_size: usize,
    }

    impl FakeFlash {
        fn new(pages: usize, page_size: usize) -> Self {
            FakeFlash {
                mem: RefCell::new(std::vec![0xffu8; pages * page_size]),
                page_size,
            }
        }
    }

    impl FlashInterface for FakeFlash {
        fn page_size(&self) -> usize {
            self.page_size
        }

        fn hal_flash_read(&self, addr: usize, out: &mut [u8]) {
            let mem = self.mem.borrow();
            out.copy_from_slice(&mem[addr..addr + out.len()]);
        }

        fn hal_flash_write(&mut self, addr: usize, data: &[u8]) -> core::result::Result<(), gnuk_hal::FlashError> {
            let mut mem = self.mem.borrow_mut();
            for (i, b) in data.iter().enumerate() {
                let cur = mem[addr + i];
                if b & !cur != 0 {
                    // would need to set a bit back to 1 without an erase
                    return Err(gnuk_hal::FlashError);
                }
                mem[addr + i] = cur & b;
            }
            Ok(())
        }

        fn hal_flash_erase_page(&mut self, addr: usize) -> core::result::Result<(), gnuk_hal::FlashError> {
            let mut mem = self.mem.borrow_mut();
            let page = addr / self.page_size;
            let start = page * self.page_size;
            for b in &mut mem[start..start + self.page_size] {
                *b = 0xff;
            }
            Ok(())
        }
    }

    fn mounted(page_size: usize) -> FlashStore<FakeFlash> {
        let flash = FakeFlash::new(2, page_size);
        let mut store = FlashStore::mount(flash, 0).unwrap();
        store
            .flash
            .hal_flash_write(0, &1u16.to_le_bytes())
            .unwrap();
        store.last = DATA_POOL_HEADER_SIZE;
        store
    }

    #[test]
    fn put_then_scan_round_trips() {
        let mut store = mounted(256);
        store.put(0x10, b"hello", |_| Ok(())).unwrap();
        store.put(0x11, b"world!", |_| Ok(())).unwrap();

        let mut seen = Vec::new();
        store.scan(|rec| seen.push((rec.nr, rec.data.to_vec())));
        assert_eq!(seen[0].0, 0x10);
        assert_eq!(seen[0].1, b"hello");
        assert_eq!(seen[1].0, 0x11);
        assert_eq!(seen[1].1, b"world!");
    }

    #[test]
    fn release_zero_fills_and_hides_from_scan() {
        let mut store = mounted(256);
        let addr = store.put(0x20, b"secret", |_| Ok(())).unwrap();
        store.release(addr, 6).unwrap();

        let mut seen = Vec::new();
        store.scan(|rec| seen.push(rec.nr));
        assert!(seen.is_empty());
    }

    #[test]
    fn compact_reclaims_released_space() {
        let mut store = mounted(64);
        let a = store.put(0x30, b"aaaaaaaaaaaaaaaaaaaa", |_| Ok(())).unwrap();
        store.release(a, 20).unwrap();
        let b = store.put(0x31, b"bb", |_| Ok(())).unwrap();

        // Without GC, the page (64 bytes, header 2) can't fit another
        // 22-byte record; force a compaction and confirm the allocation
        // that follows succeeds because the released record's space was
        // actually reclaimed. `b` is the only record a real do_store index
        // would still consider live.
        store
            .compact(|c| {
                let mut buf = [0u8; 2];
                c.read_old(b, &mut buf);
                c.put_new(0x31, &buf)?;
                Ok(())
            })
            .unwrap();

        let result = store.put(0x32, b"cccccccccccccccccccc", |_| Ok(()));
        assert!(result.is_ok());
    }

    #[test]
    fn ordinary_program_failure_is_recoverable_not_fatal() {
        let mut store = mounted(256);
        // Pre-clear the bits the record header is about to write, so the
        // header write needs to set a bit back to 1 and fails without an
        // erase — a single half-word failure, not a GC failure.
        let addr = store.active_base() + store.last;
        store.flash.hal_flash_write(addr, &[0x00, 0x00]).unwrap();
        let err = store.put(0x10, b"hi", |_| Ok(())).unwrap_err();
        assert_eq!(err, GnukError::DoWriteError);
    }

    #[test]
    fn cnt123_encoding_matches_retry_states() {
        assert_eq!(cnt123_decode(None), 0);
        assert_eq!(cnt123_decode(Some(0xff)), 1);
        assert_eq!(cnt123_decode(Some(0xc3)), 2);
        assert_eq!(cnt123_decode(Some(0x00)), 3);
    }
}
