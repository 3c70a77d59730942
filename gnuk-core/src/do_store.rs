//! The OpenPGP card's Data Object tree: a fixed table of 16-bit tags, each
//! either a compile-time constant, a variable-length value kept in
//! [`flash_store`](crate::flash_store), a value computed on the fly, or a
//! composite that concatenates other entries' TLV encodings.
//!
//! Mirrors the shape of the original firmware's `do_table_entry` array, but
//! folds the handful of "internal objects" it also keeps in the data pool
//! (the three PIN error counters, the digital-signature counter, and the
//! PW1-lifetime flag) into the same generic length-prefixed record format
//! ordinary Data Objects use, rather than their own raw half-word packing.
//! That costs a few extra bytes of pool churn per PIN attempt in exchange
//! for one record shape and one scan loop.

use gnuk_hal::FlashInterface;

use crate::flash_store::{Addr, FlashStore};
use crate::{GnukError, Result};

pub mod tag {
    pub const SEX: u16 = 0x5f35;
    pub const FP_SIG: u16 = 0x00c7;
    pub const FP_DEC: u16 = 0x00c8;
    pub const FP_AUT: u16 = 0x00c9;
    pub const CAFP_1: u16 = 0x00ca;
    pub const CAFP_2: u16 = 0x00cb;
    pub const CAFP_3: u16 = 0x00cc;
    pub const KGTIME_SIG: u16 = 0x00ce;
    pub const KGTIME_DEC: u16 = 0x00cf;
    pub const KGTIME_AUT: u16 = 0x00d0;
    pub const LOGIN_DATA: u16 = 0x005e;
    pub const URL: u16 = 0x5f50;
    pub const NAME: u16 = 0x005b;
    pub const LANGUAGE: u16 = 0x5f2d;
    pub const CH_CERTIFICATE: u16 = 0x7f21;

    pub const HIST_BYTES: u16 = 0x5f52;
    pub const FP_ALL: u16 = 0x00c5;
    pub const CAFP_ALL: u16 = 0x00c6;
    pub const KGTIME_ALL: u16 = 0x00cd;
    pub const DS_COUNT: u16 = 0x0093;
    pub const AID: u16 = 0x004f;
    pub const PW_STATUS: u16 = 0x00c4;

    pub const EXTCAP: u16 = 0x00c0;
    pub const ALG_SIG: u16 = 0x00c1;
    pub const ALG_DEC: u16 = 0x00c2;
    pub const ALG_AUT: u16 = 0x00c3;

    pub const CH_DATA: u16 = 0x0065;
    pub const APP_DATA: u16 = 0x006e;
    pub const DISCRETIONARY: u16 = 0x0073;
    pub const SS_TEMP: u16 = 0x007a;

    pub const RESETTING_CODE: u16 = 0x00d3;
    pub const KEY_IMPORT: u16 = 0x3fff;
}

/// Which authentication state a read or write is gated on. Unlike the
/// original's single required bit, PIN-error-counter resets need "either
/// PW3 or a not-yet-set RC" — composing that is `ac`'s job; here each DO
/// just names its single requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Always,
    Never,
    /// Satisfied by PW1 verified for PSO:CDS.
    Cds,
    /// Satisfied by PW1 verified for any other operation.
    Other,
    /// Satisfied by PW3 (the admin PIN).
    Admin,
}

/// The caller's currently-held authentication state, as a set of which
/// [`Access`] requirements are satisfied right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthMask {
    pub cds: bool,
    pub other: bool,
    pub admin: bool,
}

impl AuthMask {
    fn satisfies(self, required: Access) -> bool {
        match required {
            Access::Always => true,
            Access::Never => false,
            Access::Cds => self.cds,
            Access::Other => self.other,
            Access::Admin => self.admin,
        }
    }
}

#[derive(Clone, Copy)]
enum Kind {
    /// Fixed compile-time bytes (extended capabilities, algorithm attrs).
    Fixed(&'static [u8]),
    /// Variable-length value kept in one flash_store slot.
    Var(usize),
    /// Computed at read time from other card state.
    Proc,
    /// Concatenation of other tags' full TLV encodings.
    Composite(&'static [u16]),
}

struct DoEntry {
    tag: u16,
    kind: Kind,
    ac_read: Access,
    ac_write: Access,
}

const ALG_ATTR_RSA: [u8; 6] = [0x01, 0x08, 0x00, 0x00, 0x20, 0x00];
const EXTENDED_CAPABILITIES: [u8; 10] =
    [0x70, 0x00, 0x00, crate::constants::MAX_DO_LEN as u8, 0x00, 0x00, 0x00, 0xff, 0x01, 0x00];

const CMP_CH_DATA: [u16; 3] = [tag::NAME, tag::LANGUAGE, tag::SEX];
const CMP_APP_DATA: [u16; 3] = [tag::AID, tag::HIST_BYTES, tag::DISCRETIONARY];
const CMP_DISCRETIONARY: [u16; 8] = [
    tag::EXTCAP,
    tag::ALG_SIG,
    tag::ALG_DEC,
    tag::ALG_AUT,
    tag::PW_STATUS,
    tag::FP_ALL,
    tag::CAFP_ALL,
    tag::KGTIME_ALL,
];
const CMP_SS_TEMP: [u16; 1] = [tag::DS_COUNT];

// Slot indices into `DoStore::slots`, the internal equivalent of the
// original's `nr` byte.
const SLOT_SEX: usize = 0;
const SLOT_FP_SIG: usize = 1;
const SLOT_FP_DEC: usize = 2;
const SLOT_FP_AUT: usize = 3;
const SLOT_CAFP_1: usize = 4;
const SLOT_CAFP_2: usize = 5;
const SLOT_CAFP_3: usize = 6;
const SLOT_KGTIME_SIG: usize = 7;
const SLOT_KGTIME_DEC: usize = 8;
const SLOT_KGTIME_AUT: usize = 9;
const SLOT_LOGIN_DATA: usize = 10;
const SLOT_URL: usize = 11;
const SLOT_NAME: usize = 12;
const SLOT_LANGUAGE: usize = 13;
const SLOT_CH_CERTIFICATE: usize = 14;
const NUM_VAR_SLOTS: usize = 15;

const TABLE: &[DoEntry] = &[
    DoEntry { tag: tag::SEX, kind: Kind::Var(SLOT_SEX), ac_read: Access::Always, ac_write: Access::Admin },
    DoEntry { tag: tag::FP_SIG, kind: Kind::Var(SLOT_FP_SIG), ac_read: Access::Always, ac_write: Access::Admin },
    DoEntry { tag: tag::FP_DEC, kind: Kind::Var(SLOT_FP_DEC), ac_read: Access::Always, ac_write: Access::Admin },
    DoEntry { tag: tag::FP_AUT, kind: Kind::Var(SLOT_FP_AUT), ac_read: Access::Always, ac_write: Access::Admin },
    DoEntry { tag: tag::CAFP_1, kind: Kind::Var(SLOT_CAFP_1), ac_read: Access::Always, ac_write: Access::Admin },
    DoEntry { tag: tag::CAFP_2, kind: Kind::Var(SLOT_CAFP_2), ac_read: Access::Always, ac_write: Access::Admin },
    DoEntry { tag: tag::CAFP_3, kind: Kind::Var(SLOT_CAFP_3), ac_read: Access::Always, ac_write: Access::Admin },
    DoEntry { tag: tag::KGTIME_SIG, kind: Kind::Var(SLOT_KGTIME_SIG), ac_read: Access::Always, ac_write: Access::Admin },
    DoEntry { tag: tag::KGTIME_DEC, kind: Kind::Var(SLOT_KGTIME_DEC), ac_read: Access::Always, ac_write: Access::Admin },
    DoEntry { tag: tag::KGTIME_AUT, kind: Kind::Var(SLOT_KGTIME_AUT), ac_read: Access::Always, ac_write: Access::Admin },
    DoEntry { tag: tag::LOGIN_DATA, kind: Kind::Var(SLOT_LOGIN_DATA), ac_read: Access::Always, ac_write: Access::Admin },
    DoEntry { tag: tag::URL, kind: Kind::Var(SLOT_URL), ac_read: Access::Always, ac_write: Access::Admin },
    DoEntry { tag: tag::NAME, kind: Kind::Var(SLOT_NAME), ac_read: Access::Always, ac_write: Access::Admin },
    DoEntry { tag: tag::LANGUAGE, kind: Kind::Var(SLOT_LANGUAGE), ac_read: Access::Always, ac_write: Access::Admin },
    DoEntry { tag: tag::CH_CERTIFICATE, kind: Kind::Var(SLOT_CH_CERTIFICATE), ac_read: Access::Always, ac_write: Access::Admin },
    DoEntry { tag: tag::HIST_BYTES, kind: Kind::Proc, ac_read: Access::Always, ac_write: Access::Never },
    DoEntry { tag: tag::FP_ALL, kind: Kind::Proc, ac_read: Access::Always, ac_write: Access::Never },
    DoEntry { tag: tag::CAFP_ALL, kind: Kind::Proc, ac_read: Access::Always, ac_write: Access::Never },
    DoEntry { tag: tag::KGTIME_ALL, kind: Kind::Proc, ac_read: Access::Always, ac_write: Access::Never },
    DoEntry { tag: tag::DS_COUNT, kind: Kind::Proc, ac_read: Access::Always, ac_write: Access::Never },
    DoEntry { tag: tag::AID, kind: Kind::Proc, ac_read: Access::Always, ac_write: Access::Never },
    DoEntry { tag: tag::PW_STATUS, kind: Kind::Proc, ac_read: Access::Always, ac_write: Access::Admin },
    DoEntry { tag: tag::EXTCAP, kind: Kind::Fixed(&EXTENDED_CAPABILITIES), ac_read: Access::Always, ac_write: Access::Never },
    DoEntry { tag: tag::ALG_SIG, kind: Kind::Fixed(&ALG_ATTR_RSA), ac_read: Access::Always, ac_write: Access::Never },
    DoEntry { tag: tag::ALG_DEC, kind: Kind::Fixed(&ALG_ATTR_RSA), ac_read: Access::Always, ac_write: Access::Never },
    DoEntry { tag: tag::ALG_AUT, kind: Kind::Fixed(&ALG_ATTR_RSA), ac_read: Access::Always, ac_write: Access::Never },
    DoEntry { tag: tag::CH_DATA, kind: Kind::Composite(&CMP_CH_DATA), ac_read: Access::Always, ac_write: Access::Never },
    DoEntry { tag: tag::APP_DATA, kind: Kind::Composite(&CMP_APP_DATA), ac_read: Access::Always, ac_write: Access::Never },
    DoEntry { tag: tag::DISCRETIONARY, kind: Kind::Composite(&CMP_DISCRETIONARY), ac_read: Access::Always, ac_write: Access::Never },
    DoEntry { tag: tag::SS_TEMP, kind: Kind::Composite(&CMP_SS_TEMP), ac_read: Access::Always, ac_write: Access::Never },
    DoEntry { tag: tag::RESETTING_CODE, kind: Kind::Var(SLOT_RESETTING_CODE), ac_read: Access::Never, ac_write: Access::Admin },
    DoEntry { tag: tag::KEY_IMPORT, kind: Kind::Var(SLOT_KEY_IMPORT), ac_read: Access::Never, ac_write: Access::Admin },
];

const SLOT_RESETTING_CODE: usize = NUM_VAR_SLOTS;
const SLOT_KEY_IMPORT: usize = NUM_VAR_SLOTS + 1;
const NUM_SLOTS_TOTAL: usize = NUM_VAR_SLOTS + 2;

// Record numbers for the internal objects that share the same flash pool,
// placed above the VAR DO slot range so `scan`'s `nr` stays one flat
// namespace.
const NR_VAR_BASE: u8 = 0;
const NR_PW1_LIFETIME: u8 = NUM_SLOTS_TOTAL as u8;
const NR_COUNTER_PW1: u8 = NR_PW1_LIFETIME + 1;
const NR_COUNTER_RC: u8 = NR_PW1_LIFETIME + 2;
const NR_COUNTER_PW3: u8 = NR_PW1_LIFETIME + 3;
const NR_DS_COUNTER: u8 = NR_PW1_LIFETIME + 4;
const NR_KEYSTRING_PW1: u8 = NR_PW1_LIFETIME + 5;
const NR_KEYSTRING_RC: u8 = NR_PW1_LIFETIME + 6;
const NR_KEYSTRING_PW3: u8 = NR_PW1_LIFETIME + 7;

/// `len(1) + salt(8) + iter(1) + sha1(20)`, the PW3 keystring shape; PW1 and
/// RC keystrings are shorter (`len(1) + sha1(20)`, no salt/iteration).
const MAX_KEYSTRING_LEN: usize = 30;

fn keystring_index(which: Keystring) -> usize {
    match which {
        Keystring::Pw1 => 0,
        Keystring::Rc => 1,
        Keystring::Pw3 => 2,
    }
}

fn keystring_nr(which: Keystring) -> u8 {
    match which {
        Keystring::Pw1 => NR_KEYSTRING_PW1,
        Keystring::Rc => NR_KEYSTRING_RC,
        Keystring::Pw3 => NR_KEYSTRING_PW3,
    }
}

fn get_do_entry(tag: u16) -> Option<&'static DoEntry> {
    TABLE.iter().find(|e| e.tag == tag)
}

/// Which of the three PIN error counters `gpg_pw_*` addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Pw1,
    Rc,
    Pw3,
}

/// Which keystring record `ac` is reading or replacing. Absent means "use
/// the admin-less default" for PW3 and "unset" for PW1/RC (a PW1/RC
/// keystring is always present after the first successful CHANGE REFERENCE
/// DATA or RESET RETRY CODE; it just starts out matching the factory PIN
/// via a well-known derivation `ac` performs itself, never persisted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keystring {
    Pw1,
    Rc,
    Pw3,
}

/// The maximum number of consecutive failures before a PIN locks, matching
/// the 1-2-3 encoding's ceiling.
pub const PASSWORD_ERRORS_MAX: u8 = 3;

/// Owns the flash-backed pool and the in-RAM index `do_store` rebuilds
/// from it at mount time: one [`Addr`]/length pair per live VAR slot, plus
/// the three PIN counters and the signature counter.
pub struct DoStore<F: FlashInterface> {
    flash: FlashStore<F>,
    slots: [Option<(Addr, u8)>; NUM_SLOTS_TOTAL],
    pw1_lifetime: Option<Addr>,
    counters: [Option<(Addr, u8)>; 3],
    ds_counter_addr: Option<Addr>,
    ds_counter: u32,
    keystrings: [Option<(Addr, u8)>; 3],
}

impl<F: FlashInterface> DoStore<F> {
    /// Mounts the pool and replays its live records to rebuild the index,
    /// the same role `gpg_data_scan` plays at boot.
    pub fn mount(flash: FlashStore<F>) -> Self {
        let mut store = DoStore {
            flash,
            slots: [None; NUM_SLOTS_TOTAL],
            pw1_lifetime: None,
            counters: [None; 3],
            ds_counter_addr: None,
            ds_counter: 0,
            keystrings: [None; 3],
        };
        store.rebuild_index();
        store
    }

    fn rebuild_index(&mut self) {
        let slots = &mut self.slots;
        let pw1_lifetime = &mut self.pw1_lifetime;
        let counters = &mut self.counters;
        let ds_counter_addr = &mut self.ds_counter_addr;
        let keystrings = &mut self.keystrings;
        let mut ds_counter = 0u32;

        self.flash.scan(|rec| {
            let nr = rec.nr;
            if (nr as usize) < NUM_SLOTS_TOTAL {
                let len = rec.data.len() as u8;
                slots[nr as usize] = Some((rec.addr, len));
            } else if nr == NR_PW1_LIFETIME {
                *pw1_lifetime = Some(rec.addr);
            } else if nr == NR_COUNTER_PW1 {
                counters[0] = Some((rec.addr, rec.data[0]));
            } else if nr == NR_COUNTER_RC {
                counters[1] = Some((rec.addr, rec.data[0]));
            } else if nr == NR_COUNTER_PW3 {
                counters[2] = Some((rec.addr, rec.data[0]));
            } else if nr == NR_DS_COUNTER {
                *ds_counter_addr = Some(rec.addr);
                ds_counter = u32::from_le_bytes([rec.data[0], rec.data[1], rec.data[2], 0]);
            } else if nr == NR_KEYSTRING_PW1 {
                keystrings[0] = Some((rec.addr, rec.data.len() as u8));
            } else if nr == NR_KEYSTRING_RC {
                keystrings[1] = Some((rec.addr, rec.data.len() as u8));
            } else if nr == NR_KEYSTRING_PW3 {
                keystrings[2] = Some((rec.addr, rec.data.len() as u8));
            }
        });
        self.ds_counter = ds_counter;
    }

    fn nr_for_slot(slot: usize) -> u8 {
        NR_VAR_BASE + slot as u8
    }

    /// Allocates and writes a record, running a full copying GC and
    /// retrying once if the active page is out of room.
    fn put_with_gc(&mut self, nr: u8, data: &[u8]) -> Result<Addr> {
        match self.flash.put(nr, data, |_| Err(GnukError::Fatal(crate::FatalCause::FlashExhausted))) {
            Err(GnukError::Fatal(crate::FatalCause::FlashExhausted)) => {
                self.compact()?;
                self.flash.put(nr, data, |_| Err(GnukError::Fatal(crate::FatalCause::FlashExhausted)))
            }
            other => other,
        }
    }

    /// Runs a full copying GC: copies every record this index still
    /// considers live into the other page, erases the page that was
    /// active, and repoints the index at the fresh addresses. Mirrors
    /// the original firmware's `gpg_data_copy` walking its RAM pointer
    /// table during `flash_copying_gc`.
    pub fn compact(&mut self) -> Result<()> {
        let slots = self.slots;
        let pw1_lifetime_set = self.pw1_lifetime.is_some();
        let counters = self.counters;
        let ds_counter = self.ds_counter;
        let ds_addr_was_set = self.ds_counter_addr.is_some();
        let keystrings = self.keystrings;

        let mut new_slots = [None; NUM_SLOTS_TOTAL];
        let mut new_pw1_lifetime = None;
        let mut new_counters = [None; 3];
        let mut new_ds_addr = None;
        let mut new_keystrings = [None; 3];

        self.flash.compact(|c| {
            for (slot, entry) in slots.iter().enumerate() {
                if let Some((addr, len)) = *entry {
                    let mut buf = [0u8; crate::constants::MAX_DO_LEN];
                    c.read_old(addr, &mut buf[..len as usize]);
                    let new_addr = c.put_new(Self::nr_for_slot(slot), &buf[..len as usize])?;
                    new_slots[slot] = Some((new_addr, len));
                }
            }
            if pw1_lifetime_set {
                new_pw1_lifetime = Some(c.put_new(NR_PW1_LIFETIME, &[])?);
            }
            for (i, entry) in counters.iter().enumerate() {
                if let Some((_, raw)) = *entry {
                    let which = [Counter::Pw1, Counter::Rc, Counter::Pw3][i];
                    new_counters[i] = Some((c.put_new(counter_nr(which), &[raw])?, raw));
                }
            }
            if ds_addr_was_set {
                let bytes = ds_counter.to_be_bytes();
                new_ds_addr = Some(c.put_new(NR_DS_COUNTER, &bytes[1..])?);
            }
            for (i, entry) in keystrings.iter().enumerate() {
                if let Some((addr, len)) = *entry {
                    let mut buf = [0u8; MAX_KEYSTRING_LEN];
                    c.read_old(addr, &mut buf[..len as usize]);
                    let which = [Keystring::Pw1, Keystring::Rc, Keystring::Pw3][i];
                    let new_addr = c.put_new(keystring_nr(which), &buf[..len as usize])?;
                    new_keystrings[i] = Some((new_addr, len));
                }
            }
            Ok(())
        })?;

        self.slots = new_slots;
        self.pw1_lifetime = new_pw1_lifetime;
        self.counters = new_counters;
        self.ds_counter_addr = new_ds_addr;
        self.keystrings = new_keystrings;
        Ok(())
    }

    /// Replaces (or clears, with an empty slice) the stored keystring for
    /// `which`. `ac` calls this on every successful CHANGE REFERENCE DATA or
    /// RESET RETRY COUNTER, and to clear PW1/RC back to "derive from the
    /// factory PIN" when PW3 is reset via the admin-less path.
    pub fn write_keystring(&mut self, which: Keystring, data: &[u8]) -> Result<()> {
        let idx = keystring_index(which);
        let nr = keystring_nr(which);
        let new_addr = self.put_with_gc(nr, data)?;
        if let Some((old_addr, old_len)) = self.keystrings[idx] {
            self.flash.release(old_addr, old_len as usize)?;
        }
        self.keystrings[idx] = Some((new_addr, data.len() as u8));
        Ok(())
    }

    /// Reads the stored keystring for `which` into `out`, returning its
    /// length, or `None` if nothing has been written yet.
    pub fn read_keystring(&self, which: Keystring, out: &mut [u8]) -> Option<usize> {
        let idx = keystring_index(which);
        let (addr, len) = self.keystrings[idx]?;
        self.flash.read(addr, &mut out[..len as usize]);
        Some(len as usize)
    }

    /// Reads a VAR or FIXED DO's raw value into `out`, returning its
    /// length. Computed ("proc") and composite DOs go through
    /// [`read_composite`](Self::read_composite) or their own accessor.
    pub fn read_primitive(&self, tag: u16, auth: AuthMask, out: &mut [u8]) -> Result<usize> {
        let entry = get_do_entry(tag).ok_or(GnukError::ReferenceNotFound)?;
        if !auth.satisfies(entry.ac_read) {
            return Err(GnukError::SecurityStatusNotSatisfied);
        }
        match entry.kind {
            Kind::Fixed(bytes) => {
                out[..bytes.len()].copy_from_slice(bytes);
                Ok(bytes.len())
            }
            Kind::Var(slot) => match self.slots[slot] {
                None => Ok(0),
                Some((addr, len)) => {
                    self.flash.read(addr, &mut out[..len as usize]);
                    Ok(len as usize)
                }
            },
            Kind::Proc | Kind::Composite(_) => Err(GnukError::ConditionsNotSatisfied),
        }
    }

    /// Writes a TLV-encoded composite DO (one whose children each keep
    /// their own tag/length header) into `out`.
    pub fn read_composite(&self, tag: u16, auth: AuthMask, out: &mut [u8]) -> Result<usize> {
        let entry = get_do_entry(tag).ok_or(GnukError::ReferenceNotFound)?;
        if !auth.satisfies(entry.ac_read) {
            return Err(GnukError::SecurityStatusNotSatisfied);
        }
        let children = match entry.kind {
            Kind::Composite(c) => c,
            _ => return Err(GnukError::ConditionsNotSatisfied),
        };

        let mut n = 0;
        let mut value_buf = [0u8; crate::constants::MAX_DO_LEN];
        for &child_tag in children {
            let len = self.read_any(child_tag, auth, &mut value_buf)?;
            n += write_tlv(&mut out[n..], child_tag, &value_buf[..len]);
        }
        Ok(n)
    }

    /// Reads any tag's value, dispatching to the primitive or proc/computed
    /// accessors as appropriate. Used both by `openpgp_app`'s GET DATA and
    /// by [`read_composite`](Self::read_composite) for its children.
    pub fn read_any(&self, tag: u16, auth: AuthMask, out: &mut [u8]) -> Result<usize> {
        let entry = get_do_entry(tag).ok_or(GnukError::ReferenceNotFound)?;
        match entry.kind {
            Kind::Fixed(_) | Kind::Var(_) => self.read_primitive(tag, auth, out),
            Kind::Composite(_) => self.read_composite(tag, auth, out),
            Kind::Proc => self.read_proc(tag, auth, out),
        }
    }

    fn read_proc(&self, tag: u16, auth: AuthMask, out: &mut [u8]) -> Result<usize> {
        let entry = get_do_entry(tag).ok_or(GnukError::ReferenceNotFound)?;
        if !auth.satisfies(entry.ac_read) {
            return Err(GnukError::SecurityStatusNotSatisfied);
        }
        match tag {
            tag::HIST_BYTES => {
                out[..crate::constants::HISTORICAL_BYTES.len()]
                    .copy_from_slice(&crate::constants::HISTORICAL_BYTES);
                Ok(crate::constants::HISTORICAL_BYTES.len())
            }
            tag::FP_ALL => self.concat_slots(&[SLOT_FP_SIG, SLOT_FP_DEC, SLOT_FP_AUT], out),
            tag::CAFP_ALL => self.concat_slots(&[SLOT_CAFP_1, SLOT_CAFP_2, SLOT_CAFP_3], out),
            tag::KGTIME_ALL => self.concat_slots(&[SLOT_KGTIME_SIG, SLOT_KGTIME_DEC, SLOT_KGTIME_AUT], out),
            tag::DS_COUNT => {
                let b = self.ds_counter.to_be_bytes();
                out[0] = b[1];
                out[1] = b[2];
                out[2] = b[3];
                Ok(3)
            }
            tag::AID => {
                out[..6].copy_from_slice(&crate::constants::OPENPGP_AID_RID);
                out[6] = 0;
                out[7] = 0;
                out[8] = 0;
                out[9] = 0;
                out[10] = 0;
                Ok(11)
            }
            tag::PW_STATUS => {
                out[0] = if self.pw1_lifetime.is_some() { 1 } else { 0 };
                out[1] = crate::constants::PW1_MIN_LEN as u8;
                out[2] = crate::constants::PW1_MIN_LEN as u8;
                out[3] = crate::constants::PW3_MIN_LEN as u8;
                out[4] = PASSWORD_ERRORS_MAX - self.counter_errors(Counter::Pw1);
                out[5] = PASSWORD_ERRORS_MAX - self.counter_errors(Counter::Rc);
                out[6] = PASSWORD_ERRORS_MAX - self.counter_errors(Counter::Pw3);
                Ok(7)
            }
            _ => Err(GnukError::ReferenceNotFound),
        }
    }

    fn concat_slots(&self, slots: &[usize], out: &mut [u8]) -> Result<usize> {
        let mut n = 0;
        for &slot in slots {
            match self.slots[slot] {
                Some((addr, len)) => {
                    self.flash.read(addr, &mut out[n..n + len as usize]);
                    n += len as usize;
                }
                None => n += 20,
            }
        }
        Ok(n)
    }

    /// Writes a VAR DO's value, releasing the previous record (if any)
    /// once the new one is safely written, the same ordering
    /// `flash_do_write`/`flash_do_release` use to stay crash-consistent.
    pub fn write_var(&mut self, tag: u16, auth: AuthMask, data: &[u8]) -> Result<()> {
        let entry = get_do_entry(tag).ok_or(GnukError::ReferenceNotFound)?;
        if !auth.satisfies(entry.ac_write) {
            return Err(GnukError::SecurityStatusNotSatisfied);
        }
        let slot = match entry.kind {
            Kind::Var(slot) => slot,
            _ => return Err(GnukError::ConditionsNotSatisfied),
        };
        if data.len() > crate::constants::MAX_DO_LEN {
            return Err(GnukError::WrongLength);
        }

        let nr = Self::nr_for_slot(slot);
        let new_addr = self.put_with_gc(nr, data)?;
        if let Some((old_addr, old_len)) = self.slots[slot] {
            self.flash.release(old_addr, old_len as usize)?;
        }
        self.slots[slot] = Some((new_addr, data.len() as u8));
        Ok(())
    }

    /// Sets or clears the PW1-lifetime flag (whether a verified PW1 stays
    /// valid across multiple PSO:CDS operations).
    pub fn set_pw1_lifetime(&mut self, persistent: bool) -> Result<()> {
        if persistent {
            if self.pw1_lifetime.is_none() {
                let addr = self.put_with_gc(NR_PW1_LIFETIME, &[])?;
                self.pw1_lifetime = Some(addr);
            }
        } else if let Some(addr) = self.pw1_lifetime.take() {
            self.flash.release(addr, 0)?;
        }
        Ok(())
    }

    pub fn pw1_lifetime(&self) -> bool {
        self.pw1_lifetime.is_some()
    }

    fn counter_errors(&self, which: Counter) -> u8 {
        let idx = counter_index(which);
        match self.counters[idx] {
            None => 0,
            Some((_, raw)) => crate::flash_store::cnt123_decode(Some(raw)),
        }
    }

    /// True once `which` has failed `PASSWORD_ERRORS_MAX` times.
    pub fn counter_locked(&self, which: Counter) -> bool {
        self.counter_errors(which) >= PASSWORD_ERRORS_MAX
    }

    pub fn retries_left(&self, which: Counter) -> u8 {
        PASSWORD_ERRORS_MAX - self.counter_errors(which)
    }

    /// Records one more failed attempt, allocating the counter's record on
    /// first use.
    pub fn increment_error(&mut self, which: Counter) -> Result<()> {
        let idx = counter_index(which);
        let nr = counter_nr(which);
        match self.counters[idx] {
            None => {
                let addr = self.put_with_gc(nr, &[0xff])?;
                self.counters[idx] = Some((addr, 0xff));
            }
            Some((old_addr, raw)) => {
                let v = crate::flash_store::cnt123_decode(Some(raw));
                if v >= PASSWORD_ERRORS_MAX {
                    return Ok(());
                }
                let next_raw = if v == 1 { 0xc3 } else { 0x00 };
                self.flash.release(old_addr, 1)?;
                let addr = self.put_with_gc(nr, &[next_raw])?;
                self.counters[idx] = Some((addr, next_raw));
            }
        }
        Ok(())
    }

    /// Resets `which` back to zero failures (a successful VERIFY, or an
    /// administrative unblock).
    pub fn reset_error(&mut self, which: Counter) -> Result<()> {
        let idx = counter_index(which);
        if let Some((addr, _)) = self.counters[idx].take() {
            self.flash.release(addr, 1)?;
        }
        Ok(())
    }

    pub fn digital_signature_counter(&self) -> u32 {
        self.ds_counter
    }

    /// Bumps the signature counter and, unless PW1 is in "lifetime" mode,
    /// signals that the caller's PSO:CDS authorization should be dropped
    /// (handled by `ac`, which owns that state).
    pub fn increment_signature_counter(&mut self) -> Result<()> {
        let next = (self.ds_counter + 1) & 0x00ff_ffff;
        let bytes = next.to_be_bytes();
        if let Some(old) = self.ds_counter_addr.take() {
            self.flash.release(old, 3)?;
        }
        let addr = self.put_with_gc(NR_DS_COUNTER, &bytes[1..])?;
        self.ds_counter_addr = Some(addr);
        self.ds_counter = next;
        Ok(())
    }

    pub fn reset_signature_counter(&mut self) -> Result<()> {
        if let Some(old) = self.ds_counter_addr.take() {
            self.flash.release(old, 3)?;
        }
        self.ds_counter = 0;
        Ok(())
    }
}

fn counter_index(which: Counter) -> usize {
    match which {
        Counter::Pw1 => 0,
        Counter::Rc => 1,
        Counter::Pw3 => 2,
    }
}

fn counter_nr(which: Counter) -> u8 {
    match which {
        Counter::Pw1 => NR_COUNTER_PW1,
        Counter::Rc => NR_COUNTER_RC,
        Counter::Pw3 => NR_COUNTER_PW3,
    }
}

/// BER-TLV-encodes `tag`/`value` into `out`, returning the number of bytes
/// written. Tags above `0xff` take two bytes; lengths of 128 or more use
/// the `0x81 len` long form (never reached in practice since
/// `MAX_DO_LEN` is 255 and the long form only needs a second byte).
fn write_tlv(out: &mut [u8], tag: u16, value: &[u8]) -> usize {
    let mut n = 0;
    if tag > 0xff {
        out[n] = (tag >> 8) as u8;
        out[n + 1] = tag as u8;
        n += 2;
    } else {
        out[n] = tag as u8;
        n += 1;
    }
    if value.len() >= 128 {
        out[n] = 0x81;
        out[n + 1] = value.len() as u8;
        n += 2;
    } else {
        out[n] = value.len() as u8;
        n += 1;
    }
    out[n..n + value.len()].copy_from_slice(value);
    n + value.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash_store::FlashStore;
    use std::cell::RefCell;
    use std::vec::Vec;

    struct FakeFlash {
        mem: RefCell<Vec<u8>>,
        page_size: usize,
    }

    impl FakeFlash {
        fn new(pages: usize, page_size: usize) -> Self {
            FakeFlash { mem: RefCell::new(std::vec![0xffu8; pages * page_size]), page_size }
        }
    }

    impl FlashInterface for FakeFlash {
        fn page_size(&self) -> usize {
            self.page_size
        }
        fn hal_flash_read(&self, addr: usize, out: &mut [u8]) {
            out.copy_from_slice(&self.mem.borrow()[addr..addr + out.len()]);
        }
        fn hal_flash_write(&mut self, addr: usize, data: &[u8]) -> core::result::Result<(), gnuk_hal::FlashError> {
            let mut mem = self.mem.borrow_mut();
            for (i, b) in data.iter().enumerate() {
                let cur = mem[addr + i];
                if b & !cur != 0 {
                    return Err(gnuk_hal::FlashError);
                }
                mem[addr + i] = cur & b;
            }
            Ok(())
        }
        fn hal_flash_erase_page(&mut self, addr: usize) -> core::result::Result<(), gnuk_hal::FlashError> {
            let mut mem = self.mem.borrow_mut();
            let start = (addr / self.page_size) * self.page_size;
            for b in &mut mem[start..start + self.page_size] {
                *b = 0xff;
            }
            Ok(())
        }
    }

    fn mounted() -> DoStore<FakeFlash> {
        let flash = FakeFlash::new(2, 512);
        let fs = FlashStore::mount(flash, 0).unwrap();
        DoStore::mount(fs)
    }

    #[test]
    fn write_then_read_var_do_round_trips() {
        let mut store = mounted();
        let admin = AuthMask { admin: true, ..Default::default() };
        store.write_var(tag::NAME, admin, b"Alice").unwrap();

        let mut out = [0u8; 32];
        let n = store.read_primitive(tag::NAME, AuthMask::default(), &mut out).unwrap();
        assert_eq!(&out[..n], b"Alice");
    }

    #[test]
    fn write_without_admin_is_rejected() {
        let mut store = mounted();
        let err = store.write_var(tag::NAME, AuthMask::default(), b"Eve").unwrap_err();
        assert_eq!(err, GnukError::SecurityStatusNotSatisfied);
    }

    #[test]
    fn signature_counter_increments_monotonically() {
        let mut store = mounted();
        assert_eq!(store.digital_signature_counter(), 0);
        store.increment_signature_counter().unwrap();
        store.increment_signature_counter().unwrap();
        assert_eq!(store.digital_signature_counter(), 2);
    }

    #[test]
    fn pin_error_counter_locks_after_three() {
        let mut store = mounted();
        assert!(!store.counter_locked(Counter::Pw1));
        store.increment_error(Counter::Pw1).unwrap();
        store.increment_error(Counter::Pw1).unwrap();
        store.increment_error(Counter::Pw1).unwrap();
        assert!(store.counter_locked(Counter::Pw1));
        assert_eq!(store.retries_left(Counter::Pw1), 0);
    }

    #[test]
    fn reset_error_unlocks_counter() {
        let mut store = mounted();
        for _ in 0..3 {
            store.increment_error(Counter::Rc).unwrap();
        }
        assert!(store.counter_locked(Counter::Rc));
        store.reset_error(Counter::Rc).unwrap();
        assert!(!store.counter_locked(Counter::Rc));
    }

    #[test]
    fn composite_app_data_concatenates_children_with_tlv_headers() {
        let store = mounted();
        let mut out = [0u8; 64];
        let n = store.read_composite(tag::APP_DATA, AuthMask::default(), &mut out).unwrap();
        // First child is GPG_DO_AID (1-byte tag 0x4f out of range >0xff so
        // 2-byte tag, length 11).
        assert_eq!(out[0], 0x00);
        assert_eq!(out[1], 0x4f);
        assert_eq!(out[2], 11);
        assert!(n > 3);
    }
}
