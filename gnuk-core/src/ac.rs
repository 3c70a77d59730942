//! Access-control state: the three authorization flags (PSO-CDS, OTHER,
//! ADMIN), PIN hashing, PIN verification/change/reset, and the DEK ladder
//! that gates actual key use.
//!
//! Grounded on `ac.c`: plain SHA-1 keystrings for PW1/RC (`len || sha1(pw)`)
//! and a salted, iterated S2K keystring for PW3 (`salt(8) || iter(1) ||
//! md(20)`) via `decode_iterate_count`/`calc_md`, copied from that file
//! almost verbatim. Unlike `ac.c`, which verifies PW1 by attempting to
//! decrypt the signing or decryption key's wrapped DEK directly, this
//! module verifies against the stored keystring hash and only touches the
//! DEK ladder at [`unlock_key`](AccessControl::unlock_key) — the point
//! where a key is actually about to be used — and at
//! [`change_pw1`](AccessControl::change_pw1) / PW3 change / retry-counter
//! reset, which re-wrap every role's DEK under the freshly stored hash
//! (`SPEC_FULL.md` §3).

use sha1::{Digest, Sha1};

use gnuk_hal::FlashInterface;

use crate::constants::{DEK_LEN, IV_LEN, PW1_ADMINLESS_MIN_LEN, PW1_MIN_LEN, PW3_DEFAULT, PW3_MIN_LEN, S2K_COUNT};
use crate::do_store::{AuthMask, Counter, DoStore, Keystring};
use crate::keystore::{self, KeyRole, KeySlots};
use crate::{GnukError, Result};

const KEYSTRING_MD_LEN: usize = 20;
const SALT_LEN: usize = 8;
const PW1_KEYSTRING_LEN: usize = 1 + KEYSTRING_MD_LEN;
const PW3_KEYSTRING_LEN: usize = 1 + SALT_LEN + 1 + KEYSTRING_MD_LEN;

/// Which PW1 authorization a VERIFY or PSO targets. Both map to the same
/// stored keystring and the same DEK-ladder authorizer; they only differ
/// in which [`AuthMask`] bit gets set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pw1Kind {
    Cds,
    Other,
}

/// Which of the card's three PIN entities wraps a key's DEK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorizer {
    Pw1,
    Rc,
    Pw3,
}

fn authorizer_index(a: Authorizer) -> usize {
    match a {
        Authorizer::Pw1 => 0,
        Authorizer::Rc => 1,
        Authorizer::Pw3 => 2,
    }
}

fn sha1_keystring(pw: &[u8]) -> [u8; PW1_KEYSTRING_LEN] {
    let mut out = [0u8; PW1_KEYSTRING_LEN];
    out[0] = pw.len() as u8;
    out[1..].copy_from_slice(&Sha1::digest(pw));
    out
}

/// `(16 + (x & 15)) << ((x >> 4) + 6)`, RFC 4880's S2K iteration-count
/// decoding, copied verbatim from `ac.c`'s `decode_iterate_count`.
fn decode_iterate_count(x: u8) -> u32 {
    (16 + (x as u32 & 15)) << ((x as u32 >> 4) + 6)
}

/// Smallest one-byte encoding whose decoded count is at least `count`.
fn encode_iterate_count(count: u32) -> u8 {
    for x in 0..=255u8 {
        if decode_iterate_count(x) >= count {
            return x;
        }
    }
    0xff
}

/// Iterated SHA-1 over `salt || pw` repeated to fill `count` bytes total,
/// matching `ac.c`'s `calc_md` exactly.
fn calc_md(count: u32, salt: &[u8; SALT_LEN], pw: &[u8]) -> [u8; KEYSTRING_MD_LEN] {
    let mut hasher = Sha1::new();
    let mut remaining = count;
    let block = pw.len() as u32 + SALT_LEN as u32;
    while remaining > block {
        hasher.update(salt);
        hasher.update(pw);
        remaining -= block;
    }
    if remaining < SALT_LEN as u32 {
        hasher.update(&salt[..remaining as usize]);
    } else {
        hasher.update(salt);
        remaining -= SALT_LEN as u32;
        hasher.update(&pw[..remaining as usize]);
    }
    let mut out = [0u8; KEYSTRING_MD_LEN];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn build_pw3_keystring(pw: &[u8], salt: [u8; SALT_LEN], iter_byte: u8) -> [u8; PW3_KEYSTRING_LEN] {
    let count = decode_iterate_count(iter_byte);
    let md = calc_md(count, &salt, pw);
    let mut out = [0u8; PW3_KEYSTRING_LEN];
    out[0] = pw.len() as u8;
    out[1..1 + SALT_LEN].copy_from_slice(&salt);
    out[1 + SALT_LEN] = iter_byte;
    out[2 + SALT_LEN..].copy_from_slice(&md);
    out
}

fn md_for_pw1<F: FlashInterface>(do_store: &DoStore<F>) -> [u8; KEYSTRING_MD_LEN] {
    let mut buf = [0u8; PW1_KEYSTRING_LEN];
    let mut out = [0u8; KEYSTRING_MD_LEN];
    match do_store.read_keystring(Keystring::Pw1, &mut buf) {
        Some(_) => out.copy_from_slice(&buf[1..]),
        None => out.copy_from_slice(&sha1_keystring(b"123456")[1..]),
    }
    out
}

/// Resetting code with no keystring yet set wraps under an all-zero key:
/// a harmless placeholder since resetting-code-based retry-counter reset
/// is unreachable until a resetting code has actually been stored.
fn md_for_rc<F: FlashInterface>(do_store: &DoStore<F>) -> [u8; KEYSTRING_MD_LEN] {
    let mut buf = [0u8; PW1_KEYSTRING_LEN];
    let mut out = [0u8; KEYSTRING_MD_LEN];
    if do_store.read_keystring(Keystring::Rc, &mut buf).is_some() {
        out.copy_from_slice(&buf[1..]);
    }
    out
}

fn md_for_pw3<F: FlashInterface>(do_store: &DoStore<F>) -> [u8; KEYSTRING_MD_LEN] {
    let mut buf = [0u8; PW3_KEYSTRING_LEN];
    let mut out = [0u8; KEYSTRING_MD_LEN];
    match do_store.read_keystring(Keystring::Pw3, &mut buf) {
        Some(_) => out.copy_from_slice(&buf[2 + SALT_LEN..]),
        None => out.copy_from_slice(&sha1_keystring(PW3_DEFAULT)[1..]),
    }
    out
}

fn wrap_key_from_md(md: &[u8; KEYSTRING_MD_LEN]) -> [u8; DEK_LEN] {
    let mut k = [0u8; DEK_LEN];
    k.copy_from_slice(&md[..DEK_LEN]);
    k
}

/// The process-wide authorization bitfield plus the PIN-check and
/// DEK-ladder operations that use it. Reset on power-off (a fresh
/// [`AccessControl::new`]) and on SELECT FILE(MF) / PIN change
/// (`SPEC_FULL.md` §3, "Flag reset rules").
pub struct AccessControl {
    status: AuthMask,
}

impl AccessControl {
    pub fn new() -> Self {
        AccessControl { status: AuthMask::default() }
    }

    pub fn status(&self) -> AuthMask {
        self.status
    }

    pub fn deauthorize_all(&mut self) {
        self.status = AuthMask::default();
    }

    pub fn ac_reset_pso_cds(&mut self) {
        self.status.cds = false;
    }

    /// Called after a successful COMPUTE DIGITAL SIGNATURE: drops the
    /// PSO-CDS flag unless PW1 is in "lifetime" mode.
    pub fn on_signature_made<F: FlashInterface>(&mut self, do_store: &DoStore<F>) {
        if !do_store.pw1_lifetime() {
            self.status.cds = false;
        }
    }

    fn check_pw1<F: FlashInterface>(do_store: &mut DoStore<F>, candidate: &[u8]) -> Result<()> {
        if do_store.counter_locked(Counter::Pw1) {
            return Err(GnukError::AuthBlocked);
        }
        let expected = sha1_keystring(candidate);
        let mut buf = [0u8; PW1_KEYSTRING_LEN];
        let ok = match do_store.read_keystring(Keystring::Pw1, &mut buf) {
            Some(len) => len == PW1_KEYSTRING_LEN && buf == expected,
            None => candidate == b"123456",
        };
        if ok {
            do_store.reset_error(Counter::Pw1)?;
            Ok(())
        } else {
            do_store.increment_error(Counter::Pw1)?;
            if do_store.counter_locked(Counter::Pw1) {
                Err(GnukError::AuthBlocked)
            } else {
                Err(GnukError::PinFailed { remaining: do_store.retries_left(Counter::Pw1) })
            }
        }
    }

    fn check_rc<F: FlashInterface>(do_store: &mut DoStore<F>, candidate: &[u8]) -> Result<()> {
        if do_store.counter_locked(Counter::Rc) {
            return Err(GnukError::AuthBlocked);
        }
        let mut buf = [0u8; PW1_KEYSTRING_LEN];
        let stored_len = do_store.read_keystring(Keystring::Rc, &mut buf).ok_or(GnukError::ConditionsNotSatisfied)?;
        let expected = sha1_keystring(candidate);
        let ok = stored_len == PW1_KEYSTRING_LEN && buf == expected;
        if ok {
            do_store.reset_error(Counter::Rc)?;
            Ok(())
        } else {
            do_store.increment_error(Counter::Rc)?;
            if do_store.counter_locked(Counter::Rc) {
                Err(GnukError::AuthBlocked)
            } else {
                Err(GnukError::PinFailed { remaining: do_store.retries_left(Counter::Rc) })
            }
        }
    }

    fn check_pw3<F: FlashInterface>(do_store: &mut DoStore<F>, candidate: &[u8]) -> Result<()> {
        if do_store.counter_locked(Counter::Pw3) {
            return Err(GnukError::AuthBlocked);
        }
        let mut buf = [0u8; PW3_KEYSTRING_LEN];
        let ok = match do_store.read_keystring(Keystring::Pw3, &mut buf) {
            Some(len) if len == PW3_KEYSTRING_LEN => {
                let pw_len = buf[0] as usize;
                if pw_len != candidate.len() {
                    false
                } else {
                    let mut salt = [0u8; SALT_LEN];
                    salt.copy_from_slice(&buf[1..1 + SALT_LEN]);
                    let count = decode_iterate_count(buf[1 + SALT_LEN]);
                    let md = calc_md(count, &salt, candidate);
                    md[..] == buf[2 + SALT_LEN..]
                }
            }
            Some(_) => false,
            None => candidate == PW3_DEFAULT,
        };
        if ok {
            do_store.reset_error(Counter::Pw3)?;
            Ok(())
        } else {
            do_store.increment_error(Counter::Pw3)?;
            if do_store.counter_locked(Counter::Pw3) {
                Err(GnukError::AuthBlocked)
            } else {
                Err(GnukError::PinFailed { remaining: do_store.retries_left(Counter::Pw3) })
            }
        }
    }

    /// `00 20 00 81/82` VERIFY.
    pub fn verify_pw1<F: FlashInterface>(&mut self, do_store: &mut DoStore<F>, kind: Pw1Kind, candidate: &[u8]) -> Result<()> {
        Self::check_pw1(do_store, candidate)?;
        match kind {
            Pw1Kind::Cds => self.status.cds = true,
            Pw1Kind::Other => self.status.other = true,
        }
        Ok(())
    }

    /// `00 20 00 83` VERIFY.
    pub fn verify_pw3<F: FlashInterface>(&mut self, do_store: &mut DoStore<F>, candidate: &[u8]) -> Result<()> {
        Self::check_pw3(do_store, candidate)?;
        self.status.admin = true;
        Ok(())
    }

    /// Re-wraps every occupied key role's DEK for `authorizer`, from
    /// `old_md` to `new_md`. Called right after a keystring is replaced;
    /// the wrap key is always derived from whichever md is currently
    /// stored, so "old" and "new" here just bracket the write.
    fn rewrap_all_roles<F: FlashInterface>(
        key_slots: &mut KeySlots<F>,
        authorizer: Authorizer,
        old_md: &[u8; KEYSTRING_MD_LEN],
        new_md: &[u8; KEYSTRING_MD_LEN],
    ) -> Result<()> {
        let old_key = wrap_key_from_md(old_md);
        let new_key = wrap_key_from_md(new_md);
        let idx = authorizer_index(authorizer);
        for role in [KeyRole::Sig, KeyRole::Dec, KeyRole::Aut] {
            if let Some(old_idx) = key_slots.find_occupied(role) {
                let mut meta = key_slots.read_meta(role, old_idx);
                let mut body = [0u8; keystore::MAX_KEY_BODY_LEN];
                let len = key_slots.read_body(role, old_idx, &mut body);
                let dek = keystore::unwrap_dek(&old_key, &meta.iv, &meta.wrapped_dek[idx]);
                meta.wrapped_dek[idx] = keystore::wrap_dek(&new_key, &meta.iv, &dek);
                let new_idx = key_slots.allocate(role)?;
                key_slots.write(role, new_idx, &meta, &body[..len])?;
                key_slots.release(role, old_idx)?;
            }
        }
        Ok(())
    }

    /// `00 24 00 00` CHANGE REFERENCE DATA for PW1.
    pub fn change_pw1<F: FlashInterface>(
        &mut self,
        do_store: &mut DoStore<F>,
        key_slots: &mut KeySlots<F>,
        old: &[u8],
        new: &[u8],
    ) -> Result<()> {
        Self::check_pw1(do_store, old)?;
        let admin_less = {
            let mut buf = [0u8; PW3_KEYSTRING_LEN];
            do_store.read_keystring(Keystring::Pw3, &mut buf).is_none()
        };
        if admin_less && new.len() < PW1_ADMINLESS_MIN_LEN {
            return Err(GnukError::ConditionsNotSatisfied);
        }
        if new.len() < PW1_MIN_LEN {
            return Err(GnukError::WrongLength);
        }
        let old_md = md_for_pw1(do_store);
        do_store.write_keystring(Keystring::Pw1, &sha1_keystring(new))?;
        let new_md = md_for_pw1(do_store);
        Self::rewrap_all_roles(key_slots, Authorizer::Pw1, &old_md, &new_md)?;
        self.deauthorize_all();
        Ok(())
    }

    /// `00 24 00 83` CHANGE REFERENCE DATA for PW3.
    pub fn change_pw3<F: FlashInterface>(
        &mut self,
        do_store: &mut DoStore<F>,
        key_slots: &mut KeySlots<F>,
        old: &[u8],
        new: &[u8],
        salt: [u8; SALT_LEN],
    ) -> Result<()> {
        Self::check_pw3(do_store, old)?;
        if new.len() < PW3_MIN_LEN {
            return Err(GnukError::WrongLength);
        }
        let old_md = md_for_pw3(do_store);
        let ks = build_pw3_keystring(new, salt, encode_iterate_count(S2K_COUNT));
        do_store.write_keystring(Keystring::Pw3, &ks)?;
        let new_md = md_for_pw3(do_store);
        Self::rewrap_all_roles(key_slots, Authorizer::Pw3, &old_md, &new_md)?;
        self.deauthorize_all();
        Ok(())
    }

    /// `00 2C 00 00` RESET RETRY COUNTER by resetting code.
    pub fn reset_retry_counter_by_rc<F: FlashInterface>(
        &mut self,
        do_store: &mut DoStore<F>,
        key_slots: &mut KeySlots<F>,
        rc: &[u8],
        new_pw1: &[u8],
    ) -> Result<()> {
        Self::check_rc(do_store, rc)?;
        self.finish_pw1_reset(do_store, key_slots, new_pw1)
    }

    /// `00 2C 02 00` RESET RETRY COUNTER by admin (requires PW3 already
    /// verified this session).
    pub fn reset_retry_counter_by_admin<F: FlashInterface>(
        &mut self,
        do_store: &mut DoStore<F>,
        key_slots: &mut KeySlots<F>,
        new_pw1: &[u8],
    ) -> Result<()> {
        if !self.status.admin {
            return Err(GnukError::SecurityStatusNotSatisfied);
        }
        self.finish_pw1_reset(do_store, key_slots, new_pw1)
    }

    fn finish_pw1_reset<F: FlashInterface>(
        &mut self,
        do_store: &mut DoStore<F>,
        key_slots: &mut KeySlots<F>,
        new_pw1: &[u8],
    ) -> Result<()> {
        if new_pw1.len() < PW1_MIN_LEN {
            return Err(GnukError::WrongLength);
        }
        let old_md = md_for_pw1(do_store);
        do_store.write_keystring(Keystring::Pw1, &sha1_keystring(new_pw1))?;
        do_store.reset_error(Counter::Pw1)?;
        let new_md = md_for_pw1(do_store);
        Self::rewrap_all_roles(key_slots, Authorizer::Pw1, &old_md, &new_md)
    }

    /// Sets the resetting code for the first time, or replaces it
    /// (requires admin). Passing an empty `rc` clears it, matching the
    /// original's "empty keystring means unset" convention.
    pub fn set_resetting_code<F: FlashInterface>(
        &mut self,
        do_store: &mut DoStore<F>,
        key_slots: &mut KeySlots<F>,
        rc: &[u8],
    ) -> Result<()> {
        if !self.status.admin {
            return Err(GnukError::SecurityStatusNotSatisfied);
        }
        let old_md = md_for_rc(do_store);
        if rc.is_empty() {
            do_store.write_keystring(Keystring::Rc, &[])?;
        } else {
            do_store.write_keystring(Keystring::Rc, &sha1_keystring(rc))?;
        }
        do_store.reset_error(Counter::Rc)?;
        let new_md = md_for_rc(do_store);
        Self::rewrap_all_roles(key_slots, Authorizer::Rc, &old_md, &new_md)
    }

    /// Imports or replaces `role`'s private key: encrypts `plaintext_body`
    /// under a fresh caller-supplied DEK/IV and wraps that DEK under all
    /// three current authorizers. `dek`/`iv` come from `rng` since `ac`
    /// doesn't own a noise source itself.
    pub fn import_key<F: FlashInterface>(
        do_store: &DoStore<F>,
        key_slots: &mut KeySlots<F>,
        role: KeyRole,
        dek: [u8; DEK_LEN],
        iv: [u8; IV_LEN],
        plaintext_body: &[u8],
    ) -> Result<()> {
        if plaintext_body.len() > keystore::MAX_KEY_BODY_LEN {
            return Err(GnukError::WrongLength);
        }
        if let Some(old_idx) = key_slots.find_occupied(role) {
            key_slots.release(role, old_idx)?;
        }

        let mut body = [0u8; keystore::MAX_KEY_BODY_LEN];
        body[..plaintext_body.len()].copy_from_slice(plaintext_body);
        keystore::cfb_encrypt(&dek, &iv, &mut body[..plaintext_body.len()]);

        let meta = keystore::KeyMeta {
            iv,
            encrypted_checksum: keystore::make_checksum(&dek, &iv),
            wrapped_dek: [
                keystore::wrap_dek(&wrap_key_from_md(&md_for_pw1(do_store)), &iv, &dek),
                keystore::wrap_dek(&wrap_key_from_md(&md_for_rc(do_store)), &iv, &dek),
                keystore::wrap_dek(&wrap_key_from_md(&md_for_pw3(do_store)), &iv, &dek),
            ],
            body_len: plaintext_body.len() as u16,
        };
        let idx = key_slots.allocate(role)?;
        key_slots.write(role, idx, &meta, &body[..plaintext_body.len()])
    }

    /// Decrypts `role`'s private key body into `out`, gated on `authorizer`
    /// already having a satisfied flag in `self.status`. This is the
    /// DEK-ladder boundary `openpgp_app` calls through before handing key
    /// material to a `CryptoProvider`.
    pub fn unlock_key<F: FlashInterface>(
        &self,
        do_store: &DoStore<F>,
        key_slots: &KeySlots<F>,
        role: KeyRole,
        authorizer: Authorizer,
        out: &mut [u8],
    ) -> Result<usize> {
        let satisfied = match authorizer {
            Authorizer::Pw1 => self.status.cds || self.status.other,
            Authorizer::Rc => false,
            Authorizer::Pw3 => self.status.admin,
        };
        if !satisfied {
            return Err(GnukError::SecurityStatusNotSatisfied);
        }
        let idx = key_slots.find_occupied(role).ok_or(GnukError::ReferenceNotFound)?;
        let meta = key_slots.read_meta(role, idx);
        let md = match authorizer {
            Authorizer::Pw1 => md_for_pw1(do_store),
            Authorizer::Rc => md_for_rc(do_store),
            Authorizer::Pw3 => md_for_pw3(do_store),
        };
        let wrap_key = wrap_key_from_md(&md);
        let dek = keystore::unwrap_dek(&wrap_key, &meta.iv, &meta.wrapped_dek[authorizer_index(authorizer)]);
        if !keystore::checksum_matches(&dek, &meta.iv, &meta.encrypted_checksum) {
            return Err(GnukError::SecurityStatusNotSatisfied);
        }
        let len = key_slots.read_body(role, idx, out);
        keystore::cfb_decrypt(&dek, &meta.iv, &mut out[..len]);
        Ok(len)
    }
}

impl Default for AccessControl {
    fn default() -> Self {
        Self::new()
    }
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

    fn mounted() -> (DoStore<FakeFlash>, KeySlots<FakeFlash>) {
        let do_flash = FakeFlash::new(2, 512);
        let fs = FlashStore::mount(do_flash, 0).unwrap();
        let do_store = DoStore::mount(fs);
        let key_flash = FakeFlash::new(3, 1024);
        let key_slots = KeySlots::mount(key_flash, 0);
        (do_store, key_slots)
    }

    #[test]
    fn decode_iterate_count_matches_reference_values() {
        assert_eq!(decode_iterate_count(0x60), 65536);
        assert_eq!(decode_iterate_count(0x00), 1024);
    }

    #[test]
    fn default_pw1_verifies_with_factory_pin() {
        let (mut do_store, _ks) = mounted();
        let mut ac = AccessControl::new();
        ac.verify_pw1(&mut do_store, Pw1Kind::Cds, b"123456").unwrap();
        assert!(ac.status().cds);
    }

    #[test]
    fn wrong_pw1_locks_after_three_failures() {
        let (mut do_store, _ks) = mounted();
        let mut ac = AccessControl::new();
        for i in 0..3 {
            let err = ac.verify_pw1(&mut do_store, Pw1Kind::Other, b"wrongpin").unwrap_err();
            if i < 2 {
                assert!(matches!(err, GnukError::PinFailed { .. }));
            } else {
                assert_eq!(err, GnukError::AuthBlocked);
            }
        }
        assert!(do_store.counter_locked(Counter::Pw1));
    }

    #[test]
    fn default_pw3_verifies_and_sets_admin() {
        let (mut do_store, _ks) = mounted();
        let mut ac = AccessControl::new();
        ac.verify_pw3(&mut do_store, b"12345678").unwrap();
        assert!(ac.status().admin);
    }

    #[test]
    fn change_pw1_then_old_pin_no_longer_verifies() {
        let (mut do_store, mut ks) = mounted();
        let mut ac = AccessControl::new();
        ac.change_pw1(&mut do_store, &mut ks, b"123456", b"newpin1").unwrap();
        assert!(ac.verify_pw1(&mut do_store, Pw1Kind::Other, b"123456").is_err());
        assert!(!ac.status().other);
        ac.verify_pw1(&mut do_store, Pw1Kind::Other, b"newpin1").unwrap();
        assert!(ac.status().other);
    }

    #[test]
    fn import_then_unlock_round_trips_key_body() {
        let (do_store, mut ks) = mounted();
        let mut ac = AccessControl::new();
        let dek = [0x42; DEK_LEN];
        let iv = [0x24; IV_LEN];
        let body = [0xaa; 200];
        AccessControl::import_key(&do_store, &mut ks, KeyRole::Sig, dek, iv, &body).unwrap();

        ac.status.cds = true;

        let mut out = [0u8; keystore::MAX_KEY_BODY_LEN];
        let len = ac.unlock_key(&do_store, &ks, KeyRole::Sig, Authorizer::Pw1, &mut out).unwrap();
        assert_eq!(&out[..len], &body[..]);
    }

    #[test]
    fn unlock_without_authorization_is_rejected() {
        let (do_store, mut ks) = mounted();
        let ac = AccessControl::new();
        AccessControl::import_key(&do_store, &mut ks, KeyRole::Dec, [1; DEK_LEN], [2; IV_LEN], &[0xbb; 50]).unwrap();
        let mut out = [0u8; keystore::MAX_KEY_BODY_LEN];
        let err = ac.unlock_key(&do_store, &ks, KeyRole::Dec, Authorizer::Pw1, &mut out).unwrap_err();
        assert_eq!(err, GnukError::SecurityStatusNotSatisfied);
    }

    #[test]
    fn reset_retry_counter_by_rc_unlocks_and_sets_new_pw1() {
        let (mut do_store, mut ks) = mounted();
        let mut ac = AccessControl::new();
        ac.status.admin = true;
        ac.set_resetting_code(&mut do_store, &mut ks, b"rescueme").unwrap();
        ac.deauthorize_all();

        for _ in 0..3 {
            ac.verify_pw1(&mut do_store, Pw1Kind::Cds, b"wrong!!!").ok();
        }
        assert!(do_store.counter_locked(Counter::Pw1));

        ac.reset_retry_counter_by_rc(&mut do_store, &mut ks, b"rescueme", b"freshpin").unwrap();
        assert!(!do_store.counter_locked(Counter::Pw1));
        ac.verify_pw1(&mut do_store, Pw1Kind::Cds, b"freshpin").unwrap();
    }
}
