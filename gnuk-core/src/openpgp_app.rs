//! OpenPGP card instruction dispatch: turns one reassembled command APDU
//! into a response, wiring [`crate::ac`]'s access control, [`crate::do_store`]'s
//! Data Object tree and [`crate::keystore`]'s encrypted key slots together.
//!
//! Grounded on `openpgp.c`'s `cmds[]` table and its `cmd_*` handlers. RSA-2048
//! is the only key algorithm `do_store`'s `ALG_SIG`/`ALG_DEC`/`ALG_AUT`
//! entries advertise, so unlike the original (which also handles ECDSA,
//! X25519 and Ed25519 key attributes) every signing/deciphering path here
//! only ever builds a [`gnuk_hal::RsaPrivateComponents`].
//!
//! `READ BINARY`/`WRITE BINARY`/`UPDATE BINARY` and `EXTERNAL AUTHENTICATE`
//! are carried too, despite `openpgp.c` marking their dispatch-table entries
//! "Not in OpenPGP card protocol": the first three serve the serial-number,
//! firmware-update-key and cardholder-certificate EFs, and the last is the
//! firmware-update challenge/response check (`cmd_external_authenticate`).
//! Only the post-verification jump into the separate reGNUal bootloader
//! image is out of scope here — this crate models card state, not an MCU
//! reset vector.

use gnuk_hal::{CryptoError, CryptoProvider, FlashInterface, NoiseSource, RsaPrivateComponents};

use crate::ac::{AccessControl, Authorizer, Pw1Kind};
use crate::constants::{
    CHALLENGE_LEN, MAX_RSA_DIGEST_INFO_LEN, MD5_DIGESTINFO_LEN, NUM_UPDATE_KEYS, OPENPGP_AID_RID, PW1_ADMINLESS_MIN_LEN,
    PW3_DEFAULT, SHA1_DIGESTINFO_LEN, SHA224_DIGESTINFO_LEN, SHA256_DIGESTINFO_LEN, SHA384_DIGESTINFO_LEN,
    SHA512_DIGESTINFO_LEN, UPDATE_KEY_LEN,
};
use crate::do_store::{self, tag, DoStore, Keystring};
use crate::keystore::{self, KeyRole, KeySlots, MAX_KEY_BODY_LEN};
use crate::rng::Rng;
use crate::update_keys::UpdateKeys;
use crate::{apdu::Command, GnukError, Result};

pub const INS_VERIFY: u8 = 0x20;
pub const INS_CHANGE_REFERENCE_DATA: u8 = 0x24;
pub const INS_PSO: u8 = 0x2a;
pub const INS_RESET_RETRY_COUNTER: u8 = 0x2c;
pub const INS_GENERATE_ASYMMETRIC_KEY_PAIR: u8 = 0x47;
pub const INS_EXTERNAL_AUTHENTICATE: u8 = 0x82;
pub const INS_GET_CHALLENGE: u8 = 0x84;
pub const INS_INTERNAL_AUTHENTICATE: u8 = 0x88;
pub const INS_SELECT_FILE: u8 = 0xa4;
pub const INS_READ_BINARY: u8 = 0xb0;
pub const INS_GET_DATA: u8 = 0xca;
pub const INS_WRITE_BINARY: u8 = 0xd0;
pub const INS_UPDATE_BINARY: u8 = 0xd6;
pub const INS_PUT_DATA: u8 = 0xda;
pub const INS_PUT_DATA_ODD: u8 = 0xdb;

const P1_CHANGE: u8 = 0x00;
const P2_PW1: u8 = 0x81;
const P2_PW3: u8 = 0x83;

const P1_RESET_BY_RC: u8 = 0x00;
const P1_RESET_BY_ADMIN: u8 = 0x02;

const P1_GAKP_READ_PUBLIC: u8 = 0x81;

const P1_SHORT_EF: u8 = 0x80;
const SHORT_EF_ID_MASK: u8 = 0x1f;

/// `openpgp.c`'s `FILEID_*` numbering: serial number, then the four
/// update-key slots, then the certificate, reachable either via short-EF
/// `READ BINARY`/`WRITE BINARY` or via a prior `SELECT FILE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileSelection {
    None,
    Mf,
    DfOpenpgp,
    SerialNo,
    UpdateKey(u8),
    Certificate,
}

fn short_ef_id_to_selection(file_id: u8) -> Option<FileSelection> {
    match file_id {
        0 => Some(FileSelection::SerialNo),
        1..=4 => Some(FileSelection::UpdateKey(file_id - 1)),
        5 => Some(FileSelection::Certificate),
        _ => None,
    }
}

fn valid_digestinfo_len(len: usize) -> bool {
    matches!(
        len,
        x if x == MD5_DIGESTINFO_LEN
            || x == SHA1_DIGESTINFO_LEN
            || x == SHA224_DIGESTINFO_LEN
            || x == SHA256_DIGESTINFO_LEN
            || x == SHA384_DIGESTINFO_LEN
            || x == SHA512_DIGESTINFO_LEN
    )
}

fn crypto_err(_: CryptoError) -> GnukError {
    GnukError::CryptoFailure
}

/// Splits a decrypted key body into its `(e, p, q)` RSA components. Layout
/// is this crate's own (`len(1) || bytes`, repeated three times for e, p,
/// q) rather than the original's nested CRT-template TLV: `do_store`/
/// `keystore` never need to parse it, only [`dispatch`] does, right before
/// handing the pieces to [`CryptoProvider`].
fn parse_rsa_body(body: &[u8]) -> Result<(&[u8], &[u8], &[u8])> {
    let mut n = 0;
    let mut take = |body: &[u8], n: &mut usize| -> Result<&[u8]> {
        let len = *body.get(*n).ok_or(GnukError::CryptoFailure)? as usize;
        *n += 1;
        let field = body.get(*n..*n + len).ok_or(GnukError::CryptoFailure)?;
        *n += len;
        Ok(field)
    };
    let e = take(body, &mut n)?;
    let p = take(body, &mut n)?;
    let q = take(body, &mut n)?;
    Ok((e, p, q))
}

fn encode_rsa_body(out: &mut [u8; MAX_KEY_BODY_LEN], e: &[u8], p: &[u8], q: &[u8]) -> Result<usize> {
    if e.len() > 255 || p.len() > 255 || q.len() > 255 {
        return Err(GnukError::WrongLength);
    }
    let total = 3 + e.len() + p.len() + q.len();
    if total > MAX_KEY_BODY_LEN {
        return Err(GnukError::WrongLength);
    }
    let mut n = 0;
    out[n] = e.len() as u8;
    n += 1;
    out[n..n + e.len()].copy_from_slice(e);
    n += e.len();
    out[n] = p.len() as u8;
    n += 1;
    out[n..n + p.len()].copy_from_slice(p);
    n += p.len();
    out[n] = q.len() as u8;
    n += 1;
    out[n..n + q.len()].copy_from_slice(q);
    n += q.len();
    Ok(n)
}

/// Role selector and RSA component template for `PUT DATA` (odd INS, key
/// import): `role(1) || e/p/q template`, this crate's stand-in for the
/// original's nested `7F48`/`5F48` CRT-tagged template.
fn parse_import_template(data: &[u8]) -> Result<(KeyRole, &[u8])> {
    let role = match data.first() {
        Some(0) => KeyRole::Sig,
        Some(1) => KeyRole::Dec,
        Some(2) => KeyRole::Aut,
        _ => return Err(GnukError::IncorrectP1P2),
    };
    Ok((role, &data[1..]))
}

/// Length of whichever PW1/PW3/RC keystring is currently stored (or the
/// matching factory default's length if none is), used to find where the
/// old PIN ends and the new one begins in a `CHANGE REFERENCE DATA` /
/// `RESET RETRY COUNTER` body — the keystring's own first byte is always
/// its plaintext length.
fn stored_or_default_len<F: FlashInterface>(do_store: &DoStore<F>, which: Keystring, default_len: usize) -> usize {
    let mut buf = [0u8; 32];
    match do_store.read_keystring(which, &mut buf) {
        Some(_) => buf[0] as usize,
        None => default_len,
    }
}

/// Owns the one piece of application-level state that persists across
/// commands within a session: which file is currently selected, gating
/// `GET DATA`/`PUT DATA` the way `file_selection != FILE_DF_OPENPGP` does
/// in the original.
pub struct OpenPgpApp {
    file_selection: FileSelection,
    /// Set by `GET CHALLENGE`, consumed by the following `EXTERNAL
    /// AUTHENTICATE`. Mirrors the original's single-shot challenge buffer:
    /// a second `EXTERNAL AUTHENTICATE` without an intervening fresh
    /// challenge always fails.
    pending_challenge: Option<[u8; CHALLENGE_LEN]>,
}

impl OpenPgpApp {
    pub fn new() -> Self {
        OpenPgpApp { file_selection: FileSelection::None, pending_challenge: None }
    }

    /// Dispatches one reassembled command APDU, writing its response body
    /// into `out` and returning the number of bytes written. Errors map to
    /// status words via [`crate::apdu::sw_for_error`].
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch<F, N, const CAP: usize, C>(
        &mut self,
        ac: &mut AccessControl,
        do_store: &mut DoStore<F>,
        key_slots: &mut KeySlots<F>,
        rng: &mut Rng<N, CAP>,
        update_keys: &mut UpdateKeys<F>,
        crypto: &C,
        cmd: &Command,
        data: &[u8],
        out: &mut [u8],
    ) -> Result<usize>
    where
        F: FlashInterface,
        N: NoiseSource,
        C: CryptoProvider,
    {
        match cmd.ins {
            INS_SELECT_FILE => self.cmd_select_file(ac, cmd.p1, cmd.p2, data, out),
            INS_GET_DATA => self.cmd_get_data(ac, do_store, cmd.p1, cmd.p2, out),
            INS_PUT_DATA | INS_PUT_DATA_ODD => self.cmd_put_data(ac, do_store, key_slots, rng, cmd.p1, cmd.p2, data),
            INS_VERIFY => Self::cmd_verify(ac, do_store, cmd.p2, data),
            INS_CHANGE_REFERENCE_DATA => Self::cmd_change_reference_data(ac, do_store, key_slots, rng, cmd.p1, cmd.p2, data),
            INS_RESET_RETRY_COUNTER => Self::cmd_reset_retry_counter(ac, do_store, key_slots, cmd.p1, data),
            INS_PSO => Self::cmd_pso(ac, do_store, key_slots, crypto, cmd.p1, cmd.p2, data, out),
            INS_INTERNAL_AUTHENTICATE => Self::cmd_internal_authenticate(ac, do_store, key_slots, crypto, cmd.p1, cmd.p2, data, out),
            INS_GET_CHALLENGE => self.cmd_get_challenge(rng, cmd.le, out),
            INS_EXTERNAL_AUTHENTICATE => self.cmd_external_authenticate(update_keys, crypto, cmd.p2, data),
            INS_GENERATE_ASYMMETRIC_KEY_PAIR => Self::cmd_gakp(ac, cmd.p1),
            INS_READ_BINARY => self.cmd_read_binary(do_store, update_keys, ac, cmd.p1, cmd.p2, cmd.le, out),
            INS_WRITE_BINARY | INS_UPDATE_BINARY => self.cmd_write_binary(do_store, update_keys, ac, cmd.p1, cmd.p2, data, cmd.ins == INS_UPDATE_BINARY),
            _ => Err(GnukError::InsNotSupported),
        }
    }

    fn cmd_select_file(&mut self, ac: &mut AccessControl, p1: u8, _p2: u8, data: &[u8], _out: &mut [u8]) -> Result<usize> {
        if p1 == 0x04 {
            if data == OPENPGP_AID_RID {
                self.file_selection = FileSelection::DfOpenpgp;
                Ok(0)
            } else {
                self.file_selection = FileSelection::None;
                Err(GnukError::FileNotFound)
            }
        } else if data == [0x3f, 0x00] {
            self.file_selection = FileSelection::Mf;
            ac.deauthorize_all();
            Ok(0)
        } else if data == [0x2f, 0x02] {
            self.file_selection = FileSelection::SerialNo;
            Ok(0)
        } else {
            self.file_selection = FileSelection::None;
            Err(GnukError::FileNotFound)
        }
    }

    fn cmd_get_data<F: FlashInterface>(&self, ac: &AccessControl, do_store: &DoStore<F>, p1: u8, p2: u8, out: &mut [u8]) -> Result<usize> {
        if self.file_selection != FileSelection::DfOpenpgp {
            return Err(GnukError::ConditionsNotSatisfied);
        }
        let tag = (p1 as u16) << 8 | p2 as u16;
        do_store.read_any(tag, ac.status(), out)
    }

    fn cmd_put_data<F: FlashInterface, N: NoiseSource, const CAP: usize>(
        &self,
        ac: &mut AccessControl,
        do_store: &mut DoStore<F>,
        key_slots: &mut KeySlots<F>,
        rng: &mut Rng<N, CAP>,
        p1: u8,
        p2: u8,
        data: &[u8],
    ) -> Result<usize> {
        if self.file_selection != FileSelection::DfOpenpgp {
            return Err(GnukError::ConditionsNotSatisfied);
        }
        let requested_tag = (p1 as u16) << 8 | p2 as u16;

        if requested_tag == tag::RESETTING_CODE {
            ac.set_resetting_code(do_store, key_slots, data)?;
            return Ok(0);
        }
        if requested_tag == tag::KEY_IMPORT {
            let (role, template) = parse_import_template(data)?;
            let (e, p, q) = parse_rsa_body(template)?;
            let mut body = [0u8; MAX_KEY_BODY_LEN];
            let len = encode_rsa_body(&mut body, e, p, q)?;
            let mut dek = [0u8; crate::constants::DEK_LEN];
            let mut iv = [0u8; crate::constants::IV_LEN];
            rng.fill_bytes(&mut dek);
            rng.fill_bytes(&mut iv);
            AccessControl::import_key(do_store, key_slots, role, dek, iv, &body[..len])?;
            return Ok(0);
        }
        if requested_tag == tag::PW_STATUS {
            if !ac.status().admin {
                return Err(GnukError::SecurityStatusNotSatisfied);
            }
            let persistent = *data.first().ok_or(GnukError::WrongLength)? != 0;
            do_store.set_pw1_lifetime(persistent)?;
            return Ok(0);
        }
        do_store.write_var(requested_tag, ac.status(), data)?;
        Ok(0)
    }

    fn cmd_verify<F: FlashInterface>(ac: &mut AccessControl, do_store: &mut DoStore<F>, p2: u8, data: &[u8]) -> Result<usize> {
        let (kind, counter) = match p2 {
            0x81 => (Pw1Kind::Cds, do_store::Counter::Pw1),
            0x82 => (Pw1Kind::Other, do_store::Counter::Pw1),
            _ => (Pw1Kind::Other, do_store::Counter::Pw3),
        };

        if data.is_empty() {
            let satisfied = match p2 {
                0x81 => ac.status().cds,
                0x82 => ac.status().other,
                _ => ac.status().admin,
            };
            if satisfied {
                return Ok(0);
            }
            if do_store.counter_locked(counter) {
                return Err(GnukError::AuthBlocked);
            }
            return Err(GnukError::PinFailed { remaining: do_store.retries_left(counter) });
        }

        match p2 {
            0x81 | 0x82 => ac.verify_pw1(do_store, kind, data)?,
            _ => ac.verify_pw3(do_store, data)?,
        }
        Ok(0)
    }

    fn cmd_change_reference_data<F: FlashInterface, N: NoiseSource, const CAP: usize>(
        ac: &mut AccessControl,
        do_store: &mut DoStore<F>,
        key_slots: &mut KeySlots<F>,
        rng: &mut Rng<N, CAP>,
        p1: u8,
        p2: u8,
        data: &[u8],
    ) -> Result<usize> {
        if p1 != P1_CHANGE {
            return Err(GnukError::IncorrectP1P2);
        }
        match p2 {
            P2_PW1 => {
                let old_len = stored_or_default_len(do_store, Keystring::Pw1, 6);
                if old_len > data.len() {
                    return Err(GnukError::WrongLength);
                }
                let (old, new) = data.split_at(old_len);
                ac.change_pw1(do_store, key_slots, old, new)?;
                Ok(0)
            }
            P2_PW3 => {
                let old_len = stored_or_default_len(do_store, Keystring::Pw3, PW3_DEFAULT.len());
                if old_len > data.len() {
                    return Err(GnukError::WrongLength);
                }
                let (old, new) = data.split_at(old_len);
                let mut salt = [0u8; 8];
                rng.fill_bytes(&mut salt);
                ac.change_pw3(do_store, key_slots, old, new, salt)?;
                Ok(0)
            }
            _ => Err(GnukError::IncorrectP1P2),
        }
    }

    fn cmd_reset_retry_counter<F: FlashInterface>(
        ac: &mut AccessControl,
        do_store: &mut DoStore<F>,
        key_slots: &mut KeySlots<F>,
        p1: u8,
        data: &[u8],
    ) -> Result<usize> {
        match p1 {
            P1_RESET_BY_RC => {
                let mut buf = [0u8; 32];
                let rc_len = do_store.read_keystring(Keystring::Rc, &mut buf).ok_or(GnukError::ConditionsNotSatisfied)?;
                let _ = rc_len;
                let old_len = buf[0] as usize;
                if old_len > data.len() {
                    return Err(GnukError::WrongLength);
                }
                let (rc, new_pw1) = data.split_at(old_len);
                ac.reset_retry_counter_by_rc(do_store, key_slots, rc, new_pw1)?;
                Ok(0)
            }
            P1_RESET_BY_ADMIN => {
                ac.reset_retry_counter_by_admin(do_store, key_slots, data)?;
                Ok(0)
            }
            _ => Err(GnukError::IncorrectP1P2),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn cmd_pso<F: FlashInterface, C: CryptoProvider>(
        ac: &mut AccessControl,
        do_store: &mut DoStore<F>,
        key_slots: &KeySlots<F>,
        crypto: &C,
        p1: u8,
        p2: u8,
        data: &[u8],
        out: &mut [u8],
    ) -> Result<usize> {
        if p1 == 0x9e && p2 == 0x9a {
            if !ac.status().cds {
                return Err(GnukError::SecurityStatusNotSatisfied);
            }
            if !valid_digestinfo_len(data.len()) {
                return Err(GnukError::ConditionsNotSatisfied);
            }
            let mut body = [0u8; MAX_KEY_BODY_LEN];
            let len = ac.unlock_key(do_store, key_slots, KeyRole::Sig, Authorizer::Pw1, &mut body)?;
            let (e, p, q) = match parse_rsa_body(&body[..len]) {
                Ok(v) => v,
                Err(e) => {
                    ac.ac_reset_pso_cds();
                    return Err(e);
                }
            };
            let priv_key = RsaPrivateComponents { e, p, q };
            match crypto.rsa_sign(&priv_key, data, out) {
                Ok(n) => {
                    do_store.increment_signature_counter()?;
                    ac.on_signature_made(do_store);
                    Ok(n)
                }
                Err(err) => {
                    ac.ac_reset_pso_cds();
                    Err(crypto_err(err))
                }
            }
        } else if p1 == 0x80 && p2 == 0x86 {
            if !ac.status().other {
                return Err(GnukError::SecurityStatusNotSatisfied);
            }
            let ciphertext = data.get(1..).ok_or(GnukError::WrongLength)?;
            let mut body = [0u8; MAX_KEY_BODY_LEN];
            let len = ac.unlock_key(do_store, key_slots, KeyRole::Dec, Authorizer::Pw1, &mut body)?;
            let (e, p, q) = parse_rsa_body(&body[..len])?;
            let priv_key = RsaPrivateComponents { e, p, q };
            crypto.rsa_decrypt(&priv_key, ciphertext, out).map_err(crypto_err)
        } else {
            Err(GnukError::IncorrectP1P2)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn cmd_internal_authenticate<F: FlashInterface, C: CryptoProvider>(
        ac: &AccessControl,
        do_store: &DoStore<F>,
        key_slots: &KeySlots<F>,
        crypto: &C,
        p1: u8,
        p2: u8,
        data: &[u8],
        out: &mut [u8],
    ) -> Result<usize> {
        if p1 != 0x00 || p2 != 0x00 {
            return Err(GnukError::IncorrectP1P2);
        }
        if data.len() > MAX_RSA_DIGEST_INFO_LEN {
            return Err(GnukError::ConditionsNotSatisfied);
        }
        if !ac.status().other {
            return Err(GnukError::SecurityStatusNotSatisfied);
        }
        let mut body = [0u8; MAX_KEY_BODY_LEN];
        let len = ac.unlock_key(do_store, key_slots, KeyRole::Aut, Authorizer::Pw1, &mut body)?;
        let (e, p, q) = parse_rsa_body(&body[..len])?;
        let priv_key = RsaPrivateComponents { e, p, q };
        crypto.rsa_sign(&priv_key, data, out).map_err(crypto_err)
    }

    /// Generates a fresh challenge, stashes the full 32 bytes for a
    /// following `EXTERNAL AUTHENTICATE` to verify against, and returns
    /// only the caller-requested prefix (`Le == 0` meaning "all of it").
    fn cmd_get_challenge<N: NoiseSource, const CAP: usize>(&mut self, rng: &mut Rng<N, CAP>, le: usize, out: &mut [u8]) -> Result<usize> {
        let len = if le == 0 { CHALLENGE_LEN } else { le };
        if len > CHALLENGE_LEN {
            return Err(GnukError::ConditionsNotSatisfied);
        }
        let mut challenge = [0u8; CHALLENGE_LEN];
        rng.fill_bytes(&mut challenge);
        self.pending_challenge = Some(challenge);
        out[..len].copy_from_slice(&challenge[..len]);
        Ok(len)
    }

    /// Verifies a firmware-update signature against one of the four
    /// registered update keys and the challenge issued by the most recent
    /// `GET CHALLENGE`. Grounded on `cmd_external_authenticate` in
    /// `openpgp.c`: the original follows a successful check with a jump
    /// into the reGNUal bootloader, which is out of scope here, so this
    /// returns plain success instead of the original's `0xff 0xff` status
    /// word.
    fn cmd_external_authenticate<F: FlashInterface, C: CryptoProvider>(
        &mut self,
        update_keys: &UpdateKeys<F>,
        crypto: &C,
        keyno: u8,
        signature: &[u8],
    ) -> Result<usize> {
        if keyno as usize >= NUM_UPDATE_KEYS {
            // `openpgp.c:1198-1202` treats an out-of-range update-key slot
            // the same as any other EXTERNAL AUTHENTICATE precondition miss.
            return Err(GnukError::ConditionsNotSatisfied);
        }
        if signature.len() != UPDATE_KEY_LEN {
            return Err(GnukError::WrongLength);
        }
        let challenge = self.pending_challenge.take().ok_or(GnukError::ConditionsNotSatisfied)?;
        let mut modulus = [0u8; UPDATE_KEY_LEN];
        update_keys.read_registered(keyno, &mut modulus)?;
        crypto
            .rsa_verify(&modulus, &challenge, signature)
            .map_err(|_| GnukError::SecurityStatusNotSatisfied)?;
        Ok(0)
    }

    /// `READ BINARY` on whichever EF is selected, short-EF form (`P1` bit 7
    /// set) selecting the EF inline the way `cmd_read_binary` does in the
    /// original. Only the certificate EF supports a nonzero offset; the
    /// serial-number and update-key EFs are each read in one shot.
    fn cmd_read_binary<F: FlashInterface>(
        &mut self,
        do_store: &DoStore<F>,
        update_keys: &UpdateKeys<F>,
        ac: &AccessControl,
        p1: u8,
        p2: u8,
        le: usize,
        out: &mut [u8],
    ) -> Result<usize> {
        let (selection, offset) = if p1 & P1_SHORT_EF != 0 {
            let file_id = p1 & SHORT_EF_ID_MASK;
            let selection = short_ef_id_to_selection(file_id).ok_or(GnukError::FileNotFound)?;
            self.file_selection = selection;
            (selection, p2 as usize)
        } else {
            (self.file_selection, ((p1 as usize) << 8) | p2 as usize)
        };

        match selection {
            FileSelection::SerialNo => {
                if offset != 0 {
                    return Err(GnukError::IncorrectP1P2);
                }
                let n = do_store.read_any(tag::AID, ac.status(), out)?;
                if n > 0 {
                    out[0] = 0x5a;
                }
                Ok(n)
            }
            FileSelection::UpdateKey(keyno) => {
                if offset != 0 {
                    return Err(GnukError::IncorrectP1P2);
                }
                if out.len() < UPDATE_KEY_LEN {
                    return Err(GnukError::WrongLength);
                }
                let mut key = [0u8; UPDATE_KEY_LEN];
                update_keys.read_raw(keyno, &mut key)?;
                out[..UPDATE_KEY_LEN].copy_from_slice(&key);
                Ok(UPDATE_KEY_LEN)
            }
            FileSelection::Certificate => {
                let mut cert = [0u8; crate::constants::MAX_DO_LEN];
                let cert_len = do_store.read_any(tag::CH_CERTIFICATE, ac.status(), &mut cert)?;
                if offset > cert_len {
                    return Err(GnukError::IncorrectP1P2);
                }
                let avail = &cert[offset..cert_len];
                let want = if le == 0 { avail.len() } else { le.min(avail.len()) };
                out[..want].copy_from_slice(&avail[..want]);
                Ok(want)
            }
            FileSelection::None | FileSelection::Mf | FileSelection::DfOpenpgp => Err(GnukError::ConditionsNotSatisfied),
        }
    }

    /// `WRITE BINARY`/`UPDATE BINARY`, grounded on `modify_binary` in
    /// `openpgp.c`: admin authorization is required for either, short-EF
    /// `P1` reselects the target EF inline, and the update-key slots are
    /// writable only by `WRITE BINARY` (an `UPDATE BINARY` there is
    /// `ConditionsNotSatisfied`, matching the original's
    /// `op == MBD_OPRATION_UPDATE && file_id != FILEID_CH_CERTIFICATE`
    /// check), while only the certificate EF accepts either. Offset is
    /// required to be 0 — a deliberate simplification of the original's
    /// arbitrary-offset chunked writes.
    fn cmd_write_binary<F: FlashInterface>(
        &mut self,
        do_store: &mut DoStore<F>,
        update_keys: &mut UpdateKeys<F>,
        ac: &AccessControl,
        p1: u8,
        p2: u8,
        data: &[u8],
        is_update: bool,
    ) -> Result<usize> {
        if !ac.status().admin {
            return Err(GnukError::SecurityStatusNotSatisfied);
        }
        let selection = if p1 & P1_SHORT_EF != 0 {
            let file_id = p1 & SHORT_EF_ID_MASK;
            let selection = short_ef_id_to_selection(file_id).ok_or(GnukError::FileNotFound)?;
            self.file_selection = selection;
            selection
        } else {
            self.file_selection
        };
        let offset = if p1 & P1_SHORT_EF != 0 { p2 as usize } else { ((p1 as usize) << 8) | p2 as usize };
        if offset != 0 {
            return Err(GnukError::IncorrectP1P2);
        }

        match selection {
            FileSelection::Certificate => {
                do_store.write_var(tag::CH_CERTIFICATE, ac.status(), data)?;
                Ok(0)
            }
            FileSelection::UpdateKey(keyno) if !is_update => {
                update_keys.write_raw(keyno, data)?;
                Ok(0)
            }
            FileSelection::UpdateKey(_) => Err(GnukError::ConditionsNotSatisfied),
            FileSelection::SerialNo | FileSelection::None | FileSelection::Mf | FileSelection::DfOpenpgp => Err(GnukError::ConditionsNotSatisfied),
        }
    }

    /// Neither branch is supported: this firmware never caches a public
    /// modulus independently of an imported private key (deriving it from
    /// `P`/`Q` would need bignum arithmetic outside `CryptoProvider`'s
    /// boundary), and on-card key generation is the original's
    /// `KEYGEN_SUPPORT`-gated feature, which this build doesn't enable
    /// either.
    fn cmd_gakp(ac: &AccessControl, p1: u8) -> Result<usize> {
        if p1 == P1_GAKP_READ_PUBLIC {
            Err(GnukError::ConditionsNotSatisfied)
        } else if !ac.status().admin {
            Err(GnukError::SecurityStatusNotSatisfied)
        } else {
            Err(GnukError::ConditionsNotSatisfied)
        }
    }
}

impl Default for OpenPgpApp {
    fn default() -> Self {
        Self::new()
    }
}
