//! Firmware-update public key registry.
//!
//! Grounded on `openpgp.c`'s `gpg_get_firmware_update_key`/`_updatekey_store`:
//! four fixed-size RSA modulus slots. Like the card serial number, these are
//! reachable only through the vendor READ/WRITE BINARY path, never PUT DATA
//! (`modify_binary`'s `FILEID_UPDATE_KEY_0..3` branch), and are consumed by
//! EXTERNAL AUTHENTICATE to verify a firmware-update signature.

use gnuk_hal::FlashInterface;

use crate::constants::{NUM_UPDATE_KEYS, UPDATE_KEY_LEN};
use crate::{FatalCause, GnukError, Result};

/// A slot holding all `0xff` means "never provisioned"; all `0x00` means
/// "provisioned, then explicitly revoked". Either sentinel makes the key
/// unusable for EXTERNAL AUTHENTICATE, matching the original's two-sentinel
/// check in `cmd_external_authenticate`.
fn is_sentinel(key: &[u8], fill: u8) -> bool {
    key.iter().all(|&b| b == fill)
}

/// Read-only view over the four firmware-update RSA moduli.
pub struct UpdateKeys<F: FlashInterface> {
    flash: F,
    base: usize,
}

impl<F: FlashInterface> UpdateKeys<F> {
    pub fn mount(flash: F, base: usize) -> Self {
        UpdateKeys { flash, base }
    }

    /// Copies update-key slot `keyno`'s raw bytes (sentinel or a real
    /// modulus) into `out`. Every READ BINARY on an update-key EF is
    /// allowed to see the raw bytes, sentinel or not — only EXTERNAL
    /// AUTHENTICATE rejects a sentinel slot.
    pub fn read_raw(&self, keyno: u8, out: &mut [u8; UPDATE_KEY_LEN]) -> Result<()> {
        if keyno as usize >= NUM_UPDATE_KEYS {
            return Err(GnukError::IncorrectP1P2);
        }
        let addr = self.base + keyno as usize * UPDATE_KEY_LEN;
        self.flash.hal_flash_read(addr, out);
        Ok(())
    }

    /// Same as [`Self::read_raw`] but rejects an unprovisioned or revoked
    /// slot, the check EXTERNAL AUTHENTICATE needs before calling
    /// `rsa_verify`.
    pub fn read_registered(&self, keyno: u8, out: &mut [u8; UPDATE_KEY_LEN]) -> Result<()> {
        self.read_raw(keyno, out)?;
        if is_sentinel(out, 0xff) || is_sentinel(out, 0x00) {
            return Err(GnukError::ConditionsNotSatisfied);
        }
        Ok(())
    }

    /// Provisions or revokes update-key slot `keyno` via `WRITE BINARY`
    /// (`openpgp.c`'s `flash_write_binary`, the `FILEID_UPDATE_KEY_0..3`
    /// branch). `data.is_empty()` revokes the slot by zeroing it — always
    /// possible, since a program-only flash cell can clear bits without an
    /// erase. Provisioning a new modulus (`data.len() == UPDATE_KEY_LEN`)
    /// only succeeds if the slot is still blank (all `0xff`): overwriting an
    /// already-provisioned or already-revoked slot with a different value
    /// would need a page erase, which would destroy its page-mates (four
    /// key slots share one flash page here), so the original's own
    /// `flash_check_blank` guard is kept as-is rather than worked around.
    pub fn write_raw(&mut self, keyno: u8, data: &[u8]) -> Result<()> {
        if keyno as usize >= NUM_UPDATE_KEYS {
            return Err(GnukError::IncorrectP1P2);
        }
        let addr = self.base + keyno as usize * UPDATE_KEY_LEN;
        if data.is_empty() {
            self.flash.hal_flash_write(addr, &[0u8; UPDATE_KEY_LEN]).map_err(|_| GnukError::Fatal(FatalCause::FlashExhausted))?;
            return Ok(());
        }
        if data.len() != UPDATE_KEY_LEN {
            return Err(GnukError::WrongLength);
        }
        let mut current = [0u8; UPDATE_KEY_LEN];
        self.flash.hal_flash_read(addr, &mut current);
        if !is_sentinel(&current, 0xff) {
            return Err(GnukError::ConditionsNotSatisfied);
        }
        self.flash.hal_flash_write(addr, data).map_err(|_| GnukError::Fatal(FatalCause::FlashExhausted))?;
        Ok(())
    }
}
