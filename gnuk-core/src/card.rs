//! Top-level card loop: pumps USB bulk packets through [`crate::ccid`]
//! framing, [`crate::apdu`] command reassembly and response paging, and
//! [`crate::openpgp_app`] dispatch.
//!
//! Grounded on `usb-icc.c`'s main dispatch loop (the file's own "three
//! layers" diagram: USB driver, then ICCD message framing, then APDU
//! handling) and on its `icc_send_data_block_0x9000` helper, which this
//! module reuses for the one case `ccid`/`apdu` don't handle between them:
//! acknowledging a command-chaining continuation link with a bare `9000`.

use gnuk_hal::{CryptoProvider, FlashInterface, NoiseSource, UsbTransport};

use crate::ac::AccessControl;
use crate::apdu::{self, Command, CommandAssembler, ResponseAssembler};
use crate::ccid::{self, Ccid, Message};
use crate::do_store::DoStore;
use crate::keystore::KeySlots;
use crate::openpgp_app::OpenPgpApp;
use crate::rng::Rng;
use crate::update_keys::UpdateKeys;
use crate::GnukError;

/// Largest single USB bulk packet this firmware exchanges: one CCID header
/// plus one short-APDU command or response body.
pub const USB_BUF_SIZE: usize = 10 + 261;

const SW_9000: [u8; 2] = [0x90, 0x00];

/// Owns every piece of state a running card needs across USB packets: CCID
/// power/slot tracking, ISO 7816 command/response assembly, access control,
/// the Data Object store, the encrypted key slots, the RNG and the
/// application dispatcher.
pub struct OpenPgpCard<F: FlashInterface, N: NoiseSource, const CAP: usize> {
    ccid: Ccid,
    cmd_asm: CommandAssembler,
    resp_asm: ResponseAssembler,
    ac: AccessControl,
    do_store: DoStore<F>,
    key_slots: KeySlots<F>,
    rng: Rng<N, CAP>,
    update_keys: UpdateKeys<F>,
    app: OpenPgpApp,
}

impl<F: FlashInterface, N: NoiseSource, const CAP: usize> OpenPgpCard<F, N, CAP> {
    pub fn new(do_store: DoStore<F>, key_slots: KeySlots<F>, rng: Rng<N, CAP>, update_keys: UpdateKeys<F>) -> Self {
        OpenPgpCard {
            ccid: Ccid::new(),
            cmd_asm: CommandAssembler::new(),
            resp_asm: ResponseAssembler::new(),
            ac: AccessControl::new(),
            do_store,
            key_slots,
            rng,
            update_keys,
            app: OpenPgpApp::new(),
        }
    }

    /// Handles one raw `PC_to_RDR` message, writing the matching `RDR_to_PC`
    /// reply into `out` and returning its length. `crypto` is taken per call
    /// rather than stored, since it is typically a zero-sized handle onto a
    /// hardware crypto peripheral.
    pub fn handle_message<C: CryptoProvider>(&mut self, raw: &[u8], crypto: &C, out: &mut [u8]) -> usize {
        match self.ccid.handle(raw) {
            Ok(Message::PowerOn { seq, slot }) => {
                self.cmd_asm.reset();
                self.resp_asm.stage(&[]).ok();
                ccid::build_power_on_reply(seq, slot, out).unwrap_or(0)
            }
            Ok(Message::PowerOff { seq, slot }) => {
                self.cmd_asm.reset();
                ccid::build_slot_status(seq, slot, self.ccid.icc_status_bits(), ccid::ICC_CMD_STATUS_OK, out).unwrap_or(0)
            }
            Ok(Message::SlotStatus { seq, slot }) => {
                ccid::build_slot_status(seq, slot, self.ccid.icc_status_bits(), ccid::ICC_CMD_STATUS_OK, out).unwrap_or(0)
            }
            Ok(Message::XfrBlock { seq, slot, payload }) => self.handle_xfr_block(seq, slot, payload, crypto, out),
            Err(e) => self.build_status_error(0, 0, e, out),
        }
    }

    fn handle_xfr_block<C: CryptoProvider>(&mut self, seq: u8, slot: u8, payload: &[u8], crypto: &C, out: &mut [u8]) -> usize {
        let icc_status = self.ccid.icc_status_bits();

        let (cla, ins, p1, p2, body, le) = match apdu::parse_short_apdu(payload) {
            Ok(v) => v,
            Err(e) => return self.build_data_block_error(seq, slot, icc_status, e, out),
        };

        if ins == apdu::INS_GET_RESPONSE {
            if self.resp_asm.is_empty() {
                return self.build_data_block_error(seq, slot, icc_status, GnukError::ConditionsNotSatisfied, out);
            }
            return self.page_response(seq, slot, icc_status, le, out);
        }

        let cmd = match self.cmd_asm.feed(cla, ins, p1, p2, body, le) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => {
                return ccid::build_data_block(seq, slot, icc_status, ccid::ICC_CMD_STATUS_OK, &SW_9000, out).unwrap_or(0);
            }
            Err(e) => return self.build_data_block_error(seq, slot, icc_status, e, out),
        };

        self.run_command(seq, slot, icc_status, &cmd, crypto, out)
    }

    fn run_command<C: CryptoProvider>(&mut self, seq: u8, slot: u8, icc_status: u8, cmd: &Command, crypto: &C, out: &mut [u8]) -> usize {
        let data = self.cmd_asm.data();
        let mut body = [0u8; crate::constants::MAX_RES_APDU_DATA_SIZE];
        let result = self.app.dispatch(
            &mut self.ac,
            &mut self.do_store,
            &mut self.key_slots,
            &mut self.rng,
            &mut self.update_keys,
            crypto,
            cmd,
            data,
            &mut body,
        );
        self.cmd_asm.reset();

        match result {
            Ok(len) => {
                self.resp_asm.stage(&body[..len]).ok();
                self.page_response(seq, slot, icc_status, cmd.le, out)
            }
            Err(e) => self.build_data_block_error(seq, slot, icc_status, e, out),
        }
    }

    fn page_response(&mut self, seq: u8, slot: u8, icc_status: u8, le: usize, out: &mut [u8]) -> usize {
        let mut chunk = [0u8; crate::constants::MAX_RES_APDU_DATA_SIZE];
        let want = if le == 0 { 256 } else { le };
        let (data, sw) = self.resp_asm.take(want, &mut chunk);
        let data_len = data.len();
        let mut payload = [0u8; crate::constants::MAX_RES_APDU_DATA_SIZE + 2];
        payload[..data_len].copy_from_slice(&chunk[..data_len]);
        payload[data_len..data_len + 2].copy_from_slice(&sw.to_be_bytes());
        ccid::build_data_block(seq, slot, icc_status, ccid::ICC_CMD_STATUS_OK, &payload[..data_len + 2], out).unwrap_or(0)
    }

    fn build_data_block_error(&self, seq: u8, slot: u8, icc_status: u8, err: GnukError, out: &mut [u8]) -> usize {
        let sw = apdu::sw_for_error(err);
        ccid::build_data_block(seq, slot, icc_status, ccid::ICC_CMD_STATUS_OK, &sw.to_be_bytes(), out).unwrap_or(0)
    }

    fn build_status_error(&self, seq: u8, slot: u8, _err: GnukError, out: &mut [u8]) -> usize {
        ccid::build_error(seq, slot, self.ccid.icc_status_bits(), ccid::ICC_ERROR_XFR_OVERRUN, out).unwrap_or(0)
    }

    /// Pumps one bulk-OUT packet through to its bulk-IN reply, the loop body
    /// a real USB interrupt handler or polling task repeats forever.
    pub fn poll<T: UsbTransport, C: CryptoProvider>(&mut self, transport: &mut T, crypto: &C) {
        let mut in_buf = [0u8; USB_BUF_SIZE];
        let n = transport.recv_bulk_out(&mut in_buf);
        if n == 0 {
            return;
        }
        let mut out_buf = [0u8; USB_BUF_SIZE];
        let len = self.handle_message(&in_buf[..n], crypto, &mut out_buf);
        if len > 0 {
            transport.send_bulk_in(&out_buf[..len]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash_store::FlashStore;
    use gnuk_hal::{CryptoError, FlashError, RsaPrivateComponents};
    use std::cell::RefCell;

    struct FakeFlash {
        mem: RefCell<std::vec::Vec<u8>>,
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
        fn hal_flash_write(&mut self, addr: usize, data: &[u8]) -> core::result::Result<(), FlashError> {
            let mut mem = self.mem.borrow_mut();
            for (i, b) in data.iter().enumerate() {
                let cur = mem[addr + i];
                if b & !cur != 0 {
                    return Err(FlashError);
                }
                mem[addr + i] = cur & b;
            }
            Ok(())
        }
        fn hal_flash_erase_page(&mut self, addr: usize) -> core::result::Result<(), FlashError> {
            let mut mem = self.mem.borrow_mut();
            let start = (addr / self.page_size) * self.page_size;
            for b in &mut mem[start..start + self.page_size] {
                *b = 0xff;
            }
            Ok(())
        }
    }

    struct FakeNoise(u8);
    impl NoiseSource for FakeNoise {
        fn sample_adc_bits(&mut self) -> u8 {
            self.0 = self.0.wrapping_add(1);
            self.0
        }
        fn jitter_bit(&mut self) -> bool {
            self.0 & 1 == 0
        }
    }

    struct FakeCrypto;
    impl CryptoProvider for FakeCrypto {
        fn rsa_sign(&self, _: &RsaPrivateComponents, digest_info: &[u8], out: &mut [u8]) -> core::result::Result<usize, CryptoError> {
            out[..digest_info.len()].copy_from_slice(digest_info);
            Ok(digest_info.len())
        }
        fn rsa_decrypt(&self, _: &RsaPrivateComponents, ciphertext: &[u8], out: &mut [u8]) -> core::result::Result<usize, CryptoError> {
            out[..ciphertext.len()].copy_from_slice(ciphertext);
            Ok(ciphertext.len())
        }
        fn ecdsa_sign_p256(&self, _: &[u8; 32], _: &[u8; 32], _: &mut [u8; 64]) -> core::result::Result<(), CryptoError> {
            Err(CryptoError::InvalidKey)
        }
        fn x25519_agree(&self, _: &[u8; 32], _: &[u8; 32], _: &mut [u8; 32]) -> core::result::Result<(), CryptoError> {
            Err(CryptoError::InvalidKey)
        }
        fn ed25519_sign(&self, _: &[u8; 32], _: &[u8], _: &mut [u8; 64]) -> core::result::Result<(), CryptoError> {
            Err(CryptoError::InvalidKey)
        }
        fn rsa_verify(&self, _: &[u8], _: &[u8], _: &[u8]) -> core::result::Result<(), CryptoError> {
            Err(CryptoError::InvalidKey)
        }
    }

    fn card() -> OpenPgpCard<FakeFlash, FakeNoise, 8> {
        let do_flash = FakeFlash::new(2, 512);
        let fs = FlashStore::mount(do_flash, 0).unwrap();
        let do_store = DoStore::mount(fs);
        let key_flash = FakeFlash::new(3, 1024);
        let key_slots = KeySlots::mount(key_flash, 0);
        let update_key_flash = FakeFlash::new(1, 1024);
        let update_keys = UpdateKeys::mount(update_key_flash, 0);
        OpenPgpCard::new(do_store, key_slots, Rng::new(FakeNoise(1)), update_keys)
    }

    fn xfr_msg(seq: u8, apdu: &[u8]) -> std::vec::Vec<u8> {
        let mut msg = std::vec![0u8; 10 + apdu.len()];
        msg[0] = ccid::ICC_XFR_BLOCK;
        msg[1..5].copy_from_slice(&(apdu.len() as u32).to_le_bytes());
        msg[6] = seq;
        msg[10..].copy_from_slice(apdu);
        msg
    }

    fn power_on_msg(seq: u8) -> [u8; 10] {
        let mut msg = [0u8; 10];
        msg[0] = ccid::ICC_POWER_ON;
        msg[6] = seq;
        msg
    }

    #[test]
    fn power_on_returns_atr() {
        let mut c = card();
        let mut out = [0u8; USB_BUF_SIZE];
        let n = c.handle_message(&power_on_msg(1), &FakeCrypto, &mut out);
        assert_eq!(out[0], ccid::ICC_DATA_BLOCK_RET);
        assert_eq!(n, 10 + ccid::ATR_LEN);
    }

    #[test]
    fn select_then_verify_round_trip_returns_9000() {
        let mut c = card();
        let mut out = [0u8; USB_BUF_SIZE];
        c.handle_message(&power_on_msg(0), &FakeCrypto, &mut out);

        let select = [0x00u8, 0xa4, 0x04, 0x0c, 0x06, 0xD2, 0x76, 0x00, 0x01, 0x24, 0x01];
        let msg = xfr_msg(1, &select);
        let n = c.handle_message(&msg, &FakeCrypto, &mut out);
        assert_eq!(&out[n - 2..n], &[0x90, 0x00]);

        let verify = [0x00u8, 0x20, 0x00, 0x81, 0x06, b'1', b'2', b'3', b'4', b'5', b'6'];
        let msg = xfr_msg(2, &verify);
        let n = c.handle_message(&msg, &FakeCrypto, &mut out);
        assert_eq!(&out[n - 2..n], &[0x90, 0x00]);
    }

    #[test]
    fn chained_command_link_gets_bare_9000_ack() {
        let mut c = card();
        let mut out = [0u8; USB_BUF_SIZE];
        c.handle_message(&power_on_msg(0), &FakeCrypto, &mut out);

        let first_link = [0x10u8, 0xda, 0x00, 0x5b, 0x03, b'A', b'l', b'i'];
        let n = c.handle_message(&xfr_msg(1, &first_link), &FakeCrypto, &mut out);
        assert_eq!(n, 10 + 2);
        assert_eq!(&out[10..12], &[0x90, 0x00]);
    }

    #[test]
    fn xfr_block_without_power_on_is_reported_as_slot_status_error() {
        let mut c = card();
        let mut out = [0u8; USB_BUF_SIZE];
        let verify = [0x00u8, 0x20, 0x00, 0x81, 0x06, b'1', b'2', b'3', b'4', b'5', b'6'];
        let n = c.handle_message(&xfr_msg(1, &verify), &FakeCrypto, &mut out);
        assert_eq!(out[0], ccid::ICC_SLOT_STATUS_RET);
        assert_eq!(n, 10);
    }
}
