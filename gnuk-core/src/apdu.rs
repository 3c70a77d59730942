//! Command-APDU reassembly and response paging.
//!
//! Grounded on `usb-icc.c`'s `icc_cmd_apdu_data`/`end_cmd_apdu_data`: a
//! command whose CLA has bit `0x10` set is a chain link, not the whole
//! command; [`CommandAssembler`] buffers its data and waits for a final
//! link with that bit clear, checking every link's CLA/INS/P1/P2 match the
//! first one. [`ResponseAssembler`] is the other half: a response longer
//! than the requesting command's Le is staged once and paged out over
//! however many `GET RESPONSE` (`INS_GET_RESPONSE`) round-trips it takes,
//! each returning `61xx` until the last chunk, which returns `9000`.
//!
//! Framing the command/response bodies into CCID `PC_to_RDR`/`RDR_to_PC`
//! messages, and those into USB bulk packets, is [`crate::ccid`]'s job;
//! this module only knows about ISO 7816-4 command/response APDUs.

use heapless::Vec;

use crate::constants::{MAX_CMD_APDU_DATA_SIZE, MAX_RES_APDU_DATA_SIZE};
use crate::{FatalCause, GnukError, Result};

pub const INS_GET_RESPONSE: u8 = 0xc0;

pub const SW_SUCCESS: u16 = 0x9000;

/// ISO 7816-4 status word for each recoverable [`GnukError`] variant.
/// `Fatal` has no meaningful status word; callers must not reach this
/// function with one (`SPEC_FULL.md` §7 routes it to the board's
/// LED/reset driver instead of a response APDU).
pub fn sw_for_error(e: GnukError) -> u16 {
    match e {
        GnukError::WrongLength => 0x6700,
        GnukError::SecurityStatusNotSatisfied => 0x6982,
        GnukError::ReferenceNotFound => 0x6a88,
        GnukError::FileNotFound => 0x6a82,
        GnukError::AuthBlocked => 0x6983,
        GnukError::PinFailed { remaining } => 0x63c0 | (remaining as u16 & 0x0f),
        GnukError::InsNotSupported => 0x6d00,
        GnukError::ConditionsNotSatisfied => 0x6985,
        GnukError::IncorrectP1P2 => 0x6a86,
        GnukError::CryptoFailure => 0x6400,
        GnukError::DoWriteError => 0x6581,
        GnukError::Fatal(_) => 0x6f00,
    }
}

/// A fully reassembled command APDU: CLA with the chaining bit already
/// masked off, INS/P1/P2, and the length of (and Le for) the body sitting
/// in the owning [`CommandAssembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub len: usize,
    pub le: usize,
}

/// Buffers chained command-APDU bodies until a final (non-chained) link
/// completes the command.
pub struct CommandAssembler {
    data: Vec<u8, MAX_CMD_APDU_DATA_SIZE>,
    chained_header: Option<(u8, u8, u8, u8)>,
}

impl CommandAssembler {
    pub fn new() -> Self {
        CommandAssembler { data: Vec::new(), chained_header: None }
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.chained_header = None;
    }

    /// Feeds one physical command APDU's header and body. Returns
    /// `Ok(Some(cmd))` once a (possibly chained) command is complete, or
    /// `Ok(None)` if a continuation link is still expected. A
    /// continuation whose CLA/INS/P1/P2 don't match the chain's first
    /// link aborts the whole chain.
    pub fn feed(&mut self, cla: u8, ins: u8, p1: u8, p2: u8, body: &[u8], le: usize) -> Result<Option<Command>> {
        let more = cla & 0x10 != 0;
        let bare_cla = cla & !0x10;
        let header = (bare_cla, ins, p1, p2);

        match self.chained_header {
            Some(h) if h != header => {
                self.reset();
                return Err(GnukError::WrongLength);
            }
            None => self.data.clear(),
            _ => {}
        }

        self.data.extend_from_slice(body).map_err(|_| GnukError::WrongLength)?;

        if more {
            self.chained_header = Some(header);
            Ok(None)
        } else {
            self.chained_header = None;
            Ok(Some(Command { cla: bare_cla, ins, p1, p2, len: self.data.len(), le }))
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Default for CommandAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits one ISO 7816-4 short-form command APDU's raw bytes (as handed
/// over from a CCID `XfrBlock`, header stripped) into CLA/INS/P1/P2, its
/// body and its Le, covering all four classic cases: no data, `Lc`-only,
/// `Le`-only, and both present. Extended length (`00 Lc1 Lc2`) encoding
/// isn't needed here since `SPEC_FULL.md`'s command/response sizes never
/// exceed 255 bytes per physical link — longer payloads go through
/// [`CommandAssembler`] chaining instead.
pub fn parse_short_apdu(raw: &[u8]) -> Result<(u8, u8, u8, u8, &[u8], usize)> {
    if raw.len() < 4 {
        return Err(GnukError::WrongLength);
    }
    let (cla, ins, p1, p2) = (raw[0], raw[1], raw[2], raw[3]);
    let rest = &raw[4..];
    match rest.len() {
        0 => Ok((cla, ins, p1, p2, &rest[0..0], 0)),
        1 => Ok((cla, ins, p1, p2, &rest[0..0], if rest[0] == 0 { 256 } else { rest[0] as usize })),
        n => {
            let lc = rest[0] as usize;
            if n == lc + 1 {
                Ok((cla, ins, p1, p2, &rest[1..], 0))
            } else if n == lc + 2 {
                let le_byte = rest[n - 1];
                let le = if le_byte == 0 { 256 } else { le_byte as usize };
                Ok((cla, ins, p1, p2, &rest[1..n - 1], le))
            } else {
                Err(GnukError::WrongLength)
            }
        }
    }
}

/// Stages a response body and pages it out across one or more `GET
/// RESPONSE` round-trips.
pub struct ResponseAssembler {
    buf: Vec<u8, MAX_RES_APDU_DATA_SIZE>,
    sent: usize,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        ResponseAssembler { buf: Vec::new(), sent: 0 }
    }

    /// Replaces the staged response with `data`, resetting the paging
    /// cursor to the start.
    pub fn stage(&mut self, data: &[u8]) -> Result<()> {
        self.buf.clear();
        self.buf.extend_from_slice(data).map_err(|_| GnukError::Fatal(FatalCause::FlashExhausted))?;
        self.sent = 0;
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.sent
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Copies up to `le` bytes (all remaining data if `le` is `0`, the
    /// ISO 7816 "as much as you have" convention) into `out`, returning
    /// the written slice and the status word to pair with it.
    pub fn take<'a>(&mut self, le: usize, out: &'a mut [u8]) -> (&'a [u8], u16) {
        let want = if le == 0 { self.remaining() } else { le.min(self.remaining()) };
        out[..want].copy_from_slice(&self.buf[self.sent..self.sent + want]);
        self.sent += want;
        let left = self.remaining();
        let sw = if left == 0 { SW_SUCCESS } else { 0x6100 | (left.min(0xff) as u16) };
        (&out[..want], sw)
    }
}

impl Default for ResponseAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchained_command_completes_immediately() {
        let mut asm = CommandAssembler::new();
        let cmd = asm.feed(0x00, 0x20, 0x00, 0x81, b"123456", 0).unwrap().unwrap();
        assert_eq!(cmd.cla, 0x00);
        assert_eq!(cmd.len, 6);
        assert_eq!(asm.data(), b"123456");
    }

    #[test]
    fn chained_command_assembles_across_links() {
        let mut asm = CommandAssembler::new();
        assert!(asm.feed(0x10, 0xda, 0x00, 0x5b, b"Ali", 0).unwrap().is_none());
        let cmd = asm.feed(0x00, 0xda, 0x00, 0x5b, b"ce", 0).unwrap().unwrap();
        assert_eq!(cmd.ins, 0xda);
        assert_eq!(asm.data(), b"Alice");
    }

    #[test]
    fn mismatched_continuation_header_aborts_chain() {
        let mut asm = CommandAssembler::new();
        asm.feed(0x10, 0xda, 0x00, 0x5b, b"Ali", 0).unwrap();
        let err = asm.feed(0x00, 0xda, 0x00, 0x5e, b"ce", 0).unwrap_err();
        assert_eq!(err, GnukError::WrongLength);
        assert!(asm.data().is_empty());
    }

    #[test]
    fn response_pages_over_multiple_get_response_calls() {
        let mut resp = ResponseAssembler::new();
        let body: Vec<u8, 300> = (0..=255u8).cycle().take(300).collect();
        resp.stage(&body).unwrap();

        let mut out = [0u8; 256];
        let (chunk, sw) = resp.take(256, &mut out);
        assert_eq!(chunk.len(), 256);
        assert_eq!(sw, 0x6100 | 44);

        let mut out2 = [0u8; 64];
        let (chunk2, sw2) = resp.take(0, &mut out2);
        assert_eq!(chunk2.len(), 44);
        assert_eq!(sw2, SW_SUCCESS);
        assert!(resp.is_empty());
    }

    #[test]
    fn parse_short_apdu_covers_all_four_cases() {
        assert_eq!(parse_short_apdu(&[0x00, 0x20, 0x00, 0x81]).unwrap(), (0x00, 0x20, 0x00, 0x81, &b""[..], 0));
        assert_eq!(parse_short_apdu(&[0x00, 0x20, 0x00, 0x81, 0x06]).unwrap().5, 6);
        let (cla, ins, p1, p2, data, le) = parse_short_apdu(&[0x00, 0x20, 0x00, 0x81, 0x02, 0x31, 0x32]).unwrap();
        assert_eq!((cla, ins, p1, p2, data, le), (0x00, 0x20, 0x00, 0x81, &b"12"[..], 0));
        let (_, _, _, _, data, le) = parse_short_apdu(&[0x00, 0xb0, 0x00, 0x00, 0x02, 0x31, 0x32, 0x00]).unwrap();
        assert_eq!(data, b"12");
        assert_eq!(le, 256);
    }

    #[test]
    fn sw_mapping_covers_pin_failed_retries() {
        assert_eq!(sw_for_error(GnukError::PinFailed { remaining: 2 }), 0x63c2);
        assert_eq!(sw_for_error(GnukError::AuthBlocked), 0x6983);
    }
}
