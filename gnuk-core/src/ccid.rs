//! CCID/ICCD message framing.
//!
//! Grounded on `usb-icc.c`: a `PC_to_RDR` message is a fixed 10-byte header
//! (`msg_type`, little-endian `data_len`, `slot`, `seq`, 3 message-specific
//! bytes) optionally followed by `data_len` bytes of payload; a `RDR_to_PC`
//! reply has the same header shape with `bStatus`/`bError`/`bChainParameter`
//! in place of the 3 trailing request bytes. This module only turns bytes
//! into [`Message`]s and builds reply bytes; USB bulk-packet transport is
//! [`crate::gnuk_hal::UsbTransport`]'s job (a separate crate) and ISO 7816
//! command chaining/response paging is [`crate::apdu`]'s — both live above
//! this one, in [`crate::card`].

use crate::constants::{ATR_PREFIX, HISTORICAL_BYTES};
use crate::{FatalCause, GnukError, Result};

pub const ICC_MSG_HEADER_SIZE: usize = 10;

// Message types, PC_to_RDR (incoming).
pub const ICC_SET_PARAMS: u8 = 0x61;
pub const ICC_POWER_ON: u8 = 0x62;
pub const ICC_POWER_OFF: u8 = 0x63;
pub const ICC_SLOT_STATUS: u8 = 0x65;
pub const ICC_SECURE: u8 = 0x69;
pub const ICC_GET_PARAMS: u8 = 0x6c;
pub const ICC_XFR_BLOCK: u8 = 0x6f;

// Message types, RDR_to_PC (outgoing).
pub const ICC_DATA_BLOCK_RET: u8 = 0x80;
pub const ICC_SLOT_STATUS_RET: u8 = 0x81;
pub const ICC_PARAMS_RET: u8 = 0x82;

/// `bStatus` low bits: ICC run state.
pub const ICC_STATUS_RUN: u8 = 0x00;
pub const ICC_STATUS_PRESENT: u8 = 0x01;
pub const ICC_STATUS_NOTPRESENT: u8 = 0x02;

/// `bStatus` high bits: command outcome.
pub const ICC_CMD_STATUS_OK: u8 = 0x00;
pub const ICC_CMD_STATUS_ERROR: u8 = 0x40;
pub const ICC_CMD_STATUS_TIMEEXT: u8 = 0x80;

pub const ICC_ERROR_XFR_OVERRUN: u8 = 0xfc;

/// Total ATR length: fixed prefix, historical bytes, one TCK checksum byte.
pub const ATR_LEN: usize = ATR_PREFIX.len() + HISTORICAL_BYTES.len() + 1;

/// Builds the card's ATR: the fixed prefix and historical bytes from
/// `constants`, followed by a TCK that makes the XOR of every byte from
/// `T0` onward equal zero (`SPEC_FULL.md` §6).
pub fn build_atr() -> [u8; ATR_LEN] {
    let mut atr = [0u8; ATR_LEN];
    atr[..ATR_PREFIX.len()].copy_from_slice(&ATR_PREFIX);
    atr[ATR_PREFIX.len()..ATR_PREFIX.len() + HISTORICAL_BYTES.len()].copy_from_slice(&HISTORICAL_BYTES);
    let tck = atr[1..ATR_LEN - 1].iter().fold(0u8, |acc, &b| acc ^ b);
    atr[ATR_LEN - 1] = tck;
    atr
}

/// A parsed 10-byte `PC_to_RDR` header.
struct Header {
    msg_type: u8,
    data_len: u32,
    slot: u8,
    seq: u8,
}

fn parse_header(raw: &[u8]) -> Result<Header> {
    if raw.len() < ICC_MSG_HEADER_SIZE {
        return Err(GnukError::WrongLength);
    }
    Ok(Header {
        msg_type: raw[0],
        data_len: u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]),
        slot: raw[5],
        seq: raw[6],
    })
}

/// A decoded incoming CCID message, carrying just enough to build the
/// matching reply and, for [`Message::XfrBlock`], the embedded command
/// APDU bytes for [`crate::apdu::parse_short_apdu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message<'a> {
    PowerOn { seq: u8, slot: u8 },
    PowerOff { seq: u8, slot: u8 },
    SlotStatus { seq: u8, slot: u8 },
    XfrBlock { seq: u8, slot: u8, payload: &'a [u8] },
}

/// Tracks the one piece of CCID-level state that affects every reply's
/// status byte: whether the card has been powered on.
#[derive(Debug, Default)]
pub struct Ccid {
    powered: bool,
}

impl Ccid {
    pub fn new() -> Self {
        Ccid { powered: false }
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    /// `bStatus`'s low bits for the current state: `RUN` once powered on,
    /// `PRESENT` (inserted but not activated) otherwise. This firmware
    /// never reports `NOTPRESENT` — the card is always present.
    pub fn icc_status_bits(&self) -> u8 {
        if self.powered { ICC_STATUS_RUN } else { ICC_STATUS_PRESENT }
    }

    /// Decodes one raw `PC_to_RDR` message. `ICC_XFR_BLOCK` is rejected with
    /// `ConditionsNotSatisfied` while unpowered, matching the requirement
    /// that a reader send `IccPowerOn` before any APDU exchange.
    pub fn handle<'a>(&mut self, raw: &'a [u8]) -> Result<Message<'a>> {
        let h = parse_header(raw)?;
        match h.msg_type {
            ICC_POWER_ON => {
                self.powered = true;
                Ok(Message::PowerOn { seq: h.seq, slot: h.slot })
            }
            ICC_POWER_OFF => {
                self.powered = false;
                Ok(Message::PowerOff { seq: h.seq, slot: h.slot })
            }
            ICC_SLOT_STATUS => Ok(Message::SlotStatus { seq: h.seq, slot: h.slot }),
            ICC_XFR_BLOCK => {
                if !self.powered {
                    return Err(GnukError::ConditionsNotSatisfied);
                }
                let len = h.data_len as usize;
                let end = ICC_MSG_HEADER_SIZE.checked_add(len).ok_or(GnukError::WrongLength)?;
                if raw.len() < end {
                    return Err(GnukError::WrongLength);
                }
                Ok(Message::XfrBlock { seq: h.seq, slot: h.slot, payload: &raw[ICC_MSG_HEADER_SIZE..end] })
            }
            ICC_SET_PARAMS | ICC_GET_PARAMS | ICC_SECURE => Err(GnukError::InsNotSupported),
            _ => Err(GnukError::InsNotSupported),
        }
    }
}

fn write_header(out: &mut [u8], msg_type: u8, data_len: u32, slot: u8, seq: u8, b7: u8, b8: u8, b9: u8) -> Result<()> {
    if out.len() < ICC_MSG_HEADER_SIZE {
        return Err(GnukError::Fatal(FatalCause::FlashExhausted));
    }
    out[0] = msg_type;
    out[1..5].copy_from_slice(&data_len.to_le_bytes());
    out[5] = slot;
    out[6] = seq;
    out[7] = b7;
    out[8] = b8;
    out[9] = b9;
    Ok(())
}

/// Builds an `RDR_to_PC_DataBlock` carrying `payload` (the ATR on power-on,
/// or a response APDU's bytes for an `XfrBlock` reply).
pub fn build_data_block(seq: u8, slot: u8, icc_status: u8, cmd_status: u8, payload: &[u8], out: &mut [u8]) -> Result<usize> {
    let total = ICC_MSG_HEADER_SIZE.checked_add(payload.len()).ok_or(GnukError::WrongLength)?;
    if out.len() < total {
        return Err(GnukError::Fatal(FatalCause::FlashExhausted));
    }
    write_header(out, ICC_DATA_BLOCK_RET, payload.len() as u32, slot, seq, icc_status | cmd_status, 0, 0)?;
    out[ICC_MSG_HEADER_SIZE..total].copy_from_slice(payload);
    Ok(total)
}

/// Builds an `RDR_to_PC_SlotStatus` with no payload.
pub fn build_slot_status(seq: u8, slot: u8, icc_status: u8, cmd_status: u8, out: &mut [u8]) -> Result<usize> {
    write_header(out, ICC_SLOT_STATUS_RET, 0, slot, seq, icc_status | cmd_status, 0, 0)?;
    Ok(ICC_MSG_HEADER_SIZE)
}

/// Builds an `RDR_to_PC_SlotStatus` reporting a command-level error, e.g. a
/// malformed `XfrBlock` or a read overrunning the buffer.
pub fn build_error(seq: u8, slot: u8, icc_status: u8, error_code: u8, out: &mut [u8]) -> Result<usize> {
    write_header(out, ICC_SLOT_STATUS_RET, 0, slot, seq, icc_status | ICC_CMD_STATUS_ERROR, error_code, 0)?;
    Ok(ICC_MSG_HEADER_SIZE)
}

/// Builds the power-on reply: a data block carrying the ATR.
pub fn build_power_on_reply(seq: u8, slot: u8, out: &mut [u8]) -> Result<usize> {
    build_data_block(seq, slot, ICC_STATUS_RUN, ICC_CMD_STATUS_OK, &build_atr(), out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atr_checksum_xors_to_zero() {
        let atr = build_atr();
        let x = atr[1..].iter().fold(0u8, |acc, &b| acc ^ b);
        assert_eq!(x, 0);
        assert_eq!(atr[0], 0x3b);
    }

    #[test]
    fn power_on_then_xfr_block_round_trip() {
        let mut ccid = Ccid::new();
        assert!(!ccid.is_powered());

        let mut power_on_msg = [0u8; ICC_MSG_HEADER_SIZE];
        write_header(&mut power_on_msg, ICC_POWER_ON, 0, 0, 7, 0, 0, 0).unwrap();
        match ccid.handle(&power_on_msg).unwrap() {
            Message::PowerOn { seq, slot } => {
                assert_eq!(seq, 7);
                assert_eq!(slot, 0);
            }
            _ => panic!("expected PowerOn"),
        }
        assert!(ccid.is_powered());

        let mut out = [0u8; ICC_MSG_HEADER_SIZE + ATR_LEN];
        let n = build_power_on_reply(7, 0, &mut out).unwrap();
        assert_eq!(n, ICC_MSG_HEADER_SIZE + ATR_LEN);
        assert_eq!(out[0], ICC_DATA_BLOCK_RET);
        assert_eq!(&out[ICC_MSG_HEADER_SIZE..n], &build_atr()[..]);

        let apdu_bytes = [0x00u8, 0x20, 0x00, 0x81, 0x06, b'1', b'2', b'3', b'4', b'5', b'6'];
        let mut xfr = [0u8; ICC_MSG_HEADER_SIZE + 11];
        write_header(&mut xfr, ICC_XFR_BLOCK, 11, 0, 8, 0, 0, 0).unwrap();
        xfr[ICC_MSG_HEADER_SIZE..].copy_from_slice(&apdu_bytes);
        match ccid.handle(&xfr).unwrap() {
            Message::XfrBlock { seq, payload, .. } => {
                assert_eq!(seq, 8);
                assert_eq!(payload, &apdu_bytes[..]);
            }
            _ => panic!("expected XfrBlock"),
        }
    }

    #[test]
    fn xfr_block_before_power_on_is_rejected() {
        let mut ccid = Ccid::new();
        let mut xfr = [0u8; ICC_MSG_HEADER_SIZE];
        write_header(&mut xfr, ICC_XFR_BLOCK, 0, 0, 1, 0, 0, 0).unwrap();
        assert_eq!(ccid.handle(&xfr).unwrap_err(), GnukError::ConditionsNotSatisfied);
    }

    #[test]
    fn slot_status_reflects_power_state() {
        let mut ccid = Ccid::new();
        assert_eq!(ccid.icc_status_bits(), ICC_STATUS_PRESENT);

        let mut power_on_msg = [0u8; ICC_MSG_HEADER_SIZE];
        write_header(&mut power_on_msg, ICC_POWER_ON, 0, 0, 0, 0, 0, 0).unwrap();
        ccid.handle(&power_on_msg).unwrap();
        assert_eq!(ccid.icc_status_bits(), ICC_STATUS_RUN);

        let mut out = [0u8; ICC_MSG_HEADER_SIZE];
        let n = build_slot_status(3, 0, ccid.icc_status_bits(), ICC_CMD_STATUS_OK, &mut out).unwrap();
        assert_eq!(n, ICC_MSG_HEADER_SIZE);
        assert_eq!(out[7], ICC_STATUS_RUN);
    }

    #[test]
    fn power_off_resets_status_and_is_reported() {
        let mut ccid = Ccid::new();
        let mut on = [0u8; ICC_MSG_HEADER_SIZE];
        write_header(&mut on, ICC_POWER_ON, 0, 0, 0, 0, 0, 0).unwrap();
        ccid.handle(&on).unwrap();

        let mut off = [0u8; ICC_MSG_HEADER_SIZE];
        write_header(&mut off, ICC_POWER_OFF, 0, 0, 9, 0, 0, 0).unwrap();
        match ccid.handle(&off).unwrap() {
            Message::PowerOff { seq, .. } => assert_eq!(seq, 9),
            _ => panic!("expected PowerOff"),
        }
        assert!(!ccid.is_powered());
    }

    #[test]
    fn unknown_message_type_is_not_supported() {
        let mut ccid = Ccid::new();
        let mut raw = [0u8; ICC_MSG_HEADER_SIZE];
        write_header(&mut raw, 0xee, 0, 0, 0, 0, 0, 0).unwrap();
        assert_eq!(ccid.handle(&raw).unwrap_err(), GnukError::InsNotSupported);
    }

    #[test]
    fn truncated_xfr_block_payload_is_wrong_length() {
        let mut ccid = Ccid::new();
        let mut on = [0u8; ICC_MSG_HEADER_SIZE];
        write_header(&mut on, ICC_POWER_ON, 0, 0, 0, 0, 0, 0).unwrap();
        ccid.handle(&on).unwrap();

        let mut xfr = [0u8; ICC_MSG_HEADER_SIZE + 2];
        write_header(&mut xfr, ICC_XFR_BLOCK, 10, 0, 1, 0, 0, 0).unwrap();
        assert_eq!(ccid.handle(&xfr).unwrap_err(), GnukError::WrongLength);
    }

    #[test]
    fn build_error_sets_error_status_bit() {
        let mut out = [0u8; ICC_MSG_HEADER_SIZE];
        build_error(4, 0, ICC_STATUS_RUN, ICC_ERROR_XFR_OVERRUN, &mut out).unwrap();
        assert_eq!(out[0], ICC_SLOT_STATUS_RET);
        assert_eq!(out[7], ICC_STATUS_RUN | ICC_CMD_STATUS_ERROR);
        assert_eq!(out[8], ICC_ERROR_XFR_OVERRUN);
    }
}
