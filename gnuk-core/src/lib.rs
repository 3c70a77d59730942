#![cfg_attr(not(test), no_std)]
#![allow(non_snake_case)]

//! Firmware core of an ISO 7816 / OpenPGP v2 smart card exposed over USB as
//! a CCID device.
//!
//! Four subsystems, leaves first: [`flash_store`] (wear-aware persistent
//! storage), [`rng`] (ADC-driven entropy), [`do_store`] (the Data Object
//! tree built on `flash_store`), [`ac`] (PIN/access-control state), and the
//! transport/application layers [`apdu`], [`ccid`], [`openpgp_app`] that tie
//! them together into [`card::OpenPgpCard`].

pub mod ac;
pub mod apdu;
pub mod card;
pub mod ccid;
pub mod constants;
pub mod do_store;
pub mod flash_store;
pub mod keystore;
pub mod openpgp_app;
pub mod rng;
pub mod update_keys;

use core::fmt;

/// The crate-wide error type.
///
/// Variants above the `---` line are recoverable and map onto an ISO 7816
/// status word by [`apdu::sw_for_error`]; `Fatal` never does (`SPEC_FULL.md`
/// §7) and must be handled by the board-specific LED/reset driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GnukError {
    /// Le/Lc or field length did not match what the instruction expects.
    WrongLength,
    /// `ac_check` failed for the DO's or instruction's required flags.
    SecurityStatusNotSatisfied,
    /// GET DATA / SELECT FILE referenced a tag or file id that does not exist.
    ReferenceNotFound,
    FileNotFound,
    /// The PIN identified by the VERIFY/CHANGE request is locked (retry
    /// counter at 3).
    AuthBlocked,
    /// VERIFY failed; carries the remaining retry count for the `63Cx` SW.
    PinFailed { remaining: u8 },
    /// INS byte has no handler in the dispatch table.
    InsNotSupported,
    /// A request was well-formed but referred to data that isn't currently
    /// available (e.g. GET RESPONSE with no buffered tail).
    ConditionsNotSatisfied,
    /// Parameters P1/P2 are not valid for this instruction.
    IncorrectP1P2,
    /// A cryptographic operation failed (bad signature, bad key, etc).
    CryptoFailure,
    /// A single half-word program/erase failed outside of GC. Recoverable:
    /// the record being written is abandoned, but the pool/page it lives in
    /// is left in a consistent state.
    DoWriteError,

    /// Unrecoverable: persistent state could be corrupted if we proceeded.
    Fatal(FatalCause),
}

/// `SPEC_FULL.md` §7: conditions serious enough that continuing risks
/// corrupting persistent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalCause {
    /// Allocation failed even after copying GC reclaimed every released
    /// record.
    FlashExhausted,
    /// Copying GC itself could not complete (program/erase failure mid-GC).
    GcFailed,
    /// The RNG producer could not fill the ring buffer within budget.
    RngStarved,
}

pub type Result<T> = core::result::Result<T, GnukError>;

impl fmt::Display for GnukError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GnukError::WrongLength => write!(f, "wrong length"),
            GnukError::SecurityStatusNotSatisfied => write!(f, "security status not satisfied"),
            GnukError::ReferenceNotFound => write!(f, "referenced data object not found"),
            GnukError::FileNotFound => write!(f, "referenced file not found"),
            GnukError::AuthBlocked => write!(f, "PIN blocked"),
            GnukError::PinFailed { remaining } => {
                write!(f, "PIN verification failed, {} tries remaining", remaining)
            }
            GnukError::InsNotSupported => write!(f, "instruction not supported"),
            GnukError::ConditionsNotSatisfied => write!(f, "conditions of use not satisfied"),
            GnukError::IncorrectP1P2 => write!(f, "incorrect parameters P1-P2"),
            GnukError::CryptoFailure => write!(f, "cryptographic operation failed"),
            GnukError::DoWriteError => write!(f, "data object write error"),
            GnukError::Fatal(cause) => write!(f, "fatal error: {:?}", cause),
        }
    }
}
