#![no_std]

//! Collaborator traits for the OpenPGP card core.
//!
//! Everything in this crate is a boundary, not an implementation: the board,
//! its USB PHY, its flash controller and its big-integer/elliptic-curve
//! arithmetic are all out of scope for `gnuk-core` (see `SPEC_FULL.md` §1)
//! and are reached only through the traits defined here. A host build can
//! satisfy them with plain `Vec<u8>`-backed fakes; a firmware build backs
//! them with real MCU drivers and, for the crypto boundary, either
//! [`soft_crypto::SoftCrypto`] or a hardware crypto coprocessor.
//!
//! [`soft_crypto::SoftCrypto`] needs a global allocator in scope wherever
//! it's actually linked in (`rsa`'s arbitrary-precision arithmetic can't
//! avoid heap allocation); the rest of this crate has no such requirement.

extern crate alloc;

pub mod soft_crypto;
pub use soft_crypto::SoftCrypto;

/// Abstracts the flash controller's half-word programming model.
///
/// A conforming implementation must uphold the constraint the whole of
/// `flash_store` is built around: a half-word can be programmed once from
/// `0xFFFF` to any value, and only an erase can turn a `0` bit back into a
/// `1`. `hal_flash_write` is never asked to set a bit that is currently `0`.
pub trait FlashInterface {
    /// Size, in bytes, of one erasable flash page on this chip (1 KiB or 2
    /// KiB depending on density — `SPEC_FULL.md` §6).
    fn page_size(&self) -> usize;

    /// Reads `len` bytes starting at `addr` into `out`.
    fn hal_flash_read(&self, addr: usize, out: &mut [u8]);

    /// Programs `data` at `addr`. `data.len()` must be even; callers program
    /// one half-word at a time conceptually, but may batch the call.
    fn hal_flash_write(&mut self, addr: usize, data: &[u8]) -> Result<(), FlashError>;

    /// Erases the page containing `addr`, restoring all bytes in that page
    /// to `0xFF`.
    fn hal_flash_erase_page(&mut self, addr: usize) -> Result<(), FlashError>;
}

/// A flash program or erase operation failed at the hardware level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashError;

/// The USB bulk/interrupt packet pump that `ccid` drives.
///
/// Framing, chaining and response paging all live in `gnuk-core`; this trait
/// only moves raw packets across the wire.
pub trait UsbTransport {
    /// Blocks (from the caller's perspective) until a bulk-OUT packet is
    /// available, then copies it into `buf` and returns its length.
    fn recv_bulk_out(&mut self, buf: &mut [u8]) -> usize;

    /// Queues `data` for transmission on the bulk-IN endpoint.
    fn send_bulk_in(&mut self, data: &[u8]);

    /// Sends a 2-byte `RDR_to_PC_NotifySlotChange` style notification on the
    /// interrupt-IN endpoint (`SPEC_FULL.md` §4.4, card removal/insertion
    /// signaling).
    fn send_interrupt_in(&mut self, data: &[u8; 2]);
}

/// The cryptographic collaborator boundary (`SPEC_FULL.md` §9): RSA-2048,
/// NIST P-256 ECDSA, Curve25519 ECDH and Ed25519 are opaque pure functions
/// over byte arrays as far as this crate is concerned.
///
/// Key material crosses this boundary already decrypted by the caller (the
/// DEK ladder in `ac`/`do_store` is this crate's responsibility, not the
/// provider's).
pub trait CryptoProvider {
    /// RSA-2048 signs a pre-built `DigestInfo` (PKCS#1 v1.5), returning the
    /// 256-byte signature.
    fn rsa_sign(&self, priv_key: &RsaPrivateComponents, digest_info: &[u8], out: &mut [u8]) -> Result<usize, CryptoError>;

    /// RSA-OAEP/PKCS1-less raw decryption of a ciphertext block (the card
    /// performs no padding scheme beyond what PSO:DECIPHER hands it,
    /// `SPEC_FULL.md` §4.5).
    fn rsa_decrypt(&self, priv_key: &RsaPrivateComponents, ciphertext: &[u8], out: &mut [u8]) -> Result<usize, CryptoError>;

    /// NIST P-256 ECDSA over a raw 32-byte hash, returning a 64-byte `r || s`
    /// signature.
    fn ecdsa_sign_p256(&self, priv_scalar: &[u8; 32], hash: &[u8; 32], out: &mut [u8; 64]) -> Result<(), CryptoError>;

    /// X25519 Diffie-Hellman; `peer_point` is the 32-byte Montgomery-form
    /// public key from the DECIPHER APDU.
    fn x25519_agree(&self, priv_scalar: &[u8; 32], peer_point: &[u8; 32], out: &mut [u8; 32]) -> Result<(), CryptoError>;

    /// Ed25519 signs up to 256 bytes of pre-hashed or raw message data
    /// (`SPEC_FULL.md` §4.5 PSO:CDS for Ed25519 keys).
    fn ed25519_sign(&self, priv_scalar: &[u8; 32], message: &[u8], out: &mut [u8; 64]) -> Result<(), CryptoError>;

    /// Verifies a PKCS#1 v1.5 RSA signature against a public key given only
    /// by its modulus (the fixed public exponent 65537 is assumed, matching
    /// every key this card ever registers). Used solely by EXTERNAL
    /// AUTHENTICATE to check a firmware-update signature against one of the
    /// card's registered update keys (`SPEC_FULL.md` §4.5); never touches
    /// card-held private key material.
    fn rsa_verify(&self, modulus: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError>;
}

/// The ADC/jitter-timer boundary the entropy pool (`rng`) samples from.
///
/// Split into two methods because the original firmware pulls from the two
/// hardware sources at different rates: eight ADC LSBs feed one pool
/// update, while the free-running-timer jitter bit is read anywhere from
/// one to four times per update (`SPEC_FULL.md` §4.6).
pub trait NoiseSource {
    /// Packs eight successive ADC least-significant-bit samples into one
    /// byte, one bit per channel read.
    fn sample_adc_bits(&mut self) -> u8;

    /// A single low-order bit of a free-running timer, used to decide
    /// whether to fold in extra pool taps. Safe to call any number of
    /// times per round.
    fn jitter_bit(&mut self) -> bool;
}

/// The plain (`P`, `Q`, public exponent `E`) components of an imported
/// RSA private key, as stored decrypted in a key slot.
#[derive(Debug, Clone, Copy)]
pub struct RsaPrivateComponents<'a> {
    pub e: &'a [u8],
    pub p: &'a [u8],
    pub q: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    InvalidKey,
    InvalidInput,
    OutputTooSmall,
}
