//! Protocol and flash-geometry constants.
//!
//! Split the way the teacher splits `constants.rs` (architecture-independent)
//! from `rbconstants.rs` (board-geometry): the first half of this file never
//! changes across chips; the flash geometry at the bottom is the set of
//! numbers a board integration is expected to override.

/// The fixed 6-byte OpenPGP application identifier prefix every AID must
/// match on `SELECT FILE` by name (`SPEC_FULL.md` §4.5).
pub const OPENPGP_AID_RID: [u8; 6] = [0xD2, 0x76, 0x00, 0x01, 0x24, 0x01];

/// Historical bytes appended after the fixed ATR prefix (`SPEC_FULL.md` §6).
pub const HISTORICAL_BYTES: [u8; 10] = [
    0x00, // category indicator
    0x31, 0x80, // DF full-name tag
    0x73, 0x80, 0x01, 0x80, // card capabilities
    0x00, 0x90, 0x00, // status info
];

/// Fixed ATR prefix, before historical bytes and checksum.
pub const ATR_PREFIX: [u8; 10] = [
    0x3B, 0xDA, 0x11, 0xFF, 0x81, 0xB1, 0xFE, 0x55, 0x1F, 0x03,
];

/// S2K iteration count used for on-card PW3 keystring derivation.
/// Intentionally much smaller than GnuPG's software default of 65536 — the
/// MCU cannot afford that many SHA-256 compressions per VERIFY.
pub const S2K_COUNT: u32 = 192;

pub const PW1_MIN_LEN: usize = 6;
pub const PW3_MIN_LEN: usize = 8;
pub const PW3_DEFAULT: &[u8] = b"12345678";

/// Minimum new-PW1 length enforced when no PW3 keystring exists ("admin-less"
/// mode, `SPEC_FULL.md` §4.3).
pub const PW1_ADMINLESS_MIN_LEN: usize = 8;

/// Counter value denoting a locked PIN in the 1-2-3 encoding.
pub const RETRY_LOCKED: u8 = 3;
pub const RETRY_INITIAL: u8 = 3;

pub const SHA1_DIGESTINFO_LEN: usize = 35;
pub const SHA224_DIGESTINFO_LEN: usize = 47;
pub const SHA256_DIGESTINFO_LEN: usize = 51;
pub const SHA384_DIGESTINFO_LEN: usize = 67;
pub const SHA512_DIGESTINFO_LEN: usize = 83;
pub const MD5_DIGESTINFO_LEN: usize = 34;

pub const RAW_HASH_LEN_ECDSA: usize = 32;
pub const MAX_EDDSA_INPUT_LEN: usize = 256;

/// Largest `DigestInfo` INTERNAL AUTHENTICATE will sign, matching the
/// original's `MAX_RSA_DIGEST_INFO_LEN` (`SPEC_FULL.md` §4.5).
pub const MAX_RSA_DIGEST_INFO_LEN: usize = 102;

/// GET CHALLENGE's fixed response size when Le doesn't ask for less.
pub const CHALLENGE_LEN: usize = 32;

/// Largest reassembled (possibly chained) command-APDU body this firmware
/// buffers: covers a KEY IMPORT template's 256-byte RSA `P`/`Q` components
/// plus TLV overhead (`SPEC_FULL.md` §4.4).
pub const MAX_CMD_APDU_DATA_SIZE: usize = 1024;
/// Largest response body staged for GET RESPONSE paging: covers a 256-byte
/// RSA signature or a 2048-bit public-key retrieval.
pub const MAX_RES_APDU_DATA_SIZE: usize = 1024;

/// Max size of one Data Object body this firmware will ever hold in the
/// pool (`SPEC_FULL.md` §3: "single DO size is less than 256").
pub const MAX_DO_LEN: usize = 255;

/// AES-128 key / IV sizes for the DEK ladder (`SPEC_FULL.md` §3).
pub const DEK_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const CHECKSUM_LEN: usize = 16;

/// Number of key roles: SIGNING, DECRYPTION, AUTHENTICATION.
pub const NUM_KEY_ROLES: usize = 3;

/// Number of distinct authorizers a DEK is re-wrapped under: PW1, RC, PW3.
pub const NUM_AUTHORIZERS: usize = 3;

/// Number of firmware-update authentication keys (`SPEC_FULL.md` §3,
/// supplement on the update-key table).
pub const NUM_UPDATE_KEYS: usize = 4;
pub const UPDATE_KEY_LEN: usize = 256;

// --- Flash geometry (board-specific; these are the STM32F103-class
//     defaults the original firmware shipped with) -----------------------

/// Size of one erasable flash page. 1 KiB on the low-density parts Gnuk
/// originally targeted; 2 KiB on higher-density parts (`SPEC_FULL.md` §6).
#[cfg(not(feature = "flash_page_2k"))]
pub const FLASH_PAGE_SIZE: usize = 1024;
#[cfg(feature = "flash_page_2k")]
pub const FLASH_PAGE_SIZE: usize = 2048;

/// The data pool is exactly two pages (`flash_store`, `SPEC_FULL.md` §4.1).
pub const DATA_POOL_PAGES: usize = 2;
pub const DATA_POOL_HEADER_SIZE: usize = 2;

/// Fixed-size key slot: large enough for a 2048-bit RSA key's `P`, `Q`, `N`.
pub const KEY_SLOT_SIZE: usize = 512;

/// Number of key slots per role page (`FLASH_PAGE_SIZE / KEY_SLOT_SIZE`,
/// rounded down — callers should assert this divides evenly for their
/// chosen page size).
pub const fn key_slots_per_page(page_size: usize) -> usize {
    page_size / KEY_SLOT_SIZE
}
