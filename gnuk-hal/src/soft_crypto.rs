//! A software-only [`CryptoProvider`], backed by the same RustCrypto family
//! of crates the board firmware would use for the real thing: `rsa` for
//! RSA-2048, `p256` for NIST P-256 ECDSA, `x25519-dalek` for Curve25519 ECDH
//! and `ed25519-dalek` for Ed25519. Grounded on `call-rsa.c`/`rsa-sign.c`'s
//! P/Q/E-to-context reconstruction (`N = P*Q`, `D = E^-1 mod (P-1)(Q-1)`) and
//! on `rbsigner`'s `p256::ecdsa` usage (`rbsigner/src/curve.rs`,
//! `rbsigner/src/mcusigner.rs`) for the ECDSA signing shape.
//!
//! Good enough to stand in for a hardware crypto block in tests and in a
//! host build; a real MCU port would more likely wire `CryptoProvider`
//! straight to a crypto coprocessor and never touch this module.

use alloc::vec;
use alloc::vec::Vec;

use ed25519_dalek::Signer as _;
use p256::ecdsa::signature::digest::{Digest, FixedOutputDirty, Reset, Update};
use p256::ecdsa::signature::{DigestSigner, Signer as _};
use p256::elliptic_curve::consts::U32;
use p256::elliptic_curve::generic_array::GenericArray;
use rsa::pkcs1v15::Pkcs1v15Sign;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::{CryptoError, CryptoProvider, RsaPrivateComponents};

/// No state: every method rebuilds its key from the bytes it's handed.
pub struct SoftCrypto;

impl CryptoProvider for SoftCrypto {
    fn rsa_sign(&self, priv_key: &RsaPrivateComponents, digest_info: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
        let key = rsa_private_key(priv_key)?;
        let signature = key
            .sign(Pkcs1v15Sign::new_unprefixed(), digest_info)
            .map_err(|_| CryptoError::InvalidInput)?;
        write_out(&signature, out)
    }

    fn rsa_decrypt(&self, priv_key: &RsaPrivateComponents, ciphertext: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
        let p = BigUint::from_bytes_be(priv_key.p);
        let q = BigUint::from_bytes_be(priv_key.q);
        let e = BigUint::from_bytes_be(priv_key.e);
        let n = &p * &q;
        let d = rsa_private_exponent(&p, &q, &e)?;
        let c = BigUint::from_bytes_be(ciphertext);
        if c >= n {
            return Err(CryptoError::InvalidInput);
        }
        let m = c.modpow(&d, &n);
        write_out(&m.to_bytes_be(), out)
    }

    fn ecdsa_sign_p256(&self, priv_scalar: &[u8; 32], hash: &[u8; 32], out: &mut [u8; 64]) -> Result<(), CryptoError> {
        let signing_key = p256::ecdsa::SigningKey::from_bytes(priv_scalar).map_err(|_| CryptoError::InvalidKey)?;
        let digest = PrehashedSha256(*hash);
        let signature: p256::ecdsa::Signature =
            signing_key.try_sign_digest(digest).map_err(|_| CryptoError::InvalidInput)?;
        out.copy_from_slice(&signature.to_bytes());
        Ok(())
    }

    fn x25519_agree(&self, priv_scalar: &[u8; 32], peer_point: &[u8; 32], out: &mut [u8; 32]) -> Result<(), CryptoError> {
        let secret = x25519_dalek::StaticSecret::from(*priv_scalar);
        let peer = x25519_dalek::PublicKey::from(*peer_point);
        out.copy_from_slice(secret.diffie_hellman(&peer).as_bytes());
        Ok(())
    }

    fn ed25519_sign(&self, priv_scalar: &[u8; 32], message: &[u8], out: &mut [u8; 64]) -> Result<(), CryptoError> {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(priv_scalar);
        out.copy_from_slice(&signing_key.sign(message).to_bytes());
        Ok(())
    }

    fn rsa_verify(&self, modulus: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let n = BigUint::from_bytes_be(modulus);
        let e = BigUint::from_bytes_be(&[0x01, 0x00, 0x01]);
        let pubkey = RsaPublicKey::new(n, e).map_err(|_| CryptoError::InvalidKey)?;
        pubkey
            .verify(Pkcs1v15Sign::new::<Sha256>(), message, signature)
            .map_err(|_| CryptoError::InvalidInput)
    }
}

fn write_out(data: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
    if data.len() > out.len() {
        return Err(CryptoError::OutputTooSmall);
    }
    out[..data.len()].copy_from_slice(data);
    Ok(data.len())
}

fn rsa_private_key(priv_key: &RsaPrivateComponents) -> Result<RsaPrivateKey, CryptoError> {
    let p = BigUint::from_bytes_be(priv_key.p);
    let q = BigUint::from_bytes_be(priv_key.q);
    let e = BigUint::from_bytes_be(priv_key.e);
    let n = &p * &q;
    let d = rsa_private_exponent(&p, &q, &e)?;
    RsaPrivateKey::from_components(n, e, d, vec![p, q]).map_err(|_| CryptoError::InvalidKey)
}

/// `D = E^-1 mod (P-1)(Q-1)`, the same reconstruction `rsa-sign.c` does with
/// `mpi_inv_mod` before every signature: this card only ever stores P, Q and
/// E, never D.
fn rsa_private_exponent(p: &BigUint, q: &BigUint, e: &BigUint) -> Result<BigUint, CryptoError> {
    let one = BigUint::from(1u32);
    let phi = (p - &one) * (q - &one);
    mod_inverse(e, &phi).ok_or(CryptoError::InvalidKey)
}

/// Extended Euclidean algorithm, tracking the Bezout coefficient's sign by
/// hand so everything stays in unsigned `BigUint` arithmetic.
fn mod_inverse(a: &BigUint, modulus: &BigUint) -> Option<BigUint> {
    let zero = BigUint::from(0u32);
    let one = BigUint::from(1u32);

    let mut old_r = a.clone();
    let mut r = modulus.clone();
    let mut old_s = (one.clone(), false);
    let mut s = (zero.clone(), false);

    while r != zero {
        let q = &old_r / &r;
        let new_r = &old_r - &q * &r;
        old_r = core::mem::replace(&mut r, new_r);

        let qs = (&q * &s.0, s.1);
        let new_s = signed_sub(&old_s, &qs);
        old_s = core::mem::replace(&mut s, new_s);
    }

    if old_r != one {
        return None;
    }
    let (mag, neg) = old_s;
    let mag = &mag % modulus;
    if neg && mag != zero {
        Some(modulus - mag)
    } else {
        Some(mag)
    }
}

fn signed_sub(a: &(BigUint, bool), b: &(BigUint, bool)) -> (BigUint, bool) {
    signed_add(a, &(b.0.clone(), !b.1))
}

fn signed_add(a: &(BigUint, bool), b: &(BigUint, bool)) -> (BigUint, bool) {
    if a.1 == b.1 {
        (&a.0 + &b.0, a.1)
    } else if a.0 >= b.0 {
        (&a.0 - &b.0, a.1)
    } else {
        (&b.0 - &a.0, b.1)
    }
}

/// Wraps an already-computed 32-byte hash so it can be handed to
/// [`DigestSigner`] without re-hashing: `ecdsa_sign_p256` receives the raw
/// hash, not a message, so `update` has nothing left to absorb and
/// `finalize` just returns the stored bytes. Mirrors `rbsigner`'s own
/// `prehashed_digest` pattern (`rbsigner/src/mcusigner.rs`).
#[derive(Clone, Default)]
struct PrehashedSha256([u8; 32]);

impl Update for PrehashedSha256 {
    fn update(&mut self, _data: impl AsRef<[u8]>) {}
}

impl FixedOutputDirty for PrehashedSha256 {
    type OutputSize = U32;

    fn finalize_into_dirty(&mut self, out: &mut GenericArray<u8, U32>) {
        out.copy_from_slice(&self.0);
    }
}

impl Reset for PrehashedSha256 {
    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mod_inverse_matches_known_small_case() {
        // e=3, phi=40 (p=5,q=11 style toy numbers): 3*27 = 81 = 2*40+1.
        let e = BigUint::from(3u32);
        let phi = BigUint::from(40u32);
        let d = mod_inverse(&e, &phi).unwrap();
        assert_eq!(d, BigUint::from(27u32));
        assert_eq!((&e * &d) % &phi, BigUint::from(1u32));
    }

    #[test]
    fn x25519_agree_is_symmetric() {
        let alice_sk = [0x11u8; 32];
        let bob_sk = [0x22u8; 32];
        let alice_pk = *x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(alice_sk)).as_bytes();
        let bob_pk = *x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(bob_sk)).as_bytes();

        let crypto = SoftCrypto;
        let mut shared_alice = [0u8; 32];
        let mut shared_bob = [0u8; 32];
        crypto.x25519_agree(&alice_sk, &bob_pk, &mut shared_alice).unwrap();
        crypto.x25519_agree(&bob_sk, &alice_pk, &mut shared_bob).unwrap();
        assert_eq!(shared_alice, shared_bob);
    }

    #[test]
    fn ed25519_sign_produces_a_stable_signature() {
        let sk = [0x42u8; 32];
        let crypto = SoftCrypto;
        let mut sig_a = [0u8; 64];
        let mut sig_b = [0u8; 64];
        crypto.ed25519_sign(&sk, b"hello", &mut sig_a).unwrap();
        crypto.ed25519_sign(&sk, b"hello", &mut sig_b).unwrap();
        assert_eq!(sig_a, sig_b);
    }

    #[test]
    fn rsa_sign_then_verify_round_trips_through_the_public_key() {
        // A small (not 2048-bit) toy key, two Mersenne primes, large enough
        // that a 4-byte unprefixed "digest info" still fits PKCS#1 v1.5
        // padding, to exercise the P/Q/E -> D reconstruction path cheaply.
        let p = BigUint::from(2305843009213693951u64); // 2^61 - 1
        let q = BigUint::parse_bytes(b"618970019642690137449562111", 10).unwrap(); // 2^89 - 1
        let n = &p * &q;
        let priv_key = RsaPrivateComponents { e: &[0x01, 0x00, 0x01], p: &p.to_bytes_be(), q: &q.to_bytes_be() };

        let crypto = SoftCrypto;
        let digest_info = [0x2au8; 4];
        let mut sig = [0u8; 64];
        let n_len = crypto.rsa_sign(&priv_key, &digest_info, &mut sig).unwrap();

        let pubkey = RsaPublicKey::new(n, BigUint::from(65537u32)).unwrap();
        pubkey.verify(Pkcs1v15Sign::new_unprefixed(), &digest_info, &sig[..n_len]).unwrap();
    }
}
