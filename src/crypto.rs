//
// Hashing, keyed derivation, and authenticated encryption primitives.
//
// `ring` is used for everything it covers (PBKDF2, SHA-256, HMAC, CSPRNG,
// constant-time compare). AES-GCM is the one exception: `ring::aead` pins
// AES-GCM to a 12-byte nonce, but the MitID wire protocol uses 16, so that
// piece is built on the RustCrypto `aes-gcm` crate instead.

use aes_gcm::aead::{generic_array::GenericArray, AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::AesGcm;
use data_encoding::{BASE64, HEXLOWER};
use ring::{digest, hmac, pbkdf2};
use std::num::NonZeroU32;

use crate::err_sentinel;
use crate::error::Error;

/// `ring::aead` pins AES-GCM to a 12-byte nonce; the MitID wire protocol
/// calls for 16, so this instantiates the RustCrypto cipher directly over a
/// `U16` nonce size instead of using the crate's `Aes256Gcm` 12-byte alias.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

pub const GCM_NONCE_LEN: usize = 16;
const GCM_TAG_LEN: usize = 16;

/// `nonce ‖ ciphertext ‖ tag`, base64-encoded.
pub fn aes_gcm_encrypt(plaintext: &[u8], key: &[u8; 32]) -> Result<String, Error> {
    let nonce_bytes = get_random::<GCM_NONCE_LEN>();
    let cipher = Aes256Gcm16::new(GenericArray::from_slice(key));
    let nonce = GenericArray::from_slice(&nonce_bytes);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(nonce, b"", &mut buffer)
        .map_err(|_| Error::CryptoError(crate::error::Sentinel("CryptoError"), "encrypt failed".into()))?;

    let mut out = Vec::with_capacity(GCM_NONCE_LEN + buffer.len() + GCM_TAG_LEN);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&buffer);
    out.extend_from_slice(tag.as_slice());

    Ok(BASE64.encode(&out))
}

pub fn aes_gcm_decrypt(encoded: &str, key: &[u8; 32]) -> Result<Vec<u8>, Error> {
    let data = BASE64
        .decode(encoded.as_bytes())
        .map_err(|_| Error::CryptoError(crate::error::Sentinel("CryptoError"), "invalid base64".into()))?;
    aes_gcm_decrypt_bytes(&data, key)
}

pub fn aes_gcm_decrypt_bytes(data: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, Error> {
    if data.len() < GCM_NONCE_LEN + GCM_TAG_LEN {
        err_sentinel!(CryptoError, "ciphertext too short");
    }

    let (nonce_bytes, rest) = data.split_at(GCM_NONCE_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - GCM_TAG_LEN);

    let cipher = Aes256Gcm16::new(GenericArray::from_slice(key));
    let nonce = GenericArray::from_slice(nonce_bytes);

    let mut buffer = ciphertext.to_vec();
    let tag = GenericArray::clone_from_slice(tag);
    cipher
        .decrypt_in_place_detached(nonce, b"", &mut buffer, &tag)
        .map_err(|_| Error::CryptoError(crate::error::Sentinel("CryptoError"), "tag mismatch".into()))?;

    Ok(buffer)
}

//
// PBKDF2-HMAC-SHA256
//
static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;
const PBKDF2_ITERATIONS: u32 = 20_000;
const PBKDF2_OUTPUT_LEN: usize = digest::SHA256_OUTPUT_LEN;

pub fn pbkdf2_hmac_sha256(secret: &[u8], salt_hex: &str) -> Result<[u8; PBKDF2_OUTPUT_LEN], Error> {
    let salt = HEXLOWER.decode(salt_hex.to_lowercase().as_bytes()).map_err(|_| {
        crate::error::Error::CryptoError(crate::error::Sentinel("CryptoError"), "invalid hex salt".into())
    })?;

    let mut out = [0u8; PBKDF2_OUTPUT_LEN];
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).expect("PBKDF2_ITERATIONS is non-zero");
    pbkdf2::derive(PBKDF2_ALG, iterations, &salt, secret, &mut out);
    Ok(out)
}

//
// SHA-256 / HMAC-SHA-256
//
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = digest::digest(&digest::SHA256, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

pub fn sha256_hex(data: &[u8]) -> String {
    HEXLOWER.encode(&sha256(data))
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let signature = hmac::sign(&key, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(signature.as_ref());
    out
}

pub fn hmac_sha256_hex(key: &[u8], data: &[u8]) -> String {
    HEXLOWER.encode(&hmac_sha256(key, data))
}

//
// SRP-derived key helpers
//
/// `pin_key = SHA256( hex(K) ‖ "PIN" )`
pub fn pin_key(session_key: &[u8]) -> [u8; 32] {
    let mut buf = HEXLOWER.encode(session_key).into_bytes();
    buf.extend_from_slice(b"PIN");
    sha256(&buf)
}

/// `proof_key(prefix) = SHA256( prefix ‖ hex(K) )`
pub fn proof_key(prefix: &str, session_key: &[u8]) -> [u8; 32] {
    let mut buf = prefix.as_bytes().to_vec();
    buf.extend_from_slice(HEXLOWER.encode(session_key).as_bytes());
    sha256(&buf)
}

//
// Random values
//
pub fn get_random<const N: usize>() -> [u8; N] {
    use ring::rand::{SecureRandom, SystemRandom};
    let mut array = [0u8; N];
    SystemRandom::new().fill(&mut array).expect("OS CSPRNG failure");
    array
}

pub fn encode_random_bytes<const N: usize>(encoding: &'static data_encoding::Encoding) -> String {
    encoding.encode(&get_random::<N>())
}

//
// PKCS#7 padding — legacy TOKEN flows only; the APP flow never pads.
//
pub fn pkcs7_pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let pad_len = block_size - (data.len() % block_size);
    let mut out = data.to_vec();
    out.extend(std::iter::repeat(pad_len as u8).take(pad_len));
    out
}

pub fn pkcs7_unpad(data: &[u8]) -> Result<Vec<u8>, Error> {
    let Some(&pad_len) = data.last() else {
        err_sentinel!(CryptoError, "empty input");
    };
    let pad_len = pad_len as usize;
    if pad_len == 0 || pad_len > data.len() {
        err_sentinel!(CryptoError, "invalid padding");
    }
    if !data[data.len() - pad_len..].iter().all(|&b| b as usize == pad_len) {
        err_sentinel!(CryptoError, "invalid padding");
    }
    Ok(data[..data.len() - pad_len].to_vec())
}

//
// Constant-time compare
//
pub fn ct_eq<T: AsRef<[u8]>, U: AsRef<[u8]>>(a: T, b: U) -> bool {
    use ring::constant_time::verify_slices_are_equal;
    verify_slices_are_equal(a.as_ref(), b.as_ref()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_gcm_round_trip() {
        let key = get_random::<32>();
        let plaintext = b"a reasonably long plaintext payload for GCM";
        let ciphertext_b64 = aes_gcm_encrypt(plaintext, &key).unwrap();
        let raw = BASE64.decode(ciphertext_b64.as_bytes()).unwrap();
        assert_eq!(raw.len(), GCM_NONCE_LEN + plaintext.len() + GCM_TAG_LEN);

        let decrypted = aes_gcm_decrypt(&ciphertext_b64, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn aes_gcm_bitflip_fails() {
        let key = get_random::<32>();
        let ciphertext_b64 = aes_gcm_encrypt(b"hello world", &key).unwrap();
        let mut raw = BASE64.decode(ciphertext_b64.as_bytes()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(&raw);

        assert!(aes_gcm_decrypt(&tampered, &key).is_err());
    }

    #[test]
    fn aes_gcm_rejects_short_input() {
        let key = get_random::<32>();
        let short = BASE64.encode(&[0u8; 10]);
        assert!(aes_gcm_decrypt(&short, &key).is_err());
    }

    #[test]
    fn sha256_vector() {
        assert_eq!(sha256_hex(b"test"), "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08");
    }

    #[test]
    fn hmac_sha256_vector() {
        let got = hmac_sha256_hex(b"key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(got, "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8");
    }

    #[test]
    fn pkcs7_round_trip() {
        let data = b"15byteslong....";
        let padded = pkcs7_pad(data, 16);
        assert_eq!(padded.last(), Some(&0x01));
        let unpadded = pkcs7_unpad(&padded).unwrap();
        assert_eq!(unpadded, data);
    }

    #[test]
    fn pkcs7_unpad_rejects_empty() {
        assert!(pkcs7_unpad(&[]).is_err());
    }

    #[test]
    fn proof_key_deterministic_and_prefix_sensitive() {
        let k = get_random::<32>();
        let a = proof_key("flowValues", &k);
        let b = proof_key("flowValues", &k);
        let c = proof_key("other", &k);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
