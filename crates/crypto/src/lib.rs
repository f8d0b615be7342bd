#![deny(unsafe_code)]

//! Payload encryption and credential hashing.
//!
//! Two independent jobs live here:
//!
//! - The optional end-to-end protection of file payloads. A [`Crypt`] holds
//!   32 bytes of key material derived from the user's shared secret and
//!   hands out [`EncryptStream`]/[`DecryptStream`] pairs producing
//!   `IV || AES-256-CBC ciphertext || HMAC-SHA512(ciphertext)`. The streams
//!   are incremental so file bodies never need to be held in memory twice;
//!   a write of zero bytes marks end of input.
//! - The server-side [`PasswordHash`]: a salted PBKDF2 digest stored in
//!   place of the password, verified in constant time.
//!
//! Authentication failures are not recoverable: a stream that has seen a
//! bad MAC or bad padding refuses all further use.

use aes::Aes256;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, generic_array::GenericArray};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::Sha512;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

type CbcEnc = cbc::Encryptor<Aes256>;
type CbcDec = cbc::Decryptor<Aes256>;
type HmacSha512 = Hmac<Sha512>;

/// AES block size in bytes.
const BLOCK: usize = 16;
/// Length of the random IV prefix.
pub const IV_LEN: usize = 16;
/// Length of the trailing HMAC-SHA512 tag.
pub const MAC_LEN: usize = 64;
/// Derived key length.
pub const KEY_LEN: usize = 32;
/// Salt baked into the payload key derivation; both ends of a transfer must
/// derive the same key from the same secret, so this cannot vary.
const KDF_SALT: &[u8; 14] = b"libsync-kdf-v0";
/// PBKDF2 round count for both the payload key and stored passwords.
const KDF_ROUNDS: u32 = 1000;

/// Salt length for stored password hashes.
pub const PASSWORD_SALT_LEN: usize = 16;
/// Digest length for stored password hashes.
pub const PASSWORD_HASH_LEN: usize = 32;

/// Cryptographic failures.
///
/// A MAC or padding failure aborts the transfer that hit it and the
/// connection carrying it; there is no way to resynchronize with a peer
/// whose bytes fail authentication.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Ciphertext shorter than IV + one block + MAC, or not block-aligned.
    #[error("ciphertext has impossible length {0}")]
    BadLength(usize),

    /// The authentication tag did not match the ciphertext.
    #[error("message authentication failed")]
    MacMismatch,

    /// PKCS#7 padding was malformed after a successful MAC check.
    #[error("malformed padding")]
    BadPadding,

    /// The stream was used after end-of-input or after a failure.
    #[error("crypto stream is finished")]
    Finished,

    /// The operating system refused to supply randomness.
    #[error("system randomness unavailable: {0}")]
    Random(String),
}

/// Derives the 32-byte payload key from a shared secret.
#[must_use]
pub fn derive_key(secret: &str) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha512>(secret.as_bytes(), KDF_SALT, KDF_ROUNDS, &mut *key);
    key
}

/// Key material plus stream constructors.
#[derive(Clone)]
pub struct Crypt {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl std::fmt::Debug for Crypt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crypt").finish_non_exhaustive()
    }
}

impl Crypt {
    /// Builds a cipher from the configured shared secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            key: derive_key(secret),
        }
    }

    /// Total sealed length for a plaintext of `plain_len` bytes:
    /// IV, padded ciphertext, and MAC.
    #[must_use]
    pub fn sealed_len(plain_len: u64) -> u64 {
        IV_LEN as u64 + (plain_len / BLOCK as u64 + 1) * BLOCK as u64 + MAC_LEN as u64
    }

    /// Starts an encryption stream with a fresh random IV.
    pub fn encrypt_stream(&self) -> Result<EncryptStream, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        OsRng
            .try_fill_bytes(&mut iv)
            .map_err(|e| CryptoError::Random(e.to_string()))?;
        Ok(EncryptStream::new(&self.key, &iv))
    }

    /// Starts a decryption stream.
    #[must_use]
    pub fn decrypt_stream(&self) -> DecryptStream {
        DecryptStream::new(&self.key)
    }

    /// Seals a whole buffer in one call.
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut stream = self.encrypt_stream()?;
        stream.write(plain)?;
        stream.write(&[])?;
        Ok(stream.drain())
    }

    /// Opens a whole sealed buffer in one call.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut stream = self.decrypt_stream();
        stream.write(sealed)?;
        stream.write(&[])?;
        Ok(stream.drain())
    }
}

/// Incremental sealer: plaintext in, `IV || ciphertext || MAC` out.
pub struct EncryptStream {
    enc: CbcEnc,
    mac: HmacSha512,
    pending: Zeroizing<Vec<u8>>,
    out: Vec<u8>,
    read_pos: usize,
    finished: bool,
}

impl EncryptStream {
    fn new(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Self {
        let mac = HmacSha512::new_from_slice(key).expect("hmac accepts any key length");
        Self {
            enc: CbcEnc::new(key.into(), iv.into()),
            mac,
            pending: Zeroizing::new(Vec::new()),
            out: iv.to_vec(),
            read_pos: 0,
            finished: false,
        }
    }

    /// Feeds plaintext. An empty `buf` signals end of input and flushes the
    /// padding block and the MAC.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), CryptoError> {
        if self.finished {
            return Err(CryptoError::Finished);
        }
        if buf.is_empty() {
            return self.finish();
        }
        self.pending.extend_from_slice(buf);
        let full = self.pending.len() / BLOCK * BLOCK;
        for chunk in self.pending[..full].chunks_exact(BLOCK) {
            let mut block = GenericArray::clone_from_slice(chunk);
            self.enc.encrypt_block_mut(&mut block);
            self.mac.update(block.as_slice());
            self.out.extend_from_slice(block.as_slice());
        }
        self.pending.drain(..full);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), CryptoError> {
        let pad = (BLOCK - self.pending.len() % BLOCK) as u8;
        let mut last = [0u8; BLOCK];
        last[..self.pending.len()].copy_from_slice(&self.pending);
        for slot in &mut last[self.pending.len()..] {
            *slot = pad;
        }
        self.pending.clear();

        let block = GenericArray::from_mut_slice(&mut last);
        self.enc.encrypt_block_mut(block);
        self.mac.update(block.as_slice());
        self.out.extend_from_slice(block.as_slice());

        let tag = self.mac.clone().finalize().into_bytes();
        self.out.extend_from_slice(tag.as_slice());
        self.finished = true;
        Ok(())
    }

    /// Copies sealed bytes into `buf`, returning how many were copied.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let avail = &self.out[self.read_pos..];
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        self.read_pos += n;
        n
    }

    /// Takes every sealed byte produced so far.
    #[must_use]
    pub fn drain(mut self) -> Vec<u8> {
        self.out.split_off(self.read_pos)
    }
}

/// Incremental opener: `IV || ciphertext || MAC` in, plaintext out.
///
/// Nothing is released until end of input: the MAC covers the whole
/// ciphertext, so plaintext only exists once the tag has verified.
pub struct DecryptStream {
    key: Zeroizing<[u8; KEY_LEN]>,
    input: Vec<u8>,
    out: Zeroizing<Vec<u8>>,
    read_pos: usize,
    finished: bool,
}

impl DecryptStream {
    fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(*key),
            input: Vec::new(),
            out: Zeroizing::new(Vec::new()),
            read_pos: 0,
            finished: false,
        }
    }

    /// Feeds sealed bytes. An empty `buf` signals end of input and runs
    /// verification; the stream is unusable after a failure.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), CryptoError> {
        if self.finished {
            return Err(CryptoError::Finished);
        }
        if buf.is_empty() {
            let result = self.finish();
            if result.is_err() {
                self.out.clear();
            }
            return result;
        }
        self.input.extend_from_slice(buf);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), CryptoError> {
        self.finished = true;
        let len = self.input.len();
        if len < IV_LEN + BLOCK + MAC_LEN || (len - IV_LEN - MAC_LEN) % BLOCK != 0 {
            return Err(CryptoError::BadLength(len));
        }
        let (head, tag) = self.input.split_at(len - MAC_LEN);
        let (iv, ciphertext) = head.split_at(IV_LEN);

        let mut mac =
            HmacSha512::new_from_slice(&*self.key).expect("hmac accepts any key length");
        mac.update(ciphertext);
        mac.verify_slice(tag).map_err(|_| CryptoError::MacMismatch)?;

        let mut dec = CbcDec::new((&*self.key).into(), GenericArray::from_slice(iv));
        for chunk in ciphertext.chunks_exact(BLOCK) {
            let mut block = GenericArray::clone_from_slice(chunk);
            dec.decrypt_block_mut(&mut block);
            self.out.extend_from_slice(block.as_slice());
        }

        let pad = *self.out.last().ok_or(CryptoError::BadPadding)? as usize;
        if pad == 0 || pad > BLOCK || pad > self.out.len() {
            return Err(CryptoError::BadPadding);
        }
        let body = self.out.len() - pad;
        if self.out[body..].iter().any(|&b| b as usize != pad) {
            return Err(CryptoError::BadPadding);
        }
        self.out.truncate(body);
        Ok(())
    }

    /// Copies plaintext into `buf`, returning how many bytes were copied.
    /// Yields nothing until end of input has verified.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        if !self.finished {
            return 0;
        }
        let avail = &self.out[self.read_pos..];
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        self.read_pos += n;
        n
    }

    /// Takes the verified plaintext.
    #[must_use]
    pub fn drain(mut self) -> Vec<u8> {
        self.out.split_off(self.read_pos)
    }
}

/// A salted PBKDF2 password digest, the only credential form the server
/// stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHash {
    salt: [u8; PASSWORD_SALT_LEN],
    hash: [u8; PASSWORD_HASH_LEN],
}

impl PasswordHash {
    /// Hashes a password under a fresh random salt.
    pub fn create(password: &str) -> Result<Self, CryptoError> {
        let mut salt = [0u8; PASSWORD_SALT_LEN];
        OsRng
            .try_fill_bytes(&mut salt)
            .map_err(|e| CryptoError::Random(e.to_string()))?;
        Ok(Self::with_salt(password, salt))
    }

    fn with_salt(password: &str, salt: [u8; PASSWORD_SALT_LEN]) -> Self {
        let mut hash = [0u8; PASSWORD_HASH_LEN];
        pbkdf2_hmac::<Sha512>(password.as_bytes(), &salt, KDF_ROUNDS, &mut hash);
        Self { salt, hash }
    }

    /// Constant-time password check.
    #[must_use]
    pub fn verify(&self, password: &str) -> bool {
        let candidate = Self::with_salt(password, self.salt);
        self.hash.ct_eq(&candidate.hash).into()
    }

    /// Serializes as `salt || hash` for the users file.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PASSWORD_SALT_LEN + PASSWORD_HASH_LEN);
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.hash);
        out
    }

    /// Restores a digest from its serialized form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PASSWORD_SALT_LEN + PASSWORD_HASH_LEN {
            return Err(CryptoError::BadLength(bytes.len()));
        }
        let mut salt = [0u8; PASSWORD_SALT_LEN];
        let mut hash = [0u8; PASSWORD_HASH_LEN];
        salt.copy_from_slice(&bytes[..PASSWORD_SALT_LEN]);
        hash.copy_from_slice(&bytes[PASSWORD_SALT_LEN..]);
        Ok(Self { salt, hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "i am awesome";

    #[test]
    fn derive_key_is_deterministic() {
        assert_eq!(*derive_key(KEY), *derive_key(KEY));
        assert_ne!(*derive_key(KEY), *derive_key("i am different"));
    }

    #[test]
    fn sealed_len_accounts_for_iv_padding_and_mac() {
        assert_eq!(Crypt::sealed_len(0), 96);
        assert_eq!(Crypt::sealed_len(2), 96);
        assert_eq!(Crypt::sealed_len(6), 96);
        assert_eq!(Crypt::sealed_len(15), 96);
        assert_eq!(Crypt::sealed_len(16), 112);
        assert_eq!(Crypt::sealed_len(110), 192);
    }

    #[test]
    fn round_trips_block_aligned_input() {
        let c = Crypt::new(KEY);
        let plain = vec![0u8; 64];
        assert_eq!(c.decrypt(&c.encrypt(&plain).unwrap()).unwrap(), plain);
    }

    #[test]
    fn round_trips_irregular_input() {
        let c = Crypt::new(KEY);
        let plain = b"i am a random str".to_vec();
        let sealed = c.encrypt(&plain).unwrap();
        assert_eq!(sealed.len() as u64, Crypt::sealed_len(plain.len() as u64));
        assert_eq!(c.decrypt(&sealed).unwrap(), plain);
    }

    #[test]
    fn round_trips_empty_input() {
        let c = Crypt::new(KEY);
        assert_eq!(c.decrypt(&c.encrypt(b"").unwrap()).unwrap(), b"");
    }

    #[test]
    fn fresh_ivs_give_distinct_ciphertexts() {
        let c = Crypt::new(KEY);
        assert_ne!(c.encrypt(b"same").unwrap(), c.encrypt(b"same").unwrap());
    }

    #[test]
    fn incremental_writes_match_one_shot() {
        let c = Crypt::new(KEY);
        let plain = b"0123456789abcdef0123456789abcdefXYZ";

        let mut enc = c.encrypt_stream().unwrap();
        for chunk in plain.chunks(7) {
            enc.write(chunk).unwrap();
        }
        enc.write(&[]).unwrap();
        let sealed = enc.drain();

        let mut dec = c.decrypt_stream();
        for chunk in sealed.chunks(5) {
            dec.write(chunk).unwrap();
        }
        dec.write(&[]).unwrap();
        assert_eq!(dec.drain(), plain);
    }

    #[test]
    fn decrypt_yields_nothing_before_finalization() {
        let c = Crypt::new(KEY);
        let sealed = c.encrypt(b"secret").unwrap();
        let mut dec = c.decrypt_stream();
        dec.write(&sealed).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(dec.read(&mut buf), 0);
        dec.write(&[]).unwrap();
        assert!(dec.read(&mut buf) > 0);
    }

    #[test]
    fn any_flipped_byte_fails_authentication() {
        let c = Crypt::new(KEY);
        let sealed = c.encrypt(b"secret").unwrap();
        assert_eq!(sealed.len(), 96);

        for pos in IV_LEN..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[pos] ^= 0x01;
            assert!(
                matches!(c.decrypt(&tampered), Err(CryptoError::MacMismatch)),
                "flip at {pos} went unnoticed"
            );
        }
        assert_eq!(c.decrypt(&sealed).unwrap(), b"secret");
    }

    #[test]
    fn flipped_iv_byte_corrupts_without_mac_failure() {
        // The MAC deliberately excludes the IV; a flipped IV byte decrypts
        // to garbage in the first block instead of failing authentication.
        let c = Crypt::new(KEY);
        let plain = b"0123456789abcdef-0123456789abcdef";
        let sealed = c.encrypt(plain).unwrap();
        let mut tampered = sealed;
        tampered[0] ^= 0x80;
        let got = c.decrypt(&tampered).unwrap();
        assert_ne!(got, plain);
        assert_eq!(got[BLOCK..], plain[BLOCK..]);
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = Crypt::new(KEY).encrypt(b"secret").unwrap();
        assert!(matches!(
            Crypt::new("other").decrypt(&sealed),
            Err(CryptoError::MacMismatch)
        ));
    }

    #[test]
    fn garbage_input_fails() {
        let c = Crypt::new(KEY);
        assert!(matches!(
            c.decrypt(b"i am a random str"),
            Err(CryptoError::BadLength(_))
        ));
    }

    #[test]
    fn stream_refuses_use_after_finish() {
        let c = Crypt::new(KEY);
        let mut enc = c.encrypt_stream().unwrap();
        enc.write(b"x").unwrap();
        enc.write(&[]).unwrap();
        assert!(matches!(enc.write(b"more"), Err(CryptoError::Finished)));
    }

    #[test]
    fn password_hash_verifies_and_rejects() {
        let h = PasswordHash::create("hunter2").unwrap();
        assert!(h.verify("hunter2"));
        assert!(!h.verify("hunter3"));
        assert!(!h.verify(""));
    }

    #[test]
    fn password_hash_round_trips_through_bytes() {
        let h = PasswordHash::create("hunter2").unwrap();
        let again = PasswordHash::from_bytes(&h.to_bytes()).unwrap();
        assert_eq!(again, h);
        assert!(again.verify("hunter2"));
    }

    #[test]
    fn password_salts_differ_between_users() {
        let a = PasswordHash::create("same").unwrap();
        let b = PasswordHash::create("same").unwrap();
        assert_ne!(a.to_bytes(), b.to_bytes());
        assert!(a.verify("same") && b.verify("same"));
    }

    #[test]
    fn password_hash_rejects_short_blob() {
        assert!(PasswordHash::from_bytes(&[0u8; 10]).is_err());
    }
}
