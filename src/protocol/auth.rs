//! Authentication scramble computation.

use sha1::{Digest, Sha1};

/// Default authentication method.
pub const CHAP_SHA1: &str = "chap-sha1";

/// Compute the `chap-sha1` scramble:
/// `xor(sha1(password), sha1(salt || sha1(sha1(password))))`.
///
/// `salt` must be the 20-byte auth prefix of the greeting salt.
pub fn chap_sha1_scramble(salt: &[u8], password: &str) -> [u8; 20] {
    let hash1 = Sha1::digest(password.as_bytes());
    let hash2 = Sha1::digest(hash1);

    let mut mixer = Sha1::new();
    mixer.update(salt);
    mixer.update(hash2);
    let mix = mixer.finalize();

    let mut scramble = [0u8; 20];
    for (i, b) in scramble.iter_mut().enumerate() {
        *b = hash1[i] ^ mix[i];
    }
    scramble
}
