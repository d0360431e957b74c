// Password digests for lobby passwords and the admin secret.
//
// Passwords never sit in memory in the clear after setup: a lobby keeps a
// salted SHA-256 digest (hex) and the admin listener keeps the digest of its
// shared secret. Comparisons are constant-time over the digests.

use rand::Rng;
use sha2::{Digest, Sha256};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PasswordHash {
    salt: String,
    digest: String,
}

impl PasswordHash {
    pub fn new(password: &str) -> Self {
        let mut rng = rand::thread_rng();
        let salt_bytes: Vec<u8> = (0..16).map(|_| rng.r#gen::<u8>()).collect();
        let salt = hex::encode(salt_bytes);
        let digest = salted_digest(&salt, password);
        Self { salt, digest }
    }

    pub fn verify(&self, candidate: &str) -> bool {
        constant_time_eq(
            self.digest.as_bytes(),
            salted_digest(&self.salt, candidate).as_bytes(),
        )
    }

    /// Hex digest, for logs and tests. Never the password.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

fn salted_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b"\0");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Unsalted digest of a shared secret.
#[derive(Clone)]
pub struct SharedSecret {
    digest: [u8; 32],
}

impl SharedSecret {
    pub fn new(secret: &str) -> Self {
        Self {
            digest: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    pub fn verify(&self, candidate: &str) -> bool {
        let candidate: [u8; 32] = Sha256::digest(candidate.as_bytes()).into();
        constant_time_eq(&self.digest, &candidate)
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
