use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use workrelay_core::{Headers, AUTH_HEADER};

/// Checks the shared worker key carried in message headers.
///
/// Both sides are hashed to fixed-length digests before comparing, so the
/// comparison takes the same time for every candidate regardless of its
/// length or of where it first differs.
pub struct Authenticator {
    digest: [u8; 32],
}

impl Authenticator {
    pub fn new(worker_key: &str) -> Self {
        Authenticator {
            digest: Sha256::digest(worker_key.as_bytes()).into(),
        }
    }

    pub fn verify(&self, candidate: &str) -> bool {
        let digest: [u8; 32] = Sha256::digest(candidate.as_bytes()).into();
        self.digest.ct_eq(&digest).unwrap_u8() == 1
    }

    /// A missing header is treated like an empty key.
    pub fn authenticate(&self, headers: &Headers) -> bool {
        let candidate = headers.get(AUTH_HEADER).map(String::as_str).unwrap_or("");
        self.verify(candidate)
    }
}
