//! The auth handshake state machine (§4.5's `Tauth` semantics).
//!
//! This crate does not interpret any cryptography: it generates
//! challenges, tracks their expiry, and hands `(uname, challenge,
//! response)` to an application-supplied [`Verifier`]. An auth-fid is
//! not a filesystem node — reads return the challenge, writes deliver
//! the client's response.

use std::time::{Duration, Instant};

use rand::RngCore;

/// A challenge expires 60 seconds after issue (spec: "Challenges
/// expire 60 seconds after issue").
pub const CHALLENGE_TTL: Duration = Duration::from_secs(60);

/// Size of the random challenge handed to the client.
pub const CHALLENGE_LEN: usize = 32;

/// An application-supplied check of a client's signed response.
///
/// The dispatcher does not interpret the signature format; it is
/// whatever the embedding application and its clients agree on
/// (e.g. signature || pubkey).
pub trait Verifier: Send + Sync {
    fn verify(&self, uname: &str, challenge: &[u8], response: &[u8]) -> bool;
}

/// Per-auth-fid state: the claimed identity, the issued challenge, and
/// whether a verified response has been received yet.
#[derive(Clone, Debug)]
pub struct AuthState {
    pub uname: String,
    pub challenge: Vec<u8>,
    issued_at: Instant,
    pub authenticated: bool,
}

impl AuthState {
    /// Issue a fresh challenge for `uname`.
    pub fn new(uname: String) -> AuthState {
        let mut challenge = vec![0u8; CHALLENGE_LEN];
        rand::thread_rng().fill_bytes(&mut challenge);
        AuthState {
            uname,
            challenge,
            issued_at: Instant::now(),
            authenticated: false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.issued_at.elapsed() > CHALLENGE_TTL
    }

    /// Push `issued_at` into the past, for tests that need an expired
    /// challenge without sleeping the full [`CHALLENGE_TTL`].
    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: Duration) {
        self.issued_at -= by;
    }

    /// Apply a verifier to `response`, marking this state authenticated
    /// on success. Returns `false` (without mutating state) if the
    /// challenge has already expired.
    pub fn apply_response(&mut self, verifier: &dyn Verifier, response: &[u8]) -> bool {
        if self.is_expired() {
            return false;
        }
        if verifier.verify(&self.uname, &self.challenge, response) {
            self.authenticated = true;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysAccept;
    impl Verifier for AlwaysAccept {
        fn verify(&self, _uname: &str, _challenge: &[u8], response: &[u8]) -> bool {
            response == b"yes"
        }
    }

    #[test]
    fn distinct_challenges_are_issued() {
        let a = AuthState::new("glenda".to_owned());
        let b = AuthState::new("glenda".to_owned());
        assert_ne!(a.challenge, b.challenge);
        assert_eq!(a.challenge.len(), CHALLENGE_LEN);
    }

    #[test]
    fn bad_response_does_not_authenticate() {
        let mut state = AuthState::new("glenda".to_owned());
        assert!(!state.apply_response(&AlwaysAccept, b"no"));
        assert!(!state.authenticated);
    }

    #[test]
    fn good_response_authenticates() {
        let mut state = AuthState::new("glenda".to_owned());
        assert!(state.apply_response(&AlwaysAccept, b"yes"));
        assert!(state.authenticated);
    }
}
