//! VNC authentication: the classic DES challenge/response (spec §4.D)
//! and the password-file grammar the security phase consults (spec
//! §6.1).
//!
//! The teacher's `client.rs` names a `vnc::auth::VncAuth` collaborator
//! that is not present in this retrieval; rebuilt here on the same
//! `des` + `cipher` dependency the teacher's own `Cargo.toml` already
//! carries, plus `rand` for challenge generation.

use cipher::{BlockEncrypt, KeyInit};
use cipher::generic_array::GenericArray;
use des::Des;
use rand::RngCore;

/// Length in bytes of a VNC authentication challenge and response.
pub const CHALLENGE_LEN: usize = 16;

/// Generates a fresh random 16-byte challenge.
#[must_use]
pub fn generate_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// Encrypts `challenge` with `password` per the VNC-auth DES quirk:
/// the password is truncated/zero-padded to 8 bytes and each key byte
/// has its bits reversed before use (a historical artifact of the
/// original C implementation's bit-order), then each 8-byte half of
/// the challenge is DES-ECB encrypted independently.
#[must_use]
pub fn encrypt_challenge(password: &[u8], challenge: &[u8; CHALLENGE_LEN]) -> [u8; CHALLENGE_LEN] {
    let mut key_bytes = [0u8; 8];
    for (i, slot) in key_bytes.iter_mut().enumerate() {
        let b = password.get(i).copied().unwrap_or(0);
        *slot = b.reverse_bits();
    }
    let cipher = Des::new(GenericArray::from_slice(&key_bytes));

    let mut out = [0u8; CHALLENGE_LEN];
    for half in 0..2 {
        let offset = half * 8;
        let mut block = *GenericArray::from_slice(&challenge[offset..offset + 8]);
        cipher.encrypt_block(&mut block);
        out[offset..offset + 8].copy_from_slice(&block);
    }
    out
}

/// Checks `response` against every password in `passwords` in order,
/// returning the index of the first match.
#[must_use]
pub fn verify_response(
    passwords: &[String],
    challenge: &[u8; CHALLENGE_LEN],
    response: &[u8],
) -> Option<usize> {
    if response.len() != CHALLENGE_LEN {
        return None;
    }
    passwords
        .iter()
        .position(|pw| encrypt_challenge(pw.as_bytes(), challenge).as_slice() == response)
}

/// A parsed password file (spec §6.1 / §6): full-access entries
/// followed by an optional `__BEGIN_VIEWONLY__`-delimited view-only
/// tail.
#[derive(Debug, Clone, Default)]
pub struct PasswordFile {
    pub full_access: Vec<String>,
    pub view_only: Vec<String>,
}

impl PasswordFile {
    /// Parses the grammar: one entry per line, a `__COMM__` suffix
    /// strips a trailing comment, `__EMPTY__` denotes the empty
    /// password, `__BEGIN_VIEWONLY__` marks the view-only boundary,
    /// and a line starting with `#` is dropped entirely.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut full_access = Vec::new();
        let mut view_only = Vec::new();
        let mut in_view_only = false;

        for raw_line in text.lines() {
            if raw_line.starts_with('#') {
                continue;
            }
            let line = raw_line.split("__COMM__").next().unwrap_or("");
            if line == "__BEGIN_VIEWONLY__" {
                in_view_only = true;
                continue;
            }
            if line.is_empty() {
                continue;
            }
            let password = if line == "__EMPTY__" { String::new() } else { line.to_string() };
            if in_view_only {
                view_only.push(password);
            } else {
                full_access.push(password);
            }
        }

        Self { full_access, view_only }
    }

    /// Index in [`Self::all`]'s ordering at which view-only entries
    /// begin (spec S6's `view_only_boundary`).
    #[must_use]
    pub fn view_only_boundary(&self) -> usize {
        self.full_access.len()
    }

    /// All passwords, full-access first, in the order
    /// [`verify_response`] expects.
    #[must_use]
    pub fn all(&self) -> Vec<String> {
        self.full_access.iter().chain(self.view_only.iter()).cloned().collect()
    }

    /// True when `index` (as returned by [`verify_response`]) names a
    /// view-only credential.
    #[must_use]
    pub fn is_view_only(&self, index: usize) -> bool {
        index >= self.view_only_boundary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_challenge_is_deterministic_per_password() {
        let challenge = [0x11u8; CHALLENGE_LEN];
        let a = encrypt_challenge(b"secret", &challenge);
        let b = encrypt_challenge(b"secret", &challenge);
        assert_eq!(a, b);
    }

    #[test]
    fn different_passwords_produce_different_ciphertext() {
        let challenge = generate_challenge();
        let a = encrypt_challenge(b"secret", &challenge);
        let b = encrypt_challenge(b"different", &challenge);
        assert_ne!(a, b);
    }

    #[test]
    fn verify_response_finds_matching_password() {
        let passwords = vec!["alice".to_string(), "bob".to_string()];
        let challenge = generate_challenge();
        let response = encrypt_challenge(b"bob", &challenge);
        assert_eq!(verify_response(&passwords, &challenge, &response), Some(1));
    }

    #[test]
    fn verify_response_rejects_unknown_password() {
        let passwords = vec!["alice".to_string()];
        let challenge = generate_challenge();
        let response = encrypt_challenge(b"wrong", &challenge);
        assert_eq!(verify_response(&passwords, &challenge, &response), None);
    }

    /// Spec §8 scenario S6.
    #[test]
    fn password_file_separates_view_only_tail() {
        let file = PasswordFile::parse("alice\n__BEGIN_VIEWONLY__\nbob\n");
        assert_eq!(file.full_access, vec!["alice".to_string()]);
        assert_eq!(file.view_only, vec!["bob".to_string()]);
        assert_eq!(file.view_only_boundary(), 1);
    }

    #[test]
    fn password_file_honours_comment_and_empty_sentinels() {
        let file = PasswordFile::parse("# a disabled line\nreal__COMM__ trailing note\n__EMPTY__\n");
        assert_eq!(file.full_access, vec!["real".to_string(), String::new()]);
    }
}
