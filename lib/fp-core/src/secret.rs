// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Positive-match secret: a per-template value revealed to the host exactly
//! once, inside a bounded window after a successful match.
//!
//! The secret is never stored. It is derived on demand with HKDF-SHA256
//! from an IKM built of the rollback-region entropy and the TPM seed, a
//! per-template salt, and the current user id, so it exists in RAM only for
//! the duration of the read and is tied to this boot context.

use ec_proto::fp::{
    FP_CONTEXT_TPM_BYTES, FP_CONTEXT_USERID_WORDS, FP_POSITIVE_MATCH_SALT_BYTES,
    FP_POSITIVE_MATCH_SECRET_BYTES, ROLLBACK_SECRET_SIZE,
};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// How long after a match the secret stays readable.
pub const POSITIVE_MATCH_SECRET_TIMEOUT_US: u64 = 5_000_000;

const INFO_PREFIX: &[u8] = b"positive_match_secret for user ";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SecretError {
    /// No template matched, or the readable window was already consumed.
    Denied,
    /// The read window expired before the host asked.
    Timeout,
    /// A secret was still readable when a new match tried to arm one.
    AlreadyReadable,
    /// The finger index is outside the template set.
    InvalidFinger,
    /// The TPM seed has not been provided this boot.
    SeedNotSet,
    /// The rollback entropy could not be read.
    Hardware,
    /// The per-template salt is all zeroes, which would make the secret
    /// predictable.
    TrivialSalt,
    /// Key derivation produced an implausible (all-zero) result.
    DerivationFailed,
}

/// Read-once window state. All transitions go through [`enable`] /
/// [`disable`]; the surrounding task decides *when*, this type decides
/// *whether* a read may happen.
///
/// [`enable`]: PositiveMatchSecretState::enable
/// [`disable`]: PositiveMatchSecretState::disable
#[derive(Clone, Debug, Default)]
pub struct PositiveMatchSecretState {
    template_matched: Option<usize>,
    readable: bool,
    deadline_us: u64,
}

impl PositiveMatchSecretState {
    /// Arms the window for template `idx`, expiring
    /// [`POSITIVE_MATCH_SECRET_TIMEOUT_US`] after `now_us`.
    ///
    /// Arming while a previous secret is still readable is refused, and the
    /// stale window is torn down: the host missed its chance.
    pub fn enable(&mut self, idx: usize, now_us: u64) -> Result<(), SecretError> {
        if self.readable {
            self.disable();
            return Err(SecretError::AlreadyReadable);
        }
        self.template_matched = Some(idx);
        self.readable = true;
        self.deadline_us = now_us + POSITIVE_MATCH_SECRET_TIMEOUT_US;
        Ok(())
    }

    pub fn disable(&mut self) {
        self.template_matched = None;
        self.readable = false;
        self.deadline_us = 0;
    }

    /// The template armed by the last match, cleared once read or disabled.
    pub fn template_matched(&self) -> Option<usize> {
        self.template_matched
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn deadline_us(&self) -> u64 {
        self.deadline_us
    }

    /// Gate for a host read of template `idx` at `now_us`. Consumes the
    /// window on timeout; a successful gate leaves the window armed so the
    /// caller can complete the read and then [`disable`] it.
    ///
    /// [`disable`]: PositiveMatchSecretState::disable
    pub fn check_read(
        &mut self,
        idx: usize,
        now_us: u64,
    ) -> Result<(), SecretError> {
        if self.template_matched != Some(idx) || !self.readable {
            return Err(SecretError::Denied);
        }
        if now_us >= self.deadline_us {
            self.disable();
            return Err(SecretError::Timeout);
        }
        Ok(())
    }
}

/// A derived secret, wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PositiveMatchSecret(pub [u8; FP_POSITIVE_MATCH_SECRET_BYTES]);

fn bytes_are_trivial(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0)
}

/// Derives the positive-match secret for one template.
///
/// IKM is rollback entropy followed by the TPM seed; info is a fixed prefix
/// followed by the raw user-id bytes. Matches the derivation pinned by the
/// BoringSSL-generated vectors in the tests below.
pub fn derive_positive_match_secret(
    salt: &[u8; FP_POSITIVE_MATCH_SALT_BYTES],
    user_id: &[u32; FP_CONTEXT_USERID_WORDS],
    tpm_seed: &[u8; FP_CONTEXT_TPM_BYTES],
    rollback_secret: &[u8; ROLLBACK_SECRET_SIZE],
) -> Result<PositiveMatchSecret, SecretError> {
    if bytes_are_trivial(salt) {
        return Err(SecretError::TrivialSalt);
    }

    let mut ikm = [0u8; ROLLBACK_SECRET_SIZE + FP_CONTEXT_TPM_BYTES];
    ikm[..ROLLBACK_SECRET_SIZE].copy_from_slice(rollback_secret);
    ikm[ROLLBACK_SECRET_SIZE..].copy_from_slice(tpm_seed);

    let mut info = [0u8; INFO_PREFIX.len() + 4 * FP_CONTEXT_USERID_WORDS];
    info[..INFO_PREFIX.len()].copy_from_slice(INFO_PREFIX);
    for (i, word) in user_id.iter().enumerate() {
        let at = INFO_PREFIX.len() + 4 * i;
        info[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }

    let mut secret = PositiveMatchSecret([0; FP_POSITIVE_MATCH_SECRET_BYTES]);
    let hk = Hkdf::<Sha256>::new(Some(salt), &ikm);
    let expanded = hk.expand(&info, &mut secret.0);
    ikm.zeroize();
    if expanded.is_err() || bytes_are_trivial(&secret.0) {
        return Err(SecretError::DerivationFailed);
    }
    Ok(secret)
}
