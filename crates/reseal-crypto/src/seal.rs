//! Hybrid sealing: ChaCha20-Poly1305 for the payload, RSA-OAEP for the session key
//!
//! Plaintext only ever lives in `Zeroizing` buffers and is never logged.

use tracing::debug;
use zeroize::Zeroizing;

use crate::cipher;
use crate::envelope::{Envelope, ScopeLabel, FORMAT_VERSION};
use crate::keys::{KeyPair, PublicKey};
use crate::registry::KeyRegistry;
use crate::{CryptoError, Result};

/// Seal `plaintext` for `scope` under `public_key`.
///
/// Session key and nonce are fresh for every call, so sealing the same input
/// twice yields different envelopes.
pub fn seal(plaintext: &[u8], scope: &ScopeLabel, public_key: &PublicKey) -> Result<Envelope> {
    scope.validate()?;
    let session_key = cipher::generate_key();
    let nonce = cipher::generate_nonce();

    let (ciphertext, tag) = cipher::encrypt(session_key.as_ref(), &nonce, plaintext, &scope.aad())?;
    let wrapped_session_key = public_key.wrap(session_key.as_ref())?;

    Ok(Envelope {
        format_version: FORMAT_VERSION,
        key_fingerprint: Some(public_key.fingerprint().clone()),
        scope: scope.clone(),
        nonce: nonce.to_vec(),
        wrapped_session_key,
        ciphertext,
        auth_tag: tag.to_vec(),
    })
}

/// Open `envelope` for the identity the caller asserts in `claimed`.
///
/// Key selection:
/// - fingerprinted envelopes only try the named key (`UnknownKey` if absent)
/// - legacy envelopes try every key, most recent first (`NoMatchingKey` if none fits)
///
/// An envelope whose recorded scope differs from `claimed` is `Tampered`, as is
/// any AEAD failure after a successful unwrap, including an AAD mismatch.
pub fn unseal(
    envelope: &Envelope,
    claimed: &ScopeLabel,
    keys: &KeyRegistry,
) -> Result<Zeroizing<Vec<u8>>> {
    envelope.validate()?;
    claimed.validate()?;
    if &envelope.scope != claimed {
        return Err(CryptoError::Tampered);
    }

    let (key, session_key) = match envelope.fingerprint() {
        Some(fingerprint) => {
            let key = keys
                .lookup(fingerprint)
                .ok_or_else(|| CryptoError::UnknownKey(fingerprint.clone()))?;
            let session_key = key
                .unwrap_session_key(&envelope.wrapped_session_key)
                .map_err(|_| CryptoError::Tampered)?;
            (&**key, session_key)
        }
        None => scan_for_key(envelope, keys.all().map(|k| &**k))?,
    };

    debug!(fingerprint = %key.id().short(), "unwrapped session key");

    cipher::decrypt(
        session_key.as_slice(),
        &envelope.nonce,
        &envelope.ciphertext,
        &envelope.auth_tag,
        &claimed.aad(),
    )
    .map_err(|_| CryptoError::Tampered)
}

/// Seal the plaintext of `envelope` again under `new_key`, bound to `claimed`
pub fn reencrypt(
    envelope: &Envelope,
    claimed: &ScopeLabel,
    keys: &KeyRegistry,
    new_key: &PublicKey,
) -> Result<Envelope> {
    let plaintext = unseal(envelope, claimed, keys)?;
    seal(&plaintext, claimed, new_key)
}

/// First candidate able to unwrap the session key wins
fn scan_for_key<'a>(
    envelope: &Envelope,
    candidates: impl Iterator<Item = &'a KeyPair>,
) -> Result<(&'a KeyPair, Zeroizing<Vec<u8>>)> {
    for key in candidates {
        if let Ok(session_key) = key.unwrap_session_key(&envelope.wrapped_session_key) {
            return Ok((key, session_key));
        }
    }
    Err(CryptoError::NoMatchingKey)
}
