// SPDX-License-Identifier: MIT OR Apache-2.0

//! HKDF-SHA256 key derivation helpers.
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

/// Derives `N` bytes of output key material from the given input.
pub fn hkdf_sha256<const N: usize>(
    salt: Option<&[u8]>,
    ikm: &[u8],
    info: &[u8],
) -> Result<[u8; N], HkdfError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; N];
    hk.expand(info, &mut okm)
        .map_err(|_| HkdfError::InvalidLength)?;
    Ok(okm)
}

#[derive(Debug, Error)]
pub enum HkdfError {
    #[error("requested hkdf output length is invalid")]
    InvalidLength,
}

#[cfg(test)]
mod tests {
    use super::hkdf_sha256;

    #[test]
    fn deterministic_derivation() {
        let out_1: [u8; 32] = hkdf_sha256(Some(b"salt"), b"input", b"info").unwrap();
        let out_2: [u8; 32] = hkdf_sha256(Some(b"salt"), b"input", b"info").unwrap();
        assert_eq!(out_1, out_2);
    }

    #[test]
    fn info_separates_outputs() {
        let out_1: [u8; 32] = hkdf_sha256(None, b"input", b"info-a").unwrap();
        let out_2: [u8; 32] = hkdf_sha256(None, b"input", b"info-b").unwrap();
        assert_ne!(out_1, out_2);
    }
}
