use openssl::rand::rand_bytes;

use crate::error::Result;

/// Simple obfuscator, just to keep the store secret out of plain sight in
/// memory dumps. This is not a cryptographic protection: anyone with access
/// to the process memory can recover both the pad and the wrapped bytes.
pub struct SecretWrapper {
    pad: Vec<u8>,
    wrapped: Vec<u8>,
}

impl SecretWrapper {
    /// Wrap the given secret behind a freshly generated random pad.
    pub fn wrap(secret: &[u8]) -> Result<Self> {
        let mut pad = vec![0u8; secret.len()];
        rand_bytes(&mut pad)?;
        let wrapped = secret
            .iter()
            .zip(pad.iter())
            .map(|(byte, pad_byte)| byte ^ pad_byte)
            .collect();
        Ok(Self { pad, wrapped })
    }

    /// Reconstruct the plaintext secret into a freshly allocated buffer.
    pub fn unwrap_bytes(&self) -> Vec<u8> {
        self.wrapped
            .iter()
            .zip(self.pad.iter())
            .map(|(byte, pad_byte)| byte ^ pad_byte)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let wrapped = SecretWrapper::wrap(secret).unwrap();
        assert_eq!(wrapped.unwrap_bytes(), secret);
    }

    #[test]
    fn test_wrapped_bytes_differ_from_plaintext() {
        let secret = [42u8; 32];
        let wrapped = SecretWrapper::wrap(&secret).unwrap();
        assert_ne!(wrapped.wrapped, secret);
    }

    #[test]
    fn test_unwrap_is_repeatable() {
        let wrapped = SecretWrapper::wrap(b"secret").unwrap();
        assert_eq!(wrapped.unwrap_bytes(), wrapped.unwrap_bytes());
    }
}
