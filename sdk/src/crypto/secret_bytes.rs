use {
    serde::{Deserialize, Serialize},
    x25519_dalek::StaticSecret,
    zeroize::{Zeroize, ZeroizeOnDrop},
};

/// A helper struct to serialize and zeroize private key material.
/// Pool keys are held in this form and turned back into a `StaticSecret` on use.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl SecretBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for SecretBytes {
    fn from(raw: &[u8]) -> Self {
        Self(raw.to_vec())
    }
}

impl From<&StaticSecret> for SecretBytes {
    fn from(sk: &StaticSecret) -> Self {
        Self(sk.to_bytes().to_vec())
    }
}

impl TryFrom<&SecretBytes> for StaticSecret {
    type Error = usize;

    /// Fails with the actual length when it is not 32 bytes.
    fn try_from(raw: &SecretBytes) -> Result<Self, Self::Error> {
        let bytes: [u8; 32] = raw.0.as_slice().try_into().map_err(|_| raw.0.len())?;
        Ok(StaticSecret::from(bytes))
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes(<{} bytes redacted>)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rand::rngs::OsRng};

    #[test]
    fn static_secret_survives_raw_bytes() {
        let sk = StaticSecret::random_from_rng(OsRng);
        let raw = SecretBytes::from(&sk);
        let back = StaticSecret::try_from(&raw).unwrap();
        assert_eq!(sk.to_bytes(), back.to_bytes());
    }

    #[test]
    fn wrong_length_is_rejected() {
        let raw = SecretBytes(vec![7u8; 31]);
        assert_eq!(StaticSecret::try_from(&raw).err(), Some(31));
        assert_eq!(format!("{raw:?}"), "SecretBytes(<31 bytes redacted>)");
    }
}
