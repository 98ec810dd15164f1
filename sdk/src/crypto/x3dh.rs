#![forbid(unsafe_code)]
//! # X3DH key agreement engine
//!
//! [`X3dhEngine`] derives session secrets following the X3DH pattern from
//! Signal's public specification. The initiator combines its identity key and
//! a fresh ephemeral key with the responder's published identity, long-term
//! and (optional) one-time keys:
//!
//! ```text
//! DH1 = DH(IK_A, LT_B)
//! DH2 = DH(EK_A, IK_B)
//! DH3 = DH(EK_A, LT_B)
//! DH4 = DH(EK_A, OT_B)      (only when a one-time key was published)
//! SK  = HKDF(0xff*32 || DH1 || DH2 || DH3 [|| DH4], info = "X3DH" || additional data)
//! ```
//!
//! Messages are sealed with XChaCha20-Poly1305 under a key and nonce expanded
//! from `SK` and a random 32-byte per-message salt. The associated data binds
//! both identity keys in `initiator || responder` order.
//!
//! ## Example
//!
//! ```
//! use card_sessions::crypto::{
//!     CryptoEngine, InitiatorPrivateInfo, InitiatorPublicInfo, ResponderPrivateInfo,
//!     ResponderPublicInfo, X3dhEngine,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = X3dhEngine::new();
//! let alice_ik = engine.generate_key_pair();
//! let alice_ek = engine.generate_key_pair();
//! let bob_ik = engine.generate_key_pair();
//! let bob_lt = engine.generate_key_pair();
//!
//! let alice = engine.derive_initiator_session(
//!     &InitiatorPrivateInfo {
//!         identity_key: engine.import_private_key(&alice_ik.private_key)?,
//!         ephemeral_key: engine.import_private_key(&alice_ek.private_key)?,
//!     },
//!     &ResponderPublicInfo {
//!         identity_key: engine.import_public_key(&bob_ik.public_key)?,
//!         long_term_key: engine.import_public_key(&bob_lt.public_key)?,
//!         one_time_key: None,
//!     },
//!     b"",
//! )?;
//! let bob = engine.derive_responder_session(
//!     &ResponderPrivateInfo {
//!         identity_key: engine.import_private_key(&bob_ik.private_key)?,
//!         long_term_key: engine.import_private_key(&bob_lt.private_key)?,
//!         one_time_key: None,
//!     },
//!     &InitiatorPublicInfo {
//!         identity_key: engine.import_public_key(&alice_ik.public_key)?,
//!         ephemeral_key: engine.import_public_key(&alice_ek.public_key)?,
//!     },
//!     b"",
//! )?;
//! assert_eq!(alice.session_id, bob.session_id);
//!
//! let sealed = engine.encrypt_with(&alice.handle, b"hello, Bob!")?;
//! let plain = engine.decrypt_with(&bob.handle, &sealed.salt, &sealed.ciphertext)?;
//! assert_eq!(plain, b"hello, Bob!");
//! # Ok(()) }
//! ```

use {
    super::{
        secret_bytes::SecretBytes,
        CryptoEngine,
        DerivedSession,
        EngineError,
        InitiatorPrivateInfo,
        InitiatorPublicInfo,
        RawKeyPair,
        ResponderPrivateInfo,
        ResponderPublicInfo,
        Sealed,
    },
    crate::state::SessionId,
    aead::{Aead, KeyInit, Payload},
    chacha20poly1305::{XChaCha20Poly1305, XNonce},
    hkdf::Hkdf,
    rand::rngs::OsRng,
    rand_core::RngCore,
    sha2::{Digest, Sha256},
    x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret},
    xeddsa::{
        xed25519::{PrivateKey as XEdPrivate, PublicKey as XEdPublic},
        Sign,
        Verify,
    },
    zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing},
};

/// Curve identifier for `Encode(PK)` (see section 2.5 of the X3DH spec).
const CURVE_ID_X25519: u8 = 0x05;
/// Maximum ciphertext length accepted by [`X3dhEngine::decrypt_with`] (**1 MiB**).
const MAX_CIPHERTEXT: usize = 1024 * 1024;
/// Prefix of the HKDF `info` field; the caller's additional data follows it.
const HKDF_INFO: &[u8] = b"X3DH";
/// Label for per-message key expansion.
const MESSAGE_KEY_INFO: &[u8] = b"message-key";
/// Per-message salt length.
const SALT_LEN: usize = 32;
/// Length of a 32-byte root key followed by two encoded identity keys.
const HANDLE_LEN: usize = 32 + 33 + 33;

/// Shared secret produced by X3DH.
///
/// The `Zeroizing` wrapper guarantees that the 32‑byte buffer is wiped from
/// memory when dropped, preventing accidental key leakage.
pub type SharedSecret = Zeroizing<[u8; 32]>;

// === Helper utilities ===

/// Encode a Curve25519 public key as `curve_id || u_coordinate` (33 bytes).
#[inline]
fn encode_pk(pk: &X25519PublicKey) -> [u8; 33] {
    let mut out = [0u8; 33];
    out[0] = CURVE_ID_X25519;
    out[1..].copy_from_slice(pk.as_bytes());
    out
}

/// HKDF wrapper (SHA‑256) with a 32×`0xff` domain separator.
///
/// * `dhs` – list of raw Diffie‑Hellman outputs (`dh1..dh4`).
/// * `info` – application‑specific label.
fn kdf(dhs: &[&[u8]], info: &[u8]) -> Result<SharedSecret, EngineError> {
    let mut ikm = Vec::with_capacity(32 + 32 * dhs.len());
    // Domain separator – mitigates cross‑protocol attacks.
    ikm.extend([0xffu8; 32]);
    for dh in dhs {
        ikm.extend_from_slice(dh);
    }
    // 32‑byte zero salt (X3DH §2.2)
    let salt = [0u8; 32];
    let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)?;
    ikm.zeroize();
    Ok(Zeroizing::new(okm))
}

/// Diffie‑Hellman that refuses non‑contributory results (small‑order points).
fn dh(sk: &StaticSecret, pk: &X25519PublicKey, label: &str) -> Result<[u8; 32], EngineError> {
    let shared = sk.diffie_hellman(pk);
    if !shared.was_contributory() {
        return Err(EngineError::Derivation(format!(
            "non-contributory {label} exchange"
        )));
    }
    Ok(shared.to_bytes())
}

/// Run the KDF over the DH outputs and wipe them afterwards.
fn derive_root(mut dhs: Vec<[u8; 32]>, additional_data: &[u8]) -> Result<SharedSecret, EngineError> {
    let mut info = Vec::with_capacity(HKDF_INFO.len() + additional_data.len());
    info.extend_from_slice(HKDF_INFO);
    info.extend_from_slice(additional_data);

    let slices: Vec<&[u8]> = dhs.iter().map(|d| d.as_slice()).collect();
    let sk = kdf(&slices, &info);
    for d in dhs.iter_mut() {
        d.zeroize();
    }
    sk
}

/// Deterministically derives the session-ID from the X3DH shared secret.
fn calculate_session_id(shared_secret: &[u8; 32]) -> SessionId {
    let mut hasher = Sha256::new();
    // session-id | shared-secret
    hasher.update(b"session-id");
    hasher.update(shared_secret);
    SessionId(hasher.finalize().into())
}

// === Session handle ===

/// Derived session secrets held by a live session.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionSecret {
    root: [u8; 32],
    /// `Encode(IK_initiator) || Encode(IK_responder)`.
    #[zeroize(skip)]
    associated_data: [u8; 66],
}

impl SessionSecret {
    fn new(root: &[u8; 32], initiator: &X25519PublicKey, responder: &X25519PublicKey) -> Self {
        let mut associated_data = [0u8; 66];
        associated_data[..33].copy_from_slice(&encode_pk(initiator));
        associated_data[33..].copy_from_slice(&encode_pk(responder));
        Self {
            root: *root,
            associated_data,
        }
    }

    /// Expand the per-message key and nonce from the root key and `salt`.
    fn message_cipher(&self, salt: &[u8]) -> Result<(XChaCha20Poly1305, [u8; 24]), EngineError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), &self.root);
        let mut okm = Zeroizing::new([0u8; 32 + 24]);
        hk.expand(MESSAGE_KEY_INFO, &mut okm[..])?;
        let cipher = XChaCha20Poly1305::new_from_slice(&okm[..32]).map_err(|_| EngineError::Aead)?;
        let mut nonce = [0u8; 24];
        nonce.copy_from_slice(&okm[32..]);
        Ok((cipher, nonce))
    }
}

// === Engine ===

/// X25519 / XEdDSA / XChaCha20‑Poly1305 implementation of [`CryptoEngine`].
#[derive(Clone, Copy, Debug, Default)]
pub struct X3dhEngine;

impl X3dhEngine {
    pub fn new() -> Self {
        Self
    }
}

impl CryptoEngine for X3dhEngine {
    type Handle = SessionSecret;
    type PrivateKey = StaticSecret;
    type PublicKey = X25519PublicKey;

    fn generate_key_pair(&self) -> RawKeyPair {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        RawKeyPair {
            private_key: Zeroizing::new(secret.to_bytes().to_vec()),
            public_key: public.as_bytes().to_vec(),
        }
    }

    fn import_private_key(&self, raw: &[u8]) -> Result<StaticSecret, EngineError> {
        StaticSecret::try_from(&SecretBytes::from(raw)).map_err(|len| {
            EngineError::InvalidKey(format!("expected 32 private key bytes, got {len}"))
        })
    }

    fn import_public_key(&self, raw: &[u8]) -> Result<X25519PublicKey, EngineError> {
        let bytes: [u8; 32] = raw.try_into().map_err(|_| {
            EngineError::InvalidKey(format!("expected 32 public key bytes, got {}", raw.len()))
        })?;
        Ok(X25519PublicKey::from(bytes))
    }

    fn public_key_bytes(&self, key: &StaticSecret) -> Vec<u8> {
        X25519PublicKey::from(key).as_bytes().to_vec()
    }

    fn derive_initiator_session(
        &self,
        local: &InitiatorPrivateInfo<StaticSecret>,
        peer: &ResponderPublicInfo<X25519PublicKey>,
        additional_data: &[u8],
    ) -> Result<DerivedSession<SessionSecret>, EngineError> {
        let mut dhs = vec![
            dh(&local.identity_key, &peer.long_term_key, "IK_A/LT_B")?,
            dh(&local.ephemeral_key, &peer.identity_key, "EK_A/IK_B")?,
            dh(&local.ephemeral_key, &peer.long_term_key, "EK_A/LT_B")?,
        ];
        if let Some(one_time) = &peer.one_time_key {
            dhs.push(dh(&local.ephemeral_key, one_time, "EK_A/OT_B")?);
        }
        let sk = derive_root(dhs, additional_data)?;

        let local_identity = X25519PublicKey::from(&local.identity_key);
        Ok(DerivedSession {
            session_id: calculate_session_id(&sk),
            handle: SessionSecret::new(&sk, &local_identity, &peer.identity_key),
        })
    }

    fn derive_responder_session(
        &self,
        local: &ResponderPrivateInfo<StaticSecret>,
        peer: &InitiatorPublicInfo<X25519PublicKey>,
        additional_data: &[u8],
    ) -> Result<DerivedSession<SessionSecret>, EngineError> {
        let mut dhs = vec![
            dh(&local.long_term_key, &peer.identity_key, "LT_B/IK_A")?,
            dh(&local.identity_key, &peer.ephemeral_key, "IK_B/EK_A")?,
            dh(&local.long_term_key, &peer.ephemeral_key, "LT_B/EK_A")?,
        ];
        if let Some(one_time) = &local.one_time_key {
            dhs.push(dh(one_time, &peer.ephemeral_key, "OT_B/EK_A")?);
        }
        let sk = derive_root(dhs, additional_data)?;

        let local_identity = X25519PublicKey::from(&local.identity_key);
        Ok(DerivedSession {
            session_id: calculate_session_id(&sk),
            handle: SessionSecret::new(&sk, &peer.identity_key, &local_identity),
        })
    }

    fn encrypt_with(&self, handle: &SessionSecret, plaintext: &[u8]) -> Result<Sealed, EngineError> {
        let mut salt = vec![0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let (cipher, nonce) = handle.message_cipher(&salt)?;
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &handle.associated_data,
                },
            )
            .map_err(|_| EngineError::Aead)?;
        Ok(Sealed { salt, ciphertext })
    }

    fn decrypt_with(
        &self,
        handle: &SessionSecret,
        salt: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        if ciphertext.len() > MAX_CIPHERTEXT {
            return Err(EngineError::CiphertextTooLarge);
        }
        if salt.len() != SALT_LEN {
            return Err(EngineError::DecryptFailed);
        }
        let (cipher, nonce) = handle.message_cipher(salt)?;
        cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &handle.associated_data,
                },
            )
            .map_err(|_| EngineError::DecryptFailed)
    }

    fn sign(&self, data: &[u8], key: &StaticSecret) -> Vec<u8> {
        let signing = XEdPrivate::from(key);
        let signature: [u8; 64] = signing.sign(data, OsRng);
        signature.to_vec()
    }

    fn verify(&self, data: &[u8], signature: &[u8], key: &X25519PublicKey) -> bool {
        let Ok(signature) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        XEdPublic::from(key).verify(data, &signature).is_ok()
    }

    fn export_handle(&self, handle: &SessionSecret) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(HANDLE_LEN));
        out.extend_from_slice(&handle.root);
        out.extend_from_slice(&handle.associated_data);
        out
    }

    fn import_handle(&self, raw: &[u8]) -> Result<SessionSecret, EngineError> {
        if raw.len() != HANDLE_LEN {
            return Err(EngineError::InvalidHandle);
        }
        let mut root = [0u8; 32];
        root.copy_from_slice(&raw[..32]);
        let mut associated_data = [0u8; 66];
        associated_data.copy_from_slice(&raw[32..]);
        if associated_data[0] != CURVE_ID_X25519 || associated_data[33] != CURVE_ID_X25519 {
            root.zeroize();
            return Err(EngineError::InvalidHandle);
        }
        let handle = SessionSecret {
            root,
            associated_data,
        };
        root.zeroize();
        Ok(handle)
    }
}
