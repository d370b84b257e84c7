//! RSA-PSS-SHA256 signing/verification and PEM certificate helpers.
//!
//! Every signed payload in the market (offers, purchase orders, contracts,
//! get-contract requests) goes through this crate: callers assemble the
//! canonical bytes for the payload and hand them here to be signed or
//! verified. This crate never reasons about *what* the bytes mean.

use base64::Engine;
use rsa::pss::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};

const BASE64: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::STANDARD;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("malformed PEM private key")]
    MalformedKeyPem(#[source] rsa::pkcs8::Error),
    #[error("malformed PEM certificate")]
    MalformedCertPem,
    #[error("malformed certificate DER")]
    MalformedCertDer(String),
    #[error("certificate has {0} common names, expected exactly 1")]
    CommonNameCount(usize),
    #[error("certificate public key is not a well-formed RSA key")]
    MalformedPublicKey,
    #[error("signature is not valid base64")]
    MalformedSignatureBase64,
    #[error("signature verification failed")]
    InvalidSignature,
}

/// An RSA key pair, loaded from PEM, used for signing.
pub struct KeyPair {
    inner: RsaPrivateKey,
}

impl KeyPair {
    /// Loads a PKCS#1 or PKCS#8 RSA private key from PEM text.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        use rsa::pkcs1::DecodeRsaPrivateKey;
        use rsa::pkcs8::DecodePrivateKey;

        let inner = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(CryptoError::MalformedKeyPem)?;
        Ok(Self { inner })
    }

    /// Signs `data` with RSA-PSS, MGF1-SHA256, SHA-256 digest, at the
    /// scheme's maximum salt length (mirrors Python's
    /// `padding.PSS.MAX_LENGTH`: `key_size_bytes - digest_size - 2`),
    /// returning the signature base64-encoded (standard alphabet) for
    /// on-wire transport.
    pub fn sign(&self, data: &[u8]) -> String {
        let max_salt_len = self.inner.size() - <Sha256 as Digest>::output_size() - 2;
        let signing_key = SigningKey::<Sha256>::new_with_salt_len(self.inner.clone(), max_salt_len);
        let mut rng = rand::thread_rng();
        let signature: Signature = signing_key.sign_with_rng(&mut rng, data);
        BASE64.encode(signature.to_bytes())
    }
}

/// A loaded X.509 certificate: just enough to verify signatures and read the
/// Common Name used to bind a certificate to an `iaid`.
pub struct Certificate {
    public_key: RsaPublicKey,
    common_name: String,
}

impl Certificate {
    /// Loads a certificate from PEM text.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let (_, pem) = parse_x509_pem(pem.as_bytes()).map_err(|_| CryptoError::MalformedCertPem)?;
        Self::from_der(&pem.contents)
    }

    /// Loads a certificate from raw DER bytes.
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|err| CryptoError::MalformedCertDer(err.to_string()))?;

        let common_name = common_name(&cert)?;

        use rsa::pkcs8::DecodePublicKey;
        let spki_der = cert.public_key().raw;
        let public_key = RsaPublicKey::from_public_key_der(spki_der)
            .or_else(|_| {
                use rsa::pkcs1::DecodeRsaPublicKey;
                RsaPublicKey::from_pkcs1_der(spki_der)
            })
            .map_err(|_| CryptoError::MalformedPublicKey)?;

        Ok(Self { public_key, common_name })
    }

    /// The certificate's Common Name (`CN`), expected to equal the owning
    /// AS's `iaid`.
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Verifies a base64-encoded RSA-PSS-SHA256 signature over `data`.
    pub fn verify(&self, signature_b64: &str, data: &[u8]) -> Result<(), CryptoError> {
        let sig_bytes = BASE64
            .decode(signature_b64)
            .map_err(|_| CryptoError::MalformedSignatureBase64)?;
        let signature =
            Signature::try_from(sig_bytes.as_slice()).map_err(|_| CryptoError::InvalidSignature)?;
        let verifying_key = VerifyingKey::<Sha256>::new(self.public_key.clone());
        verifying_key
            .verify(data, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

fn common_name(cert: &X509Certificate) -> Result<String, CryptoError> {
    let mut names = cert.subject().iter_common_name();
    let first = names.next().ok_or(CryptoError::CommonNameCount(0))?;
    if names.next().is_some() {
        return Err(CryptoError::CommonNameCount(2));
    }
    first
        .as_str()
        .map(str::to_owned)
        .map_err(|_| CryptoError::CommonNameCount(0))
}
