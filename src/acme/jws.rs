//! JWS construction for acme requests (rfc8555 s6.2, rfc7515).
//!
//! The account key decides the algorithm: RS256 for rsa, ES256/ES384 for the
//! two supported nist curves. HS256 is only ever used for external account
//! binding, keyed by the ca provided secret.

use log::trace;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

use crate::crypt::{base64, base64_hmac256, base64_sha256};
use crate::AcmeError;

pub const ALG_RS256: &str = "RS256";
pub const ALG_ES256: &str = "ES256";
pub const ALG_ES384: &str = "ES384";
pub const ALG_HMAC_256: &str = "HS256"; //eab使用该算法签名

const TIP_UNSUPPORTED_KEY: &str = "Unsupported private key. Only rsa, ecdsa P-256 and ecdsa P-384 are accepted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlg {
    RSA2048,
    RSA4096,
    ECC256,
    ECC384,
}

impl KeyAlg {
    pub fn new(alg: &str) -> Self {
        match alg.to_uppercase().as_str() {
            "EC2" | "ECC2" | "ES256" => KeyAlg::ECC256,
            "RSA4" => KeyAlg::RSA4096,
            "RSA2" | "RS256" => KeyAlg::RSA2048,
            _ => KeyAlg::ECC384, //default
        }
    }

    pub fn is_ecc(&self) -> bool {
        matches!(self, KeyAlg::ECC256 | KeyAlg::ECC384)
    }
}

#[derive(Clone)]
pub enum KeyPair {
    Rsa(Box<RsaPrivateKey>),
    P256(p256::SecretKey),
    P384(p384::SecretKey),
}

/// An account private key plus the kid the server assigned to it, once registered.
#[derive(Clone)]
pub struct AccountKey {
    key: KeyPair,
    kid: Option<String>,
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKey").field("alg", &self.alg()).field("kid", &self.kid).finish()
    }
}

impl AccountKey {
    pub fn new(key: KeyPair) -> Self {
        AccountKey { key, kid: None }
    }

    pub fn generate(alg: KeyAlg) -> Result<Self, AcmeError> {
        let key = match alg {
            KeyAlg::ECC256 => KeyPair::P256(p256::SecretKey::random(&mut OsRng)),
            KeyAlg::ECC384 => KeyPair::P384(p384::SecretKey::random(&mut OsRng)),
            KeyAlg::RSA2048 | KeyAlg::RSA4096 => {
                let bits = if alg == KeyAlg::RSA2048 { 2048 } else { 4096 };
                let rsa = RsaPrivateKey::new(&mut rand::thread_rng(), bits).map_err(|e| AcmeError::Key(e.to_string()))?;
                KeyPair::Rsa(Box::new(rsa))
            }
        };
        Ok(Self::new(key))
    }

    /// Accepts pkcs8, sec1 (`EC PRIVATE KEY`) and pkcs1 (`RSA PRIVATE KEY`) pem.
    pub fn from_pem(pem: &str) -> Result<Self, AcmeError> {
        let pem = pem.trim();
        let key = if let Ok(k) = p256::SecretKey::from_pkcs8_pem(pem) {
            KeyPair::P256(k)
        } else if let Ok(k) = p256::SecretKey::from_sec1_pem(pem) {
            KeyPair::P256(k)
        } else if let Ok(k) = p384::SecretKey::from_pkcs8_pem(pem) {
            KeyPair::P384(k)
        } else if let Ok(k) = p384::SecretKey::from_sec1_pem(pem) {
            KeyPair::P384(k)
        } else if let Ok(k) = RsaPrivateKey::from_pkcs8_pem(pem) {
            KeyPair::Rsa(Box::new(k))
        } else if let Ok(k) = RsaPrivateKey::from_pkcs1_pem(pem) {
            KeyPair::Rsa(Box::new(k))
        } else {
            return Err(AcmeError::Key(TIP_UNSUPPORTED_KEY.to_string()));
        };
        Ok(Self::new(key))
    }

    pub fn to_pem(&self) -> Result<String, AcmeError> {
        let pem = match &self.key {
            KeyPair::Rsa(k) => k.to_pkcs8_pem(LineEnding::LF),
            KeyPair::P256(k) => k.to_pkcs8_pem(LineEnding::LF),
            KeyPair::P384(k) => k.to_pkcs8_pem(LineEnding::LF),
        }
        .map_err(|e| AcmeError::Key(e.to_string()))?;
        Ok(pem.as_str().to_string())
    }

    pub fn with_kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = Some(kid.into());
        self
    }

    /// The same key, for requests that must carry the jwk (newAccount).
    pub fn without_kid(&self) -> Self {
        AccountKey {
            key: self.key.clone(),
            kid: None,
        }
    }

    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref().filter(|k| !k.is_empty())
    }

    pub fn alg(&self) -> &'static str {
        match self.key {
            KeyPair::Rsa(_) => ALG_RS256,
            KeyPair::P256(_) => ALG_ES256,
            KeyPair::P384(_) => ALG_ES384,
        }
    }

    pub fn jwk(&self) -> Result<Jwk, AcmeError> {
        match &self.key {
            KeyPair::Rsa(k) => Ok(Jwk::Rsa(JwkRsa::new(base64(&k.e().to_bytes_be()), base64(&k.n().to_bytes_be())))),
            KeyPair::P256(k) => {
                let point = k.public_key().to_encoded_point(false);
                ec_jwk("P-256", point.x().map(|x| x.as_slice()), point.y().map(|y| y.as_slice()))
            }
            KeyPair::P384(k) => {
                let point = k.public_key().to_encoded_point(false);
                ec_jwk("P-384", point.x().map(|x| x.as_slice()), point.y().map(|y| y.as_slice()))
            }
        }
    }

    pub fn thumbprint(&self) -> Result<String, AcmeError> {
        self.jwk()?.thumbprint()
    }

    /// `token.thumbprint`, the http-01 response body (rfc8555 s8.1).
    pub fn key_authorization(&self, token: &str) -> Result<String, AcmeError> {
        Ok(format!("{}.{}", token, self.thumbprint()?))
    }

    /// base64url(sha256(key authorization)), the dns-01 txt value.
    pub fn key_authorization_digest(&self, token: &str) -> Result<String, AcmeError> {
        Ok(base64_sha256(self.key_authorization(token)?.as_bytes()))
    }

    pub(crate) fn sign(&self, data: &[u8]) -> Result<Vec<u8>, AcmeError> {
        match &self.key {
            KeyPair::Rsa(k) => {
                let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(k.as_ref().clone());
                let sig = signing_key.try_sign(data).map_err(|e| AcmeError::Key(e.to_string()))?;
                Ok(sig.to_vec())
            }
            KeyPair::P256(k) => {
                let signing_key = p256::ecdsa::SigningKey::from(k.clone());
                let sig: p256::ecdsa::Signature = signing_key.try_sign(data).map_err(|e| AcmeError::Key(e.to_string()))?;
                let (r, s) = sig.split_bytes();
                Ok(ecdsa_concat(&r, &s, 256))
            }
            KeyPair::P384(k) => {
                let signing_key = p384::ecdsa::SigningKey::from(k.clone());
                let sig: p384::ecdsa::Signature = signing_key.try_sign(data).map_err(|e| AcmeError::Key(e.to_string()))?;
                let (r, s) = sig.split_bytes();
                Ok(ecdsa_concat(&r, &s, 384))
            }
        }
    }
}

fn ec_jwk(crv: &str, x: Option<&[u8]>, y: Option<&[u8]>) -> Result<Jwk, AcmeError> {
    match (x, y) {
        (Some(x), Some(y)) => Ok(Jwk::Ecc(JwkEcc::new(crv.to_string(), base64(x), base64(y)))),
        _ => Err(AcmeError::Key("public key is the identity point".to_string())),
    }
}

// r and s are fixed width big-endian integers, rfc7518 s3.4
pub(crate) fn ecdsa_concat(r: &[u8], s: &[u8], curve_bits: usize) -> Vec<u8> {
    let octets = (curve_bits + 7) / 8;
    let mut out = pad_octets(r, octets);
    out.extend(pad_octets(s, octets));
    out
}

fn pad_octets(v: &[u8], octets: usize) -> Vec<u8> {
    let mut v = v;
    while v.len() > octets && v[0] == 0 {
        v = &v[1..];
    }
    let mut out = vec![0u8; octets.saturating_sub(v.len())];
    out.extend_from_slice(v);
    out
}

// members are declared in lexicographic order, so the serialized form is the rfc7638 input
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JwkEcc {
    crv: String,
    kty: String,
    x: String,
    y: String,
}

impl JwkEcc {
    fn new(crv: String, x: String, y: String) -> Self {
        JwkEcc {
            kty: String::from("EC"),
            crv,
            x,
            y,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JwkRsa {
    e: String,
    kty: String,
    n: String,
}

impl JwkRsa {
    fn new(e: String, n: String) -> Self {
        JwkRsa {
            kty: String::from("RSA"),
            e,
            n,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Jwk {
    Ecc(JwkEcc),
    Rsa(JwkRsa),
}

impl Jwk {
    pub fn thumbprint(&self) -> Result<String, AcmeError> {
        Ok(base64_sha256(serde_json::to_string(self)?.as_bytes()))
    }
}

#[derive(Serialize, Debug)]
pub(crate) struct Protected<'a> {
    alg: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    url: &'a str,
}

impl<'a> Protected<'a> {
    /// kid when the key carries one, the embedded jwk otherwise. Never both.
    pub(crate) fn from_key(url: &'a str, key: &'a AccountKey, nonce: Option<String>) -> Result<Self, AcmeError> {
        let (jwk, kid) = match key.kid() {
            Some(kid) => (None, Some(kid)),
            None => (Some(key.jwk()?), None),
        };
        Ok(Protected {
            alg: key.alg(),
            jwk,
            kid,
            nonce,
            url,
        })
    }

    pub(crate) fn from_jwk(url: &'a str, key: &'a AccountKey) -> Result<Self, AcmeError> {
        Ok(Protected {
            alg: key.alg(),
            jwk: Some(key.jwk()?),
            kid: None,
            nonce: None,
            url,
        })
    }

    fn from_eab(url: &'a str, kid: &'a str) -> Self {
        Protected {
            alg: ALG_HMAC_256,
            jwk: None,
            kid: Some(kid),
            nonce: None,
            url,
        }
    }

    fn encode(&self) -> Result<String, AcmeError> {
        let protected_json = serde_json::to_string(self)?;
        trace!("protected: {}", protected_json);
        Ok(base64(protected_json.as_bytes()))
    }
}

/// The three payload shapes rfc8555 s6 distinguishes.
pub enum Payload<'a> {
    /// POST-as-GET
    Empty,
    Json(serde_json::Value),
    /// an already signed message embedded verbatim, e.g. key rollover
    Signed(&'a SignedMessage),
}

impl<'a> Payload<'a> {
    pub fn json<T: Serialize>(t: &T) -> Result<Self, AcmeError> {
        Ok(Payload::Json(serde_json::to_value(t)?))
    }

    pub(crate) fn encode(&self) -> Result<String, AcmeError> {
        match self {
            Payload::Empty => Ok(String::new()),
            Payload::Json(v) => Ok(base64(serde_json::to_string(v)?.as_bytes())),
            Payload::Signed(m) => Ok(base64(serde_json::to_string(m)?.as_bytes())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

impl SignedMessage {
    pub(crate) fn sign(protected: &Protected, payload64: &str, key: &AccountKey) -> Result<Self, AcmeError> {
        let protected64 = protected.encode()?;
        let plain = format!("{}.{}", protected64, payload64);
        let signature = base64(&key.sign(plain.as_bytes())?);
        Ok(SignedMessage {
            protected: protected64,
            payload: payload64.to_string(),
            signature,
        })
    }

    fn sign_hmac(protected: &Protected, payload64: &str, hmac_key: &str) -> Result<Self, AcmeError> {
        let protected64 = protected.encode()?;
        let plain = format!("{}.{}", protected64, payload64);
        Ok(SignedMessage {
            signature: base64_hmac256(hmac_key, &plain)?,
            protected: protected64,
            payload: payload64.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, AcmeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// External account binding credentials handed out by the ca.
#[derive(Clone, Deserialize)]
pub struct Eab {
    pub kid: String,
    pub hmac_key: String,
}

impl fmt::Debug for Eab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Eab").field("kid", &self.kid).field("hmac_key", &"[redacted]").finish()
    }
}

impl Eab {
    pub fn new(kid: impl Into<String>, hmac_key: impl Into<String>) -> Self {
        Eab {
            kid: kid.into(),
            hmac_key: hmac_key.into(),
        }
    }

    /// rfc8555 s7.3.4: the account jwk, signed with the eab mac key, no nonce.
    pub(crate) fn binding(&self, key: &AccountKey, new_account_url: &str) -> Result<SignedMessage, AcmeError> {
        let payload = Payload::json(&key.jwk()?)?.encode()?;
        let protected = Protected::from_eab(new_account_url, &self.kid);
        SignedMessage::sign_hmac(&protected, &payload, &self.hmac_key)
    }
}


#[cfg(test)]
mod tests {
    use super::test_keys::*;
    use super::*;
    use crate::crypt::{base64_decode, hmac256};
    use rsa::signature::Verifier;

    fn decode_json(s: &str) -> serde_json::Value {
        serde_json::from_slice(&base64_decode(s).unwrap()).unwrap()
    }

    #[test]
    fn loads_supported_keys() {
        assert_eq!(AccountKey::from_pem(P256_SEC1).unwrap().alg(), ALG_ES256);
        assert_eq!(AccountKey::from_pem(P384_PKCS8).unwrap().alg(), ALG_ES384);
        assert_eq!(AccountKey::from_pem(RSA2048_PKCS8).unwrap().alg(), ALG_RS256);
    }

    #[test]
    fn rejects_other_curves() {
        let err = AccountKey::from_pem(SECP256K1_PKCS8).unwrap_err();
        assert!(matches!(err, AcmeError::Key(_)));
    }

    #[test]
    fn pem_round_trip_keeps_the_jwk() {
        let key = AccountKey::from_pem(P256_SEC1).unwrap();
        let again = AccountKey::from_pem(&key.to_pem().unwrap()).unwrap();
        assert_eq!(key.jwk().unwrap(), again.jwk().unwrap());
    }

    #[test]
    fn rfc7638_thumbprint() {
        let jwk = Jwk::Rsa(JwkRsa::new(
            "AQAB".to_string(),
            "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw".to_string(),
        ));
        assert_eq!(jwk.thumbprint().unwrap(), "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs");
    }

    #[test]
    fn key_authorizations() {
        let key = AccountKey::from_pem(P256_SEC1).unwrap();
        let thumbprint = key.thumbprint().unwrap();
        let ka = key.key_authorization("tok").unwrap();
        assert_eq!(ka, format!("tok.{}", thumbprint));
        assert_eq!(key.key_authorization_digest("tok").unwrap(), base64_sha256(ka.as_bytes()));
    }

    #[test]
    fn pads_short_integers() {
        let out = ecdsa_concat(&[1, 2], &[0, 0, 3], 256);
        assert_eq!(out.len(), 64);
        assert_eq!(&out[30..32], &[1, 2]);
        assert_eq!(out[63], 3);
        assert!(out[..30].iter().all(|b| *b == 0));

        // a der style leading zero is dropped rather than overflowing the width
        let mut wide = vec![0u8];
        wide.extend([0xffu8; 48]);
        assert_eq!(ecdsa_concat(&wide, &wide, 384).len(), 96);
    }

    #[test]
    fn es256_verifies_with_leading_zero_components() {
        let key = AccountKey::from_pem(P256_SEC1).unwrap();
        let verifying_key = match &key.key {
            KeyPair::P256(k) => p256::ecdsa::VerifyingKey::from(k.public_key()),
            _ => unreachable!(),
        };
        let mut seen_leading_zero = false;
        for i in 0..4000 {
            let msg = format!("message-{}", i);
            let raw = key.sign(msg.as_bytes()).unwrap();
            assert_eq!(raw.len(), 64);
            let sig = p256::ecdsa::Signature::from_slice(&raw).unwrap();
            verifying_key.verify(msg.as_bytes(), &sig).unwrap();
            if raw[0] == 0 || raw[32] == 0 {
                seen_leading_zero = true;
                break;
            }
        }
        assert!(seen_leading_zero);
    }

    #[test]
    fn es384_verifies_with_leading_zero_components() {
        let key = AccountKey::from_pem(P384_PKCS8).unwrap();
        let verifying_key = match &key.key {
            KeyPair::P384(k) => p384::ecdsa::VerifyingKey::from(k.public_key()),
            _ => unreachable!(),
        };
        let mut seen_leading_zero = false;
        for i in 0..4000 {
            let msg = format!("message-{}", i);
            let raw = key.sign(msg.as_bytes()).unwrap();
            assert_eq!(raw.len(), 96);
            let sig = p384::ecdsa::Signature::from_slice(&raw).unwrap();
            verifying_key.verify(msg.as_bytes(), &sig).unwrap();
            if raw[0] == 0 || raw[48] == 0 {
                seen_leading_zero = true;
                break;
            }
        }
        assert!(seen_leading_zero);
    }

    #[test]
    fn rs256_signature_verifies() {
        let key = AccountKey::from_pem(RSA2048_PKCS8).unwrap();
        let public = match &key.key {
            KeyPair::Rsa(k) => k.to_public_key(),
            _ => unreachable!(),
        };
        let raw = key.sign(b"payload").unwrap();
        let verifying_key = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public);
        let sig = rsa::pkcs1v15::Signature::try_from(raw.as_slice()).unwrap();
        verifying_key.verify(b"payload", &sig).unwrap();
    }

    #[test]
    fn header_uses_kid_or_jwk_never_both() {
        let key = AccountKey::from_pem(P256_SEC1).unwrap();
        let msg = SignedMessage::sign(
            &Protected::from_key("https://ca/new-acct", &key, Some("n1".to_string())).unwrap(),
            "",
            &key,
        )
        .unwrap();
        let header = decode_json(&msg.protected);
        assert!(header.get("jwk").is_some());
        assert!(header.get("kid").is_none());
        assert_eq!(header["nonce"], "n1");
        assert_eq!(header["alg"], "ES256");

        let key = key.with_kid("https://ca/acct/1");
        let msg = SignedMessage::sign(
            &Protected::from_key("https://ca/order", &key, Some("n2".to_string())).unwrap(),
            "",
            &key,
        )
        .unwrap();
        let header = decode_json(&msg.protected);
        assert!(header.get("jwk").is_none());
        assert_eq!(header["kid"], "https://ca/acct/1");
        assert_eq!(msg.payload, "");
    }

    #[test]
    fn nested_payload_is_the_marshalled_inner_message() {
        let key = AccountKey::from_pem(P256_SEC1).unwrap();
        let inner = SignedMessage::sign(&Protected::from_jwk("https://ca/key-change", &key).unwrap(), "e30", &key).unwrap();
        let encoded = Payload::Signed(&inner).encode().unwrap();
        let decoded: SignedMessage = serde_json::from_slice(&base64_decode(&encoded).unwrap()).unwrap();
        assert_eq!(decoded, inner);
    }

    #[test]
    fn eab_binding_shape_and_mac() {
        let key = AccountKey::from_pem(P256_SEC1).unwrap();
        let secret = base64(b"super-secret-mac-key");
        let eab = Eab::new("eab-kid", secret);
        let msg = eab.binding(&key, "https://ca/new-acct").unwrap();

        let header = decode_json(&msg.protected);
        assert_eq!(header["alg"], "HS256");
        assert_eq!(header["kid"], "eab-kid");
        assert_eq!(header["url"], "https://ca/new-acct");
        assert!(header.get("nonce").is_none());

        let payload: Jwk = serde_json::from_value(decode_json(&msg.payload)).unwrap();
        assert_eq!(payload, key.jwk().unwrap());

        let plain = format!("{}.{}", msg.protected, msg.payload);
        assert_eq!(msg.signature, base64(&hmac256(b"super-secret-mac-key", &plain)));
    }
}
