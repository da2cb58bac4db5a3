use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use regex::Regex;
use serde::Serialize;
use x509_parser::{certificate::X509Certificate, time::ASN1Time, x509::X509Name};

use super::jws::Payload;
use super::{media_type, AccountKey, AcmeClient};
use crate::{crypt::base64, AcmeError, HttpResponse, HEADER_LINK};

pub const CONTENT_TYPE_PEM_CHAIN: &str = "application/pem-certificate-chain";
const PEM_BEGIN: &str = "-----BEGIN";
const PEM_TAG_CERTIFICATE: &str = "CERTIFICATE";
const LINK_ALT_REGEX: &str = r#"<([^>]+)>\s*;\s*rel="?alternate"?"#;

/// A downloaded chain that passed validation. `root_cn` is the issuer CN of the topmost certificate.
#[derive(Debug, Clone)]
pub struct CertificateChain {
    pub url: String,
    pub pem: String,
    pub root_cn: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertificateChain {
    fn from_response(url: &str, res: &HttpResponse) -> Result<Self, AcmeError> {
        let content_type = media_type(res);
        if content_type != CONTENT_TYPE_PEM_CHAIN {
            return Err(AcmeError::Validation(format!("unexpected certificate content type '{}'", content_type)));
        }
        let pem = std::str::from_utf8(&res.body).map_err(|e| AcmeError::Validation(format!("certificate chain is not utf-8: {}", e)))?;
        let (root_cn, not_before, not_after) = validate_chain(pem)?;
        Ok(CertificateChain {
            url: url.to_string(),
            pem: pem.to_string(),
            root_cn,
            not_before,
            not_after,
        })
    }

    fn matches(&self, preferred: Option<&str>) -> bool {
        preferred.map_or(true, |p| p.eq_ignore_ascii_case(&self.root_cn))
    }
}

/// rfc8555 s11.4: nothing but CERTIFICATE blocks may come back from the server.
pub(crate) fn validate_chain(pem: &str) -> Result<(String, DateTime<Utc>, DateTime<Utc>), AcmeError> {
    for (i, _) in pem.match_indices(PEM_BEGIN) {
        if !pem[i + PEM_BEGIN.len()..].starts_with(" CERTIFICATE") {
            return Err(AcmeError::Validation(format!("{} not followed by {}", PEM_BEGIN, PEM_TAG_CERTIFICATE)));
        }
    }
    let blocks = pem::parse_many(pem).map_err(|e| AcmeError::Validation(format!("bad pem: {}", e)))?;
    if let Some(b) = blocks.iter().find(|b| b.tag() != PEM_TAG_CERTIFICATE) {
        return Err(AcmeError::Validation(format!("unexpected pem block {}", b.tag())));
    }
    let (leaf, top) = match (blocks.first(), blocks.last()) {
        (Some(leaf), Some(top)) => (leaf, top),
        _ => return Err(AcmeError::Validation("no valid CERTIFICATE blocks".to_string())),
    };

    let leaf = parse_der(leaf.contents())?;
    let top = parse_der(top.contents())?;
    Ok((
        common_name(top.issuer()),
        to_utc(leaf.validity().not_before)?,
        to_utc(leaf.validity().not_after)?,
    ))
}

pub(crate) fn parse_der(der: &[u8]) -> Result<X509Certificate<'_>, AcmeError> {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, cert)| cert)
        .map_err(|e| AcmeError::Validation(format!("bad certificate: {}", e)))
}

pub(crate) fn common_name(name: &X509Name) -> String {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn to_utc(t: ASN1Time) -> Result<DateTime<Utc>, AcmeError> {
    DateTime::from_timestamp(t.timestamp(), 0).ok_or_else(|| AcmeError::Validation(format!("time out of range: {}", t)))
}

fn alternate_links(res: &HttpResponse) -> Result<Vec<String>, AcmeError> {
    let re = Regex::new(LINK_ALT_REGEX)?;
    let mut links = Vec::new();
    for header in res.headers_all(HEADER_LINK) {
        for cap in re.captures_iter(&header) {
            if let Some(m) = cap.get(1) {
                links.push(m.as_str().to_string());
            }
        }
    }
    Ok(links)
}

/// rfc5280 CRLReason, sent as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    Unspecified = 0,
    KeyCompromise = 1,
    CaCompromise = 2,
    AffiliationChanged = 3,
    Superseded = 4,
    CessationOfOperation = 5,
    CertificateHold = 6,
    RemoveFromCrl = 8,
    PrivilegeWithdrawn = 9,
    AaCompromise = 10,
}

#[derive(Serialize)]
struct Revocation {
    certificate: String,
    reason: u8,
}

impl AcmeClient {
    /// Downloads the default chain, falling back to `Link: rel="alternate"` chains until one
    /// matches `preferred_root_cn`. Without a match the first valid chain wins.
    pub async fn download_certificate(
        &self,
        url: &str,
        preferred_root_cn: Option<&str>,
        key: &AccountKey,
    ) -> Result<CertificateChain, AcmeError> {
        let res = self.post_as_get(url, key).await?;
        let alternates = alternate_links(&res)?;

        let mut first_valid = None;
        match CertificateChain::from_response(url, &res) {
            Ok(chain) if chain.matches(preferred_root_cn) => return Ok(chain),
            Ok(chain) => first_valid = Some(chain),
            Err(e) => warn!("Default chain from {} rejected. {}", url, e),
        }

        for alt in alternates {
            debug!("Considering alternate chain {}", alt);
            let res = match self.post_as_get(&alt, key).await {
                Ok(res) => res,
                Err(e) => {
                    warn!("Download alternate chain {} failed. {}", alt, e);
                    continue;
                }
            };
            match CertificateChain::from_response(&alt, &res) {
                Ok(chain) if chain.matches(preferred_root_cn) => return Ok(chain),
                Ok(chain) => {
                    first_valid.get_or_insert(chain);
                }
                Err(e) => warn!("Alternate chain {} rejected. {}", alt, e),
            }
        }

        match first_valid {
            Some(chain) => {
                if let Some(p) = preferred_root_cn {
                    info!("Preferred chain {} not offered, using {}", p, chain.root_cn);
                }
                Ok(chain)
            }
            None => Err(AcmeError::Validation(format!("no valid certificate chain at {}", url))),
        }
    }

    /// Only the first pem block is sent, any trailing chain is ignored.
    pub async fn revoke_certificate(&self, cert_pem: &str, reason: RevocationReason, key: &AccountKey) -> Result<(), AcmeError> {
        let blocks = pem::parse_many(cert_pem).map_err(|e| AcmeError::Validation(format!("bad pem: {}", e)))?;
        let cert = match blocks.first() {
            Some(b) if b.tag() == PEM_TAG_CERTIFICATE => b,
            _ => return Err(AcmeError::Validation("no certificate to revoke".to_string())),
        };
        let payload = Payload::json(&Revocation {
            certificate: base64(cert.contents()),
            reason: reason as u8,
        })?;
        let url = self.directory().revoke_cert.clone();
        self.post(&url, &payload, key).await?;
        info!("Revoked certificate, reason {:?}", reason);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_certs {
    use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SerialNumber};

    pub struct Issued {
        pub pem: String,
        pub issuer_pem: String,
    }

    fn ca(cn: &str, parent: Option<(&rcgen::Certificate, &KeyPair)>) -> (rcgen::Certificate, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.use_authority_key_identifier_extension = true;
        let cert = match parent {
            Some((issuer, issuer_key)) => params.signed_by(&key, issuer, issuer_key).unwrap(),
            None => params.self_signed(&key).unwrap(),
        };
        (cert, key)
    }

    /// leaf + intermediate, where the intermediate is issued by a root named `root_cn`
    pub fn chain(root_cn: &str) -> String {
        let issued = leaf(root_cn, None, vec![0x01, 0x02, 0x03]);
        format!("{}{}", issued.pem, issued.issuer_pem)
    }

    pub fn leaf(root_cn: &str, not_after: Option<(i32, u8, u8)>, serial: Vec<u8>) -> Issued {
        let (root, root_key) = ca(root_cn, None);
        let (intermediate, intermediate_key) = ca(&format!("{} Intermediate", root_cn), Some((&root, &root_key)));

        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["a.example.com".to_string()]).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, "a.example.com");
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(SerialNumber::from(serial));
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        if let Some((y, m, d)) = not_after {
            params.not_after = rcgen::date_time_ymd(y, m, d);
        }
        let cert = params.signed_by(&key, &intermediate, &intermediate_key).unwrap();
        Issued {
            pem: cert.pem(),
            issuer_pem: intermediate.pem(),
        }
    }
}
