use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::Deserialize;
use x509_parser::extensions::ParsedExtension;

use super::certificate::{parse_der, to_utc};
use super::AcmeClient;
use crate::{crypt::base64, AcmeError, HEADER_RETRY_AFTER};

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SuggestedWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenewalInfoBody {
    suggested_window: SuggestedWindow,
    #[serde(rename = "explanationURL", default)]
    explanation_url: Option<String>,
}

/// ari response (draft-ietf-acme-ari). `retry_after` is when to ask again.
#[derive(Debug, Clone)]
pub struct RenewalInfo {
    pub suggested_window: SuggestedWindow,
    pub explanation_url: Option<String>,
    pub retry_after: DateTime<Utc>,
}

// delta-seconds or an http-date
fn parse_retry_after(v: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let v = v.trim();
    if let Ok(secs) = v.parse::<i64>() {
        // out of range saturates, the clamp caps it at a day anyway
        let t = Duration::try_seconds(secs).and_then(|d| now.checked_add_signed(d));
        return Some(t.unwrap_or(now + Duration::hours(24)));
    }
    DateTime::parse_from_rfc2822(v).ok().map(|t| t.with_timezone(&Utc))
}

fn clamp_retry_after(t: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    t.clamp(now + Duration::minutes(1), now + Duration::hours(24))
}

/// `<aki>.<serial>`, both base64url of the raw bytes.
pub(crate) fn cert_id(cert_pem: &str) -> Result<(String, DateTime<Utc>), AcmeError> {
    let block = pem::parse(cert_pem.trim()).map_err(|e| AcmeError::Validation(format!("bad pem: {}", e)))?;
    let cert = parse_der(block.contents())?;
    let aki = cert
        .extensions()
        .iter()
        .find_map(|ext| match ext.parsed_extension() {
            ParsedExtension::AuthorityKeyIdentifier(aki) => aki.key_identifier.as_ref().map(|k| k.0.to_vec()),
            _ => None,
        })
        .ok_or_else(|| AcmeError::Validation("certificate has no authority key identifier".to_string()))?;
    let not_after = to_utc(cert.validity().not_after)?;
    Ok((format!("{}.{}", base64(&aki), base64(cert.raw_serial())), not_after))
}

impl AcmeClient {
    /// Asks the server when `cert_pem` (leaf first) should be renewed.
    pub async fn renewal_info(&self, cert_pem: &str) -> Result<RenewalInfo, AcmeError> {
        let base = match &self.directory().renewal_info {
            Some(u) => u.trim_end_matches('/').to_string(),
            None => return Err(AcmeError::Validation("acme server does not support renewal info".to_string())),
        };
        let first = match pem::parse_many(cert_pem) {
            Ok(blocks) => blocks.into_iter().next(),
            Err(e) => return Err(AcmeError::Validation(format!("bad pem: {}", e))),
        };
        let first = first.ok_or_else(|| AcmeError::Validation("no certificate".to_string()))?;

        let (id, not_after) = cert_id(&pem::encode(&first))?;
        let now = Utc::now();
        if not_after <= now {
            return Err(AcmeError::Validation(format!("certificate expired at {}", not_after)));
        }

        let url = format!("{}/{}", base, id);
        let res = self.get(&url).await?;
        let retry_after = res
            .header(HEADER_RETRY_AFTER)
            .ok_or_else(|| AcmeError::Validation("renewal info has no Retry-After".to_string()))?;
        let retry_after = parse_retry_after(&retry_after, now)
            .ok_or_else(|| AcmeError::Validation(format!("bad Retry-After '{}'", retry_after)))?;

        let body: RenewalInfoBody = serde_json::from_slice(&res.body)?;
        let window = body.suggested_window;
        if window.end <= window.start {
            return Err(AcmeError::Validation(format!("suggested window ends at {} before it starts", window.end)));
        }
        debug!("Renewal window {} - {}", window.start, window.end);
        Ok(RenewalInfo {
            suggested_window: window,
            explanation_url: body.explanation_url,
            retry_after: clamp_retry_after(retry_after, now),
        })
    }
}
