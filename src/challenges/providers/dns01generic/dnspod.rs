use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::{header, ApiAction, SignedDnsApi};
use crate::{
    crypt::{hex_hmac256, hmac256},
    AcmeError, CONTENT_TYPE_JSON,
};

const HOST: &str = "dnspod.tencentcloudapi.com";
const ALG: &str = "TC3-HMAC-SHA256";

const RECORD_ADD: &str = "CreateRecord";
const RECORD_DEL: &str = "DeleteRecord";
const VERSION: &str = "2021-03-23";

const SERVICE: &str = "dnspod";
const TC3_REQUEST: &str = "tc3_request";
const VALID_HEADERS: [&str; 3] = ["content-type", "host", "x-tc-action"];
const REGX_RECORD_ID: &str = r#""RecordId":\s*(\d+)"#;

pub(crate) struct DnsPod;

impl SignedDnsApi for DnsPod {
    fn host(&self) -> &'static str {
        HOST
    }
    fn content_type(&self) -> &'static str {
        CONTENT_TYPE_JSON
    }
    fn alg(&self) -> &'static str {
        ALG
    }
    fn signed_headers(&self) -> Option<&'static [&'static str]> {
        Some(&VALID_HEADERS)
    }

    fn add_record(&self, zone: &str, rr: &str, value: &str) -> ApiAction {
        ApiAction {
            name: RECORD_ADD,
            version: VERSION,
            payload: format!(
                "{{\"Domain\":\"{}\",\"SubDomain\":\"{}\",\"Value\":\"{}\",\"RecordType\":\"TXT\",\"RecordLine\":\"默认\"}}",
                zone, rr, value
            ),
        }
    }
    fn del_record(&self, zone: &str, record_id: &str) -> ApiAction {
        ApiAction {
            name: RECORD_DEL,
            version: VERSION,
            payload: format!("{{\"Domain\":\"{}\",\"RecordId\":{}}}", zone, record_id),
        }
    }

    fn stamp(&self, action: &ApiAction, _hashed_payload: &str, now: DateTime<Utc>, btm: &mut BTreeMap<&'static str, String>) {
        btm.insert("x-tc-action", action.name.to_string());
        btm.insert("x-tc-version", action.version.to_string());
        btm.insert("x-tc-date", now.date_naive().to_string());
        btm.insert("x-tc-timestamp", now.timestamp().to_string());
    }

    fn sign(&self, s_key: &str, canonical: &str, btm: &BTreeMap<&'static str, String>) -> Result<String, AcmeError> {
        let date = header(btm, "x-tc-date")?;
        let timestamp = header(btm, "x-tc-timestamp")?;

        let credential_scope = format!("{}/{}/{}", date, SERVICE, TC3_REQUEST);
        let to_sign = format!("{}\n{}\n{}\n{}", ALG, timestamp, credential_scope, canonical);

        // 派生签名密钥
        let signature = hmac256(format!("TC3{}", s_key).as_bytes(), date);
        let signature = hmac256(&signature, SERVICE);
        let signature = hmac256(&signature, TC3_REQUEST);
        Ok(hex_hmac256(&signature, &to_sign))
    }

    fn credential(&self, s_id: &str, btm: &BTreeMap<&'static str, String>) -> Result<String, AcmeError> {
        let date = header(btm, "x-tc-date")?;
        Ok(format!("{}/{}/{}/{}", s_id, date, SERVICE, TC3_REQUEST))
    }

    fn regx_record_id(&self) -> &'static str {
        REGX_RECORD_ID
    }
}

#[cfg(test)]
mod tests {
    use super::super::to_authorization;
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn signs_with_tc3_scope() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let action = DnsPod.del_record("a.com", "1234");
        let btm = to_authorization(&DnsPod, &action, "AKID", "SECRET", now).unwrap();

        assert_eq!(btm["x-tc-date"], "2024-05-01");
        assert_eq!(btm["x-tc-timestamp"], "1714552200");
        assert_eq!(btm["authorization"], "TC3-HMAC-SHA256 Credential=AKID/2024-05-01/dnspod/tc3_request, SignedHeaders=content-type;host;x-tc-action, Signature=3bde5189c2fdc39689f4faf1ea860054de391ef21f0929b5dd4d8f04de052460");
    }
}
