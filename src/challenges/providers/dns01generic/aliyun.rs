use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::{ApiAction, SignedDnsApi};
use crate::{crypt::hex_hmac256, AcmeError};

const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";

const HOST: &str = "alidns.cn-shanghai.aliyuncs.com";
const ALG: &str = "ACS3-HMAC-SHA256";

const RECORD_ADD: &str = "AddDomainRecord";
const RECORD_DEL: &str = "DeleteDomainRecord";
const VERSION: &str = "2015-01-09";
const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const REGX_RECORD_ID: &str = r#""RecordId":"(\d+)""#;

pub(crate) struct AliYun;

impl SignedDnsApi for AliYun {
    fn host(&self) -> &'static str {
        HOST
    }
    fn content_type(&self) -> &'static str {
        CONTENT_TYPE_FORM
    }
    fn alg(&self) -> &'static str {
        ALG
    }

    fn add_record(&self, zone: &str, rr: &str, value: &str) -> ApiAction {
        ApiAction {
            name: RECORD_ADD,
            version: VERSION,
            payload: format!("DomainName={}&RR={}&Value={}&Type=TXT", zone, rr, value),
        }
    }
    fn del_record(&self, zone: &str, record_id: &str) -> ApiAction {
        ApiAction {
            name: RECORD_DEL,
            version: VERSION,
            payload: format!("DomainName={}&RecordId={}", zone, record_id),
        }
    }

    fn stamp(&self, action: &ApiAction, hashed_payload: &str, now: DateTime<Utc>, btm: &mut BTreeMap<&'static str, String>) {
        btm.insert("x-acs-action", action.name.to_string());
        btm.insert("x-acs-version", action.version.to_string());
        btm.insert("x-acs-content-sha256", hashed_payload.to_string());
        btm.insert("x-acs-date", now.format(DATE_FORMAT).to_string());
        btm.insert("x-acs-signature-nonce", now.timestamp_micros().to_string());
    }

    fn sign(&self, s_key: &str, canonical: &str, _btm: &BTreeMap<&'static str, String>) -> Result<String, AcmeError> {
        let to_sign = format!("{}\n{}", ALG, canonical);
        Ok(hex_hmac256(s_key.as_bytes(), &to_sign))
    }

    fn regx_record_id(&self) -> &'static str {
        REGX_RECORD_ID
    }
}
