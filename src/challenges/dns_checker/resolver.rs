use hickory_resolver::{
    config::{NameServerConfigGroup, ResolverConfig, ResolverOpts},
    error::{ResolveError, ResolveErrorKind},
    proto::rr::{RData, RecordType},
    TokioAsyncResolver,
};
use log::trace;
use serde::{Deserialize, Serialize};
use std::{net::IpAddr, time::Duration};

use super::DnsRecordType;
use crate::AcmeError;

const DNS_PORT: u16 = 53;
const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// One dns service: a primary server and an optional fallback.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DnsServiceIpPair {
    pub primary_ip: String,
    #[serde(default)]
    pub secondary_ip: Option<String>,
}

pub(crate) struct ResolverPair {
    primary: TokioAsyncResolver,
    secondary: Option<TokioAsyncResolver>,
}

impl ResolverPair {
    pub(crate) fn new(pair: &DnsServiceIpPair) -> Result<Self, AcmeError> {
        let secondary = match pair.secondary_ip.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(ip) => Some(make_resolver(ip)?),
        };
        Ok(ResolverPair {
            primary: make_resolver(&pair.primary_ip)?,
            secondary,
        })
    }

    /// The secondary is only asked when the primary errors.
    pub(crate) async fn check(&self, fqdn: &str, value: &str, kind: DnsRecordType) -> Result<bool, AcmeError> {
        match check_record(&self.primary, fqdn, value, kind).await {
            Ok(found) => Ok(found),
            Err(e) => match &self.secondary {
                Some(secondary) => check_record(secondary, fqdn, value, kind).await,
                None => Err(e),
            },
        }
    }
}

fn make_resolver(ip: &str) -> Result<TokioAsyncResolver, AcmeError> {
    let ip: IpAddr = ip
        .trim()
        .parse()
        .map_err(|e| AcmeError::Tip(format!("Invalid dns server ip '{}': {}", ip, e)))?;
    let servers = NameServerConfigGroup::from_ips_clear(&[ip], DNS_PORT, true);
    let config = ResolverConfig::from_parts(None, vec![], servers);

    let mut opts = ResolverOpts::default();
    opts.timeout = DNS_TIMEOUT;
    opts.attempts = 1;
    opts.cache_size = 0;
    Ok(TokioAsyncResolver::tokio(config, opts))
}

fn is_not_found(e: &ResolveError) -> bool {
    matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

fn absolute(fqdn: &str) -> String {
    if fqdn.ends_with('.') {
        fqdn.to_string()
    } else {
        format!("{}.", fqdn)
    }
}

// a missing name or record is an answer (false), anything else means the server failed
async fn check_record(resolver: &TokioAsyncResolver, fqdn: &str, value: &str, kind: DnsRecordType) -> Result<bool, AcmeError> {
    let name = absolute(fqdn);
    let values: Vec<String> = match kind {
        DnsRecordType::Txt => match resolver.txt_lookup(name.as_str()).await {
            Ok(lookup) => lookup
                .iter()
                .map(|txt| txt.txt_data().iter().map(|d| String::from_utf8_lossy(d)).collect::<String>())
                .collect(),
            Err(e) if is_not_found(&e) => return Ok(false),
            Err(e) => return Err(AcmeError::Propagation(format!("lookup txt {} failed: {}", fqdn, e))),
        },
        DnsRecordType::Cname => match resolver.lookup(name.as_str(), RecordType::CNAME).await {
            Ok(lookup) => lookup
                .iter()
                .filter_map(|r| match r {
                    RData::CNAME(cname) => Some(cname.0.to_utf8().trim_end_matches('.').to_string()),
                    _ => None,
                })
                .collect(),
            Err(e) if is_not_found(&e) => return Ok(false),
            Err(e) => return Err(AcmeError::Propagation(format!("lookup cname {} failed: {}", fqdn, e))),
        },
    };
    trace!("{:?} {} -> {:?}", kind, fqdn, values);
    Ok(values.iter().any(|v| v == value))
}
