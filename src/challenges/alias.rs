use std::collections::HashMap;
use std::sync::RwLock;

use crate::{crypt::domain_valid, AcmeError};

/// Identifier value -> domain that actually receives the challenge resource,
/// for names delegated through a CNAME.
#[derive(Debug, Default)]
pub struct AliasTable {
    map: RwLock<HashMap<String, String>>,
}

impl AliasTable {
    pub fn new(aliases: &HashMap<String, String>) -> Result<Self, AcmeError> {
        let table = AliasTable::default();
        for (from, to) in aliases {
            table.set(from, to)?;
        }
        Ok(table)
    }

    pub fn set(&self, from: &str, to: &str) -> Result<(), AcmeError> {
        let (from, to) = (from.trim().to_lowercase(), to.trim().to_lowercase());
        if !domain_valid(&from, false) || !domain_valid(&to, false) {
            return AcmeError::tip(&format!("Invalid alias {} -> {}", from, to));
        }
        self.map.write().unwrap_or_else(|e| e.into_inner()).insert(from, to);
        Ok(())
    }

    pub fn remove(&self, from: &str) -> Option<String> {
        self.map.write().unwrap_or_else(|e| e.into_inner()).remove(&from.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most specific match wins. Labels in front of the matched suffix are kept,
    /// so with `a.com -> b.net`, `x.a.com` resolves to `x.b.net`.
    pub fn resolve(&self, value: &str) -> String {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        let labels: Vec<&str> = value.split('.').collect();
        for i in 0..labels.len() {
            if let Some(target) = map.get(&labels[i..].join(".")) {
                return if i == 0 {
                    target.clone()
                } else {
                    format!("{}.{}", labels[..i].join("."), target)
                };
            }
        }
        value.to_string()
    }
}
