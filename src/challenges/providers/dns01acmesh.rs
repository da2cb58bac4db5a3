use log::debug;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tokio::process::Command;

use super::{run_script, Environment};
use crate::{create_dir, write_file, AcmeError};

const ACME_SH: &str = "acme.sh";
const DNS_API_DIR: &str = "dnsapi";
const TEMP_DIR: &str = "temp";
// acme.sh runs its cli from here; everything before it is the function library
const MAIN_CALL: &str = "main \"$@\"";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub acme_sh_path: String,
    /// hook name under dnsapi/, e.g. dns_cf
    pub dns_hook: String,
    #[serde(default)]
    pub environment: Environment,
}

/// Drives acme.sh dns hooks (`<hook>_add` / `<hook>_rm`) through bash.
pub struct Dns01AcmeSh {
    script_path: String,
    dns_hook: String,
    environment: Environment,
}

// acme.sh without its trailing cli invocation, followed by the hook
pub(crate) fn combined_script(acme_sh: &str, hook: &str) -> String {
    let lib = match acme_sh.find(MAIN_CALL) {
        Some(i) => &acme_sh[..i],
        None => acme_sh,
    };
    format!("{}\n{}", lib, hook)
}

impl Dns01AcmeSh {
    pub fn new(cfg: &Config) -> Result<Self, AcmeError> {
        if cfg!(windows) {
            return AcmeError::tip("acme.sh is not supported on windows");
        }
        if cfg.dns_hook.is_empty() || cfg.dns_hook.contains(['/', ' ', ';']) {
            return Err(AcmeError::Provider(format!("Invalid acme.sh dns hook '{}'", cfg.dns_hook)));
        }
        let root = Path::new(&cfg.acme_sh_path);
        let read = |p: &Path| {
            fs::read_to_string(p).map_err(|e| AcmeError::Provider(format!("Read {} failed. {}", p.display(), e)))
        };
        let acme_sh = read(&root.join(ACME_SH))?;
        let hook = read(&root.join(DNS_API_DIR).join(format!("{}.sh", cfg.dns_hook)))?;

        let temp = root.join(TEMP_DIR);
        create_dir(&temp.display().to_string())?;
        let script_path = temp.join(format!("{}_{}.sh", ACME_SH, cfg.dns_hook)).display().to_string();
        write_file(&script_path, combined_script(&acme_sh, &hook).as_bytes())?;
        debug!("acme.sh script for {} written to {}", cfg.dns_hook, script_path);

        Ok(Dns01AcmeSh {
            script_path,
            dns_hook: cfg.dns_hook.clone(),
            environment: cfg.environment.clone(),
        })
    }

    fn command(&self, func: &str, name: &str, content: &str) -> Command {
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(format!("source {} ; {}_{} {} {}", self.script_path, self.dns_hook, func, name, content))
            .envs(&self.environment.0);
        cmd
    }

    pub async fn provision(&self, name: &str, content: &str) -> Result<(), AcmeError> {
        run_script("acme.sh add", self.command("add", name, content)).await
    }

    pub async fn deprovision(&self, name: &str, content: &str) -> Result<(), AcmeError> {
        run_script("acme.sh rm", self.command("rm", name, content)).await
    }
}
