use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;

use super::{run_script, zone_of, Environment};
use crate::AcmeError;

const DEFAULT_SHELL: &str = "sh";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub create_script: String,
    pub delete_script: String,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub environment: Environment,
}

/// Runs user scripts as `<shell> <script> <zone> <record name> <record value>`.
pub struct Dns01Manual {
    shell: String,
    create_script: String,
    delete_script: String,
    environment: Environment,
}

impl Dns01Manual {
    pub fn new(cfg: &Config) -> Result<Self, AcmeError> {
        for script in [&cfg.create_script, &cfg.delete_script] {
            if !Path::new(script).is_file() {
                return Err(AcmeError::Provider(format!("dns-01 manual script {} is not a file", script)));
            }
        }
        Ok(Dns01Manual {
            shell: cfg.shell.clone().unwrap_or_else(|| DEFAULT_SHELL.to_string()),
            create_script: cfg.create_script.clone(),
            delete_script: cfg.delete_script.clone(),
            environment: cfg.environment.clone(),
        })
    }

    fn command(&self, script: &str, name: &str, content: &str) -> Result<Command, AcmeError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg(script).arg(zone_of(name)?).arg(name).arg(content).envs(&self.environment.0);
        Ok(cmd)
    }

    pub async fn provision(&self, name: &str, content: &str) -> Result<(), AcmeError> {
        run_script("dns-01 create", self.command(&self.create_script, name, content)?).await
    }

    pub async fn deprovision(&self, name: &str, content: &str) -> Result<(), AcmeError> {
        run_script("dns-01 delete", self.command(&self.delete_script, name, content)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn scripts_get_zone_name_and_value() {
        let dir = std::env::temp_dir().join(format!("acme-fleet-manual-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let log = dir.join("calls.log");
        let create = dir.join("create.sh");
        let delete = dir.join("delete.sh");
        fs::write(&create, format!("echo \"add $1 $2 $3 $GREETING\" >> {}\n", log.display())).unwrap();
        fs::write(&delete, format!("echo \"rm $1 $2 $3\" >> {}\nexit 3\n", log.display())).unwrap();

        let cfg = Config {
            create_script: create.display().to_string(),
            delete_script: delete.display().to_string(),
            shell: None,
            environment: Environment([("GREETING".to_string(), "hi".to_string())].into_iter().collect()),
        };
        let p = Dns01Manual::new(&cfg).unwrap();
        p.provision("_acme-challenge.www.a.com", "digest").await.unwrap();
        assert!(p.deprovision("_acme-challenge.www.a.com", "digest").await.is_err());

        let calls = fs::read_to_string(&log).unwrap();
        assert_eq!(
            calls,
            "add a.com _acme-challenge.www.a.com digest hi\nrm a.com _acme-challenge.www.a.com digest\n"
        );
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_script_is_rejected() {
        let cfg = Config {
            create_script: "/nonexistent/create.sh".to_string(),
            delete_script: "/nonexistent/delete.sh".to_string(),
            shell: None,
            environment: Environment::default(),
        };
        assert!(Dns01Manual::new(&cfg).is_err());
    }
}
