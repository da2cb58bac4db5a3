use log::{error, info};
use std::{path::Path, sync::Arc};
use tokio_util::sync::CancellationToken;

use acme_fleet::{
    acme::NewAccount,
    challenges::Challenges,
    create_dir,
    fulfillment::Fulfiller,
    orders::{IssueRequest, Issuer},
    write_file, AccountKey, AcmeCfg, AcmeClient, AcmeError, AcmeLogger, HttpClient, KeyAlg,
};

const DOMAIN_KEY_FILE: &str = "domain.key";
const CHAINED_CRT_FILE: &str = "chained.crt";

#[tokio::main]
async fn main() {
    // cargo run -- dns=ai8.rs,www.ai8.rs dir=z email=a@a.org out=/etc/nginx/ssl/ai8.rs cfg=acme.json
    let args: Vec<String> = std::env::args().skip(1).collect(); // 跳过第一个参数（程序路径）

    let cfg = match AcmeCfg::new(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };
    if let Err(e) = AcmeLogger::init(cfg.log_level) {
        eprintln!("{}", e);
    }

    match run(cfg).await {
        Ok((chained, key)) => {
            info!("Successfully. For Nginx configuration:\nssl_certificate {}\nssl_certificate_key {}", chained, key);
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cfg: AcmeCfg) -> Result<(String, String), AcmeError> {
    info!("Step 0 Params: {:?}", cfg);
    create_dir(&cfg.out_dir)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                cancel.cancel();
            }
        });
    }

    let http = HttpClient::new()?;
    let client = AcmeClient::with_http(http.clone(), &cfg.directory_url).await?;
    let refresh = client.directory_manager().spawn_refresh(cfg.file.directory_refresh, cancel.clone());

    // 账户：读取或生成 account.key
    let key = account_key(&cfg.account_key_path)?;
    let account = client
        .new_account(&NewAccount::with_email(cfg.email.as_deref()), cfg.eab.as_ref(), &key)
        .await?;
    let key = key.with_kid(account.location);

    let challenges = Arc::new(Challenges::new(&cfg.file.challenges, http, cancel.clone()).await?);
    let issuer = Issuer::new(Fulfiller::new(Arc::clone(&challenges)), cancel.clone());
    let req = IssueRequest {
        domains: cfg.dns.clone(),
        key_alg: cfg.alg,
        preferred_chain: cfg.preferred_chain.clone(),
    };
    let issued = issuer.issue(&client, &key, &req).await;

    if let Err(e) = challenges.shutdown().await {
        error!("Stopping challenge providers failed. {}", e);
    }
    cancel.cancel();
    if let Err(e) = refresh.await {
        error!("Directory refresh task failed. {}", e);
    }
    let issued = issued?;

    let key_path = cfg.out_path(DOMAIN_KEY_FILE);
    let chained_path = cfg.out_path(CHAINED_CRT_FILE);
    write_file(&key_path, issued.key_pem.as_bytes())?;
    write_file(&chained_path, issued.chain.pem.as_bytes())?;
    Ok((chained_path, key_path))
}

fn account_key(path: &str) -> Result<AccountKey, AcmeError> {
    if Path::new(path).exists() {
        let pem = std::fs::read_to_string(path)?;
        return AccountKey::from_pem(&pem);
    }
    let key = AccountKey::generate(KeyAlg::ECC384)?;
    if let Some(parent) = Path::new(path).parent().and_then(|p| p.to_str()).filter(|p| !p.is_empty()) {
        create_dir(parent)?;
    }
    write_file(path, key.to_pem()?.as_bytes())?;
    info!("Generated account key {}", path);
    Ok(key)
}
