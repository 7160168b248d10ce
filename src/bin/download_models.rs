use anyhow::{bail, Context};
use dotenv::dotenv;
use env_logger::Env;
use log::{error, info};
use psych_agent::embedding_service::{TOKENIZER_FILE, WEIGHTS_FILE};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

const MODEL_BASE_URL: &str = "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main";

const MODEL_FILES: [(&str, &str); 2] = [
    (
        WEIGHTS_FILE,
        "53aa51172d142c89d9012cce15ae4d6cc0ca6895895114379cacb4fab128d9db",
    ),
    (
        TOKENIZER_FILE,
        "be50c3628f2bf5bb5e3a7f17b1f74611b2561a3a27eeab05e5aa30f411572037",
    ),
];

fn sha256_hex(path: &Path) -> anyhow::Result<String> {
    let content = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}

async fn download_and_verify(models_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(models_dir)?;
    let client = reqwest::Client::new();

    for (filename, expected_hash) in MODEL_FILES {
        let file_path = models_dir.join(filename);

        if file_path.exists() {
            if sha256_hex(&file_path)? == expected_hash {
                info!("{} already present and verified", filename);
                continue;
            }
            info!("{} exists but hash doesn't match, re-downloading", filename);
        }

        let url = format!("{}/{}", MODEL_BASE_URL, filename);
        info!("Downloading {} to {}", url, file_path.display());
        let bytes = client.get(&url).send().await?.error_for_status()?.bytes().await?;
        fs::write(&file_path, &bytes)?;

        if sha256_hex(&file_path)? != expected_hash {
            error!("Hash verification failed for {}", filename);
            fs::remove_file(&file_path)?;
            bail!("Hash verification failed for {}", filename);
        }
        info!("Verified {}", filename);
    }

    info!("Embedding model ready in {}", models_dir.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let models_dir = std::env::var("EMBEDDING_MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("ml_models"));
    download_and_verify(&models_dir).await
}
