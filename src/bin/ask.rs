//! One-shot query against the configured pipeline.
//!
//! ```text
//! ask "What are the diagnostic criteria for PTSD?"
//! ask --raw "Explain the difference between bipolar I and II"
//! ```
//!
//! `--raw` skips retrieval and streams the model's answer directly.

use anyhow::bail;
use dotenv::dotenv;
use env_logger::Env;
use futures::StreamExt;
use psych_agent::config::Settings;
use psych_agent::state::{build_llm, build_orchestrator};
use psych_agent::types::ChatTurn;
use std::io::Write;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(Env::default().default_filter_or("warn"));

    let mut raw = false;
    let mut words = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--raw" => raw = true,
            _ => words.push(arg),
        }
    }
    let query = words.join(" ");
    if query.trim().is_empty() {
        bail!("usage: ask [--raw] <question>");
    }

    let settings = Settings::from_env()?;
    let client = reqwest::Client::new();

    if raw {
        let llm = build_llm(&settings, client)?;
        let mut stream = llm.generate_stream(&[ChatTurn::user(query)]).await;
        let mut stdout = std::io::stdout();
        while let Some(chunk) = stream.next().await {
            write!(stdout, "{}", chunk)?;
            stdout.flush()?;
        }
        writeln!(stdout)?;
        return Ok(());
    }

    let rag = build_orchestrator(&settings, client)?;
    let response = rag.process_query(&query, &[]).await;

    println!("{}\n", response.response);
    for citation in &response.citations {
        println!("[{}] {} - {}", citation.id, citation.source, citation.preview);
    }
    println!("\n{}", response.disclaimer);
    Ok(())
}
