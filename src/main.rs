use anyhow::Result;
use novelforge::config::Config;
use novelforge::workflow::BookWorkflow;
use std::fs;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    // Premise comes from the first argument, or from premise.txt.
    let premise = match std::env::args().nth(1) {
        Some(arg) => arg,
        None => match fs::read_to_string("premise.txt") {
            Ok(text) => text.trim().to_string(),
            Err(_) => {
                eprintln!("Usage: novelforge \"<story premise>\"");
                eprintln!("Or put the premise in premise.txt next to config.yml.");
                anyhow::bail!("No story premise provided");
            }
        },
    };

    let mut workflow = BookWorkflow::new(config)?;
    workflow.run(&premise).await?;
    Ok(())
}
