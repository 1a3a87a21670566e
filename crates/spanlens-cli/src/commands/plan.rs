use anyhow::Result;
use spanlens::Context;
use spanlens_core::config::Config;
use std::path::Path;

pub fn run(repo_root: &Path, config: Config, limit: Option<usize>) -> Result<()> {
    let limit = limit.unwrap_or(config.enrichment.batch_limit);
    let ctx = Context::open(repo_root, config)?;
    let plan = ctx.plan(limit)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}
