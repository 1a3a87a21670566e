use anyhow::{Context, Result};
use spanlens_core::config::Config;
use spanlens_enrich::graph_merge::{self, CodeGraph};
use std::path::Path;

pub fn run(repo_root: &Path, config: &Config, input: &Path, out: Option<&Path>) -> Result<()> {
    let raw = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read graph {}", input.display()))?;
    let mut graph: CodeGraph = serde_json::from_str(&raw).context("Graph is not valid JSON")?;

    let report = graph_merge::merge(&mut graph, repo_root, config)?;
    if !report.performed {
        println!("No enrichment source; graph left unchanged.");
        return Ok(());
    }

    let out = out.unwrap_or(input);
    std::fs::write(out, serde_json::to_string_pretty(&graph)?)
        .with_context(|| format!("Failed to write graph {}", out.display()))?;
    println!(
        "Enriched {} of {} located entities ({} lookup errors) -> {}",
        report.enriched,
        report.located,
        report.lookup_errors,
        out.display()
    );
    for (strategy, count) in &report.by_strategy {
        println!("  {strategy}: {count}");
    }
    Ok(())
}
