use anyhow::Result;
use serde_json::json;
use spanlens::Context;
use spanlens_core::config::Config;
use std::path::Path;

pub fn run(repo_root: &Path, config: Config, query: &str, json: bool) -> Result<()> {
    let mut ctx = Context::open(repo_root, config)?;
    let response = ctx.search(query)?;

    if json {
        let hits: Vec<_> = response
            .hits
            .iter()
            .map(|hit| {
                json!({
                    "span_hash": hit.record.span.span_hash,
                    "path": hit.record.span.file_path,
                    "symbol": hit.record.span.symbol,
                    "lines": [hit.record.span.start_line, hit.record.span.end_line],
                    "score": hit.score,
                    "vector_score": hit.vector_score,
                    "signals": hit.signals,
                })
            })
            .collect();
        let out = json!({
            "freshness": response.freshness,
            "modified_paths": response.modified_paths,
            "results": hits,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if !response.freshness.use_index {
        println!(
            "WARNING: index is {:?} ({}); results may be out of date.",
            response.freshness.state, response.freshness.reason
        );
    }
    if response.hits.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!("{:<50} {:<20} {:<8}", "PATH", "SYMBOL", "SCORE");
    println!("{}", "-".repeat(80));
    for hit in &response.hits {
        let span = &hit.record.span;
        let location = format!("{}:{}-{}", span.file_path, span.start_line, span.end_line);
        let marker = if response.modified_paths.contains(&span.file_path) {
            " *"
        } else {
            ""
        };
        println!("{:<50} {:<20} {:<8.4}{marker}", location, span.symbol, hit.score);
    }
    if !response.modified_paths.is_empty() {
        println!();
        println!("* file modified since the last index run");
    }
    Ok(())
}
