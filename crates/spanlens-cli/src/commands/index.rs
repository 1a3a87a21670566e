use anyhow::Result;
use spanlens::Context;
use spanlens_core::config::Config;
use std::path::Path;

pub fn run(repo_root: &Path, config: Config, embed: bool, embed_limit: usize) -> Result<()> {
    let mut ctx = Context::open(repo_root, config)?;
    let report = ctx.index_repo()?;
    println!(
        "Indexed {} files ({} skipped, {} removed), {} spans written, {} removed in {}ms",
        report.files_indexed,
        report.files_skipped,
        report.files_removed,
        report.spans_written,
        report.spans_removed,
        report.duration_ms
    );
    if report.recovered_interrupted_run {
        println!("Recovered from an interrupted previous run.");
    }
    println!("Index state: {:?}", report.final_state);

    if embed {
        let embedded = ctx.embed_pending(embed_limit)?;
        println!(
            "Embedded {} spans in {} batches{}",
            embedded.embedded,
            embedded.batches,
            if embedded.interrupted { " (interrupted)" } else { "" }
        );
    }
    ctx.close()?;
    Ok(())
}
