use anyhow::Result;
use spanlens_core::config::Config;
use spanlens_query::freshness;
use spanlens_state::{db, enrichments, spans};
use std::path::Path;

pub fn run(repo_root: &Path, config: &Config, json: bool) -> Result<()> {
    let report = freshness::check_freshness(&config.index_status_path(repo_root), repo_root);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Freshness:      {:?}", report.state);
    println!("Use index:      {}", if report.use_index { "yes" } else { "no" });
    println!("Reason:         {}", report.reason);
    if let Some(state) = report.index_state {
        println!("Index state:    {:?}", state);
    }
    println!(
        "Last indexed:   {}",
        report.last_indexed_at.as_deref().unwrap_or("never")
    );
    println!(
        "Indexed commit: {}",
        report.last_indexed_commit.as_deref().unwrap_or("-")
    );
    println!("Current HEAD:   {}", report.current_head.as_deref().unwrap_or("-"));

    let db_path = config.index_db_path(repo_root);
    if db_path.exists() {
        let conn = db::open_connection(&db_path)?;
        let (healthy, detail) = db::check_sqlite_health(&conn)?;
        println!("Spans:          {}", spans::count_spans(&conn)?);
        println!("Enrichments:    {}", enrichments::count_enrichments(&conn)?);
        match detail {
            Some(detail) if !healthy => println!("SQLite:         WARN {detail}"),
            _ => println!("SQLite:         OK"),
        }
    } else {
        println!("Store:          missing - run `spanlens index`");
    }
    Ok(())
}
