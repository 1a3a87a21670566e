pub mod db;
pub mod embedding;
pub mod embeddings;
pub mod enrichments;
pub mod files;
pub mod ignore_rules;
pub mod index_status;
pub mod ledger;
pub mod locks;
pub mod schema;
pub mod spans;
