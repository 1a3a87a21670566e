pub mod embed_writer;
pub mod ingest;
pub mod scanner;
