pub mod context;

pub use context::{Context, SearchResponse};
