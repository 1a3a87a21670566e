pub mod freshness;
pub mod hybrid;
pub mod rerank;
pub mod vector_search;
