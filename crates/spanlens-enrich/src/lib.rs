pub mod contract;
pub mod graph_merge;
pub mod pipeline;
pub mod plan;
pub mod validate;
