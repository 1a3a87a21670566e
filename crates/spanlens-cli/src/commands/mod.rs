pub mod graph;
pub mod index;
pub mod ledger;
pub mod locks;
pub mod plan;
pub mod search;
pub mod status;
