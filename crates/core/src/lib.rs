pub mod analysis;
pub mod canonical;
pub mod catalog;
pub mod compare;
pub mod description;
pub mod dim;
pub mod graph;
pub mod node;
pub mod op;
pub mod params;
pub mod validate;
