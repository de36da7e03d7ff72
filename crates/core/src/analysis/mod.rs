pub mod input;
pub mod num_params;
pub mod shape;
