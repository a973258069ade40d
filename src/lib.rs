pub mod anc;
pub mod config;
pub mod error;
pub mod pool;
pub mod rx;
pub mod safe_converter;
pub mod sgl;
