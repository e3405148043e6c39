pub mod config;
pub mod filter;
pub mod reader;
pub mod writer;
