pub mod chunking;
pub mod database;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod generator;
pub mod rag;
pub mod server;

#[cfg(test)]
mod testing;
