// Library interface for cybernews modules
// This allows tests and the binary to import modules

pub mod models;
pub mod llm;
pub mod credentials;
pub mod rotation;
pub mod scorer;
pub mod ingestion;
pub mod scraping;
pub mod storage;
pub mod publisher;
pub mod pipeline;
