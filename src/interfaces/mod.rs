pub mod csv;
pub mod http;
pub mod jsonl;
