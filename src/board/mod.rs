pub mod models;
pub mod service;

pub use models::{BoardError, BoardResult, BoardToolConfig};
pub use service::{BoardInfoClient, BoardLister, CliBoardLister};
