pub mod alerts;
pub mod cache;
pub mod history;
pub mod log;
