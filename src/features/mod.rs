pub mod annotation;
pub mod audit;
pub mod database;
pub mod documents;
pub mod lifecycle;
pub mod notify;
pub mod pdf;
pub mod session_store;
pub mod storage;
