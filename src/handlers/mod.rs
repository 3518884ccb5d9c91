// src/handlers/mod.rs
pub mod chat;
pub mod keys;
pub mod quota;
