pub mod audit;
pub mod auth;
pub mod chat;
pub mod core;
pub mod requests;
pub mod roster;
pub mod scores;
pub mod students;
