pub mod cancel;
pub mod chat;
pub mod health;
