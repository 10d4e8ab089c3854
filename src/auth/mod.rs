pub mod jwt;
pub mod session;
pub mod token_store;
