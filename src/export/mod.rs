pub mod health;
pub mod printer;
