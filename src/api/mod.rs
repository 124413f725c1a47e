pub mod events;
pub mod gateway;
pub mod models;
pub mod openai;
