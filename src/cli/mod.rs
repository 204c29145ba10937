pub mod commands;
pub mod logger;
pub mod output;
