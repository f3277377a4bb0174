pub mod allocation;
pub mod cash;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod performance;
pub mod quotes;
pub mod rebuild;
pub mod reversal;
pub mod sell;
pub mod signals;
pub mod wallets;

pub use error::{LedgerError, Result};
