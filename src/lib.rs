//! Mint Vendor - a vending-machine bot for NFT pair drops.
//!
//! The bot watches a receiving address for incoming payments, reserves one
//! item from each of two catalog collections, and asks an external mint
//! service to issue the pair to the payer, exactly once per payment.

pub mod catalog;
pub mod chain;
pub mod config;
pub mod fulfill;
pub mod issuer;
pub mod ledger;
pub mod runner;
pub mod scanner;
pub mod server;
pub mod types;
