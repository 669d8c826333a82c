//! Mailgun events API provider.

pub mod client;
pub mod models;

pub use client::MailgunProvider;
