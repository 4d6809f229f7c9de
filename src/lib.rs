pub mod build;
pub mod config;
pub mod content;
pub mod error;
pub mod service;
pub mod theme;

#[cfg(test)]
mod testutil;
