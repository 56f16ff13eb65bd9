//! HDCP agent: hosts one authentication session per display output.

pub mod config;
pub mod service;
