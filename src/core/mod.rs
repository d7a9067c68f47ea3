//! Core building blocks shared by every other module: configuration,
//! the error taxonomy and the registry data model.

pub mod config;
pub mod error;
pub mod types;
