//! Domain types: device models, observable repositories and settings

pub mod models;
pub mod repository;
pub mod settings;
