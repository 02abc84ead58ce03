pub mod batch;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod executor;
pub mod linker;
pub mod memory;
pub mod ontology;
pub mod output;
pub mod resolver;
pub mod snapshot;
pub mod store;
pub mod translation;
