pub mod agent;
pub mod aggregate;
pub mod catalog;
pub mod config;
pub mod export;
pub mod inventory;
pub mod point;
pub mod query;
pub mod sink;
pub mod vsphere;
