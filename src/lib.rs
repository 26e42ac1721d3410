pub mod config;
pub mod db;
pub mod ebay;
pub mod error;
pub mod jobs;
pub mod reconcile;
pub mod shipping;
