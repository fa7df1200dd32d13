pub mod cluster;
pub mod config;
pub mod listener;
pub mod manager;
pub mod message;
pub mod valve;

pub const CLUSTER_CONFIG: &'static str = include_str!("../cluster.toml");
