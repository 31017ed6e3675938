pub mod alerts;
pub mod config;
pub mod core;
pub mod db;
pub mod jobs;
pub mod monitor;
pub mod referral;
pub mod rewards;
