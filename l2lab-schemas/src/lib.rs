pub mod cli_models;
pub mod inventory;
pub mod pod_config;
pub mod settings;
pub mod topology;
