pub mod stats;
pub mod subscription_models;
