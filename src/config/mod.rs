pub mod schema;

pub use schema::{
    Config, GitConfig, HostAuthStyle, HostConfig, ImagePolicyConfig, PolicyConfig,
    RegistryConfig, RegistryFlavor, RunConfig, ScannerConfig, SortRule, WatchConfig, WebhookConfig,
};
