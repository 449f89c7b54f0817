pub mod config;
pub mod feed;
pub mod graphs;
pub mod reindex;

pub use config::{ConfigAction, ConfigArgs};
pub use feed::FeedArgs;
pub use graphs::CheckGraphsArgs;
pub use reindex::ReindexArgs;
