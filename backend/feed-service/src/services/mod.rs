pub mod feed;

pub use feed::{merge_recent, FeedService, RebuildError, TrimReport};
