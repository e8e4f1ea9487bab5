pub mod feed_events;

pub use feed_events::{decode_event, FeedEvent, FeedEventHandler, FeedEventsConsumer};
