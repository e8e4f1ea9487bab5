pub mod feed_trimmer;

pub use feed_trimmer::{run_trim_cycle, start_feed_trimmer};
