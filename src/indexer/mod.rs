pub mod backfill;
pub mod coordinator;
pub mod feed;
pub mod live;
pub mod transformations;

pub use backfill::backfill_window;
pub use coordinator::Coordinator;
pub use feed::{AdvanceSignal, BlockFeed, ChannelFeed, IngestOutcome, JsonLinesFeed};
pub use live::LiveChannel;
