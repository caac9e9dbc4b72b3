pub mod exchange;
pub mod price_feed;
