mod counter_store_redis;

pub use counter_store_redis::*;
