pub mod finalize_bench;
pub mod subscriber_bench;
