mod ring;
mod pool;
mod staging;

pub use ring::RingBuffer;
pub use pool::{BufferPool, PoolStats};
pub use staging::Staging;
