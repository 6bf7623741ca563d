pub mod pool;
pub mod tcp;

pub use pool::{ConnectionPool, ConnectionProvider, PooledConnection};
pub use tcp::{Connection, InfiniteTimeout};
