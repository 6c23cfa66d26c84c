// 连接池模块

pub mod connection;
pub mod guard;
pub mod manager;

pub use connection::{Connection, ConnectionHealth};
pub use guard::PooledConnection;
pub use manager::{ConnectionPool, PoolSettings, PoolStats};
