mod postgres_cluster;
mod storage_status;

pub use postgres_cluster::*;
pub use storage_status::*;
