#[path = "integration/cli.rs"]
mod cli;
#[path = "integration/cluster.rs"]
mod cluster;
#[path = "integration/scheduler.rs"]
mod scheduler;
#[path = "integration/transfer.rs"]
mod transfer;
