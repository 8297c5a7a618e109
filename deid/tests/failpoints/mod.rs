mod lease_failpoints_test;
mod snapshot_failpoints_test;
