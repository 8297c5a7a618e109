//! Postgres persistence for the de-identification pipeline.

pub mod leases;
pub mod migrations;
