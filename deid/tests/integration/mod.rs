mod identity_pipeline_test;
mod lease_test;
