//! Named fault injection points, active with the `failpoints` feature.

use fail::fail_point;

use crate::bail;
use crate::error::{DeidResult, ErrorKind};

/// Between the conditional write of an acquire and the confirming read.
pub const LEASE_ACQUIRE__AFTER_WRITE: &str = "lease.acquire.after_write";
/// Before a renewal's conditional write.
pub const LEASE_RENEW__BEFORE_WRITE: &str = "lease.renew.before_write";
/// Before a snapshot partition is read.
pub const SNAPSHOT__READ_PARTITION: &str = "snapshot.read_partition";

/// Returns an error when the failpoint `name` is configured with `return`.
///
/// The optional parameter selects the error kind: `io` yields [`ErrorKind::IoError`],
/// anything else [`ErrorKind::LeaseStoreFailed`].
pub fn deid_fail_point(name: &str) -> DeidResult<()> {
    fail_point!(name, |parameter| {
        let kind = match parameter.as_deref() {
            Some("io") => ErrorKind::IoError,
            _ => ErrorKind::LeaseStoreFailed,
        };

        bail!(
            kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
