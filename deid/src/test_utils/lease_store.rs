use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::bail;
use crate::error::{DeidResult, ErrorKind};
use crate::lease::LeaseRecord;
use crate::lease::store::{CreateOutcome, LeaseStore, UpdateOutcome};

/// Fault injected in place of a lease store call.
#[derive(Debug, Clone)]
pub enum LeaseStoreFault {
    /// The call fails with [`ErrorKind::LeaseStoreFailed`].
    Error,
    /// The given record is written to the store, as if by another process, right before the
    /// call runs. The call itself then proceeds normally.
    ForeignWrite(LeaseRecord),
}

#[derive(Debug, Default)]
struct Faults {
    gets: VecDeque<LeaseStoreFault>,
    writes: VecDeque<LeaseStoreFault>,
}

/// Lease store wrapper injecting scripted faults before delegating to the wrapped store.
///
/// Clones share the fault queues, so a test can keep a clone to script faults while a manager
/// owns another.
#[derive(Debug, Clone)]
pub struct FaultInjectingLeaseStore<S> {
    inner: S,
    faults: Arc<Mutex<Faults>>,
}

impl<S> FaultInjectingLeaseStore<S>
where
    S: LeaseStore,
{
    pub fn wrap(inner: S) -> Self {
        Self {
            inner,
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Injects `fault` into the next `count` reads.
    pub fn fail_next_gets(&self, count: usize, fault: LeaseStoreFault) {
        let mut faults = self.faults.lock().unwrap();
        faults.gets.extend(std::iter::repeat_n(fault, count));
    }

    /// Injects `fault` into the next `count` conditional writes of either kind.
    pub fn fail_next_writes(&self, count: usize, fault: LeaseStoreFault) {
        let mut faults = self.faults.lock().unwrap();
        faults.writes.extend(std::iter::repeat_n(fault, count));
    }

    fn next_get_fault(&self) -> Option<LeaseStoreFault> {
        self.faults.lock().unwrap().gets.pop_front()
    }

    fn next_write_fault(&self) -> Option<LeaseStoreFault> {
        self.faults.lock().unwrap().writes.pop_front()
    }

    async fn apply(&self, fault: Option<LeaseStoreFault>) -> DeidResult<()> {
        match fault {
            None => Ok(()),
            Some(LeaseStoreFault::Error) => {
                bail!(ErrorKind::LeaseStoreFailed, "Injected lease store failure");
            }
            Some(LeaseStoreFault::ForeignWrite(record)) => {
                overwrite(&self.inner, record).await
            }
        }
    }
}

/// Writes `record` whatever is currently stored, bumping past the stored version if needed.
async fn overwrite<S: LeaseStore>(store: &S, mut record: LeaseRecord) -> DeidResult<()> {
    match store.get(&record.name).await? {
        None => {
            store.put_if_absent(record).await?;
        }
        Some(current) => {
            record.version = record.version.max(current.version + 1);
            store.put_if_version(record, current.version).await?;
        }
    }

    Ok(())
}

impl<S> LeaseStore for FaultInjectingLeaseStore<S>
where
    S: LeaseStore + Send + Sync,
{
    async fn get(&self, name: &str) -> DeidResult<Option<LeaseRecord>> {
        self.apply(self.next_get_fault()).await?;

        self.inner.get(name).await
    }

    async fn put_if_absent(&self, record: LeaseRecord) -> DeidResult<CreateOutcome> {
        self.apply(self.next_write_fault()).await?;

        self.inner.put_if_absent(record).await
    }

    async fn put_if_version(
        &self,
        record: LeaseRecord,
        expected_version: u64,
    ) -> DeidResult<UpdateOutcome> {
        self.apply(self.next_write_fault()).await?;

        self.inner.put_if_version(record, expected_version).await
    }
}
