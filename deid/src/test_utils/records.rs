use crate::identity::{IdentifierType, IdentifierValue, IdentityRecord};
use crate::types::RawRecord;

/// Builds a partial record from `(type, value)` pairs.
pub fn partial_record(values: &[(IdentifierType, IdentifierValue)]) -> IdentityRecord {
    let mut record = IdentityRecord::new();
    for (ty, value) in values {
        record.set(*ty, value.clone()).unwrap();
    }
    record
}

/// Builds a canonical record carrying `pseudonym`.
pub fn canonical_record(
    pseudonym: &str,
    values: &[(IdentifierType, IdentifierValue)],
) -> IdentityRecord {
    let mut record = partial_record(values);
    record
        .set(IdentifierType::PSEUDONYM, pseudonym.into())
        .unwrap();
    record
}

pub fn raw_record(cells: &[Option<&str>]) -> RawRecord {
    RawRecord::new(
        cells
            .iter()
            .map(|cell| cell.map(str::to_string))
            .collect(),
    )
}
