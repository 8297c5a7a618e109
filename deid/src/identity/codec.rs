//! Line encoding of canonical identity records and of raw tabular rows.
//!
//! A line holds one cell per field separated by TAB. `NULL` is written as `\N`; an empty string
//! is an empty cell. Backslash, TAB, LF and CR inside values are escaped as `\\`, `\t`, `\n`
//! and `\r`, so a separator never appears inside a cell and `\N` is never produced by a value.
//!
//! Identity records always have one field per [`IdentifierType`], in canonical order.

use std::borrow::Cow;

use crate::error::{DeidResult, ErrorKind};
use crate::identity::{IdentifierCatalog, IdentifierType, IdentityRecord};
use crate::{bail, deid_error};

pub const FIELD_SEPARATOR: char = '\t';

pub const NULL_SENTINEL: &str = "\\N";

/// Escapes a non-null value. Borrows when nothing needs escaping.
pub fn escape_cell(value: &str) -> Cow<'_, str> {
    if !value.contains(['\\', '\t', '\n', '\r']) {
        return Cow::Borrowed(value);
    }

    let mut escaped = String::with_capacity(value.len() + 8);
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\t' => escaped.push_str("\\t"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            ch => escaped.push(ch),
        }
    }

    Cow::Owned(escaped)
}

pub fn encode_cell(value: Option<&str>) -> Cow<'_, str> {
    match value {
        None => Cow::Borrowed(NULL_SENTINEL),
        Some(value) => escape_cell(value),
    }
}

/// Decodes one cell. Fails with [`ErrorKind::InvalidData`] on an unknown or truncated escape.
pub fn decode_cell(cell: &str) -> DeidResult<Option<String>> {
    if cell == NULL_SENTINEL {
        return Ok(None);
    }
    if !cell.contains('\\') {
        return Ok(Some(cell.to_string()));
    }

    let mut value = String::with_capacity(cell.len());
    let mut chars = cell.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            value.push(ch);
            continue;
        }

        match chars.next() {
            Some('\\') => value.push('\\'),
            Some('t') => value.push('\t'),
            Some('n') => value.push('\n'),
            Some('r') => value.push('\r'),
            Some(_) => bail!(ErrorKind::InvalidData, "Cell contains an unknown escape sequence"),
            None => bail!(ErrorKind::InvalidData, "Cell ends with an incomplete escape"),
        }
    }

    Ok(Some(value))
}

/// Encodes a row of cells into one line without a trailing newline.
pub fn encode_row<'a, I>(cells: I) -> String
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut line = String::new();
    for (i, cell) in cells.into_iter().enumerate() {
        if i > 0 {
            line.push(FIELD_SEPARATOR);
        }
        line.push_str(&encode_cell(cell));
    }

    line
}

pub fn decode_row(line: &str) -> DeidResult<Vec<Option<String>>> {
    line.split(FIELD_SEPARATOR).map(decode_cell).collect()
}

/// Encodes a record as one field per identifier type, in canonical order.
pub fn encode_record(record: &IdentityRecord) -> String {
    let values: Vec<Option<String>> = IdentifierType::ALL
        .iter()
        .map(|ty| record.get(*ty).map(ToString::to_string))
        .collect();

    encode_row(values.iter().map(Option::as_deref))
}

/// Decodes a canonical record.
///
/// Fails with [`ErrorKind::CorruptSnapshot`] on a wrong field count, a malformed cell, a
/// non-integer value for an integer type, or a missing or malformed pseudonym or main
/// identifier. Error details name fields, never values.
pub fn decode_record(line: &str, catalog: &IdentifierCatalog) -> DeidResult<IdentityRecord> {
    let cells: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
    if cells.len() != IdentifierType::ALL.len() {
        bail!(
            ErrorKind::CorruptSnapshot,
            "Identity record has the wrong number of fields",
            format!(
                "expected {} fields, found {}",
                IdentifierType::ALL.len(),
                cells.len()
            )
        );
    }

    let mut record = IdentityRecord::new();
    for (ty, cell) in IdentifierType::ALL.into_iter().zip(cells) {
        let decoded = decode_cell(cell).map_err(|err| corrupt_field(ty).with_source(err))?;
        let Some(text) = decoded else {
            continue;
        };

        let value = ty
            .to_value(&text)
            .map_err(|err| corrupt_field(ty).with_source(err))?;
        record
            .set(ty, value)
            .map_err(|err| corrupt_field(ty).with_source(err))?;
    }

    match record.get(IdentifierType::PSEUDONYM) {
        Some(pseudonym) if IdentifierType::PSEUDONYM.accepts(pseudonym) => {}
        Some(_) => bail!(
            ErrorKind::CorruptSnapshot,
            "Identity record has a malformed pseudonym",
            format!("field `{}`", IdentifierType::PSEUDONYM)
        ),
        None => bail!(
            ErrorKind::CorruptSnapshot,
            "Identity record has no pseudonym",
            format!("field `{}`", IdentifierType::PSEUDONYM)
        ),
    }

    if !record.contains(catalog.main()) {
        bail!(
            ErrorKind::CorruptSnapshot,
            "Identity record has no main identifier",
            format!("field `{}`", catalog.main())
        );
    }

    Ok(record)
}

fn corrupt_field(ty: IdentifierType) -> crate::error::DeidError {
    deid_error!(
        ErrorKind::CorruptSnapshot,
        "Identity record field is malformed",
        format!("field `{ty}`")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentifierValue;

    const PSEUDONYM: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";

    fn catalog() -> IdentifierCatalog {
        IdentifierCatalog::new(IdentifierType::Huid).unwrap()
    }

    fn canonical() -> IdentityRecord {
        let mut record = IdentityRecord::new();
        record.set(IdentifierType::ResearchId, PSEUDONYM.into()).unwrap();
        record.set(IdentifierType::Huid, "12345678".into()).unwrap();
        record
            .set(IdentifierType::SourceDataId, IdentifierValue::Int(-17))
            .unwrap();
        record
    }

    #[test]
    fn records_encode_in_canonical_order_with_null_sentinels() {
        let line = encode_record(&canonical());

        assert_eq!(line, format!("{PSEUDONYM}\t12345678\t\\N\t\\N\t-17"));
        assert_eq!(decode_record(&line, &catalog()).unwrap(), canonical());
    }

    #[test]
    fn special_characters_survive_a_round_trip() {
        let mut record = canonical();
        record
            .set(IdentifierType::Xid, "a\tb\\N\nc\r".into())
            .unwrap();

        let line = encode_record(&record);
        assert_eq!(line.split(FIELD_SEPARATOR).count(), 5);
        assert_eq!(decode_record(&line, &catalog()).unwrap(), record);
    }

    #[test]
    fn empty_string_differs_from_null() {
        let mut record = canonical();
        record.set(IdentifierType::Xid, "".into()).unwrap();

        let line = encode_record(&record);
        let decoded = decode_record(&line, &catalog()).unwrap();

        assert_eq!(decoded.get(IdentifierType::Xid), Some(&"".into()));
        assert_eq!(decoded.get(IdentifierType::SourceId), None);
    }

    #[test]
    fn malformed_lines_are_corrupt() {
        let catalog = catalog();
        let cases = [
            format!("{PSEUDONYM}\t12345678"),
            format!("{PSEUDONYM}\t12345678\t\\N\tabc\t\\N"),
            format!("{PSEUDONYM}\t12345678\t\\x\t\\N\t\\N"),
            "not-a-uuid\t12345678\t\\N\t\\N\t\\N".to_string(),
            "\\N\t12345678\t\\N\t\\N\t\\N".to_string(),
            format!("{PSEUDONYM}\t\\N\ta1234567\t\\N\t\\N"),
        ];

        for line in cases {
            let err = decode_record(&line, &catalog).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::CorruptSnapshot, "line {line:?}");
            assert!(err.kind().is_config());
        }
    }

    #[test]
    fn corrupt_errors_do_not_echo_values() {
        let err = decode_record("not-a-uuid\t87654321\t\\N\t\\N\t\\N", &catalog()).unwrap_err();

        let message = format!("{err}");
        assert!(!message.contains("not-a-uuid"));
        assert!(!message.contains("87654321"));
    }

    #[test]
    fn rows_round_trip_cells() {
        let line = encode_row([Some("a\tb"), None, Some("")]);
        assert_eq!(line, "a\\tb\t\\N\t");

        assert_eq!(
            decode_row(&line).unwrap(),
            vec![Some("a\tb".to_string()), None, Some(String::new())]
        );
        assert!(decode_cell("trailing\\").is_err());
    }
}
