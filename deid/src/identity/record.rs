use std::collections::BTreeMap;
use std::fmt;

use crate::bail;
use crate::error::{DeidResult, ErrorKind};
use crate::identity::{IdentifierKind, IdentifierType};

/// A single identifier value.
///
/// [`fmt::Debug`] only shows the kind, so identity data never ends up in logs or panics by
/// accident. [`fmt::Display`] renders the value itself and is meant for encoding.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdentifierValue {
    Str(String),
    Int(i64),
}

impl IdentifierValue {
    pub fn kind(&self) -> IdentifierKind {
        match self {
            IdentifierValue::Str(_) => IdentifierKind::Str,
            IdentifierValue::Int(_) => IdentifierKind::Int,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            IdentifierValue::Str(value) => Some(value),
            IdentifierValue::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            IdentifierValue::Int(value) => Some(*value),
            IdentifierValue::Str(_) => None,
        }
    }
}

impl fmt::Debug for IdentifierValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierValue::Str(_) => f.write_str("Str(<redacted>)"),
            IdentifierValue::Int(_) => f.write_str("Int(<redacted>)"),
        }
    }
}

impl fmt::Display for IdentifierValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierValue::Str(value) => f.write_str(value),
            IdentifierValue::Int(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for IdentifierValue {
    fn from(value: &str) -> Self {
        IdentifierValue::Str(value.to_string())
    }
}

impl From<String> for IdentifierValue {
    fn from(value: String) -> Self {
        IdentifierValue::Str(value)
    }
}

impl From<i64> for IdentifierValue {
    fn from(value: i64) -> Self {
        IdentifierValue::Int(value)
    }
}

/// Result of [`IdentityRecord::set_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The slot was empty and now holds the value.
    Set,
    /// The slot already held the same value.
    Unchanged,
    /// The slot holds a different value, which was kept.
    Conflict,
}

/// The identifier values known for one entity, at most one per type.
///
/// A partial record comes from a single raw record; a canonical record is the output of
/// resolution and always carries a pseudonym.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityRecord {
    values: BTreeMap<IdentifierType, IdentifierValue>,
}

impl IdentityRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ty: IdentifierType) -> Option<&IdentifierValue> {
        self.values.get(&ty)
    }

    pub fn contains(&self, ty: IdentifierType) -> bool {
        self.values.contains_key(&ty)
    }

    /// Stores `value` for `ty`, replacing any previous value.
    ///
    /// Fails with [`ErrorKind::InvalidIdentifier`] if the value kind does not match the type.
    pub fn set(&mut self, ty: IdentifierType, value: IdentifierValue) -> DeidResult<()> {
        check_kind(ty, &value)?;
        self.values.insert(ty, value);

        Ok(())
    }

    /// Stores `value` for `ty` only if no value is present yet.
    pub fn set_if_absent(
        &mut self,
        ty: IdentifierType,
        value: IdentifierValue,
    ) -> DeidResult<SetOutcome> {
        check_kind(ty, &value)?;

        Ok(match self.values.get(&ty) {
            None => {
                self.values.insert(ty, value);
                SetOutcome::Set
            }
            Some(current) if *current == value => SetOutcome::Unchanged,
            Some(_) => SetOutcome::Conflict,
        })
    }

    pub fn remove(&mut self, ty: IdentifierType) -> Option<IdentifierValue> {
        self.values.remove(&ty)
    }

    pub fn pseudonym(&self) -> Option<&str> {
        self.get(IdentifierType::PSEUDONYM)
            .and_then(IdentifierValue::as_str)
    }

    /// A record is complete once it holds a pseudonym.
    pub fn is_complete(&self) -> bool {
        self.pseudonym().is_some()
    }

    /// Values in canonical type order.
    pub fn iter(&self) -> impl Iterator<Item = (IdentifierType, &IdentifierValue)> {
        self.values.iter().map(|(ty, value)| (*ty, value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn check_kind(ty: IdentifierType, value: &IdentifierValue) -> DeidResult<()> {
    if ty.kind() != value.kind() {
        bail!(
            ErrorKind::InvalidIdentifier,
            "Identifier value has the wrong kind",
            format!(
                "`{ty}` expects {} values, got {}",
                ty.kind().as_str(),
                value.kind().as_str()
            )
        );
    }

    Ok(())
}
