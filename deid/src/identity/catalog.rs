use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::bail;
use crate::error::{DeidError, DeidResult, ErrorKind};
use crate::identity::IdentifierValue;

static RESEARCH_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[a-f0-9]{8}-[a-f0-9]{4}-4[a-f0-9]{3}-[89ab][a-f0-9]{3}-[a-f0-9]{12}$")
        .expect("invalid research id pattern")
});

static HUID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{8}$").expect("invalid huid pattern"));

static XID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{7}$").expect("invalid xid pattern"));

/// Whether an identifier's values are strings or 64-bit integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Str,
    Int,
}

impl IdentifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierKind::Str => "string",
            IdentifierKind::Int => "int64",
        }
    }
}

/// The identifier types the pipeline understands, in canonical order.
///
/// The derived ordering is the canonical order, which fixes the column order of encoded
/// identity records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdentifierType {
    /// The pseudonym assigned by resolution. Never a raw identifier.
    ResearchId,
    /// Institution-wide identifier.
    Huid,
    /// Alternate institution identifier.
    Xid,
    /// Numeric user id of a source system.
    SourceId,
    /// Numeric id of a source system's data export.
    SourceDataId,
}

impl IdentifierType {
    pub const ALL: [IdentifierType; 5] = [
        IdentifierType::ResearchId,
        IdentifierType::Huid,
        IdentifierType::Xid,
        IdentifierType::SourceId,
        IdentifierType::SourceDataId,
    ];

    pub const PSEUDONYM: IdentifierType = IdentifierType::ResearchId;

    pub fn field_name(&self) -> &'static str {
        match self {
            IdentifierType::ResearchId => "research_id",
            IdentifierType::Huid => "huid",
            IdentifierType::Xid => "xid",
            IdentifierType::SourceId => "source_id",
            IdentifierType::SourceDataId => "source_data_id",
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            IdentifierType::ResearchId => "ResearchId",
            IdentifierType::Huid => "Huid",
            IdentifierType::Xid => "Xid",
            IdentifierType::SourceId => "SourceId",
            IdentifierType::SourceDataId => "SourceDataId",
        }
    }

    pub fn kind(&self) -> IdentifierKind {
        match self {
            IdentifierType::ResearchId | IdentifierType::Huid | IdentifierType::Xid => {
                IdentifierKind::Str
            }
            IdentifierType::SourceId | IdentifierType::SourceDataId => IdentifierKind::Int,
        }
    }

    pub fn is_pseudonym(&self) -> bool {
        *self == Self::PSEUDONYM
    }

    /// Parses a field name such as `huid`. Variant names such as `Huid` are accepted too.
    pub fn from_field_name(name: &str) -> DeidResult<Self> {
        let found = Self::ALL
            .into_iter()
            .find(|ty| ty.field_name() == name || ty.variant_name() == name);

        match found {
            Some(ty) => Ok(ty),
            None => bail!(
                ErrorKind::UnknownIdentifier,
                "Unknown identifier type",
                format!("`{name}` is not an identifier type")
            ),
        }
    }

    /// Returns `true` if `value` has this type's kind and matches its format.
    pub fn accepts(&self, value: &IdentifierValue) -> bool {
        match (self.kind(), value) {
            (IdentifierKind::Str, IdentifierValue::Str(text)) => self.matches_format(text),
            (IdentifierKind::Int, IdentifierValue::Int(_)) => true,
            _ => false,
        }
    }

    /// Converts raw text into a value of this type's kind without checking the format.
    ///
    /// Fails with [`ErrorKind::InvalidIdentifier`] when an integer type's text does not parse.
    /// The error never contains the text.
    pub fn to_value(&self, text: &str) -> DeidResult<IdentifierValue> {
        match self.kind() {
            IdentifierKind::Str => Ok(IdentifierValue::Str(text.to_string())),
            IdentifierKind::Int => match text.trim().parse::<i64>() {
                Ok(value) => Ok(IdentifierValue::Int(value)),
                Err(_) => bail!(
                    ErrorKind::InvalidIdentifier,
                    "Identifier value is not a 64-bit integer",
                    format!("identifier type `{self}`")
                ),
            },
        }
    }

    /// Converts raw text into a value of this type only if it has the right kind and format.
    pub fn recognize(&self, text: &str) -> Option<IdentifierValue> {
        let value = self.to_value(text).ok()?;
        self.accepts(&value).then_some(value)
    }

    fn matches_format(&self, text: &str) -> bool {
        match self {
            IdentifierType::ResearchId => RESEARCH_ID_REGEX.is_match(text),
            IdentifierType::Huid => HUID_REGEX.is_match(text),
            IdentifierType::Xid => XID_REGEX.is_match(text),
            IdentifierType::SourceId | IdentifierType::SourceDataId => false,
        }
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

impl FromStr for IdentifierType {
    type Err = DeidError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::from_field_name(name)
    }
}

/// The identifier types of a deployment, with the one designated as main.
///
/// Snapshots are indexed by the main identifier and scrubbing resolves rows through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifierCatalog {
    main: IdentifierType,
}

impl IdentifierCatalog {
    /// Fails with [`ErrorKind::ConfigError`] if `main` is the pseudonym type.
    pub fn new(main: IdentifierType) -> DeidResult<Self> {
        if main.is_pseudonym() {
            bail!(
                ErrorKind::ConfigError,
                "The pseudonym cannot be the main identifier",
                format!("main identifier `{main}`")
            );
        }

        Ok(Self { main })
    }

    /// Builds the catalog from a configured main identifier name.
    pub fn from_main_identifier(name: &str) -> DeidResult<Self> {
        let main = IdentifierType::from_field_name(name)?;

        Self::new(main)
    }

    pub fn main(&self) -> IdentifierType {
        self.main
    }
}
