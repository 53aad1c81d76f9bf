use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from building, parsing or evaluating smart-folder rules.
#[derive(Debug, Error, PartialEq)]
pub enum RuleError {
    #[error("Unknown rule field: {0}")]
    UnknownField(String),

    #[error("Unknown rule operation: {0}")]
    UnknownOperation(String),

    #[error("Operation '{operation}' cannot be used with field '{field}'")]
    IncompatibleOperation {
        field: RuleField,
        operation: RuleOperation,
    },

    #[error("Operation '{operation}' expects a {expected} value")]
    WrongValueType {
        operation: RuleOperation,
        expected: &'static str,
    },

    #[error("Invalid rule value '{value}': {reason}")]
    InvalidValue { value: String, reason: String },

    #[error("Rule value cannot be empty")]
    EmptyValue,

    #[error("Rule must have the form '<field> <operation> <value>': {0}")]
    Malformed(String),

    #[error("Smart folder name cannot be empty")]
    EmptyName,

    #[error("Tag lookup failed: {0}")]
    TagLookup(String),
}

/// Attribute of an article or feed a rule looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleField {
    Title,
    /// Full content, falling back to the description.
    Content,
    Author,
    /// Feed title an article came from; a feed's own title.
    Source,
    Link,
    PubDate,
    IsRead,
    Tag,
}

impl RuleField {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleField::Title => "title",
            RuleField::Content => "content",
            RuleField::Author => "author",
            RuleField::Source => "source",
            RuleField::Link => "link",
            RuleField::PubDate => "pub_date",
            RuleField::IsRead => "is_read",
            RuleField::Tag => "tag",
        }
    }

    fn is_text(self) -> bool {
        matches!(
            self,
            RuleField::Title
                | RuleField::Content
                | RuleField::Author
                | RuleField::Source
                | RuleField::Link
        )
    }
}

impl fmt::Display for RuleField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleField {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "title" => Ok(RuleField::Title),
            "content" | "body" => Ok(RuleField::Content),
            "author" => Ok(RuleField::Author),
            "source" | "feed" => Ok(RuleField::Source),
            "link" | "url" => Ok(RuleField::Link),
            "pub_date" | "date" | "published" => Ok(RuleField::PubDate),
            "is_read" | "read" => Ok(RuleField::IsRead),
            "tag" => Ok(RuleField::Tag),
            _ => Err(RuleError::UnknownField(s.to_owned())),
        }
    }
}

/// Comparison a rule applies to its field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperation {
    Contains,
    NotContains,
    Equals,
    NotEquals,
    StartsWith,
    EndsWith,
    Before,
    After,
    WithinLastDays,
    Is,
    HasTag,
    NotHasTag,
}

impl RuleOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleOperation::Contains => "contains",
            RuleOperation::NotContains => "not_contains",
            RuleOperation::Equals => "equals",
            RuleOperation::NotEquals => "not_equals",
            RuleOperation::StartsWith => "starts_with",
            RuleOperation::EndsWith => "ends_with",
            RuleOperation::Before => "before",
            RuleOperation::After => "after",
            RuleOperation::WithinLastDays => "within_last_days",
            RuleOperation::Is => "is",
            RuleOperation::HasTag => "has_tag",
            RuleOperation::NotHasTag => "not_has_tag",
        }
    }

    /// Operations accepted by a field.
    pub fn allowed_for(field: RuleField) -> &'static [RuleOperation] {
        use RuleOperation::*;
        match field {
            f if f.is_text() => &[
                Contains,
                NotContains,
                Equals,
                NotEquals,
                StartsWith,
                EndsWith,
            ],
            RuleField::PubDate => &[Before, After, WithinLastDays],
            RuleField::IsRead => &[Is],
            RuleField::Tag => &[HasTag, NotHasTag],
            _ => &[],
        }
    }
}

impl fmt::Display for RuleOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleOperation {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "contains" => Ok(RuleOperation::Contains),
            "not_contains" => Ok(RuleOperation::NotContains),
            "equals" | "is_exactly" => Ok(RuleOperation::Equals),
            "not_equals" => Ok(RuleOperation::NotEquals),
            "starts_with" => Ok(RuleOperation::StartsWith),
            "ends_with" => Ok(RuleOperation::EndsWith),
            "before" => Ok(RuleOperation::Before),
            "after" => Ok(RuleOperation::After),
            "within_last_days" | "within" => Ok(RuleOperation::WithinLastDays),
            "is" => Ok(RuleOperation::Is),
            "has_tag" | "has" => Ok(RuleOperation::HasTag),
            "not_has_tag" | "lacks" => Ok(RuleOperation::NotHasTag),
            _ => Err(RuleError::UnknownOperation(s.to_owned())),
        }
    }
}

/// Typed operand of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RuleValue {
    Text(String),
    /// Unix timestamp (seconds)
    Date(i64),
    Days(u32),
    Bool(bool),
}

impl RuleValue {
    fn kind(&self) -> &'static str {
        match self {
            RuleValue::Text(_) => "text",
            RuleValue::Date(_) => "date",
            RuleValue::Days(_) => "day-count",
            RuleValue::Bool(_) => "boolean",
        }
    }
}

impl fmt::Display for RuleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleValue::Text(text) => write!(f, "{text}"),
            RuleValue::Date(ts) => match Utc.timestamp_opt(*ts, 0).single() {
                Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d")),
                None => write!(f, "{ts}"),
            },
            RuleValue::Days(days) => write!(f, "{days}"),
            RuleValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// One `(field, operation, value)` predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub field: RuleField,
    pub operation: RuleOperation,
    pub value: RuleValue,
}

impl Rule {
    /// Build a rule, rejecting field/operation/value combinations that can
    /// never be evaluated.
    pub fn new(field: RuleField, operation: RuleOperation, value: RuleValue) -> Result<Self, RuleError> {
        let rule = Self {
            field,
            operation,
            value,
        };
        rule.validate()?;
        Ok(rule)
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if !RuleOperation::allowed_for(self.field).contains(&self.operation) {
            return Err(RuleError::IncompatibleOperation {
                field: self.field,
                operation: self.operation,
            });
        }

        let expected = match self.operation {
            RuleOperation::Before | RuleOperation::After => "date",
            RuleOperation::WithinLastDays => "day-count",
            RuleOperation::Is => "boolean",
            _ => "text",
        };
        if self.value.kind() != expected {
            return Err(RuleError::WrongValueType {
                operation: self.operation,
                expected,
            });
        }

        if let RuleValue::Text(text) = &self.value {
            if text.trim().is_empty() {
                return Err(RuleError::EmptyValue);
            }
        }
        Ok(())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.operation, self.value)
    }
}

/// Parses `<field> <operation> <value>`; the value is the rest of the line
/// and may be wrapped in double quotes.
///
/// ```
/// use gleaner::rules::{Rule, RuleField, RuleOperation, RuleValue};
///
/// let rule: Rule = "title contains \"rust async\"".parse().unwrap();
/// assert_eq!(rule.field, RuleField::Title);
/// assert_eq!(rule.operation, RuleOperation::Contains);
/// assert_eq!(rule.value, RuleValue::Text("rust async".into()));
///
/// let recent: Rule = "pub_date within_last_days 7".parse().unwrap();
/// assert_eq!(recent.value, RuleValue::Days(7));
/// ```
impl FromStr for Rule {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, char::is_whitespace);
        let (Some(field), Some(operation), Some(raw_value)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(RuleError::Malformed(s.to_owned()));
        };

        let field: RuleField = field.parse()?;
        let operation: RuleOperation = operation.parse()?;
        let raw_value = raw_value.trim();
        let raw_value = raw_value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(raw_value);

        let value = match operation {
            RuleOperation::Before | RuleOperation::After => RuleValue::Date(parse_date(raw_value)?),
            RuleOperation::WithinLastDays => {
                RuleValue::Days(raw_value.parse().map_err(|_| RuleError::InvalidValue {
                    value: raw_value.to_owned(),
                    reason: "expected a whole number of days".to_owned(),
                })?)
            }
            RuleOperation::Is => RuleValue::Bool(parse_bool(raw_value)?),
            _ => RuleValue::Text(raw_value.to_owned()),
        };

        Rule::new(field, operation, value)
    }
}

/// Accepts `YYYY-MM-DD` (midnight UTC) or an RFC 3339 timestamp.
fn parse_date(raw: &str) -> Result<i64, RuleError> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp())
        .map_err(|e| RuleError::InvalidValue {
            value: raw.to_owned(),
            reason: e.to_string(),
        })
}

fn parse_bool(raw: &str) -> Result<bool, RuleError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(RuleError::InvalidValue {
            value: raw.to_owned(),
            reason: "expected true or false".to_owned(),
        }),
    }
}

/// How a smart folder combines its rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Every rule must match (AND)
    #[default]
    All,
    /// At least one rule must match (OR)
    Any,
}

impl MatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchMode::All => "all",
            MatchMode::Any => "any",
        }
    }
}

impl FromStr for MatchMode {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" | "and" => Ok(MatchMode::All),
            "any" | "or" => Ok(MatchMode::Any),
            other => Err(RuleError::InvalidValue {
                value: other.to_owned(),
                reason: "match mode must be 'all' or 'any'".to_owned(),
            }),
        }
    }
}

/// A saved predicate over articles or feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartFolder {
    pub name: String,
    pub mode: MatchMode,
    pub rules: Vec<Rule>,
}

impl SmartFolder {
    pub fn new(name: &str, mode: MatchMode, rules: Vec<Rule>) -> Result<Self, RuleError> {
        let folder = Self {
            name: name.trim().to_owned(),
            mode,
            rules,
        };
        folder.validate()?;
        Ok(folder)
    }

    /// Re-check a folder that came from storage or another device.
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.name.is_empty() {
            return Err(RuleError::EmptyName);
        }
        self.rules.iter().try_for_each(Rule::validate)
    }

    pub fn needs_tags(&self) -> bool {
        self.rules.iter().any(|r| r.field == RuleField::Tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_rule_keeps_spaces() {
        let rule: Rule = "source equals Example Daily".parse().unwrap();
        assert_eq!(rule.field, RuleField::Source);
        assert_eq!(rule.value, RuleValue::Text("Example Daily".into()));
    }

    #[test]
    fn test_parse_date_rule() {
        let rule: Rule = "pub_date after 2024-01-02".parse().unwrap();
        assert_eq!(rule.value, RuleValue::Date(1_704_153_600));

        let rule: Rule = "date before 2024-01-02T12:00:00Z".parse().unwrap();
        assert_eq!(rule.value, RuleValue::Date(1_704_196_800));
    }

    #[test]
    fn test_parse_bool_rule() {
        let rule: Rule = "is_read is no".parse().unwrap();
        assert_eq!(rule.value, RuleValue::Bool(false));
    }

    #[test]
    fn test_parse_rejects_incompatible_pairs() {
        assert!(matches!(
            "title before 2024-01-01".parse::<Rule>(),
            Err(RuleError::IncompatibleOperation { .. })
        ));
        assert!(matches!(
            "is_read contains yes".parse::<Rule>(),
            Err(RuleError::IncompatibleOperation { .. })
        ));
        assert!(matches!(
            "tag equals work".parse::<Rule>(),
            Err(RuleError::IncompatibleOperation { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!("title contains".parse::<Rule>(), Err(RuleError::Malformed(_))));
        assert!(matches!(
            "colour contains red".parse::<Rule>(),
            Err(RuleError::UnknownField(_))
        ));
        assert!(matches!(
            "title resembles x".parse::<Rule>(),
            Err(RuleError::UnknownOperation(_))
        ));
        assert!(matches!(
            "pub_date within_last_days soon".parse::<Rule>(),
            Err(RuleError::InvalidValue { .. })
        ));
        assert!(matches!(
            "title contains \"\"".parse::<Rule>(),
            Err(RuleError::EmptyValue)
        ));
    }

    #[test]
    fn test_new_rejects_wrong_value_type() {
        let err = Rule::new(
            RuleField::PubDate,
            RuleOperation::WithinLastDays,
            RuleValue::Text("7".into()),
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::WrongValueType { expected: "day-count", .. }));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let rule: Rule = "pub_date before 2023-06-01".parse().unwrap();
        assert_eq!(rule.to_string(), "pub_date before 2023-06-01");
        assert_eq!(rule.to_string().parse::<Rule>().unwrap(), rule);
    }

    #[test]
    fn test_smart_folder_validation() {
        assert_eq!(
            SmartFolder::new("  ", MatchMode::All, vec![]).unwrap_err(),
            RuleError::EmptyName
        );

        let mut folder = SmartFolder::new("Rust", MatchMode::Any, vec![]).unwrap();
        folder.rules.push(Rule {
            field: RuleField::IsRead,
            operation: RuleOperation::Contains,
            value: RuleValue::Bool(true),
        });
        assert!(folder.validate().is_err());
    }

    #[test]
    fn test_serde_shape() {
        let rule: Rule = "title contains rust".parse().unwrap();
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "field": "title",
                "operation": "contains",
                "value": { "type": "text", "value": "rust" }
            })
        );
    }
}
