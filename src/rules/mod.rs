//! Smart folders: saved predicates over articles and feeds.
//!
//! A [`SmartFolder`] is an ordered list of `(field, operation, value)` rules
//! combined with AND ([`MatchMode::All`]) or OR ([`MatchMode::Any`]).
//!
//! - [`model`] holds the typed rule model, validation and text parsing
//! - [`subject`] adapts articles and feeds to the fields rules read
//! - [`evaluator`] resolves tag sets concurrently, then runs the predicates
//!
//! ```ignore
//! let folder = SmartFolder::new(
//!     "Unread Rust",
//!     MatchMode::All,
//!     vec!["title contains rust".parse()?, "is_read is false".parse()?],
//! )?;
//! let matches = evaluate(&folder, &articles, &db, now).await?;
//! ```

mod evaluator;
mod model;
mod subject;

pub use evaluator::{evaluate, folder_matches, rule_matches, TagSource};
pub use model::{MatchMode, Rule, RuleError, RuleField, RuleOperation, RuleValue, SmartFolder};
pub use subject::RuleSubject;
