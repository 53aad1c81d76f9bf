use crate::storage::{Article, Feed, ItemType};

use super::model::RuleField;

/// Something a smart folder can be evaluated against.
///
/// Fields a subject does not have read as `None`; text rules then see an
/// empty string and date rules never match.
pub trait RuleSubject {
    /// Normalized link (articles) or url (feeds); the key tags are stored under.
    fn item_id(&self) -> &str;
    fn item_type(&self) -> ItemType;
    fn text(&self, field: RuleField) -> Option<&str>;
    fn date(&self) -> Option<i64>;
    fn is_read(&self) -> Option<bool>;
}

impl RuleSubject for Article {
    fn item_id(&self) -> &str {
        &self.link
    }

    fn item_type(&self) -> ItemType {
        ItemType::Article
    }

    fn text(&self, field: RuleField) -> Option<&str> {
        match field {
            RuleField::Title => Some(&*self.title),
            RuleField::Content => self.content.as_deref().or(self.description.as_deref()),
            RuleField::Author => self.author.as_deref(),
            RuleField::Source => Some(&*self.source),
            RuleField::Link => Some(self.link.as_str()),
            RuleField::PubDate | RuleField::IsRead | RuleField::Tag => None,
        }
    }

    fn date(&self) -> Option<i64> {
        self.pub_date
    }

    fn is_read(&self) -> Option<bool> {
        Some(self.is_read)
    }
}

/// Feeds expose their title as both `title` and `source`, their url as
/// `link`, and count as read when nothing is unread.
impl RuleSubject for Feed {
    fn item_id(&self) -> &str {
        &self.url
    }

    fn item_type(&self) -> ItemType {
        ItemType::Feed
    }

    fn text(&self, field: RuleField) -> Option<&str> {
        match field {
            RuleField::Title | RuleField::Source => Some(&*self.title),
            RuleField::Link => Some(self.url.as_str()),
            _ => None,
        }
    }

    fn date(&self) -> Option<i64> {
        self.last_updated
    }

    fn is_read(&self) -> Option<bool> {
        Some(self.unread_count == 0)
    }
}
