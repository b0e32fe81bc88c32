//! Topic names, topic filters and the wildcard matching rule.
//!
//! Both are `/` separated. In a filter `+` matches exactly one level (an
//! empty one included) and `#`, which must be the last level, matches the
//! remaining levels, zero or more. Topics whose first level starts with `$`
//! are reserved and are only matched by filters spelling that first level out.
//!
//! ```
//! use mqbroker::topic::{matches, Topic};
//!
//! assert!(matches("sport/+/player1", "sport/tennis/player1"));
//! assert!(!matches("sport/+/player1", "sport/tennis/player1/ranking"));
//! assert!(matches("sport/#", "sport"));
//!
//! let filter: Topic = "$SYS/#".parse().unwrap();
//! assert!(filter.matches_str("$SYS/brokers"));
//! assert!(!matches("#", "$SYS/brokers"));
//! ```

use std::fmt::{self, Write};
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("InvalidTopic({0})")]
    InvalidTopic(String),
    #[error("InvalidLevel({0})")]
    InvalidLevel(String),
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash)]
pub enum Level {
    Normal(String),
    /// First level starting with `$`, e.g. `$SYS`
    Metadata(String),
    Blank,
    /// `+`
    SingleWildcard,
    /// `#`
    MultiWildcard,
}

impl Level {
    #[inline]
    pub fn value(&self) -> Option<&str> {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(*self, Level::SingleWildcard | Level::MultiWildcard)
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        matches!(*self, Level::Metadata(_))
    }

    fn parse(s: &str, first: bool) -> Result<Level, TopicError> {
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ if s.contains(['+', '#']) => {
                Err(TopicError::InvalidLevel(format!("invalid level `{}` contains +|#", s)))
            }
            _ if first && s.starts_with('$') => Ok(Level::Metadata(String::from(s))),
            _ => Ok(Level::Normal(String::from(s))),
        }
    }

    /// Matches one level of a topic name, `first` tells whether it is the first one.
    #[inline]
    fn match_level(&self, level: &str, first: bool) -> bool {
        match self {
            Level::Normal(s) | Level::Metadata(s) => s == level,
            Level::Blank => level.is_empty(),
            Level::SingleWildcard | Level::MultiWildcard => !(first && level.starts_with('$')),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => f.write_str(s.as_str()),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_char('+'),
            Level::MultiWildcard => f.write_char('#'),
        }
    }
}

/// A parsed topic filter. Topic names parse too; they simply carry no wildcard.
#[derive(Debug, Eq, PartialEq, Clone, Hash)]
pub struct Topic(Vec<Level>);

impl Topic {
    #[inline]
    pub fn levels(&self) -> &[Level] {
        &self.0
    }

    #[inline]
    pub fn has_wildcard(&self) -> bool {
        self.0.iter().any(Level::is_wildcard)
    }

    pub fn matches_str(&self, topic: &str) -> bool {
        if topic.is_empty() {
            return false;
        }
        let mut filter = self.0.iter();
        for (idx, level) in topic.split('/').enumerate() {
            match filter.next() {
                Some(Level::MultiWildcard) => return Level::MultiWildcard.match_level(level, idx == 0),
                Some(l) if l.match_level(level, idx == 0) => continue,
                _ => return false,
            }
        }
        // "sport/#" also matches "sport"
        matches!(filter.next(), None | Some(Level::MultiWildcard)) && filter.next().is_none()
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, TopicError> {
        if s.is_empty() {
            return Err(TopicError::InvalidTopic("empty topic".into()));
        }
        if s.contains('\0') {
            return Err(TopicError::InvalidTopic(format!("invalid topic `{}` contains NUL", s.escape_debug())));
        }
        let levels = s
            .split('/')
            .enumerate()
            .map(|(idx, l)| Level::parse(l, idx == 0))
            .collect::<Result<Vec<_>, TopicError>>()?;
        if levels.iter().rev().skip(1).any(|l| matches!(l, Level::MultiWildcard)) {
            return Err(TopicError::InvalidTopic(format!("invalid topic `{}`, # must be the last level", s)));
        }
        Ok(Topic(levels))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, level) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_char('/')?;
            }
            level.fmt(f)?;
        }
        Ok(())
    }
}

/// Whether `filter` selects `topic`. Invalid or empty inputs never match.
#[inline]
pub fn matches(filter: &str, topic: &str) -> bool {
    Topic::from_str(filter).map(|f| f.matches_str(topic)).unwrap_or(false)
}

#[inline]
pub fn is_valid_filter(filter: &str) -> bool {
    Topic::from_str(filter).is_ok()
}

/// A topic a client may publish to: non-empty, no wildcard, no NUL.
#[inline]
pub fn is_valid_topic_name(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#', '\0'])
}
