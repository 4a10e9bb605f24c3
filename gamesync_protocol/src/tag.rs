// Envelope tag grammar for game data packets.
//
// Every `GameData` packet carries a short textual tag that says what the
// payload answers. Two families exist:
//
//   <dir><mode><op>:<sync>    decision traffic, e.g. `I&ChooseCard:12`
//   Sync:<sync>               a hidden-information reveal for one player
//
// `dir` is `I` for a request (a participant's own answer, sent to the relay)
// or `R` for a response (the relay's echo of that answer, seen by everyone in
// one arrival order). `mode` is empty for single-player input, `&` when all
// targets answer, and `|` when any target may answer. `op` names the kind of
// decision (`[A-Za-z0-9_]+`), and `sync` is the synchronization tag the peers
// allocated for that player at that decision point.
//
// Waiters match tags with a `TagPattern`: either an exact tag or a prefix
// written with a trailing `*` (`R&ChooseCard:*` matches every response to an
// all-mode ChooseCard round).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SyncTag;

/// Prefix of reveal tags.
pub const REVEAL_PREFIX: &str = "Sync:";

/// How many of a decision's targets must answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputMode {
    /// Exactly one target.
    Single,
    /// Every target answers; all results are kept.
    All,
    /// Every target may answer; the first non-null answer wins.
    Any,
}

impl InputMode {
    /// The mode's marker inside a tag.
    pub fn marker(self) -> &'static str {
        match self {
            InputMode::Single => "",
            InputMode::All => "&",
            InputMode::Any => "|",
        }
    }
}

/// Whether a decision packet travels toward the relay or back from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    fn marker(self) -> char {
        match self {
            Direction::Request => 'I',
            Direction::Response => 'R',
        }
    }
}

/// A parsed envelope tag.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DataTag {
    Input {
        direction: Direction,
        mode: InputMode,
        op: String,
        sync: SyncTag,
    },
    Reveal(SyncTag),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    #[error("empty tag")]
    Empty,
    #[error("unknown direction marker {0:?}")]
    UnknownDirection(char),
    #[error("invalid operation name {0:?}")]
    InvalidOp(String),
    #[error("tag {0:?} has no sync tag")]
    MissingSync(String),
    #[error("invalid sync tag {0:?}")]
    InvalidSync(String),
}

impl DataTag {
    /// The tag a participant writes when answering a decision.
    pub fn request(mode: InputMode, op: impl Into<String>, sync: SyncTag) -> Self {
        DataTag::Input {
            direction: Direction::Request,
            mode,
            op: op.into(),
            sync,
        }
    }

    pub fn reveal(sync: SyncTag) -> Self {
        DataTag::Reveal(sync)
    }

    /// The relay's echo of a request. `None` for reveals and for tags that
    /// already are responses.
    pub fn to_response(&self) -> Option<DataTag> {
        match self {
            DataTag::Input {
                direction: Direction::Request,
                mode,
                op,
                sync,
            } => Some(DataTag::Input {
                direction: Direction::Response,
                mode: *mode,
                op: op.clone(),
                sync: *sync,
            }),
            _ => None,
        }
    }

    pub fn sync(&self) -> SyncTag {
        match self {
            DataTag::Input { sync, .. } | DataTag::Reveal(sync) => *sync,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            DataTag::Input {
                direction: Direction::Request,
                ..
            }
        )
    }
}

impl fmt::Display for DataTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataTag::Input {
                direction,
                mode,
                op,
                sync,
            } => write!(f, "{}{}{}:{}", direction.marker(), mode.marker(), op, sync),
            DataTag::Reveal(sync) => write!(f, "{REVEAL_PREFIX}{sync}"),
        }
    }
}

impl FromStr for DataTag {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(num) = s.strip_prefix(REVEAL_PREFIX) {
            return parse_sync(num).map(DataTag::Reveal);
        }

        let mut chars = s.chars();
        let direction = match chars.next() {
            None => return Err(TagError::Empty),
            Some('I') => Direction::Request,
            Some('R') => Direction::Response,
            Some(other) => return Err(TagError::UnknownDirection(other)),
        };
        let rest = chars.as_str();
        let (mode, body) = if let Some(body) = rest.strip_prefix('&') {
            (InputMode::All, body)
        } else if let Some(body) = rest.strip_prefix('|') {
            (InputMode::Any, body)
        } else {
            (InputMode::Single, rest)
        };

        let (op, num) = body
            .rsplit_once(':')
            .ok_or_else(|| TagError::MissingSync(s.to_string()))?;
        if !is_valid_op(op) {
            return Err(TagError::InvalidOp(op.to_string()));
        }
        Ok(DataTag::Input {
            direction,
            mode,
            op: op.to_string(),
            sync: parse_sync(num)?,
        })
    }
}

fn parse_sync(num: &str) -> Result<SyncTag, TagError> {
    num.parse::<u64>()
        .map(SyncTag)
        .map_err(|_| TagError::InvalidSync(num.to_string()))
}

/// Operation names are non-empty ASCII identifiers.
pub fn is_valid_op(op: &str) -> bool {
    !op.is_empty() && op.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A tag matcher: exact, or a prefix written with a trailing `*`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TagPattern {
    Exact(String),
    Prefix(String),
}

impl TagPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => TagPattern::Prefix(prefix.to_string()),
            None => TagPattern::Exact(pattern.to_string()),
        }
    }

    /// Matches every relay echo of `op` decisions in `mode`.
    pub fn responses(mode: InputMode, op: &str) -> Self {
        TagPattern::Prefix(format!("R{}{}:", mode.marker(), op))
    }

    /// Matches the reveal addressed to `sync`.
    pub fn reveal(sync: SyncTag) -> Self {
        TagPattern::Exact(DataTag::Reveal(sync).to_string())
    }

    pub fn matches(&self, tag: &str) -> bool {
        match self {
            TagPattern::Exact(exact) => tag == exact,
            TagPattern::Prefix(prefix) => tag.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for TagPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagPattern::Exact(exact) => f.write_str(exact),
            TagPattern::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}
