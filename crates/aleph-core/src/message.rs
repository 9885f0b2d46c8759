//! Inter-agent message files: YAML frontmatter plus a markdown body.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub const MAX_SUMMARY_LEN: usize = 200;

#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub message_id: String,
    /// Unknown frontmatter keys survive a parse/render round trip.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("missing frontmatter delimiter")]
    MissingFrontmatter,
    #[error("unterminated frontmatter block")]
    UnterminatedFrontmatter,
    #[error("exactly one of to/channel must be set")]
    BadAddress,
    #[error("summary exceeds {MAX_SUMMARY_LEN} characters")]
    SummaryTooLong,
    #[error("invalid frontmatter: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl MessageHeader {
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.to.is_some() == self.channel.is_some() {
            return Err(MessageError::BadAddress);
        }
        if self.summary.chars().count() > MAX_SUMMARY_LEN {
            return Err(MessageError::SummaryTooLong);
        }
        Ok(())
    }
}

impl Message {
    /// Parse a `---` delimited frontmatter block followed by a markdown body.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let rest = text
            .strip_prefix("---\n")
            .or_else(|| text.strip_prefix("---\r\n"))
            .ok_or(MessageError::MissingFrontmatter)?;

        let (yaml, body) = match rest.find("\n---") {
            Some(idx) => {
                let yaml = &rest[..idx + 1];
                let after = &rest[idx + 1..];
                // Skip the closing delimiter line.
                let body = after
                    .splitn(2, '\n')
                    .nth(1)
                    .unwrap_or("");
                (yaml, body)
            }
            None => return Err(MessageError::UnterminatedFrontmatter),
        };

        let header: MessageHeader = serde_yaml::from_str(yaml)?;
        header.validate()?;

        Ok(Self {
            header,
            body: body.trim_start_matches('\n').to_owned(),
        })
    }

    pub fn render(&self) -> Result<String, MessageError> {
        self.header.validate()?;
        let yaml = serde_yaml::to_string(&self.header)?;
        let mut out = String::with_capacity(yaml.len() + self.body.len() + 16);
        out.push_str("---\n");
        out.push_str(&yaml);
        if !yaml.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("---\n");
        if !self.body.is_empty() {
            out.push('\n');
            out.push_str(&self.body);
            if !self.body.ends_with('\n') {
                out.push('\n');
            }
        }
        Ok(out)
    }
}

/// Truncate a summary to the wire limit, marking the cut with an ellipsis.
pub fn clamp_summary(text: &str) -> String {
    if text.chars().count() <= MAX_SUMMARY_LEN {
        return text.to_owned();
    }
    let head: String = text.chars().take(MAX_SUMMARY_LEN - 3).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn header(to: Option<&str>, channel: Option<&str>) -> MessageHeader {
        MessageHeader {
            from: "aleph-11111111".to_owned(),
            to: to.map(str::to_owned),
            channel: channel.map(str::to_owned),
            summary: "hello".to_owned(),
            priority: Priority::Normal,
            timestamp: datetime!(2025-06-01 12:00:00 UTC),
            message_id: "01HZXW0000000000000000TEST".to_owned(),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn parse_render_round_trip() {
        let msg = Message {
            header: header(Some("aleph-22222222"), None),
            body: "A body.\n\nWith two paragraphs.\n".to_owned(),
        };

        let text = msg.render().unwrap();
        let parsed = Message::parse(&text).unwrap();
        assert_eq!(parsed, msg);

        // Stable after a second round trip (bytes match modulo key order).
        assert_eq!(parsed.render().unwrap(), text);
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let text = "---\nfrom: a\nto: b\nsummary: s\npriority: high\n\
                    timestamp: 2025-06-01T12:00:00Z\nmessage_id: m-1\n\
                    thread: t-42\n---\n\nbody\n";
        let msg = Message::parse(text).unwrap();
        assert_eq!(
            msg.header.extra.get("thread"),
            Some(&serde_yaml::Value::String("t-42".to_owned()))
        );

        let rendered = msg.render().unwrap();
        assert!(rendered.contains("thread: t-42"));
    }

    #[test]
    fn validate_requires_exactly_one_address() {
        assert!(matches!(
            header(None, None).validate(),
            Err(MessageError::BadAddress)
        ));
        assert!(matches!(
            header(Some("b"), Some("c")).validate(),
            Err(MessageError::BadAddress)
        ));
        header(Some("b"), None).validate().unwrap();
        header(None, Some("c")).validate().unwrap();
    }

    #[test]
    fn summary_over_limit_is_rejected() {
        let mut h = header(Some("b"), None);
        h.summary = "x".repeat(MAX_SUMMARY_LEN + 1);
        assert!(matches!(h.validate(), Err(MessageError::SummaryTooLong)));
    }

    #[test]
    fn clamp_summary_marks_truncation() {
        let long = "y".repeat(300);
        let clamped = clamp_summary(&long);
        assert_eq!(clamped.chars().count(), MAX_SUMMARY_LEN);
        assert!(clamped.ends_with("..."));
        assert_eq!(clamp_summary("short"), "short");
    }

    #[test]
    fn parse_rejects_missing_or_open_frontmatter() {
        assert!(matches!(
            Message::parse("no frontmatter here"),
            Err(MessageError::MissingFrontmatter)
        ));
        assert!(matches!(
            Message::parse("---\nfrom: a\n"),
            Err(MessageError::UnterminatedFrontmatter)
        ));
    }

    #[test]
    fn priority_orders_low_to_high() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
    }
}
