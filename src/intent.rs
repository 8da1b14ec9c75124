//! Rule-based intent classification.

use crate::error::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Confidence reported for any rule match.
pub const MATCH_CONFIDENCE: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    OpenApp,
    CloseApp,
    Search,
    PlayMedia,
    SystemCommand,
    Time,
    Date,
    Weather,
    Volume,
    Exit,
    Unknown,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Intent::OpenApp => "open_app",
            Intent::CloseApp => "close_app",
            Intent::Search => "search",
            Intent::PlayMedia => "play_media",
            Intent::SystemCommand => "system_command",
            Intent::Time => "time",
            Intent::Date => "date",
            Intent::Weather => "weather",
            Intent::Volume => "volume",
            Intent::Exit => "exit",
            Intent::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Classified command. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentRecord {
    pub intent: Intent,
    pub fields: BTreeMap<String, String>,
    pub confidence: f32,
}

impl IntentRecord {
    pub fn new(intent: Intent, confidence: f32) -> Self {
        Self {
            intent,
            fields: BTreeMap::new(),
            confidence,
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn unknown(original_text: &str) -> Self {
        Self::new(Intent::Unknown, 0.0).with_field("original_text", original_text)
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn is_unknown(&self) -> bool {
        self.intent == Intent::Unknown
    }
}

pub trait IntentClassifier: Send + Sync {
    fn classify(&self, text: &str) -> IntentRecord;
}

/// Spoken variants of application names.
const APP_ALIASES: &[(&str, &[&str])] = &[
    ("chrome", &["chrome", "browser", "google chrome"]),
    ("firefox", &["firefox", "fire fox", "mozilla"]),
    ("notepad", &["notepad", "note pad", "text editor"]),
    ("explorer", &["explorer", "file explorer", "files", "my computer", "file manager"]),
    ("calculator", &["calculator", "calc"]),
    ("terminal", &["terminal", "console", "command line"]),
    ("word", &["word", "microsoft word"]),
    ("excel", &["excel", "microsoft excel"]),
    ("powerpoint", &["powerpoint", "microsoft powerpoint", "ppt"]),
    ("spotify", &["spotify", "music"]),
    ("vlc", &["vlc", "vlc player", "video player"]),
];

const SYSTEM_WORDS: &[&str] = &["shutdown", "restart", "reboot", "sleep", "lock"];

/// Ordered rule table: the first matching rule wins.
const RULES: &[(Intent, &str)] = &[
    (Intent::OpenApp, r"\b(?:open|launch|start|run)\s+(.+)"),
    (Intent::OpenApp, r"\b(?:can you |please )?open\s+(.+)"),
    (Intent::CloseApp, r"\b(?:close|quit|exit|stop)\s+(.+)"),
    (Intent::Search, r"\b(?:search|look up|find|google)\s+(?:for\s+)?(.+)"),
    (Intent::Search, r"\bwhat is\s+(.+)"),
    (Intent::Search, r"\bwho is\s+(.+)"),
    (Intent::Search, r"\btell me about\s+(.+)"),
    (Intent::PlayMedia, r"\b(?:play|start playing)\s+(.+)"),
    (Intent::PlayMedia, r"\bput on\s+(.+)"),
    (Intent::SystemCommand, r"\b(shutdown|restart|reboot|sleep|lock)\s*(?:computer|system|pc)?"),
    (Intent::SystemCommand, r"\b(?:turn off|shut down)\s+(?:the\s+)?(?:computer|system|pc)"),
    (Intent::Time, r"\b(?:what time is it|tell me the time|current time)"),
    (Intent::Time, r"\bwhat'?s the time"),
    (Intent::Date, r"\b(?:what'?s (?:the )?date|today'?s date|what day is it)"),
    (Intent::Weather, r"\b(?:what'?s the weather|weather forecast|how'?s the weather)"),
    (Intent::Weather, r"\b(?:is it )?(?:raining|sunny|cloudy)"),
    (Intent::Volume, r"\b(?:volume|sound)\s+(up|down|mute|unmute|\d+)"),
    (Intent::Volume, r"\b(?:increase|decrease|raise|lower)\s+(?:the\s+)?volume"),
    (Intent::Volume, r"\b(?:mute|unmute)"),
    (Intent::Exit, r"\b(?:exit|quit|stop listening|goodbye|bye)"),
];

struct Rule {
    intent: Intent,
    pattern: Regex,
}

pub struct RuleClassifier {
    rules: Vec<Rule>,
}

impl RuleClassifier {
    pub fn new() -> Result<Self> {
        let rules = RULES
            .iter()
            .map(|(intent, pattern)| -> Result<Rule> {
                Ok(Rule {
                    intent: *intent,
                    pattern: Regex::new(&format!("(?i){pattern}"))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    fn record_for(&self, intent: Intent, text: &str, capture: Option<&str>) -> IntentRecord {
        let record = IntentRecord::new(intent, MATCH_CONFIDENCE);
        let capture = capture.map(str::trim).filter(|c| !c.is_empty());

        match (intent, capture) {
            (Intent::OpenApp | Intent::CloseApp, Some(target)) => {
                record.with_field("target", normalize_app_name(target))
            }
            (Intent::Search, Some(query)) => record.with_field("query", query),
            (Intent::PlayMedia, Some(media)) => record.with_field("media", media),
            (Intent::SystemCommand, Some(command)) => record.with_field("command", command),
            (Intent::SystemCommand, None) => {
                let command = SYSTEM_WORDS
                    .iter()
                    .find(|w| text.contains(*w))
                    .copied()
                    // "turn off the computer" / "shut down the pc"
                    .unwrap_or("shutdown");
                record.with_field("command", command)
            }
            (Intent::Volume, Some(action)) => record.with_field("action", action),
            (Intent::Volume, None) => match volume_action(text) {
                Some(action) => record.with_field("action", action),
                None => record,
            },
            (_, Some(target)) => record.with_field("target", target),
            (_, None) => record,
        }
    }
}

impl IntentClassifier for RuleClassifier {
    fn classify(&self, text: &str) -> IntentRecord {
        let text = normalize_text(text);
        if text.is_empty() {
            return IntentRecord::new(Intent::Unknown, 0.0).with_field("error", "empty_input");
        }

        for rule in &self.rules {
            if let Some(caps) = rule.pattern.captures(&text) {
                let capture = caps.get(1).map(|m| m.as_str());
                let record = self.record_for(rule.intent, &text, capture);
                debug!(text = %text, intent = %record.intent, fields = ?record.fields, "intent detected");
                return record;
            }
        }

        debug!(text = %text, "no intent matched");
        IntentRecord::unknown(&text)
    }
}

/// ASCII-fold, lower-case, drop punctuation other than apostrophes and
/// collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    let folded = deunicode::deunicode(text).to_lowercase();
    let cleaned: String = folded
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Map spoken application names to their canonical form.
pub fn normalize_app_name(name: &str) -> String {
    let name = name.trim().to_lowercase();
    APP_ALIASES
        .iter()
        .find(|(canonical, aliases)| *canonical == name || aliases.contains(&name.as_str()))
        .map(|(canonical, _)| canonical.to_string())
        .unwrap_or(name)
}

fn volume_action(text: &str) -> Option<&'static str> {
    if text.contains("unmute") {
        Some("unmute")
    } else if text.contains("mute") {
        Some("mute")
    } else if text.contains("increase") || text.contains("raise") {
        Some("up")
    } else if text.contains("decrease") || text.contains("lower") {
        Some("down")
    } else {
        None
    }
}
