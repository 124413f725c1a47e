use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Active,
    Inactive,
    Connecting,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Inactive => "inactive",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(ConnectionStatus::Active),
            "inactive" => Some(ConnectionStatus::Inactive),
            "connecting" => Some(ConnectionStatus::Connecting),
            "error" => Some(ConnectionStatus::Error),
            _ => None,
        }
    }

    /// A handshake in flight may only settle on `active` or `error`, or keep
    /// waiting while the QR code is unscanned.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        match self {
            ConnectionStatus::Connecting => matches!(
                next,
                ConnectionStatus::Active | ConnectionStatus::Error | ConnectionStatus::Connecting
            ),
            _ => true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub name: String,
    pub status: ConnectionStatus,
    pub phone: String,
    pub instance_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_model: Option<String>,
    /// Lines this chip has sent, counted from the message log on read.
    #[serde(default)]
    pub conversations_count: u64,
    pub last_active: DateTime<Utc>,
}

impl Connection {
    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Paused,
    Stopped,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Stopped => "stopped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(RunStatus::Running),
            "paused" => Some(RunStatus::Paused),
            "stopped" => Some(RunStatus::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    First,
    Second,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::First => Side::Second,
            Side::Second => Side::First,
        }
    }
}

/// Chip names are resolved from the connections table when the pair is read.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChipPair {
    pub id: String,
    pub first_chip_id: String,
    pub first_chip_name: String,
    pub second_chip_id: String,
    pub second_chip_name: String,
    pub is_active: bool,
    pub messages_count: u64,
    pub last_activity: DateTime<Utc>,
    pub status: RunStatus,
    pub use_instance_prompt: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_prompt: Option<String>,
}

impl ChipPair {
    pub fn chip_id(&self, side: Side) -> &str {
        match side {
            Side::First => &self.first_chip_id,
            Side::Second => &self.second_chip_id,
        }
    }

    pub fn chip_name(&self, side: Side) -> &str {
        match side {
            Side::First => &self.first_chip_name,
            Side::Second => &self.second_chip_name,
        }
    }

    /// Whoever did not send the last recorded message speaks next; an empty
    /// history, or a last line from the second chip, hands the turn to the first.
    pub fn next_speaker(&self, last_sender: Option<&str>) -> Side {
        match last_sender {
            None => Side::First,
            Some(id) if id == self.second_chip_id => Side::First,
            Some(_) => Side::Second,
        }
    }

    pub fn override_prompt(&self) -> Option<&str> {
        if !self.use_instance_prompt {
            return None;
        }
        self.instance_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    pub fn label(&self) -> String {
        format!("{} <-> {}", self.first_chip_name, self.second_chip_name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default, alias = "prompt_tokens")]
    pub prompt_tokens: u64,
    #[serde(default, alias = "completion_tokens")]
    pub completion_tokens: u64,
    #[serde(default, alias = "total_tokens")]
    pub total_tokens: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub pair_id: String,
    pub from_chip_id: String,
    pub from_chip_name: String,
    pub to_chip_id: String,
    pub to_chip_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_message_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub id: String,
    pub name: String,
    pub content: String,
    pub category: String,
    pub is_global: bool,
}

/// One earlier line of a pair's conversation, seen from the current speaker.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryTurn {
    pub content: String,
    pub is_from_speaker: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub active_pairs: usize,
    pub total_messages: u64,
    pub messages_last_24h: u64,
    pub is_running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> ChipPair {
        ChipPair {
            id: "p1".into(),
            first_chip_id: "a".into(),
            first_chip_name: "Acct-A".into(),
            second_chip_id: "b".into(),
            second_chip_name: "Acct-B".into(),
            is_active: true,
            messages_count: 0,
            last_activity: Utc::now(),
            status: RunStatus::Stopped,
            use_instance_prompt: false,
            instance_prompt: None,
        }
    }

    #[test]
    fn empty_history_starts_with_first_chip() {
        let p = pair();
        let side = p.next_speaker(None);
        assert_eq!(side, Side::First);
        assert_eq!(p.chip_name(side), "Acct-A");
    }

    #[test]
    fn speaker_alternates_after_each_line() {
        let p = pair();
        assert_eq!(p.next_speaker(Some("a")), Side::Second);
        assert_eq!(p.chip_name(p.next_speaker(Some("a"))), "Acct-B");
        assert_eq!(p.next_speaker(Some("b")), Side::First);
    }

    #[test]
    fn blank_override_is_ignored() {
        let mut p = pair();
        p.instance_prompt = Some("   ".into());
        p.use_instance_prompt = true;
        assert_eq!(p.override_prompt(), None);

        p.instance_prompt = Some("talk about football".into());
        assert_eq!(p.override_prompt(), Some("talk about football"));

        p.use_instance_prompt = false;
        assert_eq!(p.override_prompt(), None);
    }

    #[test]
    fn connecting_only_settles_on_active_or_error() {
        let s = ConnectionStatus::Connecting;
        assert!(s.can_transition_to(ConnectionStatus::Active));
        assert!(s.can_transition_to(ConnectionStatus::Error));
        assert!(!s.can_transition_to(ConnectionStatus::Inactive));
        assert!(ConnectionStatus::Inactive.can_transition_to(ConnectionStatus::Connecting));
    }

    #[test]
    fn status_strings_round_trip_through_parse() {
        for s in [RunStatus::Running, RunStatus::Paused, RunStatus::Stopped] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ConnectionStatus::parse("bogus"), None);
    }
}
