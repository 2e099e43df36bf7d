/// Root tags of the EMU-2 messages the bridge understands.
/// Anything else on the serial line is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTag {
    InstantaneousDemand,
    CurrentSummationDelivered,
    ConnectionStatus,
}

impl MessageTag {
    pub const ALL: [MessageTag; 3] = [
        MessageTag::InstantaneousDemand,
        MessageTag::CurrentSummationDelivered,
        MessageTag::ConnectionStatus,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MessageTag::InstantaneousDemand => "InstantaneousDemand",
            MessageTag::CurrentSummationDelivered => "CurrentSummationDelivered",
            MessageTag::ConnectionStatus => "ConnectionStatus",
        }
    }

    pub fn open_tag(self) -> &'static str {
        match self {
            MessageTag::InstantaneousDemand => "<InstantaneousDemand>",
            MessageTag::CurrentSummationDelivered => "<CurrentSummationDelivered>",
            MessageTag::ConnectionStatus => "<ConnectionStatus>",
        }
    }

    pub fn close_tag(self) -> &'static str {
        match self {
            MessageTag::InstantaneousDemand => "</InstantaneousDemand>",
            MessageTag::CurrentSummationDelivered => "</CurrentSummationDelivered>",
            MessageTag::ConnectionStatus => "</ConnectionStatus>",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.name() == name)
    }

    /// Returns the tag whose opening tag starts `line`
    pub fn opening(line: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|tag| line.starts_with(tag.open_tag()))
    }

    /// True when `text` could still grow into one of the opening tags
    pub fn is_open_prefix(text: &str) -> bool {
        !text.is_empty()
            && Self::ALL.into_iter().any(|tag| {
                let open = tag.open_tag();
                text.len() < open.len() && open.starts_with(text)
            })
    }
}

impl std::fmt::Display for MessageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
