use crate::message_tag::MessageTag;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("chunk is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssemblerMode {
    #[default]
    Idle,
    /// Inside a message, waiting for the closing tag of `MessageTag`
    AwaitingClose(MessageTag),
}

/// Output of a single [`FragmentAssembler::feed`] call
#[derive(Debug, Default, PartialEq)]
pub struct Assembled {
    fragments: Vec<String>,
    partial_tag: bool,
}

impl Assembled {
    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    /// True when the data ended on something that may still become an opening tag
    pub fn has_partial_tag(&self) -> bool {
        self.partial_tag
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

impl IntoIterator for Assembled {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.fragments.into_iter()
    }
}

/// Re-assembles complete EMU-2 messages out of serial reads that may be cut
/// at any byte.
///
/// Data is handled line by line. Outside of a message a line is only kept if
/// it starts with a known opening tag, or if it could still grow into one
/// once more bytes arrive. Inside a message everything is collected until the
/// matching closing tag shows up. The assembler never checks that a message
/// is well formed XML, that is left to the decoder.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    /// Text carried to the next feed: an unfinished message or a partial opening tag
    buffer: String,
    /// Trailing bytes of an unfinished UTF-8 sequence
    undecoded: Vec<u8>,
    mode: AssemblerMode,
    /// The last discarded line had no terminator yet, drop the rest of it
    skip_to_line_end: bool,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> AssemblerMode {
        self.mode
    }

    /// True while part of a message has been collected but not its closing tag
    pub fn is_mid_fragment(&self) -> bool {
        matches!(self.mode, AssemblerMode::AwaitingClose(_))
    }

    /// Text currently held over for the next feed
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Adds a chunk read from the device and returns every message it completed.
    ///
    /// A chunk containing an invalid UTF-8 sequence is dropped as a whole and
    /// leaves the assembler as it was, so a message in progress can still be
    /// finished by later chunks.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Assembled, AssemblyError> {
        let text = self.decode_chunk(chunk)?;
        self.buffer.push_str(&text);

        let data = std::mem::take(&mut self.buffer);
        let mut rest = data.as_str();
        let mut assembled = Assembled::default();
        let mut message = String::new();
        let mut partial: Option<&str> = None;

        if self.skip_to_line_end {
            match rest.find('\n') {
                Some(end) => {
                    rest = &rest[end + 1..];
                    self.skip_to_line_end = false;
                }
                None => rest = "",
            }
        }

        'lines: while !rest.is_empty() {
            let line_end = rest.find('\n').map_or(rest.len(), |pos| pos + 1);
            let (mut line, tail) = rest.split_at(line_end);
            rest = tail;

            // A closing tag may be followed by more data on the same line,
            // which is then treated as the start of a new line.
            loop {
                match self.mode {
                    AssemblerMode::AwaitingClose(tag) => match line.find(tag.close_tag()) {
                        Some(pos) => {
                            let end = pos + tag.close_tag().len();
                            message.push_str(&line[..end]);
                            debug!("Tag end: {}", tag.close_tag());
                            assembled.fragments.push(std::mem::take(&mut message));
                            self.mode = AssemblerMode::Idle;
                            line = &line[end..];
                            if line.is_empty() {
                                break;
                            }
                        }
                        None => {
                            message.push_str(line);
                            break;
                        }
                    },
                    AssemblerMode::Idle => {
                        if let Some(tag) = MessageTag::opening(line) {
                            debug!("Tag start: {}", line.trim_end());
                            self.mode = AssemblerMode::AwaitingClose(tag);
                        } else if MessageTag::is_open_prefix(line) {
                            debug!("Partial tag: {line}");
                            partial = Some(line);
                            break 'lines;
                        } else {
                            if !line.ends_with('\n') {
                                self.skip_to_line_end = true;
                            }
                            break;
                        }
                    }
                }
            }
        }

        self.buffer = match self.mode {
            AssemblerMode::AwaitingClose(_) => {
                debug!("Partial msg: {message}");
                message
            }
            AssemblerMode::Idle => partial.map(str::to_owned).unwrap_or_default(),
        };
        assembled.partial_tag = partial.is_some();

        Ok(assembled)
    }

    /// Decodes `chunk` together with any bytes left over from the previous one.
    /// A multi-byte character cut at the end of the chunk is kept for later.
    fn decode_chunk(&mut self, chunk: &[u8]) -> Result<String, AssemblyError> {
        let mut bytes = std::mem::take(&mut self.undecoded);
        bytes.extend_from_slice(chunk);

        match std::str::from_utf8(&bytes) {
            Ok(text) => Ok(text.to_owned()),
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = std::str::from_utf8(&bytes[..valid])?.to_owned();
                self.undecoded = bytes[valid..].to_vec();
                Ok(text)
            }
            Err(e) => Err(e.into()),
        }
    }
}
