use super::wire::Event;

/// Reassembles `data:` payloads from an SSE byte stream. Multi-line data
/// fields are joined with `\n`; other fields and comments are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();

        while let Some(index) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=index).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(payload) = self.take_payload() {
                    payloads.push(payload);
                }
                continue;
            }

            if let Some(value) = line.strip_prefix("data:") {
                let value = value.strip_prefix(' ').unwrap_or(value);
                self.data.push(value.to_owned());
            }
        }

        payloads
    }

    /// Flushes a trailing event the peer did not terminate with a blank line.
    pub fn finish(&mut self) -> Vec<String> {
        let mut payloads = Vec::new();
        if !self.buffer.is_empty() {
            payloads.extend(self.push(b"\n"));
        }
        payloads.extend(self.take_payload());
        payloads
    }

    fn take_payload(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        (!payload.is_empty()).then_some(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    StepFinish,
    SessionIdle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchStep {
    /// The assistant began answering; carries the tracked message id.
    Started(String),
    Delta(String),
    Finished(Completion),
}

/// Correlates feed events with the single in-flight assistant message of one
/// session. The feed is shared by every session on the server, so anything
/// not carrying our session id is ignored.
#[derive(Debug)]
pub struct StreamMatcher {
    session_id: String,
    assistant_message_id: Option<String>,
    tracked_message_id: Option<String>,
    finished: bool,
}

impl StreamMatcher {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            assistant_message_id: None,
            tracked_message_id: None,
            finished: false,
        }
    }

    pub fn tracked_message_id(&self) -> Option<&str> {
        self.tracked_message_id.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn observe(&mut self, event: &Event) -> Vec<MatchStep> {
        let mut steps = Vec::new();
        if self.finished {
            return steps;
        }

        match event.kind.as_str() {
            "message.updated" => {
                let Some(info) = &event.properties.info else {
                    return steps;
                };
                let ours = info.session_id.as_deref() == Some(self.session_id.as_str());
                if ours && info.role.as_deref() == Some("assistant") && self.assistant_message_id.is_none() {
                    self.assistant_message_id = info.id.clone().filter(|id| !id.is_empty());
                }
            }
            "message.part.updated" => {
                let Some(part) = &event.properties.part else {
                    return steps;
                };
                if part.session_id.as_deref() != Some(self.session_id.as_str()) {
                    return steps;
                }
                let Some(message_id) = part.message_id.as_deref() else {
                    return steps;
                };

                if self.tracked_message_id.is_none()
                    && self.assistant_message_id.as_deref() == Some(message_id)
                {
                    self.tracked_message_id = Some(message_id.to_owned());
                    steps.push(MatchStep::Started(message_id.to_owned()));
                }

                if self.tracked_message_id.as_deref() != Some(message_id) {
                    return steps;
                }

                match part.kind.as_deref() {
                    Some("text") => {
                        if let Some(delta) = event.properties.delta.as_deref().filter(|delta| !delta.is_empty()) {
                            steps.push(MatchStep::Delta(delta.to_owned()));
                        }
                    }
                    Some("step-finish") => {
                        self.finished = true;
                        steps.push(MatchStep::Finished(Completion::StepFinish));
                    }
                    _ => {}
                }
            }
            "session.idle" => {
                let ours = event.properties.session_id.as_deref() == Some(self.session_id.as_str());
                if ours && self.tracked_message_id.is_some() {
                    self.finished = true;
                    steps.push(MatchStep::Finished(Completion::SessionIdle));
                }
            }
            _ => {}
        }

        steps
    }
}
