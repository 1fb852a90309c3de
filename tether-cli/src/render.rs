//! Plain-text transcript rendering.
//!
//! Assistant text streams in place: partial entries for the same id only
//! print what was appended since the last one. Everything else is one line.

use std::io::{self, Write};

use tether_api::{ConversationEvent, Role, TranscriptEntry};
use tether_stream::truncate_for_display;

const LINE_LIMIT: usize = 160;

pub struct Renderer<W: Write> {
    out: W,
    /// Assistant entry currently streaming and how much of it is on screen.
    streaming: Option<(String, String)>,
}

impl<W: Write> Renderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            streaming: None,
        }
    }

    pub fn render(&mut self, event: &ConversationEvent) -> io::Result<()> {
        match event {
            ConversationEvent::Entry { entry, .. } => self.entry(entry)?,
            ConversationEvent::ProcessKilled { .. } => {
                self.end_stream()?;
                writeln!(self.out, "[stopped]")?;
            }
            ConversationEvent::ProcessExited { .. } => self.end_stream()?,
            ConversationEvent::ResumeCaptured { .. }
            | ConversationEvent::ProcessStarted { .. }
            | ConversationEvent::Diagnostic { .. } => {}
        }
        self.out.flush()
    }

    /// Print a stored (final) entry.
    pub fn entry(&mut self, entry: &TranscriptEntry) -> io::Result<()> {
        match entry.role {
            Role::Assistant => self.assistant(entry),
            Role::User => {
                self.end_stream()?;
                writeln!(self.out, "> {}", one_line(&entry.content))
            }
            Role::Tool => {
                self.end_stream()?;
                if entry.tool_result.is_some() {
                    let tag = if entry.is_error { "tool error" } else { "result" };
                    writeln!(self.out, "[{tag}] {}", one_line(&entry.content))
                } else {
                    let input = entry
                        .tool_input
                        .as_ref()
                        .map(|input| input.to_value().to_string())
                        .unwrap_or_default();
                    writeln!(self.out, "[tool] {} {}", entry.content, one_line(&input))
                }
            }
            Role::System => {
                self.end_stream()?;
                let tag = if entry.is_error { "error" } else { "system" };
                writeln!(self.out, "[{tag}] {}", one_line(&entry.content))
            }
        }
    }

    fn assistant(&mut self, entry: &TranscriptEntry) -> io::Result<()> {
        let shown = match self.streaming.take() {
            Some((id, shown)) if id == entry.id && entry.content.starts_with(&shown) => shown,
            Some(_) => {
                writeln!(self.out)?;
                String::new()
            }
            None => String::new(),
        };

        write!(self.out, "{}", &entry.content[shown.len()..])?;

        if entry.is_partial {
            self.streaming = Some((entry.id.clone(), entry.content.clone()));
        } else if !entry.content.is_empty() {
            writeln!(self.out)?;
        }
        Ok(())
    }

    /// Terminate a half-printed assistant line.
    fn end_stream(&mut self) -> io::Result<()> {
        if let Some((_, shown)) = self.streaming.take() {
            if !shown.is_empty() {
                writeln!(self.out)?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}

fn one_line(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_for_display(&flat, LINE_LIMIT)
}
