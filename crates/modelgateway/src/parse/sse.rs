//! Incremental scanners for provider stream framings. Providers deliver
//! bytes in arbitrary chunks; events regularly split across chunk
//! boundaries, so both scanners buffer input and only yield complete events.

use aws_event_stream_parser::{EventStreamCodec, Message};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// One server-sent event: the optional `event:` name and the joined `data:`
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
	pub event: Option<String>,
	pub data: String,
}

/// Scans `text/event-stream` bytes into events. Events are delimited by a
/// blank line; multiple `data:` lines within one event are joined with a
/// newline per the SSE spec. Comment lines (leading `:`) are dropped.
#[derive(Debug, Default)]
pub struct SseScanner {
	buf: BytesMut,
}

impl SseScanner {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, chunk: &[u8]) {
		self.buf.extend_from_slice(chunk);
	}

	/// Pop the next complete event, if any.
	pub fn next_event(&mut self) -> Option<SseEvent> {
		loop {
			let end = find_event_boundary(&self.buf)?;
			let raw = self.buf.split_to(end.consume);
			let raw = &raw[..end.event_len];
			let event = parse_event(raw);
			if let Some(event) = event {
				return Some(event);
			}
			// Comment-only or empty event; keep scanning.
		}
	}

	/// Flush a trailing event that was not terminated by a blank line.
	pub fn finish(&mut self) -> Option<SseEvent> {
		if self.buf.is_empty() {
			return None;
		}
		let raw = self.buf.split_to(self.buf.len());
		parse_event(&raw)
	}
}

struct Boundary {
	event_len: usize,
	consume: usize,
}

/// Find `\n\n` or `\r\n\r\n` (or the mixed forms), returning the event length
/// and the number of bytes to consume including the delimiter.
fn find_event_boundary(buf: &[u8]) -> Option<Boundary> {
	let mut i = 0;
	while i < buf.len() {
		// A line break is "\n" or "\r\n". Two in a row ends the event.
		let (is_break, len) = match buf[i] {
			b'\n' => (true, 1),
			b'\r' if buf.get(i + 1) == Some(&b'\n') => (true, 2),
			_ => (false, 0),
		};
		if is_break {
			let j = i + len;
			let (second, len2) = match buf.get(j) {
				Some(b'\n') => (true, 1),
				Some(b'\r') if buf.get(j + 1) == Some(&b'\n') => (true, 2),
				_ => (false, 0),
			};
			if second {
				return Some(Boundary {
					event_len: i,
					consume: j + len2,
				});
			}
			i = j;
		} else {
			i += 1;
		}
	}
	None
}

fn parse_event(raw: &[u8]) -> Option<SseEvent> {
	let text = std::str::from_utf8(raw).ok()?;
	let mut event = None;
	let mut data: Vec<&str> = Vec::new();
	for line in text.lines() {
		if line.starts_with(':') {
			continue;
		}
		let (field, value) = match line.split_once(':') {
			Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
			None => (line, ""),
		};
		match field {
			"event" => event = Some(value.to_string()),
			"data" => data.push(value),
			_ => {},
		}
	}
	if data.is_empty() && event.is_none() {
		return None;
	}
	Some(SseEvent {
		event,
		data: data.join("\n"),
	})
}

/// Scans newline-delimited JSON (ollama's stream framing) into lines.
#[derive(Debug, Default)]
pub struct LineScanner {
	buf: BytesMut,
}

impl LineScanner {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, chunk: &[u8]) {
		self.buf.extend_from_slice(chunk);
	}

	pub fn next_line(&mut self) -> Option<String> {
		loop {
			let pos = self.buf.iter().position(|b| *b == b'\n')?;
			let mut line = self.buf.split_to(pos + 1);
			line.truncate(pos);
			if line.last() == Some(&b'\r') {
				line.truncate(line.len() - 1);
			}
			if line.is_empty() {
				continue;
			}
			if let Ok(s) = std::str::from_utf8(&line) {
				return Some(s.to_string());
			}
		}
	}

	pub fn finish(&mut self) -> Option<String> {
		if self.buf.is_empty() {
			return None;
		}
		let rest = self.buf.split_to(self.buf.len());
		std::str::from_utf8(&rest)
			.ok()
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
	}
}

/// Scans AWS event-stream frames (bedrock's stream framing) into messages.
pub struct EventStreamScanner {
	buf: BytesMut,
	codec: EventStreamCodec,
}

impl EventStreamScanner {
	pub fn new() -> Self {
		EventStreamScanner {
			buf: BytesMut::new(),
			codec: EventStreamCodec,
		}
	}

	pub fn push(&mut self, chunk: &[u8]) {
		self.buf.extend_from_slice(chunk);
	}

	pub fn next_message(&mut self) -> Result<Option<Message>, anyhow::Error> {
		self
			.codec
			.decode(&mut self.buf)
			.map_err(|e| anyhow::anyhow!("event stream decode: {e}"))
	}
}

impl Default for EventStreamScanner {
	fn default() -> Self {
		Self::new()
	}
}
