use std::collections::VecDeque;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogLine {
    pub timestamp: String,
    pub content: String,
}

impl LogLine {
    pub fn parse(line: &str) -> Self {
        let (timestamp, content) = line.split_once(' ').unwrap_or((line, ""));
        Self {
            timestamp: timestamp.to_string(),
            content: content.to_string(),
        }
    }
}

/// Splits a byte stream into lines, holding back a trailing partial line
/// until the chunk that completes it arrives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let Some(last_newline) = self.partial.iter().rposition(|byte| *byte == b'\n') else {
            return Vec::new();
        };

        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        String::from_utf8_lossy(&complete)
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
        (!line.trim().is_empty()).then_some(line)
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct LogCursor {
    pub last_timestamp: Option<String>,
}

/// Drops the fractional seconds from an RFC 3339 timestamp; the log
/// endpoint only resumes at whole-second precision.
pub fn truncate_to_seconds(timestamp: &str) -> String {
    let Some(dot) = timestamp.find('.') else {
        return timestamp.to_string();
    };
    let fraction_end = timestamp[dot + 1..]
        .find(|c: char| !c.is_ascii_digit())
        .map(|offset| dot + 1 + offset)
        .unwrap_or(timestamp.len());
    format!("{}{}", &timestamp[..dot], &timestamp[fraction_end..])
}

fn second_prefix(timestamp: &str) -> &str {
    let time = timestamp.find('T').map_or(0, |t| t + 1);
    match timestamp[time..].find(['.', 'Z', '+', '-']) {
        Some(end) => &timestamp[..time + end],
        None => timestamp,
    }
}

#[derive(Debug)]
pub struct LogView {
    splitter: LineSplitter,
    cursor: LogCursor,
    resume_prefix: Option<String>,
    pending: Vec<LogLine>,
    rendered: VecDeque<LogLine>,
    capacity: usize,
    suppressed: usize,
}

impl LogView {
    pub fn new(capacity: usize) -> Self {
        Self {
            splitter: LineSplitter::default(),
            cursor: LogCursor::default(),
            resume_prefix: None,
            pending: Vec::new(),
            rendered: VecDeque::new(),
            capacity: capacity.max(1),
            suppressed: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.capacity);
    }

    pub fn accept_chunk(&mut self, chunk: &[u8]) -> usize {
        if chunk.is_empty() {
            return 0;
        }
        let lines = self.splitter.push(chunk);
        lines.iter().filter(|line| self.accept_line(line)).count()
    }

    pub fn finish_stream(&mut self) -> usize {
        match self.splitter.finish() {
            Some(line) => usize::from(self.accept_line(&line)),
            None => 0,
        }
    }

    fn accept_line(&mut self, raw: &str) -> bool {
        let line = LogLine::parse(raw);
        if self.is_replay(&line) {
            self.suppressed += 1;
            return false;
        }

        self.cursor.last_timestamp = Some(line.timestamp.clone());
        self.pending.push(line);
        true
    }

    fn is_replay(&self, line: &LogLine) -> bool {
        let Some(prefix) = self.resume_prefix.as_deref() else {
            return false;
        };
        line.timestamp.starts_with(prefix)
            && self
                .rendered
                .iter()
                .any(|rendered| rendered.content == line.content)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn flush(&mut self) -> usize {
        let count = self.pending.len();
        self.rendered.extend(self.pending.drain(..));
        while self.rendered.len() > self.capacity {
            self.rendered.pop_front();
        }
        count
    }

    pub fn resume_point(&mut self) -> Option<String> {
        let since = truncate_to_seconds(self.cursor.last_timestamp.as_deref()?);
        self.resume_prefix = Some(second_prefix(&since).to_string());
        Some(since)
    }

    pub fn lines(&self) -> impl DoubleEndedIterator<Item = &LogLine> + ExactSizeIterator {
        self.rendered.iter()
    }

    pub fn suppressed(&self) -> usize {
        self.suppressed
    }
}
