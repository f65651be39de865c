//! Newline framing over arbitrary byte chunks.

/// Accumulates raw output and yields complete lines.
///
/// Bytes are only decoded once a full line is available, so a multi-byte
/// character split across two reads decodes the same as if it had arrived
/// whole. The trailing partial line is held until the next `push` or
/// `finish`.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let mut complete = std::mem::replace(&mut self.pending, rest);
        complete.pop();

        complete.split(|&b| b == b'\n').map(decode).collect()
    }

    /// Flush an unterminated final line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(decode(&line))
    }

    /// Bytes currently waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn decode(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(chunks: &[&[u8]]) -> Vec<String> {
        let mut buffer = LineBuffer::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            lines.extend(buffer.push(chunk));
        }
        lines.extend(buffer.finish());
        lines
    }

    #[test]
    fn holds_partial_line_until_newline() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"{\"type\":").is_empty());
        assert_eq!(buffer.pending_len(), 8);
        assert_eq!(buffer.push(b"\"system\"}\n{\"a\""), vec!["{\"type\":\"system\"}"]);
        assert_eq!(buffer.finish().as_deref(), Some("{\"a\""));
    }

    #[test]
    fn every_split_point_yields_the_same_lines() {
        let stream = "first line\nsécond ✓ line\r\n\nlast".as_bytes();
        let whole = feed(&[stream]);
        assert_eq!(whole, vec!["first line", "sécond ✓ line", "", "last"]);

        for split in 0..=stream.len() {
            let (a, b) = stream.split_at(split);
            assert_eq!(feed(&[a, b]), whole, "split at {split}");
        }

        let bytewise: Vec<&[u8]> = stream.chunks(1).collect();
        assert_eq!(feed(&bytewise), whole);
    }

    #[test]
    fn finish_on_clean_boundary_is_empty() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push(b"a\nb\n"), vec!["a", "b"]);
        assert!(buffer.finish().is_none());
    }
}
