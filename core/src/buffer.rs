//! Buffer management for send and receive queues
//!
//! Bounded buffers for outgoing (sendq) and incoming (recvq) data on a
//! connection. Limits keep a slow or hostile peer from exhausting
//! memory.

use crate::message::MAX_LINE_LENGTH;
use std::collections::VecDeque;

/// Send queue - outgoing byte chunks with a size limit
#[derive(Debug)]
pub struct SendQueue {
    buffer: VecDeque<Vec<u8>>,
    current_size: usize,
    max_size: usize,
    dropped: u64,
}

impl SendQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            current_size: 0,
            max_size,
            dropped: 0,
        }
    }

    /// Queue a chunk. Returns false if the limit would be exceeded,
    /// in which case the chunk is dropped.
    pub fn push(&mut self, chunk: Vec<u8>) -> bool {
        if self.current_size + chunk.len() > self.max_size {
            self.dropped += 1;
            tracing::warn!(
                queued = self.current_size,
                max = self.max_size,
                "sendq full, dropping message"
            );
            return false;
        }
        self.current_size += chunk.len();
        self.buffer.push_back(chunk);
        true
    }

    /// Take the next chunk
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let chunk = self.buffer.pop_front()?;
        self.current_size = self.current_size.saturating_sub(chunk.len());
        Some(chunk)
    }

    /// Put back the unwritten tail of a chunk after a partial write
    pub fn push_front(&mut self, chunk: Vec<u8>) {
        self.current_size += chunk.len();
        self.buffer.push_front(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.current_size = 0;
    }
}

/// Receive queue - accumulates raw bytes and yields complete lines
#[derive(Debug)]
pub struct RecvQueue {
    buffer: Vec<u8>,
    max_size: usize,
}

impl RecvQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_size,
        }
    }

    /// Append raw input. Returns false when the unparsed backlog
    /// exceeds the limit; the connection should be dropped.
    pub fn push(&mut self, data: &[u8]) -> bool {
        if self.buffer.len() + data.len() > self.max_size {
            return false;
        }
        self.buffer.extend_from_slice(data);
        true
    }

    /// Extract every complete line, split on `\r\n` or bare `\n`.
    /// Empty lines are discarded; over-long lines are truncated to the
    /// 512-byte message cap (terminator included).
    pub fn extract_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let mut end = start + offset;
            if end > start && self.buffer[end - 1] == b'\r' {
                end -= 1;
            }
            let mut line = &self.buffer[start..end];
            if line.len() > MAX_LINE_LENGTH - 2 {
                line = &line[..MAX_LINE_LENGTH - 2];
            }
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(line).into_owned());
            }
            start += offset + 1;
        }
        self.buffer.drain(..start);
        lines
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sendq_enforces_limit() {
        let mut queue = SendQueue::new(10);
        assert!(queue.push(b"123456".to_vec()));
        assert!(!queue.push(b"78901".to_vec()));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().unwrap(), b"123456");
        assert!(queue.is_empty());
    }

    #[test]
    fn recvq_splits_on_both_terminators() {
        let mut queue = RecvQueue::new(1024);
        assert!(queue.push(b"NICK alice\r\nUSER a 0 * :A\nPING x"));
        let lines = queue.extract_lines();
        assert_eq!(lines, vec!["NICK alice", "USER a 0 * :A"]);
        // The partial line stays buffered.
        assert_eq!(queue.len(), "PING x".len());
        assert!(queue.push(b"\r\n"));
        assert_eq!(queue.extract_lines(), vec!["PING x"]);
    }

    #[test]
    fn recvq_discards_empty_lines() {
        let mut queue = RecvQueue::new(1024);
        assert!(queue.push(b"\r\n\nPING a\r\n"));
        assert_eq!(queue.extract_lines(), vec!["PING a"]);
    }

    #[test]
    fn recvq_truncates_over_long_lines() {
        let mut queue = RecvQueue::new(4096);
        let long = "x".repeat(600);
        assert!(queue.push(format!("PING {}\r\n", long).as_bytes()));
        let lines = queue.extract_lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_LINE_LENGTH - 2);
    }

    #[test]
    fn recvq_overflow_reports_false() {
        let mut queue = RecvQueue::new(8);
        assert!(queue.push(b"12345"));
        assert!(!queue.push(b"67890"));
    }
}
