//! SSE 帧解码
//!
//! 每个逻辑事件是一行 `data: <json>`，行可能被拆到两次数据块中。
//! 以字节缓冲，凑满整行才解析，避免 UTF-8 字符被截断。

use crate::protocol::{StreamEvent, WireEvent};

/// 事件行前缀
pub const DATA_PREFIX: &str = "data:";

/// 单行上限，超出的行整行丢弃
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// 增量解码器
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// buffer 中已确认不含换行的前缀长度
    scanned: usize,
    max_line: usize,
    /// 正在丢弃一条超长行的剩余部分
    discarding: bool,
    skipped: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定单行上限
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line,
            discarding: false,
            skipped: 0,
        }
    }

    /// 输入一个数据块，返回其中所有完整行解析出的事件（按到达顺序）
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut consumed = 0;
        let mut from = self.scanned;
        while let Some(offset) = buffer[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            if self.discarding {
                // 超长行的尾部
                self.discarding = false;
            } else if let Some(event) = self.decode_line(&buffer[consumed..end]) {
                events.push(event);
            }
            consumed = end + 1;
            from = consumed;
        }

        buffer.drain(..consumed);
        if !self.discarding && buffer.len() > self.max_line {
            self.skip(&format!("行超过上限 {} 字节", self.max_line));
            self.discarding = true;
        }
        if self.discarding {
            buffer.clear();
        }
        self.scanned = buffer.len();
        self.buffer = buffer;
        events
    }

    /// 连接结束时处理末尾没有换行的残留行
    pub fn finish(&mut self) -> Option<StreamEvent> {
        self.scanned = 0;
        let line = std::mem::take(&mut self.buffer);
        if std::mem::take(&mut self.discarding) || line.is_empty() {
            return None;
        }
        self.decode_line(&line)
    }

    /// 被跳过的格式错误行数
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<StreamEvent> {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim_end_matches('\r'),
            Err(e) => {
                self.skip(&format!("非 UTF-8 数据: {}", e));
                return None;
            }
        };

        // 空行是帧分隔符，冒号开头是注释/心跳
        if line.trim().is_empty() || line.starts_with(':') {
            return None;
        }

        // event:/id:/retry: 等字段不携带数据
        let payload = line.strip_prefix(DATA_PREFIX)?;
        let payload = payload.strip_prefix(' ').unwrap_or(payload);

        match serde_json::from_str::<WireEvent>(payload) {
            Ok(wire) => {
                let event_type = wire.event_type.clone();
                match wire.into_event() {
                    Some(event) => Some(event),
                    None => {
                        self.skip(&format!("未知或不完整的事件: type={}", event_type));
                        None
                    }
                }
            }
            Err(e) => {
                self.skip(&format!("JSON 解析失败: {}", e));
                None
            }
        }
    }

    fn skip(&mut self, reason: &str) {
        self.skipped += 1;
        tracing::warn!("跳过 SSE 行: {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DonePayload;

    #[test]
    fn test_single_chunk_multiple_events() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(
            b"data: {\"type\":\"token\",\"data\":\"Hel\"}\n\ndata: {\"type\":\"token\",\"data\":\"lo\"}\n\n",
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::Token("Hel".into()),
                StreamEvent::Token("lo".into())
            ]
        );
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"tok").is_empty());
        assert!(decoder.push(b"en\",\"data\":\"Hi\"").is_empty());
        assert_eq!(decoder.push(b"}\n\n"), vec![StreamEvent::Token("Hi".into())]);
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let line = "data: {\"type\":\"token\",\"data\":\"💪\"}\n".as_bytes();
        let split = line.iter().position(|b| *b >= 0x80).unwrap() + 1;

        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&line[..split]).is_empty());
        assert_eq!(decoder.push(&line[split..]), vec![StreamEvent::Token("💪".into())]);
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(
            b"data: {not json}\n\ndata: {\"type\":\"token\",\"data\":\"ok\"}\n\n",
        );
        assert_eq!(events, vec![StreamEvent::Token("ok".into())]);
        assert_eq!(decoder.skipped(), 1);
    }

    #[test]
    fn test_crlf_and_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(
            b": keep-alive\r\nevent: message\r\ndata:{\"type\":\"done\",\"data\":{\"status\":\"complete\"}}\r\n\r\n",
        );
        assert_eq!(events, vec![StreamEvent::Done(DonePayload::default())]);
        assert_eq!(decoder.skipped(), 0);
    }

    #[test]
    fn test_oversized_line_is_skipped() {
        let mut decoder = SseDecoder::with_max_line(64);
        let filler = vec![b'x'; 40];

        assert!(decoder.push(b"data: {\"type\":\"token\",\"data\":\"").is_empty());
        assert!(decoder.push(&filler).is_empty());
        assert_eq!(decoder.skipped(), 1);
        // 超长行剩余部分继续丢弃，直到换行
        assert!(decoder.push(&filler).is_empty());
        assert!(decoder.buffer.is_empty());

        let events = decoder.push(b"\"}\ndata: {\"type\":\"token\",\"data\":\"ok\"}\n");
        assert_eq!(events, vec![StreamEvent::Token("ok".into())]);
        assert_eq!(decoder.skipped(), 1);
    }

    #[test]
    fn test_many_small_chunks_of_one_line() {
        let line = b"data: {\"type\":\"token\",\"data\":\"slow\"}\n";
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for byte in line.iter() {
            events.extend(decoder.push(std::slice::from_ref(byte)));
        }
        assert_eq!(events, vec![StreamEvent::Token("slow".into())]);
        assert_eq!(decoder.scanned, 0);
    }

    #[test]
    fn test_finish_flushes_trailing_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"error\",\"data\":\"boom\"}").is_empty());
        assert_eq!(
            decoder.finish(),
            Some(StreamEvent::Error {
                message: "boom".into()
            })
        );
        assert_eq!(decoder.finish(), None);
    }
}
