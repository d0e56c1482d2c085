//! Server-sent event 解码器，保留 `data:` 原文，交给适配器自行解析。

use bytes::BytesMut;
use std::io;
use tokio_util::codec::Decoder;

/// 单个 SSE 事件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventStream {
    pub event: Option<String>,
    pub id: Option<String>,
    /// 多行 data 以 `\n` 连接后的原文
    pub data: String,
    pub retry: Option<u64>,
}

impl EventStream {
    /// 是否为结束哨兵 `[DONE]`
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// `tokio_util` 解码器
#[derive(Debug, Clone, Default)]
pub struct EventStreamData {
    current: EventStream,
    has_any: bool,
}

impl EventStreamData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn flush(&mut self) -> Option<EventStream> {
        if !self.has_any {
            return None;
        }
        self.has_any = false;
        Some(std::mem::take(&mut self.current))
    }

    fn process_line(&mut self, line: &str) -> Option<EventStream> {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "data" => {
                if self.has_any && !self.current.data.is_empty() {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_any = true;
            }
            "event" => {
                self.current.event = Some(value.to_string());
                self.has_any = true;
            }
            "id" => {
                self.current.id = Some(value.to_string());
                self.has_any = true;
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.current.retry = Some(ms);
                }
                self.has_any = true;
            }
            _ => {}
        }
        None
    }

    fn take_one_line(src: &mut BytesMut) -> io::Result<Option<String>> {
        let Some(pos) = src.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let mut line_bytes = src.split_to(pos + 1);
        line_bytes.truncate(line_bytes.len() - 1);
        if line_bytes.ends_with(b"\r") {
            line_bytes.truncate(line_bytes.len() - 1);
        }
        String::from_utf8(line_bytes.to_vec())
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Decoder for EventStreamData {
    type Item = EventStream;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        while let Some(line) = Self::take_one_line(src)? {
            if let Some(ev) = self.process_line(&line) {
                return Ok(Some(ev));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        if let Some(ev) = self.decode(src)? {
            return Ok(Some(ev));
        }
        if !src.is_empty() {
            let rest = String::from_utf8(src.split_to(src.len()).to_vec())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let rest = rest.trim_end_matches(['\r', '\n']);
            if let Some(ev) = self.process_line(rest) {
                return Ok(Some(ev));
            }
        }
        Ok(self.flush())
    }
}
