//! multipart/form-data 解析，用于图片编辑与音频转写端点读取 `model` 字段并改写后转发。

use bytes::Bytes;

use crate::error::{GatewayError, Result};

/// 表单中的一个字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// 解析后的表单
#[derive(Debug, Clone, Default)]
pub struct MultipartForm {
    pub parts: Vec<FormPart>,
}

impl MultipartForm {
    /// 文本字段值
    #[must_use]
    pub fn text(&self, name: &str) -> Option<String> {
        self.parts
            .iter()
            .find(|p| p.name == name && p.filename.is_none())
            .map(|p| String::from_utf8_lossy(&p.data).into_owned())
    }

    /// 设置（或追加）文本字段
    pub fn set_text(&mut self, name: &str, value: &str) {
        let data = Bytes::copy_from_slice(value.as_bytes());
        if let Some(part) = self
            .parts
            .iter_mut()
            .find(|p| p.name == name && p.filename.is_none())
        {
            part.data = data;
        } else {
            self.parts.push(FormPart {
                name: name.to_string(),
                filename: None,
                content_type: None,
                data,
            });
        }
    }

    /// 转换为 reqwest 表单
    pub fn into_reqwest_form(self) -> Result<reqwest::multipart::Form> {
        let mut form = reqwest::multipart::Form::new();
        for part in self.parts {
            let mut p = reqwest::multipart::Part::bytes(part.data.to_vec());
            if let Some(filename) = part.filename {
                p = p.file_name(filename);
            }
            if let Some(ct) = part.content_type {
                p = p.mime_str(&ct).map_err(|e| {
                    GatewayError::bad_request_param(format!("invalid part content type: {e}"), part.name.clone())
                })?;
            }
            form = form.part(part.name, p);
        }
        Ok(form)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if start > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[start..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + start)
}

/// 从 Content-Type 中取出 boundary
pub fn boundary_of(content_type: &str) -> Option<String> {
    content_type.split(';').map(str::trim).find_map(|item| {
        let (key, value) = item.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('"').to_string()
}

/// 解析 multipart 请求体
pub fn parse_form(content_type: &str, body: &Bytes) -> Result<MultipartForm> {
    let boundary = boundary_of(content_type)
        .ok_or_else(|| GatewayError::bad_request("multipart boundary is missing"))?;
    let marker = format!("--{boundary}");
    let delimiter = format!("\r\n{marker}");
    let bytes = body.as_ref();

    let mut cursor = find_subslice(bytes, marker.as_bytes(), 0)
        .ok_or_else(|| GatewayError::bad_request("multipart body missing boundary"))?
        + marker.len();

    let mut form = MultipartForm::default();
    loop {
        if bytes.get(cursor..cursor + 2) == Some(b"--") {
            break;
        }
        if bytes.get(cursor..cursor + 2) == Some(b"\r\n") {
            cursor += 2;
        }
        let headers_end = find_subslice(bytes, b"\r\n\r\n", cursor)
            .ok_or_else(|| GatewayError::bad_request("multipart part missing headers"))?;

        let mut part = FormPart {
            name: String::new(),
            filename: None,
            content_type: None,
            data: Bytes::new(),
        };
        for line in String::from_utf8_lossy(&bytes[cursor..headers_end]).lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("content-disposition") {
                for item in value.split(';').map(str::trim) {
                    if let Some(v) = item.strip_prefix("name=") {
                        part.name = unquote(v);
                    } else if let Some(v) = item.strip_prefix("filename=") {
                        part.filename = Some(unquote(v));
                    }
                }
            } else if key.trim().eq_ignore_ascii_case("content-type") {
                part.content_type = Some(value.trim().to_string());
            }
        }
        if part.name.is_empty() {
            return Err(GatewayError::bad_request("multipart part missing name"));
        }

        let data_start = headers_end + 4;
        let data_end = find_subslice(bytes, delimiter.as_bytes(), data_start)
            .ok_or_else(|| GatewayError::bad_request("multipart part missing trailing boundary"))?;
        part.data = body.slice(data_start..data_end);
        form.parts.push(part);
        cursor = data_end + delimiter.len();
    }
    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Bytes {
        Bytes::from_static(
            b"--XyZ\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nwhisper-virtual\r\n\
--XyZ\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.wav\"\r\nContent-Type: audio/wav\r\n\r\nRIFF\r\n--XyZ--\r\n",
        )
    }

    #[test]
    fn parses_text_and_file_parts() {
        let form = parse_form("multipart/form-data; boundary=XyZ", &sample()).unwrap();
        assert_eq!(form.parts.len(), 2);
        assert_eq!(form.text("model").as_deref(), Some("whisper-virtual"));
        assert_eq!(form.parts[1].filename.as_deref(), Some("a.wav"));
        assert_eq!(form.parts[1].data.as_ref(), b"RIFF");
    }

    #[test]
    fn set_text_replaces_model() {
        let mut form = parse_form("multipart/form-data; boundary=\"XyZ\"", &sample()).unwrap();
        form.set_text("model", "whisper-1");
        assert_eq!(form.text("model").as_deref(), Some("whisper-1"));
        assert_eq!(form.parts.len(), 2);
    }

    #[test]
    fn missing_boundary_is_bad_request() {
        let err = parse_form("multipart/form-data", &sample()).unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest { .. }));
    }
}
