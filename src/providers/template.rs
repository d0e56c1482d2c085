//! # 模板替换
//!
//! 自定义 HTTP 适配器使用的受限表达式：`{{path.to.field}}` 按点号/下标路径取值，
//! 可追加 `|filter[:arg]`，过滤器只允许 default、json、first、last、length、join。
//! 不支持任何其他语法。
//!
//! - 整个字符串只有一个表达式时保留 JSON 类型（数组、数字等）
//! - 与其他文本混排时替换为字符串形式
//! - 响应映射反向使用：`目标路径 -> $.源路径`，写入 OpenAI 形状的骨架响应

use serde_json::{Map, Value};

use super::types::ProviderResult;
use crate::error::AdapterError;

/// 路径的一段
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> ProviderResult<Vec<Segment>> {
    let path = path.trim();
    let path = path.strip_prefix('$').unwrap_or(path);
    let path = path.strip_prefix('.').unwrap_or(path);
    let mut segments = Vec::new();
    if path.is_empty() {
        return Ok(segments);
    }
    for part in path.split('.') {
        let (key, mut rest) = part.find('[').map_or((part, ""), |i| (&part[..i], &part[i..]));
        if !key.is_empty() {
            segments.push(Segment::Key(key.to_string()));
        }
        while let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped
                .find(']')
                .ok_or_else(|| AdapterError::configuration(format!("unclosed '[' in path '{path}'")))?;
            let inner = stripped[..end].trim();
            let inner = inner.trim_matches(|c| c == '"' || c == '\'');
            match inner.parse::<usize>() {
                Ok(index) => segments.push(Segment::Index(index)),
                Err(_) => segments.push(Segment::Key(inner.to_string())),
            }
            rest = &stripped[end + 1..];
        }
        if !rest.is_empty() {
            return Err(AdapterError::configuration(format!("invalid path '{path}'")));
        }
    }
    if segments.iter().any(|s| matches!(s, Segment::Key(k) if k.is_empty())) {
        return Err(AdapterError::configuration(format!("empty segment in path '{path}'")));
    }
    Ok(segments)
}

/// 按路径取值，缺失返回 None
pub fn lookup<'a>(root: &'a Value, path: &str) -> ProviderResult<Option<&'a Value>> {
    let mut current = root;
    for segment in parse_path(path)? {
        let next = match (&segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key),
            (Segment::Index(index), Value::Array(items)) => items.get(*index),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// 按路径写入，中间节点按需创建
pub fn set_path(root: &mut Value, path: &str, value: Value) -> ProviderResult<()> {
    let segments = parse_path(path)?;
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return Ok(());
    };
    let mut current = root;
    for (i, segment) in parents.iter().enumerate() {
        let next_is_index = matches!(segments[i + 1], Segment::Index(_));
        current = child_mut(current, segment, next_is_index)?;
    }
    match last {
        Segment::Key(key) => {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            if let Value::Object(map) = current {
                map.insert(key.clone(), value);
            }
        }
        Segment::Index(index) => {
            let slot = index_slot(current, *index)?;
            *slot = value;
        }
    }
    Ok(())
}

fn child_mut<'a>(
    current: &'a mut Value,
    segment: &Segment,
    next_is_index: bool,
) -> ProviderResult<&'a mut Value> {
    let empty = || {
        if next_is_index {
            Value::Array(Vec::new())
        } else {
            Value::Object(Map::new())
        }
    };
    match segment {
        Segment::Key(key) => {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            match current {
                Value::Object(map) => Ok(map.entry(key.clone()).or_insert_with(empty)),
                _ => Err(AdapterError::configuration("path target is not an object")),
            }
        }
        Segment::Index(index) => {
            let slot = index_slot(current, *index)?;
            if slot.is_null() {
                *slot = empty();
            }
            Ok(slot)
        }
    }
}

/// 数组下标位置，数组不够长时用 null 填充
fn index_slot(current: &mut Value, index: usize) -> ProviderResult<&mut Value> {
    const MAX_INDEX: usize = 1024;
    if index > MAX_INDEX {
        return Err(AdapterError::configuration("path index too large"));
    }
    if !current.is_array() {
        *current = Value::Array(Vec::new());
    }
    let Value::Array(items) = current else {
        return Err(AdapterError::configuration("path target is not an array"));
    };
    if items.len() <= index {
        items.resize(index + 1, Value::Null);
    }
    Ok(&mut items[index])
}

fn filter_arg(arg: Option<&str>) -> Value {
    let Some(arg) = arg.map(str::trim) else {
        return Value::Null;
    };
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.trim_matches('\'').to_string()))
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn apply_filter(value: Value, name: &str, arg: Option<&str>) -> ProviderResult<Value> {
    match name {
        "default" => Ok(match value {
            Value::Null => filter_arg(arg),
            Value::String(ref s) if s.is_empty() => filter_arg(arg),
            other => other,
        }),
        "json" => serde_json::to_string(&value)
            .map(Value::String)
            .map_err(|e| AdapterError::configuration(format!("json filter failed: {e}"))),
        "first" => Ok(match value {
            Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
            Value::String(s) => s.chars().next().map_or(Value::Null, |c| Value::String(c.to_string())),
            _ => Value::Null,
        }),
        "last" => Ok(match value {
            Value::Array(items) => items.into_iter().last().unwrap_or(Value::Null),
            Value::String(s) => s.chars().last().map_or(Value::Null, |c| Value::String(c.to_string())),
            _ => Value::Null,
        }),
        "length" => Ok(Value::from(match &value {
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            Value::String(s) => s.chars().count(),
            _ => 0,
        })),
        "join" => {
            let sep = match filter_arg(arg) {
                Value::Null => ",".to_string(),
                other => as_text(&other),
            };
            Ok(match value {
                Value::Array(items) => {
                    Value::String(items.iter().map(as_text).collect::<Vec<_>>().join(&sep))
                }
                other => other,
            })
        }
        other => Err(AdapterError::configuration(format!(
            "unknown template filter '{other}'"
        ))),
    }
}

/// 按 `|` 切分，引号内的 `|` 不切
fn split_pipes(expr: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in expr.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '|') => {
                parts.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&expr[start..]);
    parts
}

/// 求值单个表达式（`{{` `}}` 之间的内容）
pub fn evaluate(expr: &str, scope: &Value) -> ProviderResult<Value> {
    let parts = split_pipes(expr);
    let mut parts = parts.into_iter();
    let path = parts.next().unwrap_or_default().trim();
    if path.is_empty() {
        return Err(AdapterError::configuration("empty template expression"));
    }
    let mut value = lookup(scope, path)?.cloned().unwrap_or(Value::Null);
    for filter in parts {
        let (name, arg) = filter
            .split_once(':')
            .map_or((filter.trim(), None), |(n, a)| (n.trim(), Some(a)));
        value = apply_filter(value, name, arg)?;
    }
    Ok(value)
}

/// 渲染模板字符串
pub fn render_str(template: &str, scope: &Value) -> ProviderResult<Value> {
    let trimmed = template.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .filter(|inner| !inner.contains("{{") && !inner.contains("}}"))
    {
        return evaluate(inner, scope);
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| AdapterError::configuration("unclosed '{{' in template"))?;
        out.push_str(&as_text(&evaluate(&after[..end], scope)?));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// 递归渲染 JSON 模板，对象键不参与替换
pub fn render_value(template: &Value, scope: &Value) -> ProviderResult<Value> {
    match template {
        Value::String(s) if s.contains("{{") => render_str(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, scope))
            .collect::<ProviderResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), render_value(value, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// 响应映射：把上游响应中 `$.源路径` 的值写到骨架的目标路径；源缺失时保留骨架原值
pub fn apply_mapping(
    skeleton: Value,
    mapping: &Map<String, Value>,
    source: &Value,
) -> ProviderResult<Value> {
    let mut out = skeleton;
    for (target, spec) in mapping {
        let Some(spec) = spec.as_str() else {
            return Err(AdapterError::configuration(format!(
                "response mapping for '{target}' must be a string"
            )));
        };
        let value = if spec.trim_start().starts_with('$') {
            lookup(source, spec)?.cloned()
        } else {
            // 非 `$` 开头按模板处理，可使用过滤器
            Some(render_str(spec, source)?).filter(|v| !v.is_null())
        };
        if let Some(value) = value {
            set_path(&mut out, target, value)?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "model": "virtual",
            "messages": [
                {"role": "system", "content": "be nice"},
                {"role": "user", "content": "hello"}
            ],
            "stop": ["a", "b"],
            "temperature": 0.5,
            "ctx": {"model": "upstream-7b", "request_id": "req-1"}
        })
    }

    #[rstest]
    #[case("{{ctx.model}}", json!("upstream-7b"))]
    #[case("{{messages[1].content}}", json!("hello"))]
    #[case("{{messages|last}}", json!({"role": "user", "content": "hello"}))]
    #[case("{{messages|first}}", json!({"role": "system", "content": "be nice"}))]
    #[case("{{messages|length}}", json!(2))]
    #[case("{{stop|join:\"|\"}}", json!("a|b"))]
    #[case("{{stop|join}}", json!("a,b"))]
    #[case("{{temperature}}", json!(0.5))]
    #[case("{{max_tokens|default:256}}", json!(256))]
    #[case("{{missing|default:none}}", json!("none"))]
    #[case("{{stop|json}}", json!("[\"a\",\"b\"]"))]
    #[case("{{messages|last|json|length}}", json!(33))]
    fn whole_expression_keeps_type(#[case] template: &str, #[case] expected: Value) {
        assert_eq!(render_str(template, &scope()).unwrap(), expected);
    }

    #[test]
    fn mixed_text_interpolates_as_string() {
        let out = render_str("model={{ctx.model}} t={{temperature}} x={{nope}}", &scope()).unwrap();
        assert_eq!(out, json!("model=upstream-7b t=0.5 x="));
    }

    #[test]
    fn unknown_filter_is_rejected() {
        let err = render_str("{{model|exec:rm}}", &scope()).unwrap_err();
        assert!(err.message.contains("unknown template filter"));
    }

    #[test]
    fn unclosed_expression_is_rejected() {
        assert!(render_str("hi {{model", &scope()).is_err());
    }

    #[test]
    fn nested_templates_render_recursively() {
        let template = json!({
            "prompt": "{{messages|last}}",
            "params": {"temp": "{{temperature}}", "fixed": 3},
            "stops": ["{{stop[0]}}", "literal"]
        });
        let out = render_value(&template, &scope()).unwrap();
        assert_eq!(
            out,
            json!({
                "prompt": {"role": "user", "content": "hello"},
                "params": {"temp": 0.5, "fixed": 3},
                "stops": ["a", "literal"]
            })
        );
    }

    #[test]
    fn mapping_writes_into_skeleton() {
        let skeleton = json!({
            "object": "chat.completion",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": ""}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0}
        });
        let mapping = json!({
            "choices[0].message.content": "$.output.text",
            "usage.total_tokens": "$.meta.tokens",
            "choices[0].finish_reason": "$.missing"
        });
        let source = json!({"output": {"text": "hi there"}, "meta": {"tokens": 12}});
        let out = apply_mapping(skeleton, mapping.as_object().unwrap(), &source).unwrap();
        assert_eq!(out["choices"][0]["message"]["content"], "hi there");
        assert_eq!(out["usage"]["total_tokens"], 12);
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn set_path_creates_arrays_and_objects() {
        let mut root = Value::Null;
        set_path(&mut root, "data[1].embedding", json!([0.1])).unwrap();
        assert_eq!(root, json!({"data": [null, {"embedding": [0.1]}]}));
    }
}
