//! # 图片生成服务适配器
//!
//! 对接 Stable Diffusion WebUI 风格的接口：
//! - `/v1/images/generations` -> `/sdapi/v1/txt2img`
//! - `/v1/images/edits` -> `/sdapi/v1/img2img`（表单中的 image/mask 转为 base64）
//!
//! 响应 `{"images":[<b64>...]}` 转为 `{"created", "data":[{"b64_json"}]}`。

use axum::http::Method;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use serde_json::{Map, Value, json};

use super::normalize::{base_headers, parse_json_response, unix_now};
use super::traits::ProviderAdapter;
use super::types::{
    Capability, ChunkStream, ProviderResult, PublicBody, PublicResponse, UpstreamBody,
    UpstreamRequest, UpstreamResponse, UpstreamStream,
};
use crate::error::AdapterError;
use crate::proxy::RouteContext;
use crate::proxy::upstream_url::join_upstream_url;
use crate::store::Endpoint;
use crate::utils::MultipartForm;

const DEFAULT_SIZE: (u64, u64) = (512, 512);
const MAX_BATCH: u64 = 10;

/// 图片生成适配器
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageAdapter;

/// 公共请求中与生成相关的字段
struct ImageParams {
    prompt: String,
    negative_prompt: Option<String>,
    n: u64,
    size: (u64, u64),
}

fn parse_size(size: Option<&str>) -> ProviderResult<(u64, u64)> {
    let Some(size) = size else {
        return Ok(DEFAULT_SIZE);
    };
    let parsed = size
        .split_once(['x', 'X'])
        .and_then(|(w, h)| Some((w.trim().parse::<u64>().ok()?, h.trim().parse::<u64>().ok()?)));
    match parsed {
        Some((w, h)) if w > 0 && h > 0 => Ok((w, h)),
        _ => Err(AdapterError::invalid_param(
            format!("invalid size '{size}', expected WIDTHxHEIGHT"),
            "size",
        )),
    }
}

fn parse_n(n: Option<u64>) -> ProviderResult<u64> {
    match n.unwrap_or(1) {
        n @ 1..=MAX_BATCH => Ok(n),
        _ => Err(AdapterError::invalid_param(
            format!("n must be between 1 and {MAX_BATCH}"),
            "n",
        )),
    }
}

impl ImageParams {
    fn from_json(body: &Value) -> ProviderResult<Self> {
        let prompt = body
            .get("prompt")
            .and_then(Value::as_str)
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| AdapterError::invalid_param("prompt is required", "prompt"))?;
        Ok(Self {
            prompt: prompt.to_string(),
            negative_prompt: body
                .get("negative_prompt")
                .and_then(Value::as_str)
                .map(str::to_string),
            n: parse_n(body.get("n").and_then(Value::as_u64))?,
            size: parse_size(body.get("size").and_then(Value::as_str))?,
        })
    }

    fn from_form(form: &MultipartForm) -> ProviderResult<Self> {
        let prompt = form
            .text("prompt")
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| AdapterError::invalid_param("prompt is required", "prompt"))?;
        let n = form
            .text("n")
            .map(|n| {
                n.trim()
                    .parse::<u64>()
                    .map_err(|_| AdapterError::invalid_param("n must be an integer", "n"))
            })
            .transpose()?;
        Ok(Self {
            prompt,
            negative_prompt: form.text("negative_prompt"),
            n: parse_n(n)?,
            size: parse_size(form.text("size").as_deref())?,
        })
    }

    fn to_payload(&self, ctx: &RouteContext) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("prompt".into(), json!(self.prompt));
        if let Some(negative) = &self.negative_prompt {
            payload.insert("negative_prompt".into(), json!(negative));
        }
        payload.insert("width".into(), json!(self.size.0));
        payload.insert("height".into(), json!(self.size.1));
        payload.insert("batch_size".into(), json!(self.n));
        payload.insert(
            "steps".into(),
            ctx.extras.get("steps").cloned().unwrap_or(json!(20)),
        );
        for key in ["cfg_scale", "sampler_name", "scheduler"] {
            if let Some(v) = ctx.extras.get(key) {
                payload.insert(key.into(), v.clone());
            }
        }
        payload.insert(
            "override_settings".into(),
            json!({"sd_model_checkpoint": ctx.upstream_model}),
        );
        payload
    }
}

fn file_b64(form: &MultipartForm, name: &str) -> Option<String> {
    form.parts
        .iter()
        .find(|p| p.name == name || p.name == format!("{name}[]"))
        .map(|p| BASE64.encode(&p.data))
}

impl ImageAdapter {
    pub const NAME: &'static str = "image";
}

impl ProviderAdapter for ImageAdapter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(
            capability,
            Capability::Endpoint(Endpoint::ImagesGenerations | Endpoint::ImagesEdits)
        )
    }

    fn build_upstream_request(
        &self,
        body: PublicBody,
        ctx: &RouteContext,
    ) -> ProviderResult<UpstreamRequest> {
        if ctx.stream {
            return Err(AdapterError::invalid_param(
                "streaming is not supported for image generation",
                "stream",
            ));
        }
        let (path, payload) = match (ctx.endpoint, &body) {
            (Endpoint::ImagesGenerations, PublicBody::Json(value)) => {
                ("/sdapi/v1/txt2img", ImageParams::from_json(value)?.to_payload(ctx))
            }
            (Endpoint::ImagesEdits, PublicBody::Multipart(form)) => {
                let mut payload = ImageParams::from_form(form)?.to_payload(ctx);
                let image = file_b64(form, "image")
                    .ok_or_else(|| AdapterError::invalid_param("image is required", "image"))?;
                payload.insert("init_images".into(), json!([image]));
                if let Some(mask) = file_b64(form, "mask") {
                    payload.insert("mask".into(), json!(mask));
                }
                ("/sdapi/v1/img2img", payload)
            }
            (Endpoint::ImagesGenerations | Endpoint::ImagesEdits, _) => {
                return Err(AdapterError::invalid_param("unexpected request body type", "body"));
            }
            (endpoint, _) => {
                return Err(AdapterError::unsupported_endpoint(Self::NAME, endpoint.path()));
            }
        };

        Ok(UpstreamRequest {
            method: Method::POST,
            url: join_upstream_url(&ctx.base_url, path)?,
            headers: base_headers(ctx, true)?,
            body: UpstreamBody::Json(Value::Object(payload)),
            stream: false,
        })
    }

    fn parse_upstream_response(
        &self,
        raw: UpstreamResponse,
        _ctx: &RouteContext,
    ) -> ProviderResult<PublicResponse> {
        let value = parse_json_response(&raw)?;
        let images = value
            .get("images")
            .and_then(Value::as_array)
            .ok_or_else(|| AdapterError::translation("image response is missing 'images'"))?;
        let data: Vec<Value> = images
            .iter()
            .filter_map(Value::as_str)
            .map(|b64| json!({"b64_json": b64}))
            .collect();
        Ok(PublicResponse::Json(json!({
            "created": unix_now(),
            "data": data,
        })))
    }

    fn stream_translate(&self, _raw: UpstreamStream, _ctx: &RouteContext) -> ChunkStream {
        futures::stream::once(async {
            Err(AdapterError::translation("image upstreams do not stream"))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::normalize::tests::ctx;
    use crate::utils::parse_form;
    use axum::http::HeaderMap;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn txt2img_payload() {
        let mut c = ctx(Endpoint::ImagesGenerations, "image", json!({"steps": 30, "sampler_name": "Euler a"}));
        c.base_url = "http://sd.internal:7860".into();
        c.upstream_model = "sdxl.safetensors".into();
        let body = PublicBody::Json(json!({"prompt": "a cat", "n": 2, "size": "768x512"}));
        let req = ImageAdapter.build_upstream_request(body, &c).unwrap();
        assert_eq!(req.url, "http://sd.internal:7860/sdapi/v1/txt2img");
        let UpstreamBody::Json(payload) = req.body else {
            panic!("expected json");
        };
        assert_eq!(payload["width"], 768);
        assert_eq!(payload["height"], 512);
        assert_eq!(payload["batch_size"], 2);
        assert_eq!(payload["steps"], 30);
        assert_eq!(payload["sampler_name"], "Euler a");
        assert_eq!(payload["override_settings"]["sd_model_checkpoint"], "sdxl.safetensors");
    }

    #[rstest]
    #[case(json!({"n": 1}), "prompt")]
    #[case(json!({"prompt": "x", "size": "big"}), "size")]
    #[case(json!({"prompt": "x", "n": 0}), "n")]
    fn invalid_params(#[case] body: Value, #[case] param: &str) {
        let c = ctx(Endpoint::ImagesGenerations, "image", Value::Null);
        let err = ImageAdapter
            .build_upstream_request(PublicBody::Json(body), &c)
            .unwrap_err();
        assert_eq!(err.param.as_deref(), Some(param));
    }

    #[test]
    fn edits_encode_init_image() {
        let c = ctx(Endpoint::ImagesEdits, "image", Value::Null);
        let raw = Bytes::from_static(
            b"--B\r\nContent-Disposition: form-data; name=\"prompt\"\r\n\r\nadd a hat\r\n\
--B\r\nContent-Disposition: form-data; name=\"image\"; filename=\"a.png\"\r\nContent-Type: image/png\r\n\r\nPNG\r\n--B--\r\n",
        );
        let form = parse_form("multipart/form-data; boundary=B", &raw).unwrap();
        let req = ImageAdapter
            .build_upstream_request(PublicBody::Multipart(form), &c)
            .unwrap();
        assert!(req.url.ends_with("/sdapi/v1/img2img"));
        let UpstreamBody::Json(payload) = req.body else {
            panic!("expected json");
        };
        assert_eq!(payload["init_images"][0], BASE64.encode(b"PNG"));
    }

    #[test]
    fn images_are_reshaped() {
        let c = ctx(Endpoint::ImagesGenerations, "image", Value::Null);
        let raw = UpstreamResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: Bytes::from(json!({"images": ["AAA", "BBB"], "info": "{}"}).to_string()),
        };
        let PublicResponse::Json(v) = ImageAdapter.parse_upstream_response(raw, &c).unwrap() else {
            panic!("expected json");
        };
        assert_eq!(v["data"], json!([{"b64_json": "AAA"}, {"b64_json": "BBB"}]));
        assert!(v["created"].is_i64());
    }

    #[test]
    fn chat_is_unsupported() {
        let c = ctx(Endpoint::ChatCompletions, "image", Value::Null);
        assert!(!ImageAdapter.supports(Capability::Endpoint(Endpoint::ChatCompletions)));
        assert!(ImageAdapter.build_upstream_request(PublicBody::Json(json!({})), &c).is_err());
    }
}
