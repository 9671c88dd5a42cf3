use std::{convert::Infallible, pin::Pin, time::Duration};

use anyhow::{anyhow, Result};
use async_stream::{stream, try_stream};
use futures_util::Stream;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::{DispatchTarget, Message};

/** \brief 演示流的固定分片。 */
pub const MOCK_CHUNKS: [&str; 8] = ["你好", "，", "这是", "一个", "演示", "流式", "输出", "。"];

/**
 * \brief 聊天请求体（不含模型，模型由分发解析给出）。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/** \brief 上游 chat/completions 请求体，未给出的采样参数不写入。 */
#[derive(Serialize)]
struct UpstreamChatBody<'a> {
    model: &'a str,
    #[serde(flatten)]
    request: &'a ChatRequest,
    stream: bool,
}

/**
 * \brief 调用 `GET {base}/models` 列出上游模型 ID。
 */
pub async fn list_models(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
) -> Result<Vec<String>> {
    let url = format!("{}/models", base_url.trim_end_matches('/'));
    let resp = client
        .get(url)
        .header(AUTHORIZATION, format!("Bearer {}", api_key))
        .send()
        .await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("list models failed: {} -> {}", status, text));
    }
    parse_model_list(resp.json().await?)
}

/**
 * \brief 向上游发起流式 chat/completions，成功时返回原始响应供逐字节转发。
 */
pub async fn open_chat_stream(
    client: &reqwest::Client,
    target: &DispatchTarget,
    request: &ChatRequest,
) -> Result<reqwest::Response> {
    let url = format!("{}/chat/completions", target.base_url.trim_end_matches('/'));
    let body = UpstreamChatBody {
        model: &target.upstream_model_id,
        request,
        stream: true,
    };

    let resp = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", target.api_key))
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("request failed: {} -> {}", status, text));
    }
    Ok(resp)
}

/**
 * \brief 流式对话并解析 SSE 增量，返回文本片段流。
 */
pub async fn stream_chat_deltas(
    client: &reqwest::Client,
    target: &DispatchTarget,
    request: &ChatRequest,
) -> Result<Pin<Box<dyn Stream<Item = Result<String>> + Send>>> {
    let resp = open_chat_stream(client, target, request).await?;
    let mut stream = resp.bytes_stream();
    let mut buf = Vec::<u8>::new();

    let out = try_stream! {
        use futures_util::StreamExt;
        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buf.extend_from_slice(&chunk);
            while let Some(pos) = find_double_newline(&buf) {
                let block = buf.drain(..pos + 2).collect::<Vec<u8>>();
                if let Some(line) = extract_data_line(&block) {
                    if line.trim() == "[DONE]" {
                        break 'outer;
                    }
                    if let Some(delta) = parse_delta(&line) {
                        yield delta;
                    }
                }
            }
        }
        if !buf.is_empty() {
            if let Some(line) = extract_data_line(&buf) {
                if line.trim() != "[DONE]" {
                    if let Some(delta) = parse_delta(&line) {
                        yield delta;
                    }
                }
            }
        }
    };

    Ok(Box::pin(out))
}

/**
 * \brief 演示用 SSE 流：逐片输出 `data: {"content": ...}`，最后输出 `[DONE]`。
 */
pub fn mock_sse_stream(delay: Duration) -> impl Stream<Item = Result<String, Infallible>> + Send {
    stream! {
        for part in MOCK_CHUNKS {
            let payload = json!({ "content": part });
            yield Ok(format!("data: {}\n\n", payload));
            tokio::time::sleep(delay).await;
        }
        yield Ok("data: [DONE]\n\n".to_string());
    }
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn extract_data_line(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    for line in text.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix("data:") {
            return Some(rest.trim().to_string());
        }
    }
    None
}

/**
 * \brief 解析单条 SSE data：兼容 OpenAI delta 与演示流的 `content` 字段。
 */
fn parse_delta(line: &str) -> Option<String> {
    let v: Value = serde_json::from_str(line).ok()?;
    if let Some(content) = v
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
    {
        return Some(content.to_string());
    }
    v.get("content")
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
}

/**
 * \brief 解析模型列表：`{ data: [{ id }] }`，亦容忍裸数组。
 */
fn parse_model_list(v: Value) -> Result<Vec<String>> {
    if let Some(arr) = v.get("data").and_then(|x| x.as_array()) {
        Ok(arr
            .iter()
            .filter_map(|item| item.get("id").and_then(|s| s.as_str()))
            .map(|s| s.to_string())
            .collect())
    } else if let Some(arr) = v.as_array() {
        Ok(arr
            .iter()
            .filter_map(|item| {
                item.get("id")
                    .and_then(|s| s.as_str())
                    .or_else(|| item.as_str())
            })
            .map(|s| s.to_string())
            .collect())
    } else {
        Err(anyhow!("unexpected models payload: {}", v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;

    fn target(base: String) -> DispatchTarget {
        DispatchTarget {
            provider_slug: "openai".into(),
            base_url: base,
            api_key: "sk-test".into(),
            upstream_model_id: "gpt-4o".into(),
        }
    }

    #[test]
    fn test_parse_model_list_shapes() {
        let ids = parse_model_list(json!({"data": [{"id": "a"}, {"id": "b"}, {"x": 1}]}))
            .expect("data shape");
        assert_eq!(ids, vec!["a", "b"]);
        let ids = parse_model_list(json!(["c", {"id": "d"}])).expect("array shape");
        assert_eq!(ids, vec!["c", "d"]);
        assert!(parse_model_list(json!({"models": []})).is_err());
    }

    #[test]
    fn test_parse_delta_variants() {
        assert_eq!(
            parse_delta(r#"{"choices":[{"delta":{"content":"hi"}}]}"#).as_deref(),
            Some("hi")
        );
        assert_eq!(parse_delta(r#"{"content":"演示"}"#).as_deref(), Some("演示"));
        assert_eq!(parse_delta(r#"{"choices":[{"delta":{}}]}"#), None);
        assert_eq!(parse_delta("not json"), None);
    }

    #[tokio::test]
    async fn test_list_models_sends_bearer() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/v1/models")
                .header("authorization", "Bearer sk-test");
            then.status(200)
                .json_body(json!({"data": [{"id": "gpt-4o"}, {"id": "gpt-4o-mini"}]}));
        });

        let client = reqwest::Client::new();
        let base = format!("{}/v1/", server.base_url());
        let ids = list_models(&client, &base, "sk-test")
            .await
            .expect("list models");
        mock.assert();
        assert_eq!(ids, vec!["gpt-4o", "gpt-4o-mini"]);
    }

    #[tokio::test]
    async fn test_list_models_non_success_is_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/models");
            then.status(401).body("unauthorized");
        });
        let client = reqwest::Client::new();
        assert!(list_models(&client, &server.base_url(), "bad").await.is_err());
    }

    #[tokio::test]
    async fn test_stream_chat_deltas_parses_sse() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .header("authorization", "Bearer sk-test")
                .body_contains("\"model\":\"gpt-4o\"")
                .body_contains("\"stream\":true");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(concat!(
                    "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
                    "data: [DONE]\n\n"
                ));
        });

        let client = reqwest::Client::new();
        let request = ChatRequest {
            messages: vec![Message {
                role: "user".into(),
                content: "hi".into(),
            }],
            temperature: Some(0.2),
            max_tokens: None,
        };
        let mut stream = stream_chat_deltas(&client, &target(server.base_url()), &request)
            .await
            .expect("open stream");
        let mut out = String::new();
        while let Some(delta) = stream.next().await {
            out.push_str(&delta.expect("delta"));
        }
        mock.assert();
        assert_eq!(out, "Hello");
    }

    #[tokio::test]
    async fn test_unset_sampling_params_are_omitted() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/chat/completions").json_body(json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            }));
            then.status(200)
                .header("content-type", "text/event-stream")
                .body("data: [DONE]\n\n");
        });
        let client = reqwest::Client::new();
        let request = ChatRequest {
            messages: vec![Message {
                role: "user".into(),
                content: "hi".into(),
            }],
            ..Default::default()
        };
        open_chat_stream(&client, &target(server.base_url()), &request)
            .await
            .expect("open stream");
        mock.assert();
    }

    #[tokio::test]
    async fn test_open_chat_stream_rejects_upstream_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(500);
        });
        let client = reqwest::Client::new();
        let res = open_chat_stream(&client, &target(server.base_url()), &ChatRequest::default())
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_mock_stream_ends_with_done() {
        let frames: Vec<String> = mock_sse_stream(Duration::from_millis(0))
            .map(|r| match r {
                Ok(s) => s,
                Err(never) => match never {},
            })
            .collect()
            .await;
        assert_eq!(frames.len(), MOCK_CHUNKS.len() + 1);
        assert_eq!(frames[0], "data: {\"content\":\"你好\"}\n\n");
        assert_eq!(frames.last().map(String::as_str), Some("data: [DONE]\n\n"));
    }
}
