use serde_json::{json, Value};

/// Chat-provider block stored in settings under `chat.provider`.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
}

impl ChatConfig {
    pub fn from_settings(v: &Value) -> Option<Self> {
        let base_url = v.get("baseUrl")?.as_str()?.trim_end_matches('/').to_string();
        let api_key = v.get("apiKey")?.as_str()?.to_string();
        let model = v.get("model")?.as_str()?.to_string();
        if base_url.is_empty() || model.is_empty() {
            return None;
        }
        let system_prompt = v
            .get("systemPrompt")
            .and_then(|p| p.as_str())
            .unwrap_or("You are a helpful assistant for a school student-records system.")
            .to_string();
        Some(ChatConfig {
            base_url,
            api_key,
            model,
            system_prompt,
        })
    }
}

/// One best-effort chat-completion round trip. No streaming, no retry; a
/// provider failure is returned as-is for the handler to surface.
pub fn chat(
    cfg: &ChatConfig,
    context: Option<&str>,
    history: &[(String, String)],
    message: &str,
) -> anyhow::Result<String> {
    let mut system = cfg.system_prompt.clone();
    if let Some(ctx) = context {
        system.push_str("\n\n");
        system.push_str(ctx);
    }

    let mut messages = vec![json!({ "role": "system", "content": system })];
    for (role, content) in history {
        messages.push(json!({ "role": role, "content": content }));
    }
    messages.push(json!({ "role": "user", "content": message }));

    let body = json!({
        "model": cfg.model,
        "messages": messages,
    });

    let client = reqwest::blocking::Client::new();
    let response = client
        .post(format!("{}/chat/completions", cfg.base_url))
        .bearer_auth(&cfg.api_key)
        .json(&body)
        .send()?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().unwrap_or_else(|_| "(no body)".to_string());
        anyhow::bail!("chat provider returned {}: {}", status, text);
    }

    let parsed: Value = response.json()?;
    let reply = parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
        .ok_or_else(|| anyhow::anyhow!("chat provider response had no message content"))?;
    Ok(reply.to_string())
}
