//! Text-analysis service client.
//!
//! ```text
//!  code ─► detect_language ─► prompt ─► POST chat/completions ─► strip fences
//!                                                                   │
//!                           fallback_analysis ◄── unparseable ──────┤
//!                                                                   ▼
//!                                                           AnalysisReport
//! ```
//!
//! Analysis never fails when the service is down or unconfigured: a
//! rule-based report is produced instead. Optimization has no fallback and
//! reports an [`AnalysisError`].

use std::path::Path;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AnalysisConfig;

/// Analysis and optimization failures. Sent to the requesting connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("No code provided")]
    EmptyCode,
    #[error("AI service not configured")]
    NotConfigured,
    #[error("AI service failed: {0}")]
    Service(String),
    #[error("Failed to parse optimization")]
    Parse,
}

/// A single finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    #[serde(rename = "type", default = "default_severity")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub line: usize,
    #[serde(default = "default_severity")]
    pub severity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

fn default_severity() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSummary {
    pub lines: usize,
    pub functions: usize,
    pub classes: usize,
    pub complexity_score: u32,
}

impl Default for AnalysisSummary {
    fn default() -> Self {
        Self {
            lines: 0,
            functions: 0,
            classes: 0,
            complexity_score: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisReport {
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
    #[serde(default)]
    pub analysis: AnalysisSummary,
    #[serde(default)]
    pub language: String,
    /// Model name, `"fallback"` for rule-based reports, `None` for empty input
    #[serde(default)]
    pub llm_used: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub description: String,
    #[serde(default)]
    pub impact: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub optimized_code: String,
    #[serde(default)]
    pub changes: Vec<Change>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub llm_used: Option<String>,
}

/// Code analysis collaborator.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, code: &str, filename: Option<&str>)
        -> Result<AnalysisReport, AnalysisError>;

    async fn optimize(&self, code: &str, filename: Option<&str>)
        -> Result<OptimizationReport, AnalysisError>;
}

// ─── Language detection & rule-based fallback ────────────────────────

/// Guess the language from the filename extension, then from content.
pub fn detect_language(code: &str, filename: Option<&str>) -> &'static str {
    let by_extension = filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .and_then(|ext| match ext.as_str() {
            "py" => Some("python"),
            "js" | "jsx" => Some("javascript"),
            "ts" | "tsx" => Some("typescript"),
            "cpp" | "h" => Some("cpp"),
            "c" => Some("c"),
            "java" => Some("java"),
            "html" => Some("html"),
            "css" => Some("css"),
            "sql" => Some("sql"),
            "go" => Some("go"),
            "rs" => Some("rust"),
            "rb" => Some("ruby"),
            "php" => Some("php"),
            "sh" => Some("bash"),
            "json" => Some("json"),
            _ => None,
        });
    if let Some(language) = by_extension {
        return language;
    }

    if code.contains("def ") && code.contains(':') {
        "python"
    } else if code.contains("function ") || code.contains("const ") {
        "javascript"
    } else if code.contains("#include") {
        "cpp"
    } else if code.contains("public class") {
        "java"
    } else {
        "text"
    }
}

/// Report for blank input.
pub fn empty_analysis() -> AnalysisReport {
    AnalysisReport {
        suggestions: Vec::new(),
        analysis: AnalysisSummary::default(),
        language: "text".to_string(),
        llm_used: None,
    }
}

/// Rule-based report used when the service is unavailable.
pub fn fallback_analysis(code: &str, language: &str) -> AnalysisReport {
    let lines: Vec<&str> = code.split('\n').collect();
    let mut suggestions = Vec::new();

    if language == "python" {
        for (index, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            let commented = trimmed.starts_with('#');
            if trimmed.ends_with(';') && !commented {
                suggestions.push(Suggestion {
                    kind: "error".into(),
                    message: "Unnecessary semicolon in Python".into(),
                    line: index + 1,
                    severity: "error".into(),
                    fix: Some(line.trim_end().trim_end_matches(';').to_string()),
                });
            }
            if line.contains("//") && !commented {
                suggestions.push(Suggestion {
                    kind: "error".into(),
                    message: "Use # for comments in Python, not //".into(),
                    line: index + 1,
                    severity: "error".into(),
                    fix: Some(hash_comments(line.trim_end())),
                });
            }
        }
    }

    let penalty = 20 * suggestions.len() as u32;
    AnalysisReport {
        analysis: AnalysisSummary {
            lines: lines.len(),
            functions: 0,
            classes: 0,
            complexity_score: 100u32.saturating_sub(penalty),
        },
        suggestions,
        language: language.to_string(),
        llm_used: Some("fallback".to_string()),
    }
}

fn hash_comments(line: &str) -> String {
    let mut parts = line.split("//");
    let mut out = parts.next().unwrap_or_default().trim_end().to_string();
    for part in parts {
        out.push_str("  # ");
        out.push_str(part.trim_start());
    }
    out
}

// ─── Reply parsing ───────────────────────────────────────────────────

/// Remove a surrounding markdown code fence, if any.
pub fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string ("json") up to the first newline.
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Close unterminated brackets and drop trailing commas before closers.
fn repair_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut open = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.trim_end().trim_end_matches(',').chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            out.push(c);
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                open.pop();
                let trimmed = out.trim_end().trim_end_matches(',').len();
                out.truncate(trimmed);
            }
            _ => {}
        }
        out.push(c);
    }
    while let Some(closer) = open.pop() {
        let trimmed = out.trim_end().trim_end_matches(',').len();
        out.truncate(trimmed);
        out.push(closer);
    }
    out
}

/// Parse a model reply as JSON, tolerating fences and truncation.
pub fn parse_reply<T: DeserializeOwned>(text: &str) -> Option<T> {
    let body = strip_code_fence(text);
    if body.is_empty() {
        return None;
    }
    serde_json::from_str(body)
        .or_else(|_| serde_json::from_str(&repair_json(body)))
        .ok()
}

// ─── HTTP client ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

/// Analysis over an OpenAI-compatible chat completions endpoint.
pub struct HttpAnalysisService {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpAnalysisService {
    pub fn new(config: &AnalysisConfig) -> Result<Self, AnalysisError> {
        let http = reqwest::Client::builder()
            .user_agent(format!("codesync/{}", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout())
            .build()
            .map_err(|e| AnalysisError::Service(e.to_string()))?;
        let api_key = config.resolved_api_key();
        if api_key.is_some() {
            log::info!("Analysis service configured with model {}", config.model);
        } else {
            log::warn!("No analysis API key configured; using rule-based analysis");
        }
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn complete(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, AnalysisError> {
        let api_key = self.api_key.as_deref().ok_or(AnalysisError::NotConfigured)?;
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": max_tokens,
            "temperature": temperature,
        });
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .header("X-Title", "CodeSync")
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalysisError::Service(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnalysisError::Service(format!("HTTP {}", status.as_u16())));
        }
        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Service(e.to_string()))?;
        reply
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| AnalysisError::Service("empty completion".into()))
    }
}

#[async_trait]
impl AnalysisService for HttpAnalysisService {
    async fn analyze(
        &self,
        code: &str,
        filename: Option<&str>,
    ) -> Result<AnalysisReport, AnalysisError> {
        if code.trim().is_empty() {
            return Ok(empty_analysis());
        }
        let language = detect_language(code, filename);
        if !self.is_configured() {
            return Ok(fallback_analysis(code, language));
        }

        let numbered: Vec<String> = code
            .split('\n')
            .enumerate()
            .map(|(i, line)| format!("{}: {line}", i + 1))
            .collect();
        let prompt = format!(
            "Analyze this {language} code. Find ALL errors and provide FIXED code for each error.\n\n\
             CODE:\n{}\n\n\
             Return JSON with this EXACT format:\n\
             {{\"suggestions\": [{{\"type\": \"error/warning/info\", \"message\": \"description\", \
             \"line\": 1, \"severity\": \"error/warning/info\", \"fix\": \"corrected line\"}}], \
             \"analysis\": {{\"lines\": 10, \"functions\": 2, \"classes\": 1, \"complexity_score\": 75}}}}\n\n\
             Return ONLY valid JSON, no markdown.",
            numbered.join("\n")
        );

        let reply = match self.complete(&prompt, 1500, 0.1).await {
            Ok(reply) => reply,
            Err(e) => {
                log::error!("Analysis request failed: {e}");
                return Ok(fallback_analysis(code, language));
            }
        };
        let Some(mut report) = parse_reply::<AnalysisReport>(&reply) else {
            log::warn!("Unparseable analysis reply; using rule-based analysis");
            return Ok(fallback_analysis(code, language));
        };
        report.language = language.to_string();
        report.llm_used = Some(self.model.clone());
        report.analysis.lines = numbered.len();
        Ok(report)
    }

    async fn optimize(
        &self,
        code: &str,
        filename: Option<&str>,
    ) -> Result<OptimizationReport, AnalysisError> {
        if code.is_empty() {
            return Err(AnalysisError::EmptyCode);
        }
        let language = detect_language(code, filename);
        if !self.is_configured() {
            return Err(AnalysisError::NotConfigured);
        }

        let prompt = format!(
            "Optimize this {language} code. Return ONLY JSON:\n\n\
             ```{language}\n{code}\n```\n\n\
             JSON format: {{\"optimized_code\": \"code here\", \"changes\": \
             [{{\"description\": \"change\", \"impact\": \"performance/readability\"}}], \
             \"summary\": \"summary text\"}}"
        );
        let reply = self.complete(&prompt, 4096, 0.2).await?;
        let mut report = parse_reply::<OptimizationReport>(&reply).ok_or(AnalysisError::Parse)?;
        report.language = language.to_string();
        report.llm_used = Some(self.model.clone());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned chat completion per connection.
    async fn mock_endpoint(reply: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request).to_string();
                    if let Some(end) = text.find("\r\n\r\n") {
                        let length = text[..end]
                            .lines()
                            .find_map(|l| {
                                let (name, value) = l.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse::<usize>().ok())?
                            })
                            .unwrap_or(0);
                        if request.len() >= end + 4 + length {
                            break;
                        }
                    }
                }
                let body = serde_json::json!({
                    "choices": [{ "message": { "content": reply } }]
                })
                .to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/v1/chat/completions")
    }

    fn service(endpoint: String, key: Option<&str>) -> HttpAnalysisService {
        HttpAnalysisService::new(&AnalysisConfig {
            endpoint,
            api_key: Some(key.unwrap_or("").to_string()),
            model: "test-model".into(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_detect_language() {
        assert_eq!(detect_language("", Some("main.PY")), "python");
        assert_eq!(detect_language("", Some("app.tsx")), "typescript");
        assert_eq!(detect_language("", Some("lib.rs")), "rust");
        assert_eq!(detect_language("def f():\n  pass", None), "python");
        assert_eq!(detect_language("const x = 1", Some("notes.txt")), "javascript");
        assert_eq!(detect_language("#include <stdio.h>", None), "cpp");
        assert_eq!(detect_language("public class A {}", None), "java");
        assert_eq!(detect_language("hello", None), "text");
    }

    #[test]
    fn test_fallback_flags_python_mistakes() {
        let code = "x = 1;\n# fine;\ny = 2 // comment\nz = 3";
        let report = fallback_analysis(code, "python");
        assert_eq!(report.suggestions.len(), 2);
        assert_eq!(report.suggestions[0].line, 1);
        assert_eq!(report.suggestions[0].fix.as_deref(), Some("x = 1"));
        assert_eq!(report.suggestions[1].line, 3);
        assert_eq!(report.suggestions[1].fix.as_deref(), Some("y = 2  # comment"));
        assert_eq!(report.analysis.lines, 4);
        assert_eq!(report.analysis.complexity_score, 60);
        assert_eq!(report.llm_used.as_deref(), Some("fallback"));
    }

    #[test]
    fn test_fallback_score_floors_at_zero() {
        let code = "a;\nb;\nc;\nd;\ne;\nf;";
        assert_eq!(fallback_analysis(code, "python").analysis.complexity_score, 0);
        assert!(fallback_analysis(code, "javascript").suggestions.is_empty());
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n[1]\n```"), "[1]");
    }

    #[test]
    fn test_parse_reply_repairs_truncation() {
        let value: serde_json::Value =
            parse_reply("{\"suggestions\": [{\"message\": \"x\"},").unwrap();
        assert_eq!(value["suggestions"][0]["message"], "x");
        assert!(parse_reply::<serde_json::Value>("not json at all").is_none());
        assert!(parse_reply::<serde_json::Value>("").is_none());
    }

    #[tokio::test]
    async fn test_blank_code_yields_empty_analysis() {
        let report = service("http://127.0.0.1:9".into(), None)
            .analyze("   \n", None)
            .await
            .unwrap();
        assert_eq!(report, empty_analysis());
        assert_eq!(report.analysis.complexity_score, 100);
    }

    #[tokio::test]
    async fn test_unconfigured_service() {
        let svc = service("http://127.0.0.1:9".into(), None);
        assert!(!svc.is_configured());
        let report = svc.analyze("x = 1;", Some("a.py")).await.unwrap();
        assert_eq!(report.llm_used.as_deref(), Some("fallback"));
        assert_eq!(report.suggestions.len(), 1);
        assert_eq!(svc.optimize("x", None).await, Err(AnalysisError::NotConfigured));
        assert_eq!(svc.optimize("", None).await, Err(AnalysisError::EmptyCode));
    }

    #[tokio::test]
    async fn test_analyze_parses_fenced_reply() {
        let endpoint = mock_endpoint(
            "```json\n{\"suggestions\": [{\"type\": \"warning\", \"message\": \"unused\", \"line\": 2, \"severity\": \"warning\"}], \"analysis\": {\"functions\": 1, \"complexity_score\": 80}}\n```",
        )
        .await;
        let svc = service(endpoint, Some("sk-test"));
        let report = svc.analyze("def f():\n    x = 1", None).await.unwrap();
        assert_eq!(report.language, "python");
        assert_eq!(report.llm_used.as_deref(), Some("test-model"));
        assert_eq!(report.analysis.lines, 2);
        assert_eq!(report.analysis.functions, 1);
        assert_eq!(report.suggestions[0].message, "unused");
        assert_eq!(report.suggestions[0].fix, None);
    }

    #[tokio::test]
    async fn test_unparseable_reply_falls_back() {
        let endpoint = mock_endpoint("I cannot help with that").await;
        let svc = service(endpoint, Some("sk-test"));
        let report = svc.analyze("x = 1;", Some("a.py")).await.unwrap();
        assert_eq!(report.llm_used.as_deref(), Some("fallback"));
        assert_eq!(
            svc.optimize("x = 1;", Some("a.py")).await,
            Err(AnalysisError::Parse)
        );
    }

    #[tokio::test]
    async fn test_optimize_parses_reply() {
        let endpoint = mock_endpoint(
            "{\"optimized_code\": \"x = 1\", \"changes\": [{\"description\": \"drop semicolon\", \"impact\": \"readability\"}], \"summary\": \"tidy\"}",
        )
        .await;
        let report = service(endpoint, Some("sk-test"))
            .optimize("x = 1;", Some("a.py"))
            .await
            .unwrap();
        assert_eq!(report.optimized_code, "x = 1");
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.language, "python");
    }
}
