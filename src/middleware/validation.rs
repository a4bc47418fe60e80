//! 请求体校验与滥用检测
//!
//! 清洗是基于黑名单的粗粒度过滤，不是解析器，只能作为纵深防御的一层。
//! 下游拼接 SQL 或 HTML 时仍需自行参数化和转义。
//!
//! 检测总是先于改写：整个原始请求体先做可疑模式扫描，命中即拒绝；
//! 通过扫描后才做字段校验和清洗。

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::Config;

/// 命中即拒绝的攻击特征
static SUSPICIOUS_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("JavaScript protocol", r"(?i)javascript\s*:"),
        ("VBScript protocol", r"(?i)vbscript\s*:"),
        ("Iframe injection", r"(?i)<\s*iframe"),
        ("Eval call", r"(?i)\beval\s*\("),
        ("Cookie access", r"(?i)document\s*\.\s*cookie"),
        ("Location access", r"(?i)(?:window|document)\s*\.\s*location"),
        ("SQL union select", r"(?i)\bunion\s+(?:all\s+)?select\b"),
        ("SQL drop table", r"(?i)\bdrop\s+table\b"),
        ("SQL exec", r"(?i)\bexec\s*\("),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("valid suspicious pattern")))
    .collect()
});

static SCRIPT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<\s*script\b[^>]*>.*?<\s*/\s*script\s*>").expect("valid regex"));
static UNCLOSED_SCRIPT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<\s*/?\s*script\b[^>]*>?").expect("valid regex"));
static MARKUP_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));
static SQL_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:union\s+(?:all\s+)?select|insert\s+into|delete\s+from|drop\s+(?:table|database)|truncate\s+table|xp_cmdshell)\b|\bexec(?:ute)?\s*\(|--|/\*|\*/",
    )
    .expect("valid regex")
});
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

const BOT_TOKENS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "scraper",
    "curl",
    "wget",
    "python-requests",
    "headless",
];

/// 清洗后的请求体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizedBody {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_content: Option<String>,
    pub intensive_mode: bool,
}

impl SanitizedBody {
    pub fn has_attachment(&self) -> bool {
        self.document_content
            .as_deref()
            .is_some_and(|d| !d.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub ok: bool,
    pub sanitized: Option<SanitizedBody>,
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    fn rejected(errors: Vec<String>) -> Self {
        Self {
            ok: false,
            sanitized: None,
            errors,
        }
    }
}

/// 扫描结果：命中的特征名
pub fn scan_suspicious(text: &str) -> Vec<&'static str> {
    SUSPICIOUS_PATTERNS
        .iter()
        .filter(|(_, pattern)| pattern.is_match(text))
        .map(|(name, _)| *name)
        .collect()
}

pub fn sanitize(text: &str) -> String {
    let text = SCRIPT_TAG.replace_all(text, " ");
    let text = UNCLOSED_SCRIPT_TAG.replace_all(&text, " ");
    let text = MARKUP_TAG.replace_all(&text, " ");
    let text = SQL_KEYWORDS.replace_all(&text, " ");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

#[derive(Clone)]
pub struct InputValidator {
    config: Arc<Config>,
}

impl InputValidator {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn validate(&self, body: &Value) -> ValidationOutcome {
        // 先检测整个请求体
        let serialized = body.to_string();
        let matches = scan_suspicious(&serialized);
        if !matches.is_empty() {
            return ValidationOutcome::rejected(
                matches
                    .into_iter()
                    .map(|name| format!("Suspicious pattern detected: {}", name))
                    .collect(),
            );
        }

        let Some(object) = body.as_object() else {
            return ValidationOutcome::rejected(vec!["Request body must be a JSON object".into()]);
        };

        let mut errors = Vec::new();

        let query = match object.get("query") {
            None | Some(Value::Null) => {
                errors.push("query is required".to_string());
                None
            }
            Some(Value::String(q)) if q.trim().is_empty() => {
                errors.push("query must not be empty".to_string());
                None
            }
            Some(Value::String(q)) if q.chars().count() > self.config.max_query_length => {
                errors.push(format!(
                    "query exceeds {} characters",
                    self.config.max_query_length
                ));
                None
            }
            Some(Value::String(q)) => Some(q.as_str()),
            Some(_) => {
                errors.push("query must be a string".to_string());
                None
            }
        };

        let document = match object.get("document_content") {
            None | Some(Value::Null) => None,
            Some(Value::String(d)) if d.chars().count() > self.config.max_document_length => {
                errors.push(format!(
                    "document_content exceeds {} characters",
                    self.config.max_document_length
                ));
                None
            }
            Some(Value::String(d)) => Some(d.as_str()),
            Some(_) => {
                errors.push("document_content must be a string".to_string());
                None
            }
        };

        let intensive_mode = match object.get("intensive_mode") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                errors.push("intensive_mode must be a boolean".to_string());
                false
            }
        };

        if !errors.is_empty() {
            return ValidationOutcome::rejected(errors);
        }
        let Some(query) = query else {
            return ValidationOutcome::rejected(vec!["query is required".into()]);
        };

        let query = sanitize(query);
        if query.is_empty() {
            return ValidationOutcome::rejected(vec!["query is empty after sanitization".into()]);
        }

        ValidationOutcome {
            ok: true,
            sanitized: Some(SanitizedBody {
                query,
                document_content: document.map(sanitize).filter(|d| !d.is_empty()),
                intensive_mode,
            }),
            errors: Vec::new(),
        }
    }

    /// 每个响应都要带上的 CORS 与安全头
    pub fn security_headers(&self, origin: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();

        let allow_any = self.config.allowed_origins.iter().any(|o| o == "*");
        let allowed_origin = if allow_any {
            Some("*")
        } else {
            origin.filter(|o| self.config.allowed_origins.iter().any(|a| a == o))
        };
        if let Some(value) = allowed_origin.and_then(|o| HeaderValue::from_str(o).ok()) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        if !allow_any {
            headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        }
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization"),
        );
        headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));

        headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
        headers.insert(header::X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block"));
        headers.insert(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        );
        if self.config.enable_csp {
            headers.insert(
                header::CONTENT_SECURITY_POLICY,
                HeaderValue::from_static("default-src 'self'; frame-ancestors 'none'"),
            );
        }
        if self.config.enable_hsts {
            headers.insert(
                header::STRICT_TRANSPORT_SECURITY,
                HeaderValue::from_static("max-age=31536000; includeSubDomains"),
            );
        }

        headers
    }

    /// 与 IP 无关的客户端指纹
    pub fn request_fingerprint(&self, headers: &HeaderMap) -> String {
        let material = format!(
            "{}|{}|{}",
            header_str(headers, header::USER_AGENT),
            header_str(headers, header::ACCEPT_LANGUAGE),
            header_str(headers, header::ACCEPT_ENCODING),
        );
        Sha256::digest(material.as_bytes())
            .iter()
            .take(8)
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// 缺少 User-Agent 也视为机器流量
    pub fn is_likely_bot(&self, headers: &HeaderMap) -> bool {
        let user_agent = header_str(headers, header::USER_AGENT).to_lowercase();
        user_agent.is_empty() || BOT_TOKENS.iter().any(|token| user_agent.contains(token))
    }
}
