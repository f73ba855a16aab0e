//! `http` step: sends a request and checks the response.
//!
//! ```yaml
//! http:
//!   url: http://localhost:{random.port}/api/users
//!   method: POST
//!   body:
//!     json: {name: alice}
//!   expect:
//!     status: 201
//!     body:
//!       fields:
//!         - path: items[0].id
//!           type: number
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::template::{Sources, Template, SOURCE_RANDOM};
use super::{StepError, StepInput, StepOutput, StepRunner, DEFAULT_TIMEOUT};

const ALLOWED_SOURCES: &[&str] = &[SOURCE_RANDOM];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpStepConfig {
    url: String,
    #[serde(default)]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<HttpBody>,
    #[serde(default)]
    expect: Option<HttpExpect>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
}

/// Request body. Exactly one of `raw` and `json` is set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HttpBody {
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(default)]
    pub json: Option<Map<String, Value>>,
}

impl HttpBody {
    fn validate(&self) -> Result<(), StepError> {
        match (&self.raw, &self.json) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(StepError::InvalidConfig(
                "invalid body for http step: exactly one key must be defined on body".to_string(),
            )),
        }
    }

    /// Serialized body and the content type it implies, if any.
    fn content(&self) -> Result<(Vec<u8>, Option<&'static str>), StepError> {
        if let Some(raw) = &self.raw {
            return Ok((raw.clone().into_bytes(), None));
        }
        if let Some(json) = &self.json {
            let data = serde_json::to_vec(json).map_err(|e| {
                StepError::Http(format!("failed to marshal body.json to json: {}", e))
            })?;
            return Ok((data, Some("application/json")));
        }
        Err(StepError::Http("no valid body set".to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HttpExpect {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub body: Option<ExpectBody>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExpectBody {
    #[serde(default)]
    pub fields: Vec<FieldAssertion>,
    /// Regex applied to the raw body.
    #[serde(default, rename = "match")]
    pub pattern: Option<String>,
}

/// A check on one JSON field, addressed as `user.name` or `items[0].id`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FieldAssertion {
    pub path: String,
    #[serde(default)]
    pub equals: Option<Value>,
    /// One of string, number, bool, array, object, null.
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,
    #[serde(default, rename = "match")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub exists: Option<bool>,
}

/// A parsed `http` step.
#[derive(Debug)]
pub struct HttpStep {
    url: Template,
    method: Template,
    headers: Vec<(String, Template)>,
    body: Option<HttpBody>,
    expect: Option<HttpExpect>,
    timeout: Duration,
    client: Client,
}

impl HttpStep {
    pub const TYPE: &'static str = "http";

    pub fn parse(raw: &Value) -> Result<Self, StepError> {
        let cfg: HttpStepConfig =
            serde_json::from_value(raw.clone()).map_err(|source| StepError::Parse {
                step_type: Self::TYPE.to_string(),
                source,
            })?;

        let url = Template::parse(&cfg.url, ALLOWED_SOURCES)?;
        let method = Template::parse(&cfg.method, ALLOWED_SOURCES)?;

        let mut headers = Vec::with_capacity(cfg.headers.len());
        for (key, value) in cfg.headers {
            headers.push((key, Template::parse(&value, ALLOWED_SOURCES)?));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        if let Some(body) = &cfg.body {
            body.validate()?;
        }

        let timeout = cfg.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StepError::Http(format!("failed to create http client: {}", e)))?;

        Ok(Self {
            url,
            method,
            headers,
            body: cfg.body,
            expect: cfg.expect,
            timeout,
            client,
        })
    }
}

#[async_trait]
impl StepRunner for HttpStep {
    fn step_type(&self) -> &str {
        Self::TYPE
    }

    async fn execute(&self, input: &StepInput<'_>) -> Result<StepOutput, StepError> {
        let sources = Sources::new().with(SOURCE_RANDOM, input.random);

        let method = self.method.render(&sources)?;
        let method = if method.is_empty() {
            Method::GET
        } else {
            Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(|e| StepError::Http(format!("invalid http method {:?}: {}", method, e)))?
        };
        let url = self.url.render(&sources)?;

        let mut request = self.client.request(method.clone(), &url);
        let mut has_content_type = false;
        for (key, tpl) in &self.headers {
            let value = tpl
                .render(&sources)
                .map_err(|e| StepError::Http(format!("failed to build header {:?} from template: {}", key, e)))?;
            has_content_type |= key.eq_ignore_ascii_case(CONTENT_TYPE.as_str());
            request = request.header(key.as_str(), value);
        }

        if let Some(body) = &self.body {
            let (data, content_type) = body.content()?;
            if let (Some(ct), false) = (content_type, has_content_type) {
                request = request.header(CONTENT_TYPE, ct);
            }
            request = request.body(data);
        }

        debug!(method = %method, url = %url, "Sending http request");

        let response = tokio::select! {
            res = request.send() => res.map_err(|e| {
                if e.is_timeout() {
                    StepError::Timeout(self.timeout)
                } else {
                    StepError::Http(format!("failed to make http request: {}", e))
                }
            })?,
            _ = input.cancel.cancelled() => return Err(StepError::Cancelled),
        };

        let Some(expect) = &self.expect else {
            return Ok(StepOutput::success(
                Self::TYPE,
                "request completed (no expectations defined)",
            ));
        };

        let status = response.status().as_u16();
        let body = match &expect.body {
            Some(_) => Some(
                response
                    .bytes()
                    .await
                    .map(|b| b.to_vec())
                    .map_err(|e| e.to_string()),
            ),
            None => None,
        };

        Ok(expect.validate(status, body))
    }
}

impl HttpExpect {
    /// Checks a response. `body` is only read when body checks exist.
    fn validate(&self, status: u16, body: Option<Result<Vec<u8>, String>>) -> StepOutput {
        let mut errors = Vec::new();

        if let Some(expected) = self.status {
            if expected != 0 && expected != status {
                errors.push(format!("expected status code {}, got {}", expected, status));
            }
        }

        if let Some(expect_body) = &self.body {
            match body {
                Some(Ok(bytes)) => errors.extend(expect_body.validate(&bytes)),
                Some(Err(e)) => errors.push(format!("failed to read response body: {}", e)),
                None => {}
            }
        }

        if errors.is_empty() {
            StepOutput::success(HttpStep::TYPE, "response passed all validation")
        } else {
            StepOutput::failure(
                HttpStep::TYPE,
                format!("response failed validation check: {}", errors.join("; ")),
            )
        }
    }
}

impl ExpectBody {
    fn validate(&self, body: &[u8]) -> Vec<String> {
        let mut errors = self.validate_match(body);
        errors.extend(self.validate_fields(body));
        errors
    }

    fn validate_match(&self, body: &[u8]) -> Vec<String> {
        let Some(pattern) = &self.pattern else {
            return Vec::new();
        };
        match Regex::new(pattern) {
            Err(e) => vec![format!("invalid match regex {:?}: {}", pattern, e)],
            Ok(re) if !re.is_match(&String::from_utf8_lossy(body)) => {
                vec![format!("body did not match pattern {:?}", pattern)]
            }
            Ok(_) => Vec::new(),
        }
    }

    fn validate_fields(&self, body: &[u8]) -> Vec<String> {
        if self.fields.is_empty() {
            return Vec::new();
        }
        if body.is_empty() {
            return vec!["expected JSON body but got empty response".to_string()];
        }
        let parsed: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => return vec![format!("failed to parse response body as JSON: {}", e)],
        };
        self.fields
            .iter()
            .flat_map(|field| field.validate(&parsed))
            .collect()
    }
}

impl FieldAssertion {
    fn validate(&self, data: &Value) -> Vec<String> {
        let value = field_by_path(data, &self.path);

        match (self.exists, value) {
            (Some(true), None) => return vec![format!("field {:?} does not exist", self.path)],
            (Some(false), Some(_)) => {
                return vec![format!("field {:?} exists but should not", self.path)]
            }
            _ => {}
        }

        let Some(value) = value else {
            if self.equals.is_some() || self.value_type.is_some() || self.pattern.is_some() {
                return vec![format!("field {:?} does not exist", self.path)];
            }
            return Vec::new();
        };

        let mut errors = Vec::new();

        if let Some(expected) = &self.value_type {
            let actual = type_name(value);
            if actual != expected {
                errors.push(format!(
                    "field {:?}: expected type {}, got {}",
                    self.path, expected, actual
                ));
            }
        }

        if let Some(expected) = &self.equals {
            if !values_equal(value, expected) {
                errors.push(format!(
                    "field {:?}: expected {}, got {}",
                    self.path,
                    display_value(expected),
                    display_value(value)
                ));
            }
        }

        if let Some(pattern) = &self.pattern {
            match value.as_str() {
                None => errors.push(format!(
                    "field {:?}: match requires string value, got {}",
                    self.path,
                    type_name(value)
                )),
                Some(s) => match Regex::new(pattern) {
                    Err(e) => errors.push(format!(
                        "field {:?}: invalid match regex {:?}: {}",
                        self.path, pattern, e
                    )),
                    Ok(re) if !re.is_match(s) => errors.push(format!(
                        "field {:?}: value {:?} did not match pattern {:?}",
                        self.path, s, pattern
                    )),
                    Ok(_) => {}
                },
            }
        }

        errors
    }
}

#[derive(Debug, PartialEq, Eq)]
struct PathPart {
    key: String,
    is_index: bool,
}

/// Splits `data.users[2].email` into keys and indices. A bare numeric
/// segment such as `items.0` stays a key.
fn split_path(path: &str) -> Vec<PathPart> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_bracket = false;

    let mut flush = |current: &mut String, is_index: bool| {
        if !current.is_empty() {
            parts.push(PathPart {
                key: std::mem::take(current),
                is_index,
            });
        }
    };

    for ch in path.chars() {
        match ch {
            '.' => {
                flush(&mut current, in_bracket);
                in_bracket = false;
            }
            '[' => {
                flush(&mut current, false);
                in_bracket = true;
            }
            ']' => {
                flush(&mut current, true);
                in_bracket = false;
            }
            c => current.push(c),
        }
    }
    flush(&mut current, in_bracket);

    parts
}

fn field_by_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    split_path(path).iter().try_fold(data, |current, part| {
        if part.is_index {
            let idx: usize = part.key.parse().ok()?;
            current.as_array()?.get(idx)
        } else {
            current.as_object()?.get(&part.key)
        }
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "bool",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Null => "null",
    }
}

/// Numbers compare numerically (so `200` equals `200.0`); everything else
/// compares by its printed form, so `"200"` also equals `200`.
fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    display_value(a) == display_value(b)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::steps::template::SourceResolver;
    use crate::steps::{RandomResolver, StepOutputs};

    fn field(v: Value) -> FieldAssertion {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_split_path() {
        let parts = split_path("data.users[2].email");
        let keys: Vec<_> = parts.iter().map(|p| (p.key.as_str(), p.is_index)).collect();
        assert_eq!(
            keys,
            vec![("data", false), ("users", false), ("2", true), ("email", false)]
        );

        let parts = split_path("items.0.id");
        assert!(parts.iter().all(|p| !p.is_index));
    }

    #[test]
    fn test_field_by_path() {
        let data = json!({"items": [{"id": 7}], "user": {"name": "alice"}});
        assert_eq!(field_by_path(&data, "items[0].id"), Some(&json!(7)));
        assert_eq!(field_by_path(&data, "user.name"), Some(&json!("alice")));
        assert_eq!(field_by_path(&data, "items[3].id"), None);
        // A plain numeric segment is an object key, not an index.
        assert_eq!(field_by_path(&data, "items.0.id"), None);
    }

    #[test]
    fn test_values_equal() {
        assert!(values_equal(&json!(200), &json!(200.0)));
        assert!(values_equal(&json!("200"), &json!(200)));
        assert!(values_equal(&json!(true), &json!(true)));
        assert!(!values_equal(&json!("a"), &json!("b")));
    }

    #[test]
    fn test_field_assertions() {
        let data = json!({"name": "alice", "count": 3, "tags": []});

        assert!(field(json!({"path": "name", "equals": "alice", "type": "string"}))
            .validate(&data)
            .is_empty());
        assert_eq!(
            field(json!({"path": "missing", "exists": true})).validate(&data),
            vec!["field \"missing\" does not exist"]
        );
        assert_eq!(
            field(json!({"path": "name", "exists": false})).validate(&data),
            vec!["field \"name\" exists but should not"]
        );
        assert_eq!(
            field(json!({"path": "tags", "type": "object"})).validate(&data),
            vec!["field \"tags\": expected type object, got array"]
        );
        assert_eq!(
            field(json!({"path": "count", "equals": 4})).validate(&data),
            vec!["field \"count\": expected 4, got 3"]
        );
        assert_eq!(
            field(json!({"path": "count", "match": "3"})).validate(&data),
            vec!["field \"count\": match requires string value, got number"]
        );
        assert!(field(json!({"path": "name", "match": "^al"}))
            .validate(&data)
            .is_empty());
        assert!(field(json!({"path": "absent"})).validate(&data).is_empty());
    }

    #[test]
    fn test_expect_validate() {
        let expect: HttpExpect = serde_json::from_value(json!({
            "status": 200,
            "body": {"match": "ok", "fields": [{"path": "status", "equals": "ok"}]}
        }))
        .unwrap();

        let out = expect.validate(200, Some(Ok(br#"{"status":"ok"}"#.to_vec())));
        assert!(out.success, "{}", out.error);
        assert_eq!(out.message, "response passed all validation");

        let out = expect.validate(500, Some(Ok(Vec::new())));
        assert!(!out.success);
        assert_eq!(
            out.error,
            "response failed validation check: expected status code 200, got 500; \
             body did not match pattern \"ok\"; expected JSON body but got empty response"
        );
    }

    #[test]
    fn test_body_must_have_one_key() {
        let err = HttpStep::parse(&json!({
            "url": "http://localhost",
            "body": {"raw": "x", "json": {"a": 1}}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("exactly one key must be defined on body"));
        assert!(HttpStep::parse(&json!({"url": "http://localhost", "body": {}})).is_err());
    }

    #[test]
    fn test_steps_source_not_allowed() {
        let err = HttpStep::parse(&json!({"url": "http://x/{steps.script.stdout}"})).unwrap_err();
        assert!(matches!(err, StepError::Template(_)));
    }

    /// Answers every connection with `status` and `body`, passing each raw
    /// request on to the test.
    async fn serve(status: u16, body: &'static str) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let _ = tx.send(read_request(&mut stream).await);
                let response = format!(
                    "HTTP/1.1 {} Test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (format!("http://{}", addr), rx)
    }

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).into_owned();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|l| l.split_once(':'))
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    struct Env {
        cancel: CancellationToken,
        env: HashMap<String, String>,
        outputs: StepOutputs,
        random: RandomResolver,
    }

    impl Env {
        fn new() -> Self {
            Self {
                cancel: CancellationToken::new(),
                env: HashMap::new(),
                outputs: StepOutputs::new(),
                random: RandomResolver::new(),
            }
        }

        async fn run(&self, step: &HttpStep) -> StepOutput {
            let input = StepInput {
                cancel: &self.cancel,
                workdir: Path::new("."),
                env: &self.env,
                agent: None,
                step_outputs: &self.outputs,
                random: &self.random,
            };
            step.execute(&input).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_request_meets_expectations() {
        let (base, mut requests) = serve(201, r#"{"status":"ok","items":[{"id":7}]}"#).await;
        let step = HttpStep::parse(&json!({
            "url": format!("{}/users/{{random.id}}", base),
            "method": "post",
            "headers": {"X-Run": "{random.id}"},
            "body": {"json": {"name": "alice"}},
            "expect": {
                "status": 201,
                "body": {"match": "ok", "fields": [{"path": "items[0].id", "type": "number"}]}
            }
        }))
        .unwrap();
        let env = Env::new();

        let out = env.run(&step).await;
        assert!(out.success, "{}", out.error);
        assert_eq!(out.message, "response passed all validation");

        let id = env.random.resolve("id").unwrap();
        let request = requests.recv().await.unwrap();
        assert!(request.starts_with(&format!("POST /users/{} ", id)), "{}", request);
        let lower = request.to_ascii_lowercase();
        assert!(lower.contains(&format!("x-run: {}", id)), "{}", request);
        assert!(lower.contains("content-type: application/json"), "{}", request);
        assert!(request.ends_with(r#"{"name":"alice"}"#), "{}", request);
    }

    #[tokio::test]
    async fn test_request_fails_expectations() {
        let (base, _requests) = serve(500, r#"{"status":"down"}"#).await;
        let step = HttpStep::parse(&json!({
            "url": base,
            "expect": {
                "status": 200,
                "body": {"fields": [{"path": "status", "equals": "ok"}]}
            }
        }))
        .unwrap();

        let out = Env::new().run(&step).await;
        assert!(!out.success);
        assert_eq!(
            out.error,
            "response failed validation check: expected status code 200, got 500; \
             field \"status\": expected ok, got down"
        );
    }

    #[tokio::test]
    async fn test_request_without_expectations() {
        let (base, mut requests) = serve(404, "{}").await;
        let step = HttpStep::parse(&json!({"url": base, "body": {"raw": "plain"}})).unwrap();

        let out = Env::new().run(&step).await;
        assert!(out.success);
        assert_eq!(out.message, "request completed (no expectations defined)");

        let request = requests.recv().await.unwrap();
        assert!(request.starts_with("GET / "), "{}", request);
        assert!(!request.to_ascii_lowercase().contains("content-type"), "{}", request);
        assert!(request.ends_with("plain"), "{}", request);
    }

    #[tokio::test]
    async fn test_explicit_content_type_kept() {
        let (base, mut requests) = serve(200, "{}").await;
        let step = HttpStep::parse(&json!({
            "url": base,
            "method": "PUT",
            "headers": {"Content-Type": "application/merge-patch+json"},
            "body": {"json": {"a": 1}},
            "expect": {"status": 200}
        }))
        .unwrap();

        let out = Env::new().run(&step).await;
        assert!(out.success, "{}", out.error);

        let request = requests.recv().await.unwrap().to_ascii_lowercase();
        assert!(request.contains("content-type: application/merge-patch+json"), "{}", request);
        assert!(!request.contains("content-type: application/json"), "{}", request);
    }
}
