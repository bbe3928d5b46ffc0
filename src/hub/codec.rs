//! Payload 解析
//!
//! 把传输层的原始字节解析成 [`ParsedMessage`]。任何结构问题都返回
//! [`ParseFailure`]，不会 panic，也不会把错误抛过 Dispatcher 边界。

use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{AgentUpsert, MetricInput};

/// 解析失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("payload root must be an object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(String),

    #[error("field `{field}` must be {expected}")]
    InvalidField { field: String, expected: &'static str },
}

/// 上报中的 Agent 部分
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAgent {
    pub uuid: String,
    pub name: Option<String>,
    pub username: Option<String>,
    pub hostname: Option<String>,
    pub pid: Option<i64>,
}

impl ParsedAgent {
    /// 转成 upsert 参数
    pub fn to_upsert(&self, connected: bool) -> AgentUpsert {
        AgentUpsert {
            uuid: self.uuid.clone(),
            name: self.name.clone(),
            username: self.username.clone(),
            hostname: self.hostname.clone(),
            pid: self.pid,
            connected,
        }
    }
}

/// 一条合法的 agent/message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub agent: ParsedAgent,
    /// 保持上报顺序
    pub metrics: Vec<MetricInput>,
}

/// 解析原始 payload
pub fn parse(raw: &[u8]) -> Result<ParsedMessage, ParseFailure> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| ParseFailure::InvalidJson(e.to_string()))?;
    let root = value.as_object().ok_or(ParseFailure::NotAnObject)?;

    let agent = match root.get("agent") {
        Some(Value::Object(agent)) => parse_agent(agent)?,
        Some(_) => return Err(invalid("agent", "an object")),
        None => return Err(ParseFailure::MissingField("agent".into())),
    };

    let metrics = match root.get("metrics") {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| parse_metric(i, item))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(invalid("metrics", "an array")),
        None => return Err(ParseFailure::MissingField("metrics".into())),
    };

    Ok(ParsedMessage { agent, metrics })
}

fn parse_agent(agent: &Map<String, Value>) -> Result<ParsedAgent, ParseFailure> {
    let uuid = match agent.get("uuid") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::String(_)) => return Err(invalid("agent.uuid", "a non-empty string")),
        Some(_) => return Err(invalid("agent.uuid", "a string")),
        None => return Err(ParseFailure::MissingField("agent.uuid".into())),
    };

    let pid = match agent.get("pid") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(pid) if pid >= 0 => Some(pid),
            _ => return Err(invalid("agent.pid", "a non-negative integer")),
        },
        Some(_) => return Err(invalid("agent.pid", "a non-negative integer")),
    };

    Ok(ParsedAgent {
        uuid,
        name: optional_string(agent, "name")?,
        username: optional_string(agent, "username")?,
        hostname: optional_string(agent, "hostname")?,
        pid,
    })
}

fn parse_metric(index: usize, item: &Value) -> Result<MetricInput, ParseFailure> {
    let field = |name: &str| format!("metrics[{}].{}", index, name);

    let metric = item
        .as_object()
        .ok_or_else(|| invalid(format!("metrics[{}]", index), "an object"))?;

    let metric_type = match metric.get("type") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(_) => return Err(invalid(field("type"), "a non-empty string")),
        None => return Err(ParseFailure::MissingField(field("type"))),
    };

    let value = match metric.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(_) => return Err(invalid(field("value"), "a string, number or boolean")),
        None => return Err(ParseFailure::MissingField(field("value"))),
    };

    let timestamp = match metric.get("timestamp") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => Some(
            n.as_i64()
                .ok_or_else(|| invalid(field("timestamp"), "an integer (ms)"))?,
        ),
        Some(Value::String(s)) => Some(
            chrono::DateTime::parse_from_rfc3339(s)
                .map_err(|_| invalid(field("timestamp"), "an RFC 3339 string"))?
                .timestamp_millis(),
        ),
        Some(_) => return Err(invalid(field("timestamp"), "an integer or RFC 3339 string")),
    };

    Ok(MetricInput {
        metric_type,
        value,
        timestamp,
    })
}

fn optional_string(obj: &Map<String, Value>, key: &str) -> Result<Option<String>, ParseFailure> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(invalid(format!("agent.{}", key), "a string")),
    }
}

fn invalid(field: impl Into<String>, expected: &'static str) -> ParseFailure {
    ParseFailure::InvalidField {
        field: field.into(),
        expected,
    }
}
