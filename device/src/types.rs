use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// Management API (iot-api.heclouds.com)

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateDeviceRequest {
    pub product_id: String,
    pub device_name: String,
    pub desc: String,
    pub lon: String,
    pub lat: String,
}

/// `{code, msg, data}` wrapper used by the management API.
#[derive(Deserialize, Debug)]
pub struct ApiEnvelope<T> {
    pub code: Option<Value>,
    #[serde(default)]
    pub msg: Option<String>,
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    pub fn is_ok(&self) -> bool {
        code_is_success(self.code.as_ref())
    }

    pub fn code_string(&self) -> String {
        match &self.code {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "missing".to_string(),
        }
    }
}

/// `0` or `"succ"`.
pub fn code_is_success(code: Option<&Value>) -> bool {
    match code {
        Some(Value::Number(n)) => n.as_i64() == Some(0),
        Some(Value::String(s)) => s == "succ",
        _ => false,
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct CreatedDevice {
    #[serde(deserialize_with = "string_or_number")]
    pub did: String,
    #[serde(default)]
    pub pid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sec_key: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct UploadedFile {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub fid: Option<String>,
}

// Device access API (open.iot.10086.cn)

#[derive(Serialize, Debug, Clone)]
pub struct OnlineRequest {
    pub pid: String,
    #[serde(rename = "devName")]
    pub dev_name: String,
    pub status: u8,
    pub protocol: &'static str,
    pub network: u8,
    pub mac: String,
}

/// `{errno, error}` reply of the fuse endpoints.
#[derive(Deserialize, Debug, Default)]
pub struct FuseReply {
    pub errno: Option<i64>,
    pub error: Option<String>,
}

impl FuseReply {
    pub fn is_ok(&self) -> bool {
        self.errno == Some(0) || self.error.as_deref() == Some("succ")
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct OneJsonRequest {
    pub id: String,
    pub version: &'static str,
    pub params: Value,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct TimedValue {
    pub value: f32,
    pub time: i64,
}

// Local activation server

#[derive(Deserialize, Debug, Default)]
pub struct ActivateRequest {
    #[serde(default)]
    pub device_code: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ActivateResponse {
    Ok {
        success: bool,
        product_id: String,
        device_id: String,
        device_name: String,
    },
    Err {
        success: bool,
        error: String,
    },
}

impl ActivateResponse {
    pub fn ok(product_id: &str, device_id: &str, device_name: &str) -> Self {
        ActivateResponse::Ok {
            success: true,
            product_id: product_id.to_string(),
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        ActivateResponse::Err {
            success: false,
            error: error.into(),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {}", other))),
    }
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!("expected string or number, got {}", other))),
    }
}
