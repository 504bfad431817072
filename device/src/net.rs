use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::Config;
use crate::credentials::DeviceCredentials;
use crate::error::ApiError;
use crate::token;
use crate::types::{
    code_is_success, ApiEnvelope, CreateDeviceRequest, CreatedDevice, FuseReply, OneJsonRequest,
    OnlineRequest, TimedValue, UploadedFile,
};

pub const CREATE_TIMEOUT: Duration = Duration::from_secs(15);
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEVICE_TIMEOUT: Duration = Duration::from_secs(15);
pub const PACK_TIMEOUT: Duration = Duration::from_secs(30);

const CREATE_PATH: &str = "/device/create";
const UPLOAD_PATH: &str = "/device/file-upload";
const ONLINE_PATH: &str = "/fuse/http/device/online";
const PROPERTY_PATH: &str = "/fuse/http/device/thing/property/post";
const PACK_PATH: &str = "/fuse/http/device/thing/pack/post";

/// Percent-encodes `$` and `/` of a `$sys/...` topic for the query string.
pub fn encode_topic(topic: &str) -> String {
    topic.replace('$', "%24").replace('/', "%2F")
}

fn topic_url(config: &Config, path: &str, creds: &DeviceCredentials, kind: &str) -> String {
    let topic = format!("$sys/{}/{}/thing/{}/post", creds.product_id, creds.device_name, kind);
    format!(
        "{}{}?topic={}&protocol=HTTP",
        config.device_api_base_url,
        path,
        encode_topic(&topic)
    )
}

async fn read_body(response: Response) -> Result<(StatusCode, String), ApiError> {
    let status = response.status();
    let text = response.text().await?;
    Ok((status, text))
}

fn parse<T: DeserializeOwned>(status: StatusCode, text: &str) -> Result<T, ApiError> {
    serde_json::from_str(text).map_err(|e| {
        if status.is_success() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Status(status.as_u16())
        }
    })
}

/// Registers a device under the configured product with a product-level token.
pub async fn create_device(
    client: &Client,
    config: &Config,
    request: &CreateDeviceRequest,
) -> Result<CreatedDevice, ApiError> {
    let url = format!("{}{}", config.api_base_url, CREATE_PATH);
    let auth = token::product_token(&config.product_id, &config.product_access_key)?;

    log::info!("Registering device {} on OneNET", request.device_name);
    let response = client
        .post(&url)
        .header("authorization", auth)
        .json(request)
        .timeout(CREATE_TIMEOUT)
        .send()
        .await?;
    let (status, text) = read_body(response).await?;
    log::debug!("Create device response {}: {}", status, text);

    let envelope: ApiEnvelope<CreatedDevice> = parse(status, &text)?;
    if !envelope.is_ok() {
        return Err(ApiError::Rejected {
            code: envelope.code_string(),
            msg: envelope.msg.clone().unwrap_or_else(|| "unknown".to_string()),
        });
    }
    envelope
        .data
        .ok_or_else(|| ApiError::Decode("response has no data".to_string()))
}

/// Posts a prebuilt multipart body. `auth` is a user-level token.
pub async fn upload_file(
    client: &Client,
    config: &Config,
    auth: &str,
    body: Vec<u8>,
    boundary: &str,
) -> Result<UploadedFile, ApiError> {
    let url = format!("{}{}", config.api_base_url, UPLOAD_PATH);

    let response = client
        .post(&url)
        .header("authorization", auth)
        .header(
            reqwest::header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(body)
        .timeout(UPLOAD_TIMEOUT)
        .send()
        .await?;
    let (status, text) = read_body(response).await?;
    log::info!("Upload HTTP status {}, {} response bytes", status, text.len());

    if status != StatusCode::OK {
        return Err(ApiError::Status(status.as_u16()));
    }
    let envelope: ApiEnvelope<UploadedFile> = parse(status, &text)?;
    if !matches!(envelope.code.as_ref().and_then(Value::as_i64), Some(0)) {
        return Err(ApiError::Rejected {
            code: envelope.code_string(),
            msg: envelope.msg.clone().unwrap_or_else(|| "Unknown error".to_string()),
        });
    }
    let file = envelope.data.unwrap_or_default();
    if let Some(fid) = &file.fid {
        log::info!("File uploaded, fid {}", fid);
    }
    Ok(file)
}

fn fuse_result(status: StatusCode, text: &str) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return if status.is_success() {
            Ok(())
        } else {
            Err(ApiError::Status(status.as_u16()))
        };
    }
    let reply: FuseReply = parse(status, text)?;
    if reply.is_ok() {
        Ok(())
    } else {
        Err(ApiError::Rejected {
            code: reply.errno.map(|e| e.to_string()).unwrap_or_else(|| "missing".to_string()),
            msg: reply.error.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

pub async fn set_device_online(
    client: &Client,
    config: &Config,
    creds: &DeviceCredentials,
    online: bool,
    mac: &str,
) -> Result<(), ApiError> {
    let url = format!("{}{}", config.device_api_base_url, ONLINE_PATH);
    let auth = token::device_token(&creds.product_id, &creds.device_name, &creds.secret_key)?;
    let body = OnlineRequest {
        pid: creds.product_id.clone(),
        dev_name: creds.device_name.clone(),
        status: u8::from(online),
        protocol: "HTTP",
        network: 0,
        mac: mac.to_string(),
    };

    let response = client
        .post(&url)
        .header("token", auth)
        .json(&body)
        .timeout(DEVICE_TIMEOUT)
        .send()
        .await?;
    let (status, text) = read_body(response).await?;
    fuse_result(status, &text)?;
    log::info!("Device {} reported {}", creds.device_name, if online { "online" } else { "offline" });
    Ok(())
}

/// Posts a OneJSON property message; `params` is the property object.
pub async fn post_properties(
    client: &Client,
    config: &Config,
    creds: &DeviceCredentials,
    params: Value,
) -> Result<(), ApiError> {
    let url = topic_url(config, PROPERTY_PATH, creds, "property");
    let auth = token::device_token(&creds.product_id, &creds.device_name, &creds.secret_key)?;
    let body = OneJsonRequest {
        id: Uuid::new_v4().simple().to_string(),
        version: "1.0",
        params,
    };

    let response = client
        .post(&url)
        .header("token", auth)
        .json(&body)
        .timeout(DEVICE_TIMEOUT)
        .send()
        .await?;
    let (status, text) = read_body(response).await?;
    if text.trim().is_empty() {
        return if status.is_success() {
            Ok(())
        } else {
            Err(ApiError::Status(status.as_u16()))
        };
    }

    let envelope: ApiEnvelope<Value> = parse(status, &text)?;
    if code_is_success(envelope.code.as_ref()) {
        return Ok(());
    }
    match envelope.code.as_ref().and_then(Value::as_str) {
        Some("authPermissionDeny") => Err(ApiError::AuthDenied),
        Some("invalidParameter") => Err(ApiError::InvalidParameter),
        _ => Err(ApiError::Rejected {
            code: envelope.code_string(),
            msg: envelope.msg.clone().unwrap_or_else(|| "unknown".to_string()),
        }),
    }
}

/// Posts one oscilloscope sample through the pack endpoint.
pub async fn post_pack(
    client: &Client,
    config: &Config,
    creds: &DeviceCredentials,
    sample: TimedValue,
) -> Result<(), ApiError> {
    let url = topic_url(config, PACK_PATH, creds, "pack");
    let auth = token::device_token(&creds.product_id, &creds.device_name, &creds.secret_key)?;
    let body = OneJsonRequest {
        id: Uuid::new_v4().simple().to_string(),
        version: "1.0",
        params: json!({ "properties": { "Oscilloscope_data": sample } }),
    };

    let response = client
        .post(&url)
        .header("token", auth)
        .json(&body)
        .timeout(PACK_TIMEOUT)
        .send()
        .await?;
    let (status, text) = read_body(response).await?;
    fuse_result(status, &text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{spawn_mock, test_config};
    use axum::extract::Query;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::collections::HashMap;

    fn creds() -> DeviceCredentials {
        DeviceCredentials {
            product_id: "FCwDzD6VU0".to_string(),
            device_name: "ExDebugTool_1".to_string(),
            secret_key: "c2VjcmV0".to_string(),
        }
    }

    fn create_request() -> CreateDeviceRequest {
        CreateDeviceRequest {
            product_id: "FCwDzD6VU0".to_string(),
            device_name: "ExDebugTool_1".to_string(),
            desc: "test".to_string(),
            lon: "116.397000".to_string(),
            lat: "39.916000".to_string(),
        }
    }

    #[test]
    fn topic_encoding_only_touches_dollar_and_slash() {
        assert_eq!(
            encode_topic("$sys/P/ExDebugTool_1/thing/property/post"),
            "%24sys%2FP%2FExDebugTool_1%2Fthing%2Fproperty%2Fpost"
        );
    }

    #[tokio::test]
    async fn create_device_sends_product_token_and_parses_reply() {
        let app = Router::new().route(
            "/device/create",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let auth = headers.get("authorization").and_then(|v| v.to_str().ok()).unwrap_or("");
                assert!(auth.starts_with("version=2018-10-31&res=products%2FFCwDzD6VU0&"));
                assert!(auth.contains("&method=md5&"));
                assert_eq!(body["lon"], "116.397000");
                Json(json!({"code":0,"msg":"succ","data":{"did":"123","sec_key":"c2VjcmV0"}}))
            }),
        );
        let base = spawn_mock(app).await;
        let config = test_config(&base);

        let created = create_device(&Client::new(), &config, &create_request()).await.unwrap();
        assert_eq!(created.did, "123");
        assert_eq!(created.sec_key.as_deref(), Some("c2VjcmV0"));
    }

    #[tokio::test]
    async fn create_device_surfaces_api_message() {
        let app = Router::new().route(
            "/device/create",
            post(|| async { Json(json!({"code":10406,"msg":"device exists"})) }),
        );
        let base = spawn_mock(app).await;
        let err = create_device(&Client::new(), &test_config(&base), &create_request())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "API error: device exists");
    }

    #[tokio::test]
    async fn upload_failures_by_status_and_code() {
        let app = Router::new()
            .route("/device/file-upload", post(|| async { Json(json!({"code":1,"msg":"bad ext"})) }));
        let base = spawn_mock(app).await;
        let err = upload_file(&Client::new(), &test_config(&base), "t", b"x".to_vec(), "b")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Rejected { ref msg, .. } if msg == "bad ext"));

        let app = Router::new().route(
            "/device/file-upload",
            post(|| async { (axum::http::StatusCode::BAD_GATEWAY, "oops") }),
        );
        let base = spawn_mock(app).await;
        let err = upload_file(&Client::new(), &test_config(&base), "t", b"x".to_vec(), "b")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "HTTP status: 502");
    }

    #[tokio::test]
    async fn upload_with_unparseable_ok_body_is_failure() {
        let app = Router::new().route("/device/file-upload", post(|| async { "not json" }));
        let base = spawn_mock(app).await;
        let err = upload_file(&Client::new(), &test_config(&base), "t", b"x".to_vec(), "b")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[tokio::test]
    async fn online_accepts_errno_error_and_empty_body() {
        let app = Router::new()
            .route(
                "/fuse/http/device/online",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    assert!(headers.contains_key("token"));
                    assert_eq!(body["devName"], "ExDebugTool_1");
                    if body["status"] == 1 {
                        Json(json!({"errno":0}))
                    } else {
                        Json(json!({"errno":3,"error":"succ"}))
                    }
                }),
            );
        let base = spawn_mock(app).await;
        let config = test_config(&base);
        set_device_online(&Client::new(), &config, &creds(), true, "00:00:00:00:00:00").await.unwrap();
        set_device_online(&Client::new(), &config, &creds(), false, "00:00:00:00:00:00").await.unwrap();

        let app = Router::new().route("/fuse/http/device/online", post(|| async { "" }));
        let base = spawn_mock(app).await;
        set_device_online(&Client::new(), &test_config(&base), &creds(), true, "m").await.unwrap();
    }

    #[tokio::test]
    async fn property_post_maps_named_error_codes() {
        let app = Router::new().route(
            "/fuse/http/device/thing/property/post",
            post(|Query(q): Query<HashMap<String, String>>, Json(body): Json<Value>| async move {
                assert_eq!(q.get("topic").map(String::as_str), Some("$sys/FCwDzD6VU0/ExDebugTool_1/thing/property/post"));
                assert_eq!(q.get("protocol").map(String::as_str), Some("HTTP"));
                assert_eq!(body["version"], "1.0");
                match body["params"]["mode"]["value"].as_str() {
                    Some("deny") => Json(json!({"code":"authPermissionDeny"})),
                    Some("bad") => Json(json!({"code":"invalidParameter"})),
                    Some("other") => Json(json!({"code":"serverError","msg":"x"})),
                    _ => Json(json!({"code":"succ"})),
                }
            }),
        );
        let base = spawn_mock(app).await;
        let config = test_config(&base);
        let client = Client::new();
        let post_mode = |mode: &'static str| {
            let client = client.clone();
            let config = config.clone();
            async move {
                post_properties(&client, &config, &creds(), json!({"mode":{"value":mode}})).await
            }
        };

        post_mode("ok").await.unwrap();
        assert!(matches!(post_mode("deny").await, Err(ApiError::AuthDenied)));
        assert!(matches!(post_mode("bad").await, Err(ApiError::InvalidParameter)));
        assert!(matches!(post_mode("other").await, Err(ApiError::Rejected { .. })));
    }

    #[tokio::test]
    async fn pack_post_carries_last_sample() {
        let app = Router::new().route(
            "/fuse/http/device/thing/pack/post",
            post(|Json(body): Json<Value>| async move {
                let osc = &body["params"]["properties"]["Oscilloscope_data"];
                if osc["value"] == 1.5 && osc["time"] == 1_700_000_000_000i64 {
                    Json(json!({"errno":0,"error":"succ"}))
                } else {
                    Json(json!({"errno":1,"error":"wrong body"}))
                }
            }),
        );
        let base = spawn_mock(app).await;
        let sample = TimedValue { value: 1.5, time: 1_700_000_000_000 };
        post_pack(&Client::new(), &test_config(&base), &creds(), sample).await.unwrap();
    }
}
