use axum::Router;
use tokio::net::TcpListener;

use crate::config::Config;

/// Serves `app` on an ephemeral localhost port and returns its base URL.
pub async fn spawn_mock(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Both OneNET hosts pointed at `base`, known-good keys, no drain delays and
/// an ephemeral activation port.
pub fn test_config(base: &str) -> Config {
    let mut config = Config {
        api_base_url: base.to_string(),
        device_api_base_url: base.to_string(),
        product_access_key: "74ttu7Ofi9n3Z7dfT6dfkctJR8E3xyVxFXdX71/Hs4k=".to_string(),
        user_id: "420568".to_string(),
        user_access_key: "c2VjcmV0".to_string(),
        mac_address: Some("02:00:00:00:00:01".to_string()),
        ..Config::default()
    };
    config.activation = config.activation.without_drain();
    config.activation.http_bind = "127.0.0.1".to_string();
    config.activation.http_port = 0;
    config
}
