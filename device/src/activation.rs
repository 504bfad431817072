use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ActivationConfig, Config};
use crate::credentials::{CredentialStore, DeviceIdentity};
use crate::error::ActivationError;
use crate::net;
use crate::types::{ActivateRequest, ActivateResponse, CreateDeviceRequest};

const SERVER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates a device on OneNET under the next counter name and persists the
/// activated identity. `base` supplies the location and any fields that
/// survive activation.
pub async fn register_device(
    client: &Client,
    config: &Config,
    store: &CredentialStore,
    base: &DeviceIdentity,
) -> Result<DeviceIdentity, ActivationError> {
    let device_name = store.next_device_name()?;
    let request = CreateDeviceRequest {
        product_id: config.product_id.clone(),
        device_name: device_name.clone(),
        desc: config.device_desc.clone(),
        lon: format!("{:.6}", base.longitude),
        lat: format!("{:.6}", base.latitude),
    };

    let created = net::create_device(client, config, &request).await?;
    let sec_key = created
        .sec_key
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ActivationError::Registration("no sec_key in response".to_string()))?;

    let mut identity = base.clone();
    identity.activate(
        &created.did,
        created.pid.as_deref().unwrap_or(&config.product_id),
        created.name.as_deref().unwrap_or(&device_name),
        &sec_key,
        Utc::now(),
    );
    store.save(&identity)?;
    info!(device_id = %identity.device_id, device_name = %identity.device_name, "Device registered");
    Ok(identity)
}

/// The local WiFi access point a phone joins during activation.
pub trait AccessPoint: Send + Sync {
    /// Brings the access point up and returns its gateway address.
    fn start(&self, settings: &ActivationConfig) -> Result<String, ActivationError>;

    /// Takes the access point down and restores station mode.
    fn stop(&self) -> Result<(), ActivationError>;
}

/// Host builds have no radio; the activation page is served on the bind
/// address and the configured gateway is reported as-is.
#[derive(Debug, Default)]
pub struct HostAccessPoint;

impl AccessPoint for HostAccessPoint {
    fn start(&self, settings: &ActivationConfig) -> Result<String, ActivationError> {
        info!(
            ssid = %settings.ap_ssid,
            channel = settings.ap_channel,
            max_clients = settings.ap_max_clients,
            "Access point up"
        );
        Ok(settings.ap_gateway.clone())
    }

    fn stop(&self) -> Result<(), ActivationError> {
        info!("Access point down, station mode restored");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ActivationStatus {
    #[default]
    Idle,
    ApStarted,
    ClientConnected,
    Registering,
    Success,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct ActivationProgress {
    pub status: ActivationStatus,
    pub identity: Option<DeviceIdentity>,
    pub error: Option<String>,
}

struct ServerContext {
    client: Client,
    config: Arc<Config>,
    store: CredentialStore,
    base: Mutex<DeviceIdentity>,
    accepting: AtomicBool,
    registering: tokio::sync::Mutex<()>,
    progress: watch::Sender<ActivationProgress>,
}

impl ServerContext {
    fn set_status(&self, status: ActivationStatus) {
        self.progress.send_modify(|p| p.status = status);
    }

    fn base(&self) -> DeviceIdentity {
        self.base.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct Running {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<std::io::Result<()>>,
}

/// Where a started activation server can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub gateway: String,
    pub local_addr: SocketAddr,
}

/// SoftAP activation: an access point plus a one-page HTTP server whose
/// `POST /activate` registers the device.
pub struct ActivationServer<A: AccessPoint = HostAccessPoint> {
    ctx: Arc<ServerContext>,
    access_point: A,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<A: AccessPoint> ActivationServer<A> {
    pub fn new(client: Client, config: Arc<Config>, store: CredentialStore, access_point: A) -> Self {
        let (progress, _) = watch::channel(ActivationProgress::default());
        ActivationServer {
            ctx: Arc::new(ServerContext {
                client,
                config,
                store,
                base: Mutex::new(DeviceIdentity::default()),
                accepting: AtomicBool::new(false),
                registering: tokio::sync::Mutex::new(()),
                progress,
            }),
            access_point,
            lifecycle: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the HTTP server is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> ActivationStatus {
        self.ctx.progress.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<ActivationProgress> {
        self.ctx.progress.subscribe()
    }

    /// Brings up the access point and the HTTP server. `base` is the
    /// identity registration starts from; its device code is shown on the page.
    pub async fn start(&self, base: DeviceIdentity) -> Result<ServerInfo, ActivationError> {
        let mut lifecycle = self
            .lifecycle
            .try_lock()
            .map_err(|_| ActivationError::OperationInProgress)?;
        if lifecycle.is_some() {
            return Err(ActivationError::AlreadyRunning);
        }

        let settings = &self.ctx.config.activation;
        let gateway = self.access_point.start(settings)?;
        let listener = match TcpListener::bind(format!("{}:{}", settings.http_bind, settings.http_port)).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "Activation server bind failed");
                if let Err(e) = self.access_point.stop() {
                    warn!(error = %e, "Access point stop failed");
                }
                return Err(ActivationError::Bind(e));
            }
        };
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);

        *self.ctx.base.lock().unwrap_or_else(PoisonError::into_inner) = base;
        self.ctx.progress.send_replace(ActivationProgress {
            status: ActivationStatus::ApStarted,
            ..ActivationProgress::default()
        });
        self.ctx.accepting.store(true, Ordering::SeqCst);

        let app = router(self.ctx.clone());
        let (shutdown, signal) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                })
                .await
        });

        *lifecycle = Some(Running { shutdown, handle });
        self.running.store(true, Ordering::SeqCst);
        info!(%gateway, %local_addr, "Activation server started");
        Ok(ServerInfo { gateway, local_addr })
    }

    /// Stops accepting, drains, stops the HTTP server, then the access point.
    /// Each step waits out its configured drain delay before the next.
    pub async fn stop(&self) -> Result<(), ActivationError> {
        let mut lifecycle = self
            .lifecycle
            .try_lock()
            .map_err(|_| ActivationError::OperationInProgress)?;
        let Some(running) = lifecycle.take() else {
            return Ok(());
        };
        let settings = &self.ctx.config.activation;

        info!("Stopping activation server");
        self.ctx.accepting.store(false, Ordering::SeqCst);
        tokio::time::sleep(settings.drain_in_flight()).await;

        let _ = running.shutdown.send(());
        let mut handle = running.handle;
        match tokio::time::timeout(SERVER_JOIN_TIMEOUT, &mut handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "Activation server exited with error"),
            Ok(Err(e)) => warn!(error = %e, "Activation server task failed"),
            Err(_) => {
                warn!("Activation server did not drain in time, aborting");
                handle.abort();
            }
        }
        tokio::time::sleep(settings.drain_server()).await;

        if let Err(e) = self.access_point.stop() {
            warn!(error = %e, "Access point stop failed");
        }
        tokio::time::sleep(settings.drain_wifi()).await;

        self.running.store(false, Ordering::SeqCst);
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.ctx.set_status(ActivationStatus::Idle);
        info!("Activation server stopped");
        Ok(())
    }

    /// Resolves once a registration through the page has succeeded. Failed
    /// attempts leave the page up for another try.
    pub async fn wait_for_completion(&self) -> Result<DeviceIdentity, ActivationError> {
        let mut rx = self.ctx.progress.subscribe();
        let progress = rx
            .wait_for(|p| p.status == ActivationStatus::Success && p.identity.is_some())
            .await
            .map_err(|_| ActivationError::Aborted)?;
        progress.identity.clone().ok_or(ActivationError::Aborted)
    }
}

fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/activate", post(activate))
        .with_state(ctx)
}

fn stopping() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ActivateResponse::err("activation server is stopping")),
    )
        .into_response()
}

async fn index(State(ctx): State<Arc<ServerContext>>) -> Response {
    if !ctx.accepting.load(Ordering::SeqCst) {
        return stopping();
    }
    ctx.progress.send_if_modified(|p| {
        if p.status == ActivationStatus::ApStarted {
            p.status = ActivationStatus::ClientConnected;
            true
        } else {
            false
        }
    });
    let base = ctx.base();
    Html(render_page(&ctx.config.product_id, &base.device_code)).into_response()
}

async fn activate(State(ctx): State<Arc<ServerContext>>, body: Bytes) -> Response {
    if !ctx.accepting.load(Ordering::SeqCst) {
        return stopping();
    }
    // The page posts `{}`; anything unparseable counts as empty.
    let request: ActivateRequest = serde_json::from_slice(&body).unwrap_or_default();
    if let Some(code) = &request.device_code {
        debug!(device_code = %code, "Activation requested for device code");
    }

    let _registering = ctx.registering.lock().await;
    let done = ctx.progress.borrow().identity.clone();
    if let Some(done) = done {
        return Json(ActivateResponse::ok(&done.product_id, &done.device_id, &done.device_name)).into_response();
    }

    info!("Activation request received");
    ctx.set_status(ActivationStatus::Registering);
    match register_device(&ctx.client, &ctx.config, &ctx.store, &ctx.base()).await {
        Ok(identity) => {
            let reply = ActivateResponse::ok(&identity.product_id, &identity.device_id, &identity.device_name);
            ctx.progress.send_modify(|p| {
                p.status = ActivationStatus::Success;
                p.identity = Some(identity);
                p.error = None;
            });
            Json(reply).into_response()
        }
        Err(e) => {
            let msg = e.to_string();
            error!(error = %msg, "Activation failed");
            ctx.progress.send_modify(|p| {
                p.status = ActivationStatus::Failed;
                p.error = Some(msg.clone());
            });
            Json(ActivateResponse::err(msg)).into_response()
        }
    }
}

fn render_page(product_id: &str, device_code: &str) -> String {
    ACTIVATION_PAGE
        .replace("{{product_id}}", product_id)
        .replace("{{device_code}}", device_code)
}

const ACTIVATION_PAGE: &str = r#"<!DOCTYPE html>
<html><head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width,initial-scale=1.0">
<title>ExDebugTool Activation</title>
<style>
*{margin:0;padding:0;box-sizing:border-box}
body{font-family:sans-serif;background:#e0f7fa;min-height:100vh;display:flex;align-items:center;justify-content:center;padding:20px}
.card{background:#fff;border-radius:16px;padding:24px;max-width:360px;width:100%}
h1{color:#0288d1;font-size:22px;text-align:center}
.row{display:flex;justify-content:space-between;padding:6px 0;font-size:13px}
.row span{font-family:monospace;font-weight:600}
button{width:100%;padding:14px;margin-top:12px;background:#0288d1;color:#fff;border:none;border-radius:10px;font-size:15px}
button:disabled{background:#ccc}
#status{margin-top:12px;text-align:center;font-size:13px}
</style>
</head><body>
<div class="card">
<h1>ExDebugTool</h1>
<div class="row"><label>Product ID</label><span>{{product_id}}</span></div>
<div class="row"><label>Device Code</label><span>{{device_code}}</span></div>
<button id="btn" onclick="activate()">Activate Device</button>
<div id="status"></div>
<div id="result" hidden>
<div class="row"><label>Device ID</label><span id="rid">-</span></div>
<div class="row"><label>Device Name</label><span id="rname">-</span></div>
</div>
</div>
<script>
var btn=document.getElementById('btn'),st=document.getElementById('status');
async function activate(){
btn.disabled=true;btn.textContent='Activating...';st.textContent='Registering device on OneNET...';
try{
var r=await fetch('/activate',{method:'POST',headers:{'Content-Type':'application/json'},body:'{}'});
var d=await r.json();
if(d.success){
st.textContent='Device activated successfully!';
document.getElementById('rid').textContent=d.device_id;
document.getElementById('rname').textContent=d.device_name;
document.getElementById('result').hidden=false;
btn.textContent='Activated!';
}else{st.textContent='Error: '+d.error;btn.disabled=false;btn.textContent='Retry';}
}catch(e){st.textContent='Network Error: '+e.message;btn.disabled=false;btn.textContent='Retry';}
}
</script>
</body></html>
"#;
