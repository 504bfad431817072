use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CredentialError, StoreError};
use crate::storage::{KvStore, Namespace};

pub const NAMESPACE: &str = "cloud_mgr";

const KEY_ACTIVATED: &str = "activated";
const KEY_DEVICE_CODE: &str = "dev_code";
const KEY_DEVICE_NAME: &str = "dev_name";
const KEY_DEVICE_ID: &str = "dev_id";
const KEY_PRODUCT_ID: &str = "prod_id";
const KEY_SEC_KEY: &str = "sec_key";
const KEY_ACTIVATION_TIME: &str = "act_time";
const KEY_LONGITUDE: &str = "longitude";
const KEY_LATITUDE: &str = "latitude";
const KEY_LOCATION: &str = "location";
const KEY_DEVICE_INDEX: &str = "dev_index";

pub const DEVICE_NAME_PREFIX: &str = "ExDebugTool_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ActivationState {
    #[default]
    NotActivated,
    Activating,
    Activated,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceIdentity {
    pub device_code: String,
    pub device_id: String,
    pub product_id: String,
    pub device_name: String,
    pub secret_key: String,
    pub state: ActivationState,
    pub activation_time: Option<DateTime<Utc>>,
    pub longitude: f64,
    pub latitude: f64,
    pub location_name: String,
}

impl DeviceIdentity {
    pub fn is_activated(&self) -> bool {
        self.state == ActivationState::Activated
    }

    /// True unless the record is activated and carries a secret key.
    pub fn needs_activation(&self) -> bool {
        !self.is_activated() || self.secret_key.is_empty()
    }

    /// Marks the identity activated with the values returned by registration.
    /// The device code becomes the device name, or the id when no name came back.
    pub fn activate(
        &mut self,
        device_id: &str,
        product_id: &str,
        device_name: &str,
        secret_key: &str,
        at: DateTime<Utc>,
    ) {
        self.device_id = device_id.to_string();
        self.product_id = product_id.to_string();
        if !device_name.is_empty() {
            self.device_name = device_name.to_string();
        }
        self.secret_key = secret_key.to_string();
        self.device_code = if self.device_name.is_empty() {
            device_id.to_string()
        } else {
            self.device_name.clone()
        };
        self.state = ActivationState::Activated;
        self.activation_time = Some(at);
    }

    /// Credentials for device-level calls. `fallback_product_id` fills in a
    /// record saved without a product id.
    pub fn credentials(&self, fallback_product_id: &str) -> Result<DeviceCredentials, CredentialError> {
        if !self.is_activated() {
            return Err(CredentialError::NotActivated);
        }
        if self.secret_key.is_empty() {
            return Err(CredentialError::MissingSecret);
        }
        let product_id = if self.product_id.is_empty() {
            fallback_product_id.to_string()
        } else {
            self.product_id.clone()
        };
        Ok(DeviceCredentials {
            product_id,
            device_name: self.device_name.clone(),
            secret_key: self.secret_key.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub product_id: String,
    pub device_name: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub longitude: f64,
    pub latitude: f64,
    pub name: String,
}

/// Persists the single device identity record, one key per field.
#[derive(Clone)]
pub struct CredentialStore {
    kv: Arc<KvStore>,
}

impl CredentialStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        CredentialStore { kv }
    }

    fn ns(&self) -> Namespace<'_> {
        self.kv.namespace(NAMESPACE)
    }

    /// Returns `None` when no activated record is stored.
    pub fn load(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        let ns = self.ns();
        if !ns.get_bool(KEY_ACTIVATED)?.unwrap_or(false) {
            return Ok(None);
        }

        let mut identity = DeviceIdentity {
            device_code: ns.get_str(KEY_DEVICE_CODE)?.unwrap_or_default(),
            device_id: ns.get_str(KEY_DEVICE_ID)?.unwrap_or_default(),
            product_id: ns.get_str(KEY_PRODUCT_ID)?.unwrap_or_default(),
            device_name: ns.get_str(KEY_DEVICE_NAME)?.unwrap_or_default(),
            secret_key: ns.get_str(KEY_SEC_KEY)?.unwrap_or_default(),
            state: ActivationState::Activated,
            activation_time: ns
                .get_i64(KEY_ACTIVATION_TIME)?
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            ..DeviceIdentity::default()
        };
        if let Some(location) = self.load_location()? {
            identity.longitude = location.longitude;
            identity.latitude = location.latitude;
            identity.location_name = location.name;
        }

        if identity.secret_key.is_empty() {
            warn!(device_name = %identity.device_name, "Activated record has no secret key");
        }
        Ok(Some(identity))
    }

    pub fn save(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        let ns = self.ns();
        ns.set_bool(KEY_ACTIVATED, identity.is_activated())?;
        ns.set_str(KEY_DEVICE_CODE, &identity.device_code)?;
        ns.set_str(KEY_DEVICE_NAME, &identity.device_name)?;
        ns.set_str(KEY_DEVICE_ID, &identity.device_id)?;
        ns.set_str(KEY_PRODUCT_ID, &identity.product_id)?;
        ns.set_str(KEY_SEC_KEY, &identity.secret_key)?;
        if let Some(at) = identity.activation_time {
            ns.set_i64(KEY_ACTIVATION_TIME, at.timestamp())?;
        }
        self.save_location(&Location {
            longitude: identity.longitude,
            latitude: identity.latitude,
            name: identity.location_name.clone(),
        })?;
        info!(
            device_id = %identity.device_id,
            device_name = %identity.device_name,
            sec_key_len = identity.secret_key.len(),
            "Saved device identity"
        );
        Ok(())
    }

    /// Removes the activation keys. Location, settings and counters stay.
    pub fn clear(&self) -> Result<(), StoreError> {
        let ns = self.ns();
        ns.set_bool(KEY_ACTIVATED, false)?;
        for key in [
            KEY_DEVICE_CODE,
            KEY_DEVICE_NAME,
            KEY_DEVICE_ID,
            KEY_PRODUCT_ID,
            KEY_SEC_KEY,
            KEY_ACTIVATION_TIME,
        ] {
            ns.erase(key)?;
        }
        info!("Cleared device activation");
        Ok(())
    }

    pub fn load_location(&self) -> Result<Option<Location>, StoreError> {
        let ns = self.ns();
        match (ns.get_f64(KEY_LONGITUDE)?, ns.get_f64(KEY_LATITUDE)?) {
            (Some(longitude), Some(latitude)) => Ok(Some(Location {
                longitude,
                latitude,
                name: ns.get_str(KEY_LOCATION)?.unwrap_or_default(),
            })),
            _ => Ok(None),
        }
    }

    pub fn save_location(&self, location: &Location) -> Result<(), StoreError> {
        let ns = self.ns();
        ns.set_f64(KEY_LONGITUDE, location.longitude)?;
        ns.set_f64(KEY_LATITUDE, location.latitude)?;
        ns.set_str(KEY_LOCATION, &location.name)?;
        Ok(())
    }

    /// Bumps the durable name counter and returns the new value. The first
    /// call on a fresh store returns 1.
    pub fn next_device_index(&self) -> Result<u32, StoreError> {
        let ns = self.ns();
        let next = ns.get_u32(KEY_DEVICE_INDEX)?.unwrap_or(0).wrapping_add(1).max(1);
        ns.set_u32(KEY_DEVICE_INDEX, next)?;
        Ok(next)
    }

    pub fn next_device_name(&self) -> Result<String, StoreError> {
        Ok(format!("{}{}", DEVICE_NAME_PREFIX, self.next_device_index()?))
    }
}

/// `DVC-XXXXXXXX`: the low MAC bytes mixed with a random word.
pub fn generate_device_code(mac: Option<[u8; 6]>) -> String {
    let mut rng = rand::thread_rng();
    let mac = mac.unwrap_or_else(|| rng.gen());
    let r: u32 = rng.gen();
    format!(
        "DVC-{:02X}{:02X}{:02X}{:02X}",
        mac[4] ^ (r >> 24) as u8,
        mac[5] ^ (r >> 16) as u8,
        (r >> 8) as u8,
        r as u8
    )
}

/// Parses `aa:bb:cc:dd:ee:ff` (or `-` separated).
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = s.split(|c| c == ':' || c == '-');
    for byte in out.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CredentialStore {
        CredentialStore::new(Arc::new(KvStore::open_in_memory().unwrap()))
    }

    fn activated_identity() -> DeviceIdentity {
        let mut identity = DeviceIdentity {
            longitude: 116.397128,
            latitude: 39.916527,
            location_name: "Beijing".to_string(),
            ..Default::default()
        };
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        identity.activate("123", "FCwDzD6VU0", "ExDebugTool_1", "c2VjcmV0", at);
        identity
    }

    #[test]
    fn fresh_store_is_not_activated() {
        assert_eq!(store().load().unwrap(), None);
    }

    #[test]
    fn save_then_load_round_trips() {
        let store = store();
        let identity = activated_identity();
        store.save(&identity).unwrap();
        assert_eq!(store.load().unwrap(), Some(identity));
    }

    #[test]
    fn clear_drops_activation_but_keeps_location_and_counter() {
        let store = store();
        store.save(&activated_identity()).unwrap();
        store.next_device_index().unwrap();
        store.clear().unwrap();

        assert_eq!(store.load().unwrap(), None);
        assert_eq!(store.load_location().unwrap().unwrap().name, "Beijing");
        assert_eq!(store.next_device_index().unwrap(), 2);
    }

    #[test]
    fn device_names_never_repeat() {
        let store = store();
        assert_eq!(store.next_device_name().unwrap(), "ExDebugTool_1");
        assert_eq!(store.next_device_name().unwrap(), "ExDebugTool_2");
        assert_eq!(store.next_device_name().unwrap(), "ExDebugTool_3");
    }

    #[test]
    fn credentials_require_activation_and_secret() {
        let mut identity = DeviceIdentity::default();
        assert!(matches!(identity.credentials("P"), Err(CredentialError::NotActivated)));

        identity = activated_identity();
        identity.product_id.clear();
        let creds = identity.credentials("P").unwrap();
        assert_eq!(creds.product_id, "P");
        assert_eq!(creds.device_name, "ExDebugTool_1");

        identity.secret_key.clear();
        assert!(identity.needs_activation());
        assert!(matches!(identity.credentials("P"), Err(CredentialError::MissingSecret)));
    }

    #[test]
    fn empty_secret_is_loaded_but_unusable() {
        let store = store();
        let mut identity = activated_identity();
        identity.secret_key.clear();
        store.save(&identity).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert!(loaded.is_activated());
        assert!(loaded.needs_activation());
    }

    #[test]
    fn activation_uses_id_as_code_without_name() {
        let mut identity = DeviceIdentity::default();
        identity.activate("987", "P", "", "c2VjcmV0", Utc::now());
        assert_eq!(identity.device_code, "987");
    }

    #[test]
    fn device_code_format() {
        let code = generate_device_code(parse_mac("24:0a:c4:12:34:56"));
        assert_eq!(code.len(), 12);
        assert!(code.starts_with("DVC-"));
        assert!(code[4..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_eq!(generate_device_code(None).len(), 12);
    }

    #[test]
    fn mac_parsing() {
        assert_eq!(parse_mac("24-0A-C4-12-34-56"), Some([0x24, 0x0a, 0xc4, 0x12, 0x34, 0x56]));
        assert_eq!(parse_mac("24:0a:c4"), None);
        assert_eq!(parse_mac("24:0a:c4:12:34:56:78"), None);
    }
}
