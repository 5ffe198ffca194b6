//! Config service: process-wide settings shared by every session.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{parse_args, parse_args_optional, MethodTable, ServiceInterface, ServiceResult};

/// Settings storage shared between all `Config` servants.
pub type SharedSettings = Arc<RwLock<HashMap<String, Value>>>;

/// Stateless settings service. Each session gets its own servant, all of
/// them reading and writing the same [`SharedSettings`].
pub struct ConfigService {
    settings: SharedSettings,
}

impl ConfigService {
    pub fn new(settings: SharedSettings) -> Self {
        Self { settings }
    }

    /// A fresh settings store holding the defaults.
    pub fn shared_defaults() -> SharedSettings {
        Arc::new(RwLock::new(default_settings()))
    }

    fn get(&self, args: Value) -> ServiceResult<Value> {
        let p: ConfigKeyParam = parse_args(args)?;
        let value = self.settings.read().get(&p.key).cloned().unwrap_or(Value::Null);
        Ok(json!({ "value": value }))
    }

    fn set(&self, args: Value) -> ServiceResult<Value> {
        let p: ConfigSetParam = parse_args(args)?;
        debug!("config set {}", p.key);
        self.settings.write().insert(p.key, p.value);
        Ok(json!({ "success": true }))
    }

    fn get_all(&self) -> ServiceResult<Value> {
        let settings = self.settings.read();
        Ok(json!({ "settings": *settings }))
    }

    fn reset(&self, args: Value) -> ServiceResult<Value> {
        let p: ConfigResetParam = parse_args_optional(args)?;
        if let Some(key) = p.key {
            let defaults = default_settings();
            match defaults.get(&key) {
                Some(value) => {
                    self.settings.write().insert(key, value.clone());
                }
                None => {
                    self.settings.write().remove(&key);
                }
            }
        } else {
            *self.settings.write() = default_settings();
        }
        Ok(json!({ "success": true }))
    }
}

impl ServiceInterface for ConfigService {
    const INTERFACE: &'static str = "Config";

    fn method_table() -> &'static MethodTable<Self> {
        static TABLE: OnceLock<MethodTable<ConfigService>> = OnceLock::new();
        TABLE.get_or_init(|| {
            MethodTable::new(Self::INTERFACE)
                .method("get", |svc: Arc<Self>, args| async move { svc.get(args) })
                .method("set", |svc: Arc<Self>, args| async move { svc.set(args) })
                .method("getAll", |svc: Arc<Self>, _args| async move { svc.get_all() })
                .method("reset", |svc: Arc<Self>, args| async move { svc.reset(args) })
        })
    }
}

#[derive(Deserialize)]
struct ConfigKeyParam {
    key: String,
}

#[derive(Deserialize)]
struct ConfigSetParam {
    key: String,
    value: Value,
}

#[derive(Deserialize, Default)]
struct ConfigResetParam {
    key: Option<String>,
}

fn default_settings() -> HashMap<String, Value> {
    let mut s = HashMap::new();
    s.insert("session.keepAliveSeconds".into(), json!(300));
    s.insert("acquire.defaultWaitSeconds".into(), json!(30));
    s.insert("rawFile.maxReadBytes".into(), json!(1_048_576));
    s
}
