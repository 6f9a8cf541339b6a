//! WASM bindings for browser environment
//!
//! This module provides:
//! - StorageBackend implementation over `window.localStorage` (JS imports)
//! - Token and generic secure-store API exposed to JavaScript
//! - Bridge from the browser `storage` event and focus changes to the notifier
//!
//! The page is expected to forward `window.addEventListener("storage", e =>
//! onStorageEvent(e.key, e.newValue))` and `focus` to `onFocus()`.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use wasm_bindgen::prelude::*;

use crate::config::{ApplicationSecret, ConfigError, MissingSecretPolicy, StoreConfig};
use crate::notifier::{ChangeNotifier, ChangeSource, StorageChange};
use crate::secure_store::{SecretStore, SecureStorage, SelfTestProbe};
use crate::storage::{BasicStorage, StorageBackend, StorageError};
use crate::token::{duration_from_millis, Clock, SetTokenOutcome, TokenVault};

// ============================================================
// LOCAL STORAGE BACKEND (JS Imports)
// ============================================================

#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(catch, js_namespace = localStorage, js_name = "getItem")]
    fn js_get_item(key: &str) -> Result<Option<String>, JsValue>;

    #[wasm_bindgen(catch, js_namespace = localStorage, js_name = "setItem")]
    fn js_set_item(key: &str, value: &str) -> Result<(), JsValue>;

    #[wasm_bindgen(catch, js_namespace = localStorage, js_name = "removeItem")]
    fn js_remove_item(key: &str) -> Result<(), JsValue>;

    /// Monotonic; unaffected by wall-clock adjustments
    #[wasm_bindgen(js_namespace = performance, js_name = "now")]
    fn js_performance_now() -> f64;

    /// Log to console (for debugging)
    #[wasm_bindgen(js_namespace = console, js_name = "log")]
    fn js_log(s: &str);
}

/// Public log function for debugging from other modules
pub fn log(s: &str) {
    js_log(s);
}

fn storage_error(error: JsValue) -> StorageError {
    let name = js_sys::Reflect::get(&error, &JsValue::from_str("name"))
        .ok()
        .and_then(|name| name.as_string())
        .unwrap_or_default();
    match name.as_str() {
        "QuotaExceededError" | "NS_ERROR_DOM_QUOTA_REACHED" => StorageError::QuotaExceeded {
            key: String::new(),
        },
        "SecurityError" => StorageError::AccessDenied,
        _ => StorageError::Unavailable(format!("{:?}", error)),
    }
}

/// `window.localStorage` via JS imports
#[derive(Clone, Copy, Default)]
pub struct JsLocalStorage;

impl StorageBackend for JsLocalStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        js_get_item(key).map_err(storage_error)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        js_set_item(key, value).map_err(|e| match storage_error(e) {
            StorageError::QuotaExceeded { .. } => StorageError::QuotaExceeded { key: key.to_string() },
            other => other,
        })
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        js_remove_item(key).map_err(storage_error)
    }
}

/// Clock over `performance.now()`, measured from page load
#[derive(Clone, Copy, Default)]
pub struct JsClock;

impl Clock for JsClock {
    fn now(&self) -> Duration {
        duration_from_millis(js_performance_now())
    }
}

// ============================================================
// GLOBAL RUNTIME
// ============================================================

type JsSecureStorage = Rc<SecureStorage<JsLocalStorage>>;

struct Runtime {
    secure: JsSecureStorage,
    vault: TokenVault<JsSecureStorage, JsClock>,
    notifier: ChangeNotifier,
    plain: BasicStorage<JsLocalStorage>,
    development_secret: bool,
}

thread_local! {
    static RUNTIME: RefCell<Option<Rc<Runtime>>> = RefCell::new(None);
}

fn build_runtime(policy: MissingSecretPolicy) -> Result<Rc<Runtime>, ConfigError> {
    let secret = ApplicationSecret::from_build_env(policy)?;
    let development_secret = secret.is_development();
    if development_secret {
        log("[WASM] No application secret configured; using development secret");
    }

    let config = StoreConfig::new(secret);
    let notifier = ChangeNotifier::new();
    let plain = BasicStorage::with_notifier(JsLocalStorage, notifier.clone());
    let secure = Rc::new(SecureStorage::select(plain.clone(), &config, &SelfTestProbe));
    let vault = TokenVault::with_config(Rc::clone(&secure), JsClock, &config).watching(&notifier);

    log(&format!("[WASM] Secure storage ready (backend: {})", secure.backend().as_str()));
    Ok(Rc::new(Runtime {
        secure,
        vault,
        notifier,
        plain,
        development_secret,
    }))
}

/// Current runtime, created with the default policy on first use
fn runtime() -> Option<Rc<Runtime>> {
    RUNTIME.with(|cell| {
        if let Some(runtime) = cell.borrow().as_ref() {
            return Some(Rc::clone(runtime));
        }
        match build_runtime(MissingSecretPolicy::default()) {
            Ok(runtime) => {
                *cell.borrow_mut() = Some(Rc::clone(&runtime));
                Some(runtime)
            }
            Err(e) => {
                log(&format!("[WASM] Secure storage unavailable: {}", e));
                None
            }
        }
    })
}

// ============================================================
// WASM EXPORTS - LIFECYCLE
// ============================================================

/// Initialize panic hook for better error messages
#[wasm_bindgen(start)]
pub fn init() {
    console_error_panic_hook::set_once();
}

/// Initialize secure storage explicitly
/// With `require_secret`, a missing build-time secret is an error instead
/// of a fallback. Returns false when initialization failed.
#[wasm_bindgen(js_name = "initSecureStorage")]
pub fn init_secure_storage(require_secret: bool) -> bool {
    let policy = if require_secret {
        MissingSecretPolicy::Reject
    } else {
        MissingSecretPolicy::UseDevelopmentSecret
    };
    match build_runtime(policy) {
        Ok(runtime) => {
            RUNTIME.with(|cell| *cell.borrow_mut() = Some(runtime));
            true
        }
        Err(e) => {
            log(&format!("[WASM] Failed to initialize secure storage: {}", e));
            false
        }
    }
}

/// "web-crypto" or "fallback"
#[wasm_bindgen(js_name = "activeBackend")]
pub fn active_backend() -> Option<String> {
    runtime().map(|rt| rt.secure.backend().as_str().to_string())
}

#[wasm_bindgen(js_name = "isUsingDevelopmentSecret")]
pub fn is_using_development_secret() -> bool {
    runtime().is_some_and(|rt| rt.development_secret)
}

// ============================================================
// WASM EXPORTS - TOKEN API
// ============================================================

/// Resolves to the token or null (absent or unreadable)
#[wasm_bindgen(js_name = "getToken")]
pub async fn get_token() -> Result<JsValue, JsValue> {
    let Some(rt) = runtime() else {
        return Ok(JsValue::NULL);
    };
    match rt.vault.get_token().await {
        Ok(Some(token)) => Ok(JsValue::from_str(&token)),
        Ok(None) => Ok(JsValue::NULL),
        Err(e) => {
            log(&format!("[WASM] Failed to read token: {}", e));
            Ok(JsValue::NULL)
        }
    }
}

/// Resolves to "stored", "unchanged", "throttled" or "error"
#[wasm_bindgen(js_name = "setToken")]
pub async fn set_token(value: String) -> Result<JsValue, JsValue> {
    let Some(rt) = runtime() else {
        return Ok(JsValue::from_str("error"));
    };
    let outcome = match rt.vault.set_token(&value).await {
        Ok(SetTokenOutcome::Stored) => "stored",
        Ok(SetTokenOutcome::Unchanged) => "unchanged",
        Ok(SetTokenOutcome::Throttled) => "throttled",
        Err(e) => {
            log(&format!("[WASM] Failed to store token: {}", e));
            "error"
        }
    };
    Ok(JsValue::from_str(outcome))
}

#[wasm_bindgen(js_name = "clearToken")]
pub fn clear_token() {
    if let Some(rt) = runtime() {
        rt.vault.clear_token();
    }
}

// ============================================================
// WASM EXPORTS - GENERIC SECURE STORE
// ============================================================

#[wasm_bindgen(js_name = "secureGet")]
pub async fn secure_get(key: String) -> Result<JsValue, JsValue> {
    let Some(rt) = runtime() else {
        return Ok(JsValue::NULL);
    };
    match rt.secure.secure_get(&key).await {
        Ok(Some(value)) => Ok(JsValue::from_str(&value)),
        Ok(None) => Ok(JsValue::NULL),
        Err(e) => {
            log(&format!("[WASM] Failed to read '{}': {}", key, e));
            Ok(JsValue::NULL)
        }
    }
}

/// Resolves to true when the value was encrypted and persisted
#[wasm_bindgen(js_name = "secureSet")]
pub async fn secure_set(key: String, value: String) -> Result<JsValue, JsValue> {
    let Some(rt) = runtime() else {
        return Ok(JsValue::FALSE);
    };
    match rt.secure.secure_set(&key, &value).await {
        Ok(()) => Ok(JsValue::TRUE),
        Err(e) => {
            log(&format!("[WASM] Failed to store '{}': {}", key, e));
            Ok(JsValue::FALSE)
        }
    }
}

#[wasm_bindgen(js_name = "secureRemove")]
pub fn secure_remove(key: &str) {
    if let Some(rt) = runtime() {
        rt.secure.secure_remove(key);
    }
}

// ============================================================
// WASM EXPORTS - CHANGE NOTIFICATION
// ============================================================

fn source_name(source: ChangeSource) -> &'static str {
    match source {
        ChangeSource::Local => "local",
        ChangeSource::CrossContext => "cross-context",
        ChangeSource::Reconcile => "reconcile",
    }
}

/// Register `callback(key, newValue, source)` for changes to `key`
/// Returns a subscription id, or -1 when storage is unavailable
#[wasm_bindgen(js_name = "subscribe")]
pub fn subscribe(key: &str, callback: js_sys::Function) -> f64 {
    let Some(rt) = runtime() else {
        return -1.0;
    };
    let initial = rt.plain.get(key);
    let id = rt.notifier.subscribe_with_initial(key, initial, move |change| {
        let value = change
            .new_value
            .as_deref()
            .map_or(JsValue::NULL, JsValue::from_str);
        if let Err(e) = callback.call3(
            &JsValue::NULL,
            &JsValue::from_str(&change.key),
            &value,
            &JsValue::from_str(source_name(change.source)),
        ) {
            log(&format!("[WASM] Subscriber threw: {:?}", e));
        }
    });
    id as f64
}

#[wasm_bindgen(js_name = "unsubscribe")]
pub fn unsubscribe(id: f64) -> bool {
    if id < 0.0 {
        return false;
    }
    runtime().is_some_and(|rt| rt.notifier.unsubscribe(id as u64))
}

/// Forward of the browser `storage` event (fired for other tabs' writes)
/// A null key means the whole store was cleared.
#[wasm_bindgen(js_name = "onStorageEvent")]
pub fn on_storage_event(key: Option<String>, new_value: Option<String>) {
    let Some(rt) = runtime() else {
        return;
    };
    match key {
        Some(key) => rt
            .notifier
            .dispatch_external(StorageChange::new(key, new_value, ChangeSource::CrossContext)),
        None => rt.notifier.reconcile(&rt.plain),
    }
}

/// Re-read subscribed keys after the tab regains focus
#[wasm_bindgen(js_name = "onFocus")]
pub fn on_focus() {
    if let Some(rt) = runtime() {
        rt.notifier.reconcile(&rt.plain);
    }
}
