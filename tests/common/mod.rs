#![allow(dead_code)]
//! Shared integration test utilities.

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::Mutex;
use tcpmgr::config::ManagerConfig;
use tcpmgr::{ConnectionIdentity, ConnectionManager, DataArrived};

static INIT_LOGGING: Once = Once::new();

/// Upper bound for anything a test waits on
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Route tracing output through the test harness (RUST_LOG selects the level)
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Manager settings with short poll intervals so loops notice cancellation quickly
pub fn fast_config() -> ManagerConfig {
    ManagerConfig {
        poll_interval: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_secs(5),
        ..ManagerConfig::default()
    }
}

pub fn new_manager() -> ConnectionManager {
    init_test_logging();
    ConnectionManager::new(fast_config()).expect("manager inside runtime")
}

/// Poll `condition` until it holds or `WAIT_TIMEOUT` expires
pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Await `fut`, failing the test if it takes longer than `WAIT_TIMEOUT`
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT_TIMEOUT, fut)
        .await
        .expect("operation timed out")
}

/// Thread-safe list of identities collected from an event
#[derive(Clone, Default)]
pub struct IdentityLog(Arc<Mutex<Vec<ConnectionIdentity>>>);

impl IdentityLog {
    pub fn recorder(&self) -> impl Fn(&ConnectionIdentity) + Send + Sync + 'static {
        let log = Arc::clone(&self.0);
        move |identity| log.lock().push(identity.clone())
    }

    pub fn snapshot(&self) -> Vec<ConnectionIdentity> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn count_of(&self, identity: &ConnectionIdentity) -> usize {
        self.0.lock().iter().filter(|seen| *seen == identity).count()
    }
}

/// Bytes and event count collected from data-arrived events
#[derive(Clone, Default)]
pub struct DataLog {
    bytes: Arc<Mutex<Vec<u8>>>,
    events: Arc<Mutex<usize>>,
}

impl DataLog {
    pub fn recorder(&self) -> impl Fn(&DataArrived) + Send + Sync + 'static {
        let bytes = Arc::clone(&self.bytes);
        let events = Arc::clone(&self.events);
        move |event| {
            bytes.lock().extend_from_slice(&event.bytes);
            *events.lock() += 1;
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    pub fn byte_count(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn events(&self) -> usize {
        *self.events.lock()
    }
}
