//! Single-slot bridge to the packet-routing (tun-to-socks) engine

use crate::config::VpnSettings;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// What the packet engine is told to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketEngineKey {
    /// `fd://<n>`
    pub device: String,
    /// `socks5://<host:port>`
    pub proxy: String,
    pub mtu: u32,
    pub log_level: String,
}

impl PacketEngineKey {
    pub fn new(device_fd: i32, proxy_address: &str, settings: &VpnSettings) -> Self {
        Self {
            device: format!("fd://{}", device_fd),
            proxy: format!("socks5://{}", proxy_address),
            mtu: settings.mtu,
            log_level: settings.log_level.clone(),
        }
    }
}

/// External packet-routing engine. `stop` must tolerate being called when
/// nothing is running.
pub trait PacketEngine: Send + Sync {
    fn start(&self, key: &PacketEngineKey) -> Result<()>;

    fn stop(&self);
}

/// Stand-in for builds without a linked packet engine
#[derive(Debug, Default)]
pub struct UnlinkedPacketEngine;

impl PacketEngine for UnlinkedPacketEngine {
    fn start(&self, _key: &PacketEngineKey) -> Result<()> {
        Err(Error::UnsupportedNetwork("no packet-routing engine is linked into this build".to_string()))
    }

    fn stop(&self) {}
}

#[derive(Debug, Default)]
struct VpnSlot {
    started: bool,
    key: Option<PacketEngineKey>,
}

pub struct VpnBridge {
    engine: Arc<dyn PacketEngine>,
    settings: VpnSettings,
    slot: Mutex<VpnSlot>,
}

impl VpnBridge {
    pub fn new(engine: Arc<dyn PacketEngine>, settings: VpnSettings) -> Self {
        Self {
            engine,
            settings,
            slot: Mutex::new(VpnSlot::default()),
        }
    }

    /// Route the device's traffic to the SOCKS5 endpoint at `proxy_address`
    pub fn start(&self, device_fd: i32, proxy_address: &str) -> Result<()> {
        let mut slot = self.slot.lock();
        if slot.started {
            return Err(Error::AlreadyStarted);
        }

        let key = PacketEngineKey::new(device_fd, proxy_address, &self.settings);
        self.engine.start(&key)?;
        info!(device = %key.device, proxy = %key.proxy, mtu = key.mtu, "packet engine started");

        slot.started = true;
        slot.key = Some(key);
        Ok(())
    }

    /// Tear down unconditionally and reset the slot
    pub fn stop(&self) {
        let mut slot = self.slot.lock();
        self.engine.stop();
        if slot.started {
            info!("packet engine stopped");
        }
        *slot = VpnSlot::default();
    }

    pub fn is_started(&self) -> bool {
        self.slot.lock().started
    }

    pub fn current_key(&self) -> Option<PacketEngineKey> {
        self.slot.lock().key.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingEngine {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl PacketEngine for CountingEngine {
        fn start(&self, _key: &PacketEngineKey) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn second_start_is_rejected_until_stop() {
        let engine = Arc::new(CountingEngine::default());
        let bridge = VpnBridge::new(engine.clone(), VpnSettings::default());

        bridge.start(7, "127.0.0.1:1080").unwrap();
        assert!(matches!(bridge.start(7, "127.0.0.1:1080"), Err(Error::AlreadyStarted)));

        bridge.stop();
        assert!(!bridge.is_started());
        bridge.start(8, "127.0.0.1:1081").unwrap();
        assert_eq!(engine.starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn key_describes_device_and_proxy() {
        let bridge = VpnBridge::new(Arc::new(CountingEngine::default()), VpnSettings::default());
        bridge.start(42, "127.0.0.1:2080").unwrap();

        let key = bridge.current_key().unwrap();
        assert_eq!(key.device, "fd://42");
        assert_eq!(key.proxy, "socks5://127.0.0.1:2080");
        assert_eq!(key.mtu, 1500);
        assert_eq!(key.log_level, "info");
    }

    #[test]
    fn stop_without_start_is_safe() {
        let engine = Arc::new(CountingEngine::default());
        let bridge = VpnBridge::new(engine.clone(), VpnSettings::default());
        bridge.stop();
        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
        assert!(bridge.current_key().is_none());
    }

    #[test]
    fn engine_failure_leaves_slot_free() {
        let bridge = VpnBridge::new(Arc::new(UnlinkedPacketEngine), VpnSettings::default());
        assert!(matches!(bridge.start(3, "127.0.0.1:1080"), Err(Error::UnsupportedNetwork(_))));
        assert!(!bridge.is_started());
    }
}
