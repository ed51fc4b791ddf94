use coreswitch_core::{
    ControlSurface, CoreRegistry, ExternalCore, PacketEngine, ProcessEngine, Settings, TunnelService, VpnBridge,
};
use std::sync::Arc;
use tracing::info;

/// Registry with the tunnel core first, plus the external engine core when enabled
pub fn build_registry(settings: &Settings) -> CoreRegistry {
    let registry = CoreRegistry::new();
    registry.register(Arc::new(TunnelService::new(settings.probe.clone())));

    let external = &settings.external;
    if external.enabled {
        let core = ExternalCore::new(
            external.name.clone(),
            Arc::new(ProcessEngine::from_settings(external)),
            settings.probe.clone(),
            external.maintenance_interval(),
        )
        .with_policy(external.policy);
        registry.register(Arc::new(core));
        info!(core = %external.name, program = %external.program, "external core registered");
    }
    registry
}

pub fn build_control_surface(settings: &Settings, packets: Arc<dyn PacketEngine>) -> Arc<ControlSurface> {
    let registry = Arc::new(build_registry(settings));
    let vpn = Arc::new(VpnBridge::new(packets, settings.vpn.clone()));
    Arc::new(ControlSurface::new(registry, vpn))
}
