pub mod device_registry;
pub mod midi_router;
pub mod route_manager;
pub mod routing_table;

pub use device_registry::{DeviceKind, DeviceRecord, DeviceRegistry};
pub use midi_router::{LocalPort, MidiRouter, PeerDirectory, RouterState};
pub use route_manager::{ForwardingRule, NewRule, RouteManager, RuleStats};
pub use routing_table::{Route, RoutingTable};
