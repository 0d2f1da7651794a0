pub mod adapters;
pub mod config;
pub mod error;
pub mod mesh;
pub mod store;
pub mod types;

pub use adapters::{
    BatteryProvider, Clock, CloudResponse, CloudSink, FixedBattery, FixedLocation, GeoFix,
    HttpCloudSink, HttpProbeTransport, InboundFrame, LinkLayer, LocationProvider, ManualClock,
    ProbeTransport, Storage, StoreKind, SystemClock,
};
pub use config::EngineConfig;
pub use error::{CloudError, DecodeError, EngineError, LinkError, PacketError, StorageError};
pub use mesh::{EngineAdapters, MeshEngine};
pub use store::{MemoryStorage, SledStorage};
pub use types::*;
