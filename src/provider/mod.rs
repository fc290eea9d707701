//! Provider capabilities, the registry, and runtime selection.

pub mod descriptor;
pub mod registry;
pub mod selector;

pub use descriptor::{LatencyClass, ProviderDescriptor, ProviderId};
pub use registry::ProviderRegistry;
pub use selector::{
    ActiveProvider, AlwaysOnline, ConnectivityProbe, ManualConnectivity, ProviderSelection, ProviderSelector,
    SelectorState,
};

/// The adapter contract every provider implements.
pub use crate::storage::traits::{PushStore, RecordStore};
