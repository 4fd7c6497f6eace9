pub mod adapter;
pub mod cache;
pub mod capability;
mod error;
pub mod lifecycle;
pub mod providers;
pub mod scheduler;
pub mod types;
pub mod utils;

pub use adapter::ImageAdapter;
pub use cache::{CacheEntryStats, CacheKey, CacheStats, ConversionCache, ConversionCacheConfig};
pub use capability::{CapabilityProfile, builtin_profiles};
pub use error::{EaselError, ErrorKind, Result};
pub use lifecycle::{
    InMemoryTransientStore, LifecycleConfig, LifecycleManager, TransientHandle, TransientStore,
};
pub use scheduler::{
    DEFAULT_MAX_IN_FLIGHT, GenerationScheduler, SchedulerBuilder, SchedulerConfig,
};
pub use types::{
    GenerationItem, GenerationRequest, GenerationStatus, ImageOptions, ImagePayload, ImageResult,
};
pub use utils::RetryPolicy;

#[cfg(feature = "provider-chat")]
pub use providers::ChatImages;
#[cfg(feature = "provider-rest")]
pub use providers::RestImages;
