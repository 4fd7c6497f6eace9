use async_trait::async_trait;

use crate::Result;
use crate::capability::CapabilityProfile;
use crate::types::{GenerationRequest, ImageResult};

/// Pure translator between one wire protocol and the canonical result shape.
/// Adapters hold no per-invocation state; the scheduler decides fan-out and
/// passes the number of images this one call should produce.
#[async_trait]
pub trait ImageAdapter: Send + Sync {
    fn provider(&self) -> &str;

    /// Issues one outbound call for `count` images. The returned length is
    /// authoritative: the scheduler maps results to items by position and
    /// marks unmatched slots itself, so a short response is not an error
    /// here. A response with no extractable image at all is
    /// [`crate::EaselError::NoImageData`].
    async fn invoke(
        &self,
        request: &GenerationRequest,
        profile: &CapabilityProfile,
        count: u32,
    ) -> Result<Vec<ImageResult>>;
}
