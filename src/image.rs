//! # Image Adapter
//!
//! Typed facade over the CRI image service.
//!
//! | CRI ImageService | ImageClient |
//! |------------------|-------------|
//! | `PullImage`      | [`ImageClient::pull_image`] |
//! | `ImageStatus`    | [`ImageClient::image_status`] |
//! | `ListImages`     | [`ImageClient::list_images`] |
//! | `RemoveImage`    | [`ImageClient::remove_image`] |
//!
//! Removal is idempotent: a missing image is skipped, and a `NotFound` from
//! a racing remover counts as success. The `expect_*` helpers check the
//! identity invariants a conformant runtime must uphold after a pull.

use crate::constants::{DEFAULT_CALL_TIMEOUT, IMAGE_PULL_TIMEOUT};
use crate::cri::{
    bounded_call, Image, ImageFilter, ImageService, ImageSpec, ImageStatusRequest,
    ListImagesRequest, PullImageRequest, RemoveImageRequest,
};
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// =============================================================================
// References
// =============================================================================

/// Returns true if the reference carries a tag or a digest.
///
/// A colon only counts as a tag separator in the last path component, so
/// `localhost:5000/busybox` is untagged.
pub fn has_tag_or_digest(reference: &str) -> bool {
    if reference.contains('@') {
        return true;
    }
    let last = reference.rsplit('/').next().unwrap_or(reference);
    last.contains(':')
}

/// Appends `:latest` to references without tag or digest.
pub fn normalize_reference(reference: &str) -> String {
    if has_tag_or_digest(reference) {
        reference.to_string()
    } else {
        format!("{reference}:latest")
    }
}

fn image_spec(reference: &str) -> ImageSpec {
    ImageSpec {
        image: reference.to_string(),
        ..Default::default()
    }
}

// =============================================================================
// Client
// =============================================================================

/// CRI image service adapter.
#[derive(Clone)]
pub struct ImageClient {
    service: Arc<dyn ImageService>,
    cancel: CancellationToken,
    call_timeout: Duration,
    pull_timeout: Duration,
}

impl ImageClient {
    pub fn new(service: Arc<dyn ImageService>) -> Self {
        Self {
            service,
            cancel: CancellationToken::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            pull_timeout: IMAGE_PULL_TIMEOUT,
        }
    }

    /// Sets the bound on every call except pulls.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Returns a copy whose calls are cancelled with `cancel`.
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    /// Pulls an image, adding `:latest` when no tag or digest is given.
    ///
    /// Returns the image reference reported by the runtime.
    pub async fn pull_image(&self, reference: &str) -> Result<String> {
        let reference = normalize_reference(reference);
        info!("Pulling image: {}", reference);

        let request = PullImageRequest {
            image: Some(image_spec(&reference)),
            sandbox_config: None,
        };
        let response = bounded_call(
            "PullImage",
            &self.cancel,
            self.pull_timeout,
            self.service.pull_image(request),
        )
        .await?;

        debug!("Pulled {} as {}", reference, response.image_ref);
        Ok(response.image_ref)
    }

    /// Looks an image up by reference or id. `None` if absent.
    pub async fn image_status(&self, reference: &str) -> Result<Option<Image>> {
        let request = ImageStatusRequest {
            image: Some(image_spec(reference)),
            verbose: false,
        };
        let response = bounded_call(
            "ImageStatus",
            &self.cancel,
            self.call_timeout,
            self.service.image_status(request),
        )
        .await;

        match response {
            Ok(response) => Ok(response.image),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Lists images, optionally filtered by reference.
    pub async fn list_images(&self, filter: Option<&str>) -> Result<Vec<Image>> {
        let request = ListImagesRequest {
            filter: filter.map(|reference| ImageFilter {
                image: Some(image_spec(reference)),
            }),
        };
        let response = bounded_call(
            "ListImages",
            &self.cancel,
            self.call_timeout,
            self.service.list_images(request),
        )
        .await?;
        Ok(response.images)
    }

    /// Removes an image by reference or id.
    ///
    /// Skipped if the image is already gone; a `NotFound` from the runtime
    /// (another remover won the race) is success.
    pub async fn remove_image(&self, reference: &str) -> Result<()> {
        if self.image_status(reference).await?.is_none() {
            debug!("Image {} already absent, skipping removal", reference);
            return Ok(());
        }

        let request = RemoveImageRequest {
            image: Some(image_spec(reference)),
        };
        let removed = bounded_call(
            "RemoveImage",
            &self.cancel,
            self.call_timeout,
            self.service.remove_image(request),
        )
        .await;

        match removed {
            Ok(_) => {
                debug!("Removed image {}", reference);
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Removes if present, pulls, and checks the resulting status.
    ///
    /// The status must exist with a non-empty id and a non-zero size.
    pub async fn pull_public_image(&self, reference: &str) -> Result<Image> {
        self.remove_image(reference).await?;
        self.pull_image(reference).await?;

        let normalized = normalize_reference(reference);
        let image = self.image_status(&normalized).await?.ok_or_else(|| {
            Error::assertion(format!("image status for {normalized} is nil after pull"))
        })?;

        if image.id.is_empty() {
            return Err(Error::assertion(format!(
                "image {normalized} has an empty id after pull"
            )));
        }
        if image.size == 0 {
            return Err(Error::assertion(format!(
                "image {normalized} reports zero size after pull"
            )));
        }
        Ok(image)
    }
}

// =============================================================================
// Identity Invariants
// =============================================================================

/// After pulling a name without tag or digest, a repo tag ends in `:latest`.
pub fn expect_latest_tag(image: &Image) -> Result<()> {
    if image.repo_tags.iter().any(|tag| tag.ends_with(":latest")) {
        Ok(())
    } else {
        Err(Error::assertion(format!(
            "expected a repo tag ending in ':latest', got {:?}",
            image.repo_tags
        )))
    }
}

/// After pulling by digest, repo tags are empty and repo digests contain the
/// pulled reference.
pub fn expect_digest_only(image: &Image, reference: &str) -> Result<()> {
    if !image.repo_tags.is_empty() {
        return Err(Error::assertion(format!(
            "expected no repo tags after pulling {reference}, got {:?}",
            image.repo_tags
        )));
    }
    if !image.repo_digests.iter().any(|digest| digest == reference) {
        return Err(Error::assertion(format!(
            "expected repo digests to contain {reference}, got {:?}",
            image.repo_digests
        )));
    }
    Ok(())
}

/// N images with pairwise distinct content have N distinct ids.
pub fn expect_distinct_ids(images: &[Image], expected: usize) -> Result<()> {
    let ids: BTreeSet<&str> = images.iter().map(|image| image.id.as_str()).collect();
    if ids.len() == expected {
        Ok(())
    } else {
        Err(Error::assertion(format!(
            "expected {expected} distinct image ids, got {}: {ids:?}",
            ids.len()
        )))
    }
}

/// N tags of identical content resolve to one id whose repo tags equal the
/// pulled set.
pub fn expect_shared_id(images: &[Image], tags: &[String]) -> Result<()> {
    let ids: BTreeSet<&str> = images.iter().map(|image| image.id.as_str()).collect();
    if ids.len() != 1 {
        return Err(Error::assertion(format!(
            "expected one image id for {tags:?}, got {ids:?}"
        )));
    }

    let want: BTreeSet<&str> = tags.iter().map(String::as_str).collect();
    let got: BTreeSet<&str> = images
        .iter()
        .flat_map(|image| image.repo_tags.iter().map(String::as_str))
        .collect();
    if want == got {
        Ok(())
    } else {
        Err(Error::assertion(format!(
            "expected repo tags {want:?}, got {got:?}"
        )))
    }
}
