//! Image identity across repo tags: distinct content yields distinct ids,
//! identical content shares one id and accumulates tags.

use crate::constants::{DISTINCT_CONTENT_IMAGES, SAME_CONTENT_TAGS, TEST_IMAGE_REGISTRY};
use crate::error::{Error, Result};
use crate::image::{expect_distinct_ids, expect_shared_id};
use crate::suite::{Context, Registry};

fn references(names: &[&str]) -> Vec<String> {
    names
        .iter()
        .map(|name| format!("{TEST_IMAGE_REGISTRY}{name}"))
        .collect()
}

/// Pulls every reference (registering removal) and returns their statuses.
async fn pull_all(ctx: &Context, refs: &[String]) -> Result<Vec<crate::cri::Image>> {
    let mut images = Vec::with_capacity(refs.len());
    for reference in refs {
        ctx.defer_image_removal(reference);
        ctx.images().pull_image(reference).await?;
    }
    for reference in refs {
        let image = ctx
            .images()
            .image_status(reference)
            .await?
            .ok_or_else(|| Error::assertion(format!("image {reference} missing after pull")))?;
        images.push(image);
    }
    Ok(images)
}

pub fn register(registry: &mut Registry) {
    registry.describe("[k8s.io] Image Consistency [Serial]", |group| {
        group.it(
            "images with distinct content should have distinct ids [Conformance]",
            |ctx| async move {
                let refs = references(&DISTINCT_CONTENT_IMAGES);
                let images = pull_all(&ctx, &refs).await?;
                expect_distinct_ids(&images, refs.len())
            },
        );

        group.it(
            "tags of identical content should share one id [Conformance]",
            |ctx| async move {
                let refs = references(&SAME_CONTENT_TAGS);
                pull_all(&ctx, &refs).await?;

                // Listing by id returns the one image with every tag.
                let first = ctx
                    .images()
                    .image_status(&refs[0])
                    .await?
                    .ok_or_else(|| Error::assertion(format!("image {} missing", refs[0])))?;
                let listed: Vec<_> = ctx
                    .images()
                    .list_images(None)
                    .await?
                    .into_iter()
                    .filter(|image| image.id == first.id)
                    .collect();
                expect_shared_id(&listed, &refs)
            },
        );
    });
}
