//! Image Manager scenarios: pull by name, tag and digest, status of absent
//! images, and concurrent removal by id.

use crate::constants::{
    CONCURRENT_REMOVAL_IMAGE, PUBLIC_IMAGE_WITHOUT_TAG, PUBLIC_IMAGE_WITH_DIGEST,
    PUBLIC_IMAGE_WITH_TAG,
};
use crate::error::{Error, Result};
use crate::expect::{be_nil, contain_element, equal, expect};
use crate::fixture::unique_name;
use crate::image::{expect_digest_only, expect_latest_tag};
use crate::suite::Registry;
use tokio::sync::mpsc;
use tracing::debug;

/// Workers racing to remove the same image.
const REMOVERS: usize = 5;

pub fn register(registry: &mut Registry) {
    registry.describe("[k8s.io] Image Manager", |group| {
        group.it(
            "public image with tag should be pulled and removed [Conformance]",
            |ctx| async move {
                ctx.defer_image_removal(PUBLIC_IMAGE_WITH_TAG);
                let image = ctx.images().pull_public_image(PUBLIC_IMAGE_WITH_TAG).await?;
                expect(&image.repo_tags).to(contain_element(PUBLIC_IMAGE_WITH_TAG))?;

                ctx.images().remove_image(PUBLIC_IMAGE_WITH_TAG).await?;
                let status = ctx.images().image_status(PUBLIC_IMAGE_WITH_TAG).await?;
                expect(status).to(be_nil())
            },
        );

        group.it(
            "public image without tag should be pulled as latest [Conformance]",
            |ctx| async move {
                let latest = format!("{PUBLIC_IMAGE_WITHOUT_TAG}:latest");
                ctx.defer_image_removal(&latest);
                let image = ctx
                    .images()
                    .pull_public_image(PUBLIC_IMAGE_WITHOUT_TAG)
                    .await?;
                expect_latest_tag(&image)
            },
        );

        group.it(
            "public image with digest should be pulled without tags [Conformance]",
            |ctx| async move {
                ctx.defer_image_removal(PUBLIC_IMAGE_WITH_DIGEST);
                let image = ctx
                    .images()
                    .pull_public_image(PUBLIC_IMAGE_WITH_DIGEST)
                    .await?;
                expect_digest_only(&image, PUBLIC_IMAGE_WITH_DIGEST)
            },
        );

        group.it(
            "image status should be nil for an image that was never pulled [Conformance]",
            |ctx| async move {
                let missing = format!("{}:never-pulled", unique_name("cricheck/absent"));
                let status = ctx.images().image_status(&missing).await?;
                expect(status).to(be_nil())
            },
        );

        group.it(
            "listing images should include a pulled image [Conformance]",
            |ctx| async move {
                ctx.defer_image_removal(PUBLIC_IMAGE_WITH_TAG);
                let pulled = ctx.images().pull_public_image(PUBLIC_IMAGE_WITH_TAG).await?;
                let ids: Vec<String> = ctx
                    .images()
                    .list_images(None)
                    .await?
                    .into_iter()
                    .map(|image| image.id)
                    .collect();
                expect(&ids).to(contain_element(&pulled.id))
            },
        );

        group.it(
            "image should be removed by concurrent callers using its id [Serial] [Conformance]",
            |ctx| async move {
                ctx.defer_image_removal(CONCURRENT_REMOVAL_IMAGE);
                ctx.images().pull_image(CONCURRENT_REMOVAL_IMAGE).await?;
                let image = ctx
                    .images()
                    .image_status(CONCURRENT_REMOVAL_IMAGE)
                    .await?
                    .ok_or_else(|| {
                        Error::assertion(format!("{CONCURRENT_REMOVAL_IMAGE} missing after pull"))
                    })?;
                let id = image.id;

                let (results, mut collected) = mpsc::channel::<(usize, Result<()>)>(REMOVERS);
                let mut workers = Vec::with_capacity(REMOVERS);
                for worker in 0..REMOVERS {
                    let results = results.clone();
                    let id = id.clone();
                    workers.push(ctx.spawn(move |child| async move {
                        let removed = child.images().remove_image(&id).await;
                        let outcome = match removed {
                            Ok(()) => match child.images().image_status(&id).await {
                                Ok(None) => Ok(()),
                                Ok(Some(_)) => Err(Error::assertion(format!(
                                    "remover {worker}: image {id} still present after removal"
                                ))),
                                Err(err) => Err(err),
                            },
                            Err(err) => Err(err),
                        };
                        results
                            .send((worker, outcome))
                            .await
                            .map_err(|_| Error::Internal("result channel closed".to_string()))
                    }));
                }
                drop(results);

                for worker in workers {
                    worker.join().await?;
                }

                let mut outcomes = Vec::with_capacity(REMOVERS);
                while let Some((worker, outcome)) = collected.recv().await {
                    debug!("Remover {} finished: {:?}", worker, outcome);
                    outcomes.push(outcome.map_err(|err| {
                        Error::assertion(format!("remover {worker} failed: {err}"))
                    }));
                }
                expect(outcomes.len()).to(equal(REMOVERS))?;
                for outcome in outcomes {
                    outcome?;
                }

                let status = ctx.images().image_status(&id).await?;
                expect(status).to(be_nil())
            },
        );
    });
}
