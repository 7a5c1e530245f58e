//! Local image lookup and deployment-tag cleanup

use crate::daemon::{Daemon, LocalImage};
use crate::error::BuildResult;
use crate::reference::ImageReference;
use bollard::auth::DockerCredentials;

/// Shortest hex fragment treated as an image id
pub const MIN_ID_FRAGMENT: usize = 12;

/// Whether `name` should be matched against image ids rather than tags
pub fn looks_like_image_id(name: &str) -> bool {
    let fragment = name.strip_prefix("sha256:").unwrap_or(name);
    fragment.len() >= MIN_ID_FRAGMENT
        && fragment
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Tags that count as a match for `name`, most specific first
pub fn search_terms(name: &str) -> Vec<String> {
    let mut terms = vec![name.to_string()];

    if let Ok(reference) = ImageReference::parse(name) {
        let candidates = [
            format!("{}:{}", name, reference.tag),
            reference.short_name(),
            reference.familiar_name(),
            reference.remote(),
            format!("{}:{}", reference.full_path(), reference.tag),
            reference.repository(),
        ];
        for candidate in candidates {
            if !terms.contains(&candidate) {
                terms.push(candidate);
            }
        }
    }

    terms
}

/// Find `name` among `images`, first by id fragment, then by tag
pub fn search_images<'a>(images: &'a [LocalImage], name: &str) -> Option<&'a LocalImage> {
    if looks_like_image_id(name) {
        let fragment = name.strip_prefix("sha256:").unwrap_or(name);
        if let Some(image) = images.iter().find(|img| {
            img.id
                .strip_prefix("sha256:")
                .unwrap_or(&img.id)
                .starts_with(fragment)
        }) {
            tracing::debug!("Found image by id: {}", name);
            return Some(image);
        }
    }

    let terms = search_terms(name);
    tracing::debug!("Search terms: {:?}", terms);

    images.iter().find(|img| {
        img.repo_tags
            .iter()
            .filter(|tag| !tag.starts_with("<none>"))
            .any(|tag| terms.iter().any(|term| term == tag))
    })
}

/// Look `name` up on the daemon
pub async fn find_image(daemon: &dyn Daemon, name: &str) -> BuildResult<Option<LocalImage>> {
    let images = daemon.list_images(None).await?;
    Ok(search_images(&images, name).cloned())
}

/// Look `name` up, pulling it from its registry when the daemon lacks it
pub async fn resolve_image(
    daemon: &dyn Daemon,
    name: &str,
    credentials: Option<DockerCredentials>,
) -> BuildResult<Option<LocalImage>> {
    if let Some(image) = find_image(daemon, name).await? {
        return Ok(Some(image));
    }

    println!("Unable to find image '{}' locally", name);
    let remote = ImageReference::parse(name)?.remote();
    daemon.pull_image(&remote, credentials).await?;

    find_image(daemon, name).await
}

/// Remove every local tag of the images matching `tag`. Individual
/// failures are logged and skipped.
pub async fn delete_deployment_images(daemon: &dyn Daemon, tag: &str) -> BuildResult<usize> {
    let images = daemon.list_images(Some(tag)).await?;

    let mut removed = 0;
    for image in images {
        for repo_tag in &image.repo_tags {
            match daemon.remove_image(repo_tag).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::debug!("Error deleting image {}: {}", repo_tag, e),
            }
        }
    }

    Ok(removed)
}
