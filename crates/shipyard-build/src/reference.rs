//! Image reference parsing

use crate::error::{BuildError, BuildResult};

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";

/// イメージ名とタグを分離
///
/// # Examples
/// - `ghcr.io/org/app:v1.0` -> `("ghcr.io/org/app", "v1.0")`
/// - `ghcr.io/org/app` -> `("ghcr.io/org/app", "latest")`
/// - `localhost:5000/app:dev` -> `("localhost:5000/app", "dev")`
pub fn split_image_tag(image: &str) -> (String, String) {
    if let Some(pos) = image.rfind(':') {
        let potential_tag = &image[pos + 1..];
        let potential_image = &image[..pos];

        // ポート番号は / を含まない純粋な数字
        if !potential_tag.contains('/') && !potential_tag.chars().all(|c| c.is_ascii_digit()) {
            return (potential_image.to_string(), potential_tag.to_string());
        }
    }

    (image.to_string(), DEFAULT_TAG.to_string())
}

/// イメージ名からレジストリを抽出
///
/// # Examples
/// - `ghcr.io/org/app:tag` -> `ghcr.io`
/// - `myuser/app:tag` -> `docker.io`
/// - `localhost:5000/app` -> `localhost:5000`
pub fn extract_registry(image: &str) -> String {
    registry_component(image)
        .unwrap_or(DEFAULT_REGISTRY)
        .to_string()
}

fn registry_component(image: &str) -> Option<&str> {
    let (first, rest) = image.split_once('/')?;
    if rest.is_empty() {
        return None;
    }
    if first.contains('.') || first.contains(':') || first == "localhost" {
        Some(first)
    } else {
        None
    }
}

/// タグのバリデーション
///
/// - 128文字以下
/// - 英数字、ピリオド、ハイフン、アンダースコアのみ
/// - 先頭はピリオドまたはハイフンではない
pub fn validate_tag(tag: &str) -> BuildResult<()> {
    if tag.is_empty() {
        return Err(BuildError::InvalidTag {
            tag: "(empty)".to_string(),
        });
    }

    if tag.len() > 128 {
        return Err(BuildError::InvalidTag {
            tag: format!("Tag too long ({} characters, max 128)", tag.len()),
        });
    }

    if tag.starts_with('.') || tag.starts_with('-') {
        return Err(BuildError::InvalidTag {
            tag: tag.to_string(),
        });
    }

    for c in tag.chars() {
        if !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != '_' {
            return Err(BuildError::InvalidTag {
                tag: format!("Invalid character '{}' in tag: {}", c, tag),
            });
        }
    }

    Ok(())
}

/// A parsed `[registry/]path[:tag][@digest]` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub path: String,
    pub tag: String,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> BuildResult<Self> {
        let reference = reference.trim();
        if reference.is_empty() || reference.chars().any(char::is_whitespace) {
            return Err(BuildError::InvalidConfig(format!(
                "Invalid image reference: '{}'",
                reference
            )));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (reference, None),
        };

        let (repository, tag) = split_image_tag(name);
        let registry = registry_component(&repository).map(str::to_string);
        let path = match &registry {
            Some(r) => repository[r.len() + 1..].to_string(),
            None => repository.clone(),
        };

        if path.is_empty() || path.split('/').any(str::is_empty) {
            return Err(BuildError::InvalidConfig(format!(
                "Invalid image reference: '{}'",
                reference
            )));
        }

        Ok(Self {
            registry,
            path,
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        self.registry.as_deref().unwrap_or(DEFAULT_REGISTRY)
    }

    /// Repository path with the implicit `library/` namespace for
    /// official images on the default registry
    pub fn full_path(&self) -> String {
        if self.registry.is_none() && !self.path.contains('/') {
            format!("library/{}", self.path)
        } else {
            self.path.clone()
        }
    }

    /// Repository as written, without tag (`app`, `ghcr.io/org/app`)
    pub fn repository(&self) -> String {
        match &self.registry {
            Some(r) => format!("{}/{}", r, self.path),
            None => self.path.clone(),
        }
    }

    /// `repository:tag` as written
    pub fn short_name(&self) -> String {
        format!("{}:{}", self.repository(), self.tag)
    }

    /// Docker Hub shorthand (`nginx:latest`, `user/app:tag`); other
    /// registries keep their host
    pub fn familiar_name(&self) -> String {
        let on_hub = matches!(self.registry(), DEFAULT_REGISTRY | "index.docker.io");
        if !on_hub {
            return self.short_name();
        }

        let path = self
            .path
            .strip_prefix("library/")
            .filter(|p| !p.contains('/'))
            .unwrap_or(&self.path);
        format!("{}:{}", path, self.tag)
    }

    /// Fully qualified `registry/path:tag`
    pub fn remote(&self) -> String {
        format!("{}/{}:{}", self.registry(), self.full_path(), self.tag)
    }
}
