use crate::builtins::{BuiltinSpec, render_builtin};
use crate::error::{BuildError, Result};
use crate::reference::validate_tag;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Conventional recipe names, in lookup order
pub const CONVENTIONAL_RECIPES: [&str; 2] = ["Dockerfile", "dockerfile"];

/// Name the recipe always has inside the build context
pub const RECIPE_ENTRY_NAME: &str = "Dockerfile";

/// Build arguments after merging. `None` means declared without a value.
pub type BuildArgs = BTreeMap<String, Option<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipeSource {
    Explicit(PathBuf),
    Conventional(PathBuf),
    Builtin(String),
}

#[derive(Debug, Clone)]
pub struct Recipe {
    pub source: RecipeSource,
    pub contents: Vec<u8>,
}

impl Recipe {
    /// Name used when deciding whether exclude rules would drop the recipe
    pub fn file_name(&self) -> String {
        match &self.source {
            RecipeSource::Explicit(path) | RecipeSource::Conventional(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| RECIPE_ENTRY_NAME.to_string()),
            RecipeSource::Builtin(_) => RECIPE_ENTRY_NAME.to_string(),
        }
    }
}

pub struct BuildResolver {
    project_root: PathBuf,
}

impl BuildResolver {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Dockerfileを解決
    ///
    /// 検索順序:
    /// 1. 明示的な指定（プロジェクトルートからの相対パス）
    /// 2. 規約ベース: `Dockerfile`, `dockerfile`
    /// 3. ビルトイン
    pub fn resolve_recipe(
        &self,
        explicit: Option<&Path>,
        builtin: Option<&BuiltinSpec>,
    ) -> Result<Recipe> {
        if let Some(dockerfile) = explicit {
            let path = self.project_root.join(dockerfile);
            if !path.is_file() {
                return Err(BuildError::DockerfileNotFound(path));
            }
            tracing::debug!("Using Dockerfile at {}", path.display());
            let contents = std::fs::read(&path)?;
            return Ok(Recipe {
                source: RecipeSource::Explicit(path),
                contents,
            });
        }

        for candidate in CONVENTIONAL_RECIPES {
            let path = self.project_root.join(candidate);
            if path.is_file() {
                tracing::debug!("Found Dockerfile at: {}", path.display());
                let contents = std::fs::read(&path)?;
                return Ok(Recipe {
                    source: RecipeSource::Conventional(path),
                    contents,
                });
            }
        }

        if let Some(spec) = builtin {
            tracing::debug!("Using builtin '{}'", spec.name);
            let rendered = render_builtin(spec)?;
            return Ok(Recipe {
                source: RecipeSource::Builtin(spec.name.clone()),
                contents: rendered.into_bytes(),
            });
        }

        Err(BuildError::NoRecipe(self.project_root.clone()))
    }

    /// ビルドコンテキストのパスを解決
    pub fn resolve_context(&self) -> Result<PathBuf> {
        let context = &self.project_root;

        if !context.exists() {
            return Err(BuildError::ContextNotFound(context.clone()));
        }

        if !context.is_dir() {
            return Err(BuildError::InvalidConfig(format!(
                "Build context is not a directory: {}",
                context.display()
            )));
        }

        Ok(context.clone())
    }
}

/// ビルド引数の検証（機密情報の警告）
pub fn validate_build_arg(key: &str) {
    let sensitive_patterns = ["password", "token", "secret", "api_key", "private_key"];

    let key_lower = key.to_lowercase();
    if sensitive_patterns.iter().any(|p| key_lower.contains(p)) {
        tracing::warn!(
            "Build argument '{}' may contain sensitive data. Build arguments are recorded in the image history; use secrets instead.",
            key
        );
    }
}

/// Parse a `KEY=VALUE` build argument.
///
/// A bare `KEY` takes its value from the environment, or stays unset.
pub fn parse_build_arg(arg: &str) -> Result<(String, Option<String>)> {
    let (key, value) = match arg.split_once('=') {
        Some((key, value)) => (key, Some(value.to_string())),
        None => (arg, std::env::var(arg).ok()),
    };

    let key = key.trim();
    if key.is_empty() {
        return Err(BuildError::InvalidConfig(format!(
            "Invalid build argument '{}', expected KEY=VALUE",
            arg
        )));
    }

    Ok((key.to_string(), value))
}

/// Merge recipe-declared arguments with call-site ones; later entries win
pub fn normalize_build_args(
    declared: &BTreeMap<String, String>,
    overrides: &[(String, Option<String>)],
) -> BuildArgs {
    let mut args: BuildArgs = declared
        .iter()
        .map(|(k, v)| (k.clone(), Some(v.clone())))
        .collect();

    for (key, value) in overrides {
        args.insert(key.clone(), value.clone());
    }

    for key in args.keys() {
        validate_build_arg(key);
    }

    args
}

/// Arguments with a value, in the shape the Docker API expects
pub fn build_args_with_values(args: &BuildArgs) -> HashMap<String, String> {
    args.iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.clone())))
        .collect()
}

/// `registry/app:label`, with `deployment-<unix time>` as the default label
pub fn deployment_tag(registry: &str, app_name: &str, label: Option<&str>) -> Result<String> {
    let label = match label {
        Some(label) => label.to_string(),
        None => format!("deployment-{}", chrono::Utc::now().timestamp()),
    };
    validate_tag(&label)?;

    Ok(format!("{}/{}:{}", registry, app_name, label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_recipe_explicit() {
        let temp_dir = tempdir().unwrap();
        fs::create_dir(temp_dir.path().join("docker")).unwrap();
        let dockerfile_path = temp_dir.path().join("docker/prod.dockerfile");
        fs::write(&dockerfile_path, "FROM alpine").unwrap();

        let resolver = BuildResolver::new(temp_dir.path());
        let recipe = resolver
            .resolve_recipe(Some(Path::new("docker/prod.dockerfile")), None)
            .unwrap();

        assert_eq!(recipe.source, RecipeSource::Explicit(dockerfile_path));
        assert_eq!(recipe.contents, b"FROM alpine");
        assert_eq!(recipe.file_name(), "prod.dockerfile");
    }

    #[test]
    fn test_resolve_recipe_explicit_missing() {
        let temp_dir = tempdir().unwrap();
        // a conventional file must not mask the missing explicit one
        fs::write(temp_dir.path().join("Dockerfile"), "FROM alpine").unwrap();

        let resolver = BuildResolver::new(temp_dir.path());
        let result = resolver.resolve_recipe(Some(Path::new("missing.dockerfile")), None);
        assert!(matches!(result, Err(BuildError::DockerfileNotFound(_))));
    }

    #[test]
    fn test_resolve_recipe_lowercase_convention() {
        let temp_dir = tempdir().unwrap();
        let dockerfile_path = temp_dir.path().join("dockerfile");
        fs::write(&dockerfile_path, "FROM alpine").unwrap();

        let resolver = BuildResolver::new(temp_dir.path());
        let recipe = resolver.resolve_recipe(None, None).unwrap();
        assert!(matches!(recipe.source, RecipeSource::Conventional(_)));
    }

    #[test]
    fn test_conventional_recipe_beats_builtin() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("Dockerfile"), "FROM scratch").unwrap();

        let resolver = BuildResolver::new(temp_dir.path());
        let recipe = resolver
            .resolve_recipe(None, Some(&BuiltinSpec::new("node")))
            .unwrap();
        assert_eq!(recipe.contents, b"FROM scratch");
    }

    #[test]
    fn test_resolve_recipe_builtin_fallback() {
        let temp_dir = tempdir().unwrap();
        let resolver = BuildResolver::new(temp_dir.path());

        let recipe = resolver
            .resolve_recipe(None, Some(&BuiltinSpec::new("node")))
            .unwrap();
        assert_eq!(recipe.source, RecipeSource::Builtin("node".into()));
        assert_eq!(recipe.file_name(), RECIPE_ENTRY_NAME);
        let contents = String::from_utf8(recipe.contents).unwrap();
        assert!(contents.starts_with("FROM node:current-slim"));
        assert!(contents.contains(r#"CMD [ "npm","start" ]"#));
    }

    #[test]
    fn test_resolve_recipe_nothing_found() {
        let temp_dir = tempdir().unwrap();
        let resolver = BuildResolver::new(temp_dir.path());
        let result = resolver.resolve_recipe(None, None);
        assert!(matches!(result, Err(BuildError::NoRecipe(_))));
    }

    #[test]
    fn test_resolve_context() {
        let temp_dir = tempdir().unwrap();
        let resolver = BuildResolver::new(temp_dir.path());
        assert_eq!(resolver.resolve_context().unwrap(), temp_dir.path());

        let missing = BuildResolver::new(temp_dir.path().join("nope"));
        assert!(matches!(
            missing.resolve_context(),
            Err(BuildError::ContextNotFound(_))
        ));
    }

    #[test]
    fn test_normalize_build_args_last_wins() {
        let declared = BTreeMap::from([
            ("NODE_ENV".to_string(), "development".to_string()),
            ("PORT".to_string(), "8080".to_string()),
        ]);
        let overrides = vec![
            ("NODE_ENV".to_string(), Some("staging".to_string())),
            ("NODE_ENV".to_string(), Some("production".to_string())),
            ("EMPTY".to_string(), None),
        ];

        let args = normalize_build_args(&declared, &overrides);
        assert_eq!(args["NODE_ENV"].as_deref(), Some("production"));
        assert_eq!(args["PORT"].as_deref(), Some("8080"));
        assert_eq!(args["EMPTY"], None);

        let values = build_args_with_values(&args);
        assert_eq!(values.len(), 2);
        assert!(!values.contains_key("EMPTY"));
    }

    #[test]
    fn test_parse_build_arg() {
        assert_eq!(
            parse_build_arg("VERSION=1.2=3").unwrap(),
            ("VERSION".to_string(), Some("1.2=3".to_string()))
        );
        assert!(parse_build_arg("=value").is_err());

        temp_env::with_var("SHIPYARD_TEST_BUILD_ARG", Some("from-env"), || {
            assert_eq!(
                parse_build_arg("SHIPYARD_TEST_BUILD_ARG").unwrap().1.as_deref(),
                Some("from-env")
            );
        });
        temp_env::with_var_unset("SHIPYARD_TEST_BUILD_ARG", || {
            assert_eq!(parse_build_arg("SHIPYARD_TEST_BUILD_ARG").unwrap().1, None);
        });
    }

    #[test]
    fn test_deployment_tag() {
        let tag = deployment_tag("registry.shipyard.dev", "myapp", Some("v1")).unwrap();
        assert_eq!(tag, "registry.shipyard.dev/myapp:v1");

        let generated = deployment_tag("registry.shipyard.dev", "myapp", None).unwrap();
        let label = generated
            .strip_prefix("registry.shipyard.dev/myapp:deployment-")
            .unwrap();
        assert!(label.parse::<i64>().unwrap() > 0);

        assert!(deployment_tag("registry.shipyard.dev", "myapp", Some("bad label")).is_err());
    }
}
