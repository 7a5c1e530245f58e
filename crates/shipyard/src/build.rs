use crate::BuildArgs;
use colored::Colorize;
use shipyard_build::builtins::BuiltinSpec;
use shipyard_build::resolver::parse_build_arg;
use shipyard_build::{
    BuildOperation, BuildOptions, DockerConnector, Image, RegistryAuth, StaticRemoteBuilder,
};
use shipyard_config::{FileSettings, UserConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// ビルドコマンドを処理
pub async fn handle_build_command(args: BuildArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    let config = UserConfig::load()?;
    let source_dir = args.dir.canonicalize().map_err(|e| {
        anyhow::anyhow!("Source directory {} not found: {}", args.dir.display(), e)
    })?;

    let build_args = args
        .build_args
        .iter()
        .map(|arg| parse_build_arg(arg))
        .collect::<Result<Vec<_>, _>>()?;

    let mut auth = RegistryAuth::new();
    if let Some(token) = &config.access_token {
        auth = auth.with_deploy_token(&config.registry_host, token);
    }

    let source = StaticRemoteBuilder::new(
        config.remote_builder_url.clone(),
        config.access_token.clone(),
    );
    let connector = Arc::new(DockerConnector::new(Arc::new(source)));

    let options = build_options(&args, &config)?;
    let operation = BuildOperation::new(options, connector, auth, cancel)
        .await?
        .with_settings(Box::new(FileSettings::open_default()?));

    println!("{}", format!("==> Building image for {}", args.app).green().bold());
    println!("  → Tag: {}", operation.image_tag().cyan());

    let (image, built) = produce_image(&operation, &args, &source_dir, &build_args).await?;
    // プッシュ済みのビルド結果のみローカルタグを掃除する
    if built && !args.no_push {
        operation.cleanup_deployment_tags().await;
    }

    println!();
    println!("{}", "✓ Image ready".green().bold());
    println!("  {} {}", "Image:".bold(), image.tag.cyan());
    println!("  {} {}", "Id:".bold(), image.id);
    println!("  {} {:.1} MB", "Size:".bold(), image.size as f64 / 1_000_000.0);

    Ok(())
}

fn build_options(args: &BuildArgs, config: &UserConfig) -> anyhow::Result<BuildOptions> {
    let mut options = BuildOptions::new(&args.app, &config.registry_host);
    options.image_label = args.image_label.clone();
    options.image_ref = config.image_ref.clone();
    options.local_only = args.local_only;
    options.remote_only = args.remote_only;
    options.buildpack_builder = args.buildpack_builder.clone();
    options.buildpacks = args.buildpacks.clone();
    options.target = args.target.clone();
    options.no_cache = args.no_cache;
    options.ignore_file = args.ignore_file.clone();

    if let Some(name) = &args.builtin {
        let mut spec = BuiltinSpec::new(name);
        for setting in &args.builtin_settings {
            let (key, value) = setting.split_once('=').ok_or_else(|| {
                anyhow::anyhow!("Invalid builtin setting '{}', expected KEY=VALUE", setting)
            })?;
            spec = spec.with_setting(key, parse_setting_value(value));
        }
        options.builtin = Some(spec);
    }

    Ok(options)
}

/// JSONとして解釈できればそのまま、できなければ文字列として扱う
fn parse_setting_value(value: &str) -> serde_json::Value {
    serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()))
}

async fn produce_image(
    operation: &BuildOperation,
    args: &BuildArgs,
    source_dir: &std::path::Path,
    build_args: &[(String, Option<String>)],
) -> anyhow::Result<(Image, bool)> {
    if let Some(image_ref) = &args.image {
        println!("  → Resolving {}", image_ref.cyan());
        if let Some(image) = operation.resolve_image(image_ref).await? {
            return Ok((image, false));
        }
        println!(
            "  {} {} not found locally or in its registry, building from source",
            "⚠".yellow(),
            image_ref
        );
    }

    let image = if args.buildpack_builder.is_some() {
        operation
            .build_from_buildpack_builder(source_dir, build_args)
            .await?
    } else {
        operation
            .build_from_dockerfile(source_dir, args.dockerfile.as_deref(), build_args)
            .await?
    };

    if args.no_push {
        println!("  {} Skipping push (--no-push)", "⚠".yellow());
    } else {
        println!();
        println!("{}", "📤 イメージをプッシュ中...".blue().bold());
        operation.push_image(&image).await?;
    }

    Ok((image, true))
}
