mod build;

use clap::{Parser, Subcommand};
use colored::Colorize;
use shipyard_build::BuildError;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ship")]
#[command(about = "Build and push deployment images, locally or on a remote builder", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// イメージをビルドしてデプロイ用レジストリにプッシュ
    Build(BuildArgs),
    /// List the builtin recipes
    Builtins,
    /// BuildKitのノードIDを表示（未生成なら作成して保存）
    #[command(name = "node-id")]
    NodeId,
    /// バージョン情報を表示
    Version,
}

#[derive(clap::Args)]
pub struct BuildArgs {
    /// ソースディレクトリ
    #[arg(default_value = ".")]
    pub dir: PathBuf,
    /// アプリケーション名
    #[arg(short, long, env = "SHIPYARD_APP")]
    pub app: String,
    /// Dockerfileのパス（ソースディレクトリからの相対パス）
    #[arg(short = 'f', long)]
    pub dockerfile: Option<PathBuf>,
    /// ビルド引数 (KEY=VALUE、KEYのみなら環境変数から取得)
    #[arg(long = "build-arg", value_name = "KEY=VALUE")]
    pub build_args: Vec<String>,
    /// デプロイタグのラベル（デフォルト: deployment-<unix time>）
    #[arg(long)]
    pub image_label: Option<String>,
    /// ビルドせずに既存のイメージを使う
    #[arg(short, long)]
    pub image: Option<String>,
    /// ローカルのDockerデーモンのみ使用
    #[arg(long)]
    pub local_only: bool,
    /// リモートビルダーのみ使用
    #[arg(long)]
    pub remote_only: bool,
    /// Dockerfileがない場合に使うビルトインレシピ
    #[arg(long)]
    pub builtin: Option<String>,
    /// Builtin setting (KEY=VALUE), repeatable
    #[arg(long = "builtin-setting", value_name = "KEY=VALUE")]
    pub builtin_settings: Vec<String>,
    /// Cloud Native Buildpacksのビルダーイメージ
    #[arg(long)]
    pub buildpack_builder: Option<String>,
    /// 追加のbuildpack
    #[arg(long = "buildpack")]
    pub buildpacks: Vec<String>,
    /// ターゲットステージ
    #[arg(long)]
    pub target: Option<String>,
    /// キャッシュを使用しない
    #[arg(long)]
    pub no_cache: bool,
    /// ビルド後にプッシュしない
    #[arg(long)]
    pub no_push: bool,
    /// .dockerignore の代わりに使う除外ファイル
    #[arg(long)]
    pub ignore_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // ログはstderrへ（RUST_LOG未設定時はinfo）
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    if let Err(e) = run(cli, cancel).await {
        if let Some(build_error) = e.downcast_ref::<BuildError>() {
            if build_error.is_cancelled() {
                return;
            }
            eprintln!("{} {}", "Error:".red().bold(), build_error.user_message());
        } else {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    match cli.command {
        Commands::Build(args) => build::handle_build_command(args, cancel).await?,
        Commands::Builtins => {
            for builtin in shipyard_build::builtins::list_builtins() {
                println!("{:<12} {}", builtin.name.cyan(), builtin.description);
            }
        }
        Commands::NodeId => {
            let mut settings = shipyard_config::FileSettings::open_default()?;
            println!("{}", shipyard_build::session::build_node_id(&mut settings));
        }
        Commands::Version => {
            println!("shipyard {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
