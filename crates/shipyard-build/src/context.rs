//! ビルドコンテキストの組み立て
//!
//! ソースディレクトリを除外ルールに従って一時ディレクトリへコピーし、
//! レシピなどの追加ファイルを書き込んだ上で tar.gz アーカイブを作成します。

use crate::error::{BuildError, BuildResult};
use crate::ignore::ExcludeSet;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::Builder;
use tempfile::TempDir;

const MAX_CONTEXT_SIZE: usize = 500 * 1024 * 1024; // 500MB

/// Scratch directory holding an assembled build context
pub struct BuildContext {
    dir: TempDir,
}

impl BuildContext {
    pub fn new() -> BuildResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("shipyard-context-")
            .tempdir()?;
        tracing::debug!("Assembling build context in {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Copy `source` into the context, skipping excluded paths.
    /// Returns the number of files copied.
    pub fn add_source(&self, source: &Path, excludes: &ExcludeSet) -> BuildResult<usize> {
        if !source.is_dir() {
            return Err(BuildError::ContextNotFound(source.to_path_buf()));
        }

        let mut copied = 0;
        copy_tree(source, source, self.path(), excludes, &mut copied)?;
        tracing::debug!("Copied {} files from {}", copied, source.display());
        Ok(copied)
    }

    /// Write a single named file into the context
    pub fn add_file(&self, name: &str, contents: &[u8]) -> BuildResult<()> {
        let target = self.entry_path(name)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, contents)?;
        Ok(())
    }

    /// Stream a single named file into the context
    pub fn add_reader<R: Read>(&self, name: &str, reader: &mut R) -> BuildResult<u64> {
        let target = self.entry_path(name)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&target)?;
        Ok(std::io::copy(reader, &mut file)?)
    }

    /// コンテキストをtar.gzアーカイブとして作成
    pub fn archive(&self) -> BuildResult<Vec<u8>> {
        let mut archive_data = Vec::new();
        {
            let encoder = GzEncoder::new(&mut archive_data, Compression::default());
            let mut tar = Builder::new(encoder);
            // シンボリックリンクはそのまま格納する
            tar.follow_symlinks(false);

            tar.append_dir_all(".", self.path())
                .map_err(BuildError::Io)?;

            let encoder = tar.into_inner().map_err(BuildError::Io)?;
            encoder.finish().map_err(BuildError::Io)?;
        }

        tracing::debug!("Build context created: {} bytes", archive_data.len());
        check_context_size(archive_data.len());

        Ok(archive_data)
    }

    /// Remove the scratch directory
    pub fn close(self) -> BuildResult<()> {
        self.dir.close()?;
        Ok(())
    }

    fn entry_path(&self, name: &str) -> BuildResult<PathBuf> {
        let relative = Path::new(name);
        let valid = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !valid {
            return Err(BuildError::InvalidConfig(format!(
                "Invalid build context entry name: {}",
                name
            )));
        }
        Ok(self.path().join(relative))
    }
}

/// コンテキストサイズのチェックと警告
fn check_context_size(size: usize) {
    if size > MAX_CONTEXT_SIZE {
        tracing::warn!(
            "Build context is large ({}MB). Consider excluding files with .dockerignore.",
            size / 1024 / 1024
        );
    }
}

fn copy_tree(
    root: &Path,
    current: &Path,
    dest_root: &Path,
    excludes: &ExcludeSet,
    copied: &mut usize,
) -> BuildResult<()> {
    let mut entries = fs::read_dir(current)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let relative = match path.strip_prefix(root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };
        let excluded = excludes.is_excluded(&relative);
        let file_type = entry.file_type()?;
        let dest = dest_root.join(&relative);

        if file_type.is_dir() {
            // 否定ルールがあれば除外ディレクトリ配下も確認する
            if excluded && !excludes.has_negations() {
                continue;
            }
            if !excluded {
                fs::create_dir_all(&dest)?;
            }
            copy_tree(root, &path, dest_root, excludes, copied)?;
            continue;
        }

        if excluded {
            tracing::trace!("Excluded from context: {}", relative.display());
            continue;
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if file_type.is_symlink() {
            copy_symlink(&path, &dest)?;
        } else {
            fs::copy(&path, &dest)?;
        }
        *copied += 1;
    }

    Ok(())
}

#[cfg(unix)]
fn copy_symlink(source: &Path, dest: &Path) -> BuildResult<()> {
    let target = fs::read_link(source)?;
    std::os::unix::fs::symlink(target, dest)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, dest: &Path) -> BuildResult<()> {
    fs::copy(source, dest)?;
    Ok(())
}
