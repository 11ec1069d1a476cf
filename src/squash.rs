//! Layer squasher
//!
//! Extracts ordered layer archives (oldest first) into one scoped working tree,
//! applying last-writer-wins and whiteout semantics, then packages the merged
//! tree as a single gzip-compressed tar stream.

use crate::error::{FetchError, Result};
use crate::logging::{EventObserver, FetchEvent, NullObserver};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tar::{Archive, Builder};

const WORKDIR_PREFIX: &str = "rootfs_squash_";
const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const MAX_LINK_HOPS: usize = 40;

/// Progress of one squash invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SquashState {
    Validating,
    /// `layer` is 1-based
    Extracting { layer: usize, total: usize },
    Packaging,
    Done,
    Failed,
}

pub struct Squasher {
    observer: Arc<dyn EventObserver>,
}

impl Default for Squasher {
    fn default() -> Self {
        Self::new(Arc::new(NullObserver))
    }
}

impl Squasher {
    pub fn new(observer: Arc<dyn EventObserver>) -> Self {
        Self { observer }
    }

    /// Merge `layers` in order and write the result to `sink`.
    ///
    /// Nothing reaches `sink` unless every layer extracted cleanly. The layer
    /// readers stay owned by the caller.
    pub fn squash_layers<R: Read, W: Write>(&self, layers: &mut [R], sink: &mut W) -> Result<()> {
        self.emit(SquashState::Validating);
        let result = self.run(layers, sink);
        self.emit(match result {
            Ok(()) => SquashState::Done,
            Err(_) => SquashState::Failed,
        });
        result
    }

    fn run<R: Read, W: Write>(&self, layers: &mut [R], sink: &mut W) -> Result<()> {
        if layers.is_empty() {
            return Err(FetchError::NoLayers);
        }

        // Removed on drop, on every exit path.
        let workdir = tempfile::Builder::new()
            .prefix(WORKDIR_PREFIX)
            .tempdir()
            .map_err(|e| FetchError::Io {
                message: format!("could not create squash working directory: {}", e),
                path: None,
            })?;
        let root = fs::canonicalize(workdir.path()).map_err(|e| FetchError::io_at(e, workdir.path()))?;

        let total = layers.len();
        for (i, layer) in layers.iter_mut().enumerate() {
            self.emit(SquashState::Extracting {
                layer: i + 1,
                total,
            });
            extract_layer(layer, &root).map_err(|e| FetchError::layer(i + 1, total, e))?;
        }

        self.emit(SquashState::Packaging);
        package_tree(&root, sink)
    }

    fn emit(&self, state: SquashState) {
        self.observer.on_event(&FetchEvent::Squash(state));
    }
}

/// Squash with no observer attached
pub fn squash<R: Read, W: Write>(layers: &mut [R], sink: &mut W) -> Result<()> {
    Squasher::default().squash_layers(layers, sink)
}

fn extract_layer<R: Read>(layer: &mut R, root: &Path) -> Result<()> {
    let mut buffered = BufReader::new(layer);
    let gzipped = buffered.fill_buf()?.starts_with(&GZIP_MAGIC);
    let stream: Box<dyn Read + '_> = if gzipped {
        Box::new(GzDecoder::new(buffered))
    } else {
        Box::new(buffered)
    };

    let mut archive = Archive::new(stream);
    // Resolved paths written by this layer, with their ancestors
    let mut written: HashSet<PathBuf> = HashSet::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative = sanitize(&entry.path()?)?;
        let Some(name) = relative.file_name().map(|n| n.to_os_string()) else {
            continue;
        };
        let parent = resolve_in_root(root, relative.parent().unwrap_or(Path::new("")))?;
        let name_str = name.to_str().unwrap_or_default();

        if name_str == OPAQUE_WHITEOUT {
            clear_opaque(&parent, &written)?;
            continue;
        }
        if let Some(target) = name_str.strip_prefix(WHITEOUT_PREFIX) {
            if target.is_empty() || target == "." || target == ".." {
                return Err(FetchError::PathTraversal {
                    path: relative.display().to_string(),
                });
            }
            remove_path(&parent.join(target))?;
            continue;
        }

        let entry_type = entry.header().entry_type();
        let dest = parent.join(&name);
        if let Ok(existing) = fs::symlink_metadata(&dest) {
            if !(entry_type.is_dir() && existing.is_dir()) {
                remove_path(&dest)?;
            }
        }
        fs::create_dir_all(&parent).map_err(|e| FetchError::io_at(e, &parent))?;

        if entry_type.is_hard_link() {
            let link = entry.link_name()?.ok_or_else(|| FetchError::Io {
                message: format!("hard link {} has no target", relative.display()),
                path: None,
            })?;
            let source = hard_link_source(root, &link)?;
            fs::hard_link(&source, &dest).map_err(|e| FetchError::io_at(e, &dest))?;
        } else {
            entry.set_preserve_permissions(true);
            entry.unpack(&dest).map_err(|e| FetchError::io_at(e, &dest))?;
        }
        if entry_type.is_dir() {
            keep_writable(&dest)?;
        }
        mark_written(&mut written, root, &dest);
    }

    Ok(())
}

/// Entry path relative to the tree root. Absolute roots are stripped, `..` is fatal.
fn sanitize(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                return Err(FetchError::PathTraversal {
                    path: path.display().to_string(),
                });
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Ok(out)
}

/// Hard link targets name archive members, so they must be relative and free of `..`.
fn hard_link_source(root: &Path, link: &Path) -> Result<PathBuf> {
    if link.has_root() {
        return Err(FetchError::PathTraversal {
            path: link.display().to_string(),
        });
    }
    let relative = sanitize(link)?;
    let name = relative.file_name().ok_or_else(|| FetchError::PathTraversal {
        path: link.display().to_string(),
    })?;
    Ok(resolve_in_root(root, relative.parent().unwrap_or(Path::new("")))?.join(name))
}

enum Step {
    Up,
    Down(OsString),
}

fn push_steps(pending: &mut Vec<Step>, path: &Path) {
    let steps: Vec<Step> = path
        .components()
        .filter_map(|component| match component {
            Component::ParentDir => Some(Step::Up),
            Component::Normal(part) => Some(Step::Down(part.to_os_string())),
            _ => None,
        })
        .collect();
    pending.extend(steps.into_iter().rev());
}

/// Resolve `relative` under `root` following symlinks the way a chroot would:
/// absolute link targets restart at `root` and `..` stops there.
fn resolve_in_root(root: &Path, relative: &Path) -> Result<PathBuf> {
    let mut pending = Vec::new();
    push_steps(&mut pending, relative);
    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(step) = pending.pop() {
        let part = match step {
            Step::Up => {
                resolved.pop();
                continue;
            }
            Step::Down(part) => part,
        };
        let candidate = resolved.join(&part);
        let absolute = root.join(&candidate);
        match fs::symlink_metadata(&absolute) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_LINK_HOPS {
                    return Err(FetchError::PathTraversal {
                        path: relative.display().to_string(),
                    });
                }
                let target = fs::read_link(&absolute).map_err(|e| FetchError::io_at(e, &absolute))?;
                if target.has_root() {
                    resolved.clear();
                }
                push_steps(&mut pending, &target);
            }
            Ok(_) => resolved = candidate,
            Err(e) if e.kind() == io::ErrorKind::NotFound => resolved = candidate,
            Err(e) => return Err(FetchError::io_at(e, absolute)),
        }
    }
    Ok(root.join(resolved))
}

fn mark_written(written: &mut HashSet<PathBuf>, root: &Path, dest: &Path) {
    let mut path = dest.to_path_buf();
    while path.as_path() != root && path.starts_with(root) {
        if !written.insert(path.clone()) {
            break;
        }
        path.pop();
    }
}

/// Drop everything under `dir` that earlier layers contributed.
fn clear_opaque(dir: &Path, written: &HashSet<PathBuf>) -> Result<()> {
    let listing = match fs::read_dir(dir) {
        Ok(listing) => listing,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(FetchError::io_at(e, dir)),
    };

    for child in listing {
        let child = child.map_err(|e| FetchError::io_at(e, dir))?;
        let path = child.path();
        if !written.contains(&path) {
            remove_path(&path)?;
            continue;
        }
        let file_type = child.file_type().map_err(|e| FetchError::io_at(e, &path))?;
        if file_type.is_dir() {
            clear_opaque(&path, written)?;
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| FetchError::io_at(e, path))
}

/// Later layers (and cleanup) must still be able to write into extracted directories.
#[cfg(unix)]
fn keep_writable(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = fs::symlink_metadata(dir).map_err(|e| FetchError::io_at(e, dir))?;
    if !meta.is_dir() {
        return Ok(());
    }
    let mut permissions = meta.permissions();
    let mode = permissions.mode();
    if mode & 0o700 != 0o700 {
        permissions.set_mode(mode | 0o700);
        fs::set_permissions(dir, permissions).map_err(|e| FetchError::io_at(e, dir))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn keep_writable(_dir: &Path) -> Result<()> {
    Ok(())
}

fn package_tree<W: Write>(root: &Path, sink: &mut W) -> Result<()> {
    let encoder = GzEncoder::new(&mut *sink, Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);
    append_tree(&mut builder, root, Path::new(""))?;

    let encoder = builder.into_inner()?;
    let sink = encoder.finish()?;
    sink.flush()?;
    Ok(())
}

/// Sorted, depth-first walk so identical trees give identical archives
fn append_tree<W: Write>(builder: &mut Builder<W>, root: &Path, relative: &Path) -> Result<()> {
    let directory = root.join(relative);
    let mut names = fs::read_dir(&directory)
        .map_err(|e| FetchError::io_at(e, &directory))?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| FetchError::io_at(e, &directory))?;
    names.sort();

    for name in names {
        let entry_path = relative.join(&name);
        let absolute = root.join(&entry_path);
        let meta = fs::symlink_metadata(&absolute).map_err(|e| FetchError::io_at(e, &absolute))?;
        if meta.is_dir() {
            builder.append_dir(&entry_path, &absolute)?;
            append_tree(builder, root, &entry_path)?;
        } else {
            builder.append_path_with_name(&absolute, &entry_path)?;
        }
    }
    Ok(())
}
