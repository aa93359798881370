//! Trees of EFI image load events built from boot file sequences, as the
//! TPM policy expects them to be measured.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extension of container archives whose boot images are only extracted when
/// the PCR profile is evaluated.
const CONTAINER_EXTENSION: &str = "snap";
/// Image name assumed when a container archive is referenced on its own.
const DEFAULT_CONTAINER_IMAGE: &str = "kernel.efi";

#[derive(Error, Debug, PartialEq)]
pub enum LoadChainError {
    #[error("boot image {} does not exist", .0.display())]
    MissingBootImage(PathBuf),
    #[error("load sequence {0} is empty, expected at least one boot image")]
    EmptySequence(usize),
}

pub type Result<T, E = LoadChainError> = core::result::Result<T, E>;

/// Who loaded an image: the firmware loads the first image of a chain, the
/// shim everything after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadSource {
    Firmware,
    Shim,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum EfiImage {
    File {
        path: PathBuf,
    },
    /// An image inside a container archive.
    Embedded {
        container: PathBuf,
        file_name: PathBuf,
    },
}

impl EfiImage {
    /// Classifies a boot file path. `pc-kernel_1.snap/kernel.efi` and
    /// `pc-kernel_1.snap` both reference an image inside the container.
    pub fn from_path(path: &Path) -> Self {
        let container = path
            .ancestors()
            .find(|p| p.extension().map_or(false, |ext| ext == CONTAINER_EXTENSION));
        match container {
            Some(container) => {
                let file_name = match path.strip_prefix(container) {
                    Ok(rest) if !rest.as_os_str().is_empty() => rest.to_path_buf(),
                    _ => PathBuf::from(DEFAULT_CONTAINER_IMAGE),
                };
                EfiImage::Embedded {
                    container: container.to_path_buf(),
                    file_name,
                }
            }
            None => EfiImage::File {
                path: path.to_path_buf(),
            },
        }
    }

    /// The file that has to exist on disk at seal time.
    pub fn backing_file(&self) -> &Path {
        match self {
            EfiImage::File { path } => path,
            EfiImage::Embedded { container, .. } => container,
        }
    }
}

impl fmt::Display for EfiImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EfiImage::File { path } => write!(f, "{}", path.display()),
            EfiImage::Embedded {
                container,
                file_name,
            } => write!(f, "{}:{}", container.display(), file_name.display()),
        }
    }
}

/// A node of an EFI image load tree, the input of PCR profile computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadEvent {
    pub source: LoadSource,
    pub image: EfiImage,
    pub next: Vec<LoadEvent>,
}

impl LoadEvent {
    fn render(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let source = match self.source {
            LoadSource::Firmware => "firmware",
            LoadSource::Shim => "shim",
        };
        writeln!(f, "{:indent$}{}: {}", "", source, self.image, indent = depth * 2)?;
        self.next.iter().try_for_each(|ev| ev.render(f, depth + 1))
    }
}

impl fmt::Display for LoadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, 0)
    }
}

/// A boot file and every boot file it may go on to load, e.g.
///
/// ```text
/// shim -> recovery grub -> recovery kernel
///                      |-> normal grub -> run kernel
///                                     |-> try kernel
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadChain {
    pub boot_file: PathBuf,
    pub next: Vec<LoadChain>,
}

impl LoadChain {
    pub fn new(boot_file: impl Into<PathBuf>) -> Self {
        Self {
            boot_file: boot_file.into(),
            next: Vec::new(),
        }
    }

    pub fn with_next(mut self, next: LoadChain) -> Self {
        self.next.push(next);
        self
    }

    /// Folds a linear sequence right to left: the last boot file is the
    /// leaf, every preceding one loads the chain built so far.
    pub fn from_sequence<P: AsRef<Path>>(sequence: &[P]) -> Option<Self> {
        sequence.iter().rev().fold(None, |next, path| {
            Some(LoadChain {
                boot_file: path.as_ref().to_path_buf(),
                next: next.into_iter().collect(),
            })
        })
    }

    fn check_images(&self) -> Result<()> {
        let image = EfiImage::from_path(&self.boot_file);
        if !image.backing_file().exists() {
            return Err(LoadChainError::MissingBootImage(
                image.backing_file().to_path_buf(),
            ));
        }
        self.next.iter().try_for_each(LoadChain::check_images)
    }

    fn load_event(&self, source: LoadSource) -> LoadEvent {
        LoadEvent {
            source,
            image: EfiImage::from_path(&self.boot_file),
            // everything that is not the root is loaded by the shim
            next: self
                .next
                .iter()
                .map(|chain| chain.load_event(LoadSource::Shim))
                .collect(),
        }
    }
}

/// Builds one load event tree per chain. All images of all chains are
/// checked before any tree is built.
pub fn build_load_trees(chains: &[LoadChain]) -> Result<Vec<LoadEvent>> {
    chains.iter().try_for_each(LoadChain::check_images)?;
    Ok(chains
        .iter()
        .map(|chain| chain.load_event(LoadSource::Firmware))
        .collect())
}

/// Builds one load event tree root per ordered sequence of boot files.
pub fn build_load_sequences<P: AsRef<Path>>(sequences: &[Vec<P>]) -> Result<Vec<LoadEvent>> {
    let chains = sequences
        .iter()
        .enumerate()
        .map(|(i, seq)| LoadChain::from_sequence(seq).ok_or(LoadChainError::EmptySequence(i)))
        .collect::<Result<Vec<_>>>()?;
    build_load_trees(&chains)
}
