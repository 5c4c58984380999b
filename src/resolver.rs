//! Facility directory conventions and worklist construction.

use crate::error::ResolveError;
use crate::model::WorkItem;
use crate::params::{Choice, Facility};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Subdirectory holding dark-subtracted frames in the NSLS2 layout.
pub const NSLS2_IMAGE_SUBDIR: &str = "dark_sub";

/// A directory that holds images to integrate, and the output directory name derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDirectory {
    pub source_dir: PathBuf,
    pub output_name: String,
    /// Sorted lexicographically by path.
    pub images: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub sources: Vec<SourceDirectory>,
    /// Directories that did not fit the layout or held no matching images.
    pub skipped: Vec<PathBuf>,
}

impl Resolution {
    pub fn image_count(&self) -> usize {
        self.sources.iter().map(|s| s.images.len()).sum()
    }
}

/// Resolves root directories into source directories for one facility layout.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    facility: Facility,
    keyword: Option<String>,
}

impl DirectoryResolver {
    pub fn new(facility: Facility) -> Self {
        Self {
            facility,
            keyword: None,
        }
    }

    /// Only keep candidate directories whose name contains `keyword`. `ALL` keeps everything.
    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        let keyword = keyword.into();
        let keyword = keyword.trim();
        self.keyword = if keyword.is_empty() || keyword.eq_ignore_ascii_case("all") {
            None
        } else {
            Some(keyword.to_string())
        };
        self
    }

    /// Enumerate source directories and their images. Output is sorted at every level and
    /// independent of the order `roots` are given in.
    pub fn resolve(&self, roots: &[PathBuf]) -> Result<Resolution, ResolveError> {
        if roots.is_empty() {
            return Err(ResolveError::NoRoots);
        }
        let mut roots = roots.to_vec();
        roots.sort();
        roots.dedup();

        for root in &roots {
            if !root.exists() {
                return Err(ResolveError::RootNotFound(root.clone()));
            }
            if !root.is_dir() {
                return Err(ResolveError::NotADirectory(root.clone()));
            }
        }

        let mut resolution = Resolution::default();
        let mut candidates = 0usize;
        let extension = self.facility.image_extension();

        for root in &roots {
            for (dir, output_name) in self.candidates(root, &mut resolution.skipped)? {
                candidates += 1;
                let images = list_images(&dir, extension)?;
                if images.is_empty() {
                    info!(dir = %dir.display(), extension, "no images found, skipping directory");
                    resolution.skipped.push(dir);
                    continue;
                }
                debug!(dir = %dir.display(), images = images.len(), "resolved source directory");
                resolution.sources.push(SourceDirectory {
                    source_dir: dir,
                    output_name,
                    images,
                });
            }
        }

        if candidates == 0 {
            return Err(ResolveError::NoDirectories {
                facility: self.facility.token().to_string(),
                roots: roots
                    .iter()
                    .map(|r| r.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        if resolution.sources.is_empty() {
            return Err(ResolveError::NoImages {
                extension,
                directories: candidates,
            });
        }
        Ok(resolution)
    }

    /// Directories under `root` that should hold images, paired with their output names.
    fn candidates(
        &self,
        root: &Path,
        skipped: &mut Vec<PathBuf>,
    ) -> Result<Vec<(PathBuf, String)>, ResolveError> {
        match self.facility {
            Facility::ApsSingle => {
                let name = dir_name(root);
                if self.keeps(&name) {
                    Ok(vec![(root.to_path_buf(), name)])
                } else {
                    Ok(Vec::new())
                }
            }
            Facility::ApsMulti | Facility::Ssrl => Ok(self
                .subdirectories(root)?
                .into_iter()
                .map(|dir| {
                    let name = dir_name(&dir);
                    (dir, name)
                })
                .collect()),
            Facility::Nsls2 => {
                let mut found = Vec::new();
                for sample in self.subdirectories(root)? {
                    let frames = sample.join(NSLS2_IMAGE_SUBDIR);
                    if frames.is_dir() {
                        found.push((frames, dir_name(&sample)));
                    } else {
                        info!(
                            dir = %sample.display(),
                            "no {NSLS2_IMAGE_SUBDIR} subdirectory, skipping"
                        );
                        skipped.push(sample);
                    }
                }
                Ok(found)
            }
        }
    }

    fn keeps(&self, name: &str) -> bool {
        match &self.keyword {
            Some(keyword) => name.contains(keyword.as_str()),
            None => true,
        }
    }

    /// Immediate, non-hidden subdirectories of `root` that pass the keyword filter, sorted.
    fn subdirectories(&self, root: &Path) -> Result<Vec<PathBuf>, ResolveError> {
        let mut dirs = Vec::new();
        for entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| ResolveError::Io {
                path: root.to_path_buf(),
                source: e.into(),
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') || !self.keeps(&name) {
                continue;
            }
            dirs.push(entry.into_path());
        }
        Ok(dirs)
    }
}

/// Regular files directly inside `dir` whose extension matches, case-insensitively.
fn list_images(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, ResolveError> {
    let mut images = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| ResolveError::Io {
            path: dir.to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        if matches {
            images.push(entry.into_path());
        }
    }
    Ok(images)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .or_else(|| {
            path.canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        })
        .unwrap_or_else(|| "integrated".to_string())
}

/// Create `output_root/<output_name>` for every source (reusing existing directories) and
/// flatten the resolution into work items, in resolution order.
pub fn build_worklist(
    resolution: &Resolution,
    output_root: &Path,
) -> Result<Vec<WorkItem>, ResolveError> {
    let mut items = Vec::with_capacity(resolution.image_count());
    for source in &resolution.sources {
        let output_dir = output_root.join(&source.output_name);
        fs::create_dir_all(&output_dir).map_err(|e| ResolveError::OutputDir {
            path: output_dir.clone(),
            source: e,
        })?;
        for image in &source.images {
            let output_stem = image
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            items.push(WorkItem {
                source_image: image.clone(),
                output_dir: output_dir.clone(),
                output_stem,
            });
        }
    }
    Ok(items)
}
