/// Template store and named profile registry
///
/// Profiles are persisted as a JSON object mapping a profile name to an
/// ordered list of template image paths, indented with four spaces:
///
/// ```json
/// {
///     "daily": [
///         "templates/accept.png",
///         "templates/continue.png"
///     ]
/// }
/// ```
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::GrayImage;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::capture::to_grayscale;
use crate::error::{ProfileError, TemplateError, ValidationError};

/// A reference image and its identity.
///
/// The decoded buffer is shared, so cloning a template (or a whole profile
/// snapshot) never copies pixels. A template whose file failed to decode is
/// kept with no image and skipped by the matcher.
#[derive(Debug, Clone)]
pub struct TemplateRef {
    name: String,
    path: Option<PathBuf>,
    image: Option<Arc<GrayImage>>,
}

impl TemplateRef {
    /// Decode an image file to grayscale; failures are logged, not raised
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let image = match decode(path) {
            Ok(image) => Some(Arc::new(image)),
            Err(err) => {
                warn!("Template unavailable: {err}");
                None
            }
        };

        Self {
            name: display_name(path),
            path: Some(path.to_path_buf()),
            image,
        }
    }

    /// Decode an image file, failing if it cannot be read
    pub fn try_from_path(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let image = decode(path)?;
        Ok(Self {
            name: display_name(path),
            path: Some(path.to_path_buf()),
            image: Some(Arc::new(image)),
        })
    }

    /// Wrap an already decoded image
    pub fn from_image(name: impl Into<String>, image: GrayImage) -> Self {
        Self {
            name: name.into(),
            path: None,
            image: Some(Arc::new(image)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_decoded(&self) -> bool {
        self.image.is_some()
    }

    pub fn image(&self) -> Result<&GrayImage, TemplateError> {
        self.image
            .as_deref()
            .ok_or_else(|| TemplateError::NotDecoded(self.name.clone()))
    }
}

/// Decode any supported image format to a grayscale buffer
pub fn decode(path: &Path) -> Result<GrayImage, TemplateError> {
    let image = image::open(path).map_err(|source| TemplateError::DecodeFailed {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(to_grayscale(&image.to_rgba8()))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Registry shared read-mostly between automation groups
pub type SharedProfiles = Arc<RwLock<ProfileRegistry>>;

/// Named, ordered template path lists backed by a JSON file
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    path: PathBuf,
    profiles: BTreeMap<String, Vec<String>>,
}

impl ProfileRegistry {
    /// Empty registry that will save to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            profiles: BTreeMap::new(),
        }
    }

    /// Load from `path`; a missing file yields an empty registry
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ProfileError> {
        let path = path.into();
        if !path.exists() {
            info!("No profile file at {}, starting empty", path.display());
            return Ok(Self::new(path));
        }

        let load_err = |source: Box<dyn std::error::Error + Send + Sync>| ProfileError::LoadFailed {
            path: path.display().to_string(),
            source,
        };
        let contents = fs::read_to_string(&path).map_err(|e| load_err(Box::new(e)))?;
        let profiles: BTreeMap<String, Vec<String>> =
            serde_json::from_str(&contents).map_err(|e| load_err(Box::new(e)))?;

        info!("Loaded {} profile(s) from {}", profiles.len(), path.display());
        Ok(Self { path, profiles })
    }

    /// Write the registry as 4-space indented JSON
    pub fn save(&self) -> Result<(), ProfileError> {
        let save_err = |source: Box<dyn std::error::Error + Send + Sync>| ProfileError::SaveFailed {
            path: self.path.display().to_string(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| save_err(Box::new(e)))?;
            }
        }

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.profiles
            .serialize(&mut ser)
            .map_err(|e| save_err(Box::new(e)))?;

        fs::write(&self.path, buf).map_err(|e| save_err(Box::new(e)))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.profiles.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Insert or replace a profile; empty names and empty lists are rejected
    pub fn upsert(&mut self, name: &str, paths: Vec<String>) -> Result<(), ValidationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyProfileName);
        }
        if paths.is_empty() {
            return Err(ValidationError::EmptyProfile);
        }
        self.profiles.insert(name.to_string(), paths);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Vec<String>, ProfileError> {
        self.profiles
            .remove(name)
            .ok_or_else(|| ProfileError::NotFound(name.to_string()))
    }

    /// Decode every template of a profile, in order.
    ///
    /// Relative paths resolve against the directory holding the registry file.
    /// Undecodable files stay in the list with no image.
    pub fn load_templates(&self, name: &str) -> Result<Vec<TemplateRef>, ProfileError> {
        let paths = self
            .get(name)
            .ok_or_else(|| ProfileError::NotFound(name.to_string()))?;
        let base = self.path.parent().unwrap_or_else(|| Path::new(""));

        Ok(paths
            .iter()
            .map(|p| {
                let path = Path::new(p);
                if path.is_absolute() {
                    TemplateRef::from_path(path)
                } else {
                    TemplateRef::from_path(base.join(path))
                }
            })
            .collect())
    }
}
