use directories::ProjectDirs;
use std::path::PathBuf;

/// Application directories following the XDG base directory layout
#[derive(Debug, Clone)]
pub struct Directories {
    /// Config directory (~/.config/worlty)
    pub config: PathBuf,

    /// Data directory (~/.local/share/worlty)
    pub data: PathBuf,

    /// Config file path
    pub config_file: PathBuf,

    /// Persisted session state (device map, identity, connection parameters)
    pub state_file: PathBuf,
}

impl Directories {
    /// Resolve the standard XDG paths.
    ///
    /// Falls back to `./.worlty` when no home directory can be determined.
    #[must_use]
    pub fn new() -> Self {
        let Some(project) = ProjectDirs::from("", "", "worlty") else {
            return Self::with_base(PathBuf::from(".worlty"));
        };

        let config = project.config_dir().to_path_buf();
        let data = project.data_dir().to_path_buf();

        Self {
            config_file: config.join("config.json"),
            state_file: data.join("state.json"),
            config,
            data,
        }
    }

    #[must_use]
    pub fn with_base(base: PathBuf) -> Self {
        Self {
            config_file: base.join("config.json"),
            state_file: base.join("state.json"),
            config: base.clone(),
            data: base,
        }
    }

    /// Ensure all directories exist.
    ///
    /// # Errors
    ///
    /// Returns an error if any directory cannot be created.
    pub fn ensure_exists(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config)?;
        std::fs::create_dir_all(&self.data)?;
        Ok(())
    }
}

impl Default for Directories {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_base_sets_all_paths() {
        let base = PathBuf::from("/tmp/test-worlty");
        let dirs = Directories::with_base(base.clone());

        assert_eq!(dirs.config, base);
        assert_eq!(dirs.data, base);
        assert_eq!(dirs.config_file, base.join("config.json"));
        assert_eq!(dirs.state_file, base.join("state.json"));
    }

    #[test]
    fn test_ensure_exists_creates_directories() {
        let temp_dir = tempfile::tempdir().unwrap();
        let base = temp_dir.path().join("worlty-test-subdir");
        let dirs = Directories::with_base(base.clone());

        assert!(!base.exists());
        dirs.ensure_exists().unwrap();
        dirs.ensure_exists().unwrap();

        assert!(dirs.config.exists());
        assert!(dirs.data.exists());
    }

    #[test]
    fn test_new_returns_named_paths() {
        let dirs = Directories::new();

        assert!(dirs.config_file.to_string_lossy().ends_with("config.json"));
        assert!(dirs.state_file.to_string_lossy().ends_with("state.json"));
    }
}
