//! Model references and the CmdStan build toolchain.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Result, StanError};
use crate::obs;

/// A model given either as Stan source or as an already compiled executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum ModelReference {
    /// A `.stan` source file; compiled before running.
    Source(PathBuf),
    /// A CmdStan model executable.
    Executable(PathBuf),
}

impl ModelReference {
    /// Classify `path` by extension: `.stan` is source, anything else an executable.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.extension().is_some_and(|ext| ext == "stan") {
            ModelReference::Source(path)
        } else {
            ModelReference::Executable(path)
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ModelReference::Source(p) | ModelReference::Executable(p) => p,
        }
    }

    /// Return a runnable executable, compiling into `build_dir` if this is source.
    pub async fn resolve(&self, cmdstan: &CmdStan, build_dir: &Path) -> Result<PathBuf> {
        match self {
            ModelReference::Executable(path) => {
                if !path.is_file() {
                    return Err(StanError::Io {
                        path: path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "model executable not found",
                        ),
                    });
                }
                Ok(path.clone())
            }
            ModelReference::Source(path) => cmdstan.compile(path, build_dir).await,
        }
    }
}

/// Location of a CmdStan installation and the tools used from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CmdStan {
    /// CmdStan home directory (contains `makefile` and `bin/`).
    pub home: Option<PathBuf>,
    /// `make` program used to compile models.
    pub make: PathBuf,
    /// Override for the `diagnose` tool; defaults to `<home>/bin/diagnose`.
    pub diagnose: Option<PathBuf>,
}

impl Default for CmdStan {
    fn default() -> Self {
        CmdStan {
            home: std::env::var_os("CMDSTAN")
                .or_else(|| std::env::var_os("CMDSTAN_HOME"))
                .map(PathBuf::from),
            make: std::env::var_os("STANRUN_MAKE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("make")),
            diagnose: None,
        }
    }
}

impl CmdStan {
    /// Configuration from `CMDSTAN` (or `CMDSTAN_HOME`) and `STANRUN_MAKE`.
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Use the installation at `home`.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        CmdStan {
            home: Some(home.into()),
            make: PathBuf::from("make"),
            diagnose: None,
        }
    }

    pub fn with_make(mut self, make: impl Into<PathBuf>) -> Self {
        self.make = make.into();
        self
    }

    pub fn with_diagnose(mut self, diagnose: impl Into<PathBuf>) -> Self {
        self.diagnose = Some(diagnose.into());
        self
    }

    fn home(&self) -> Result<&Path> {
        self.home
            .as_deref()
            .ok_or_else(|| StanError::CmdStanNotFound {
                reason: "set CMDSTAN to the CmdStan installation directory".to_string(),
            })
    }

    /// Path of the `diagnose` tool, if one can be determined.
    pub fn diagnose_path(&self) -> Option<PathBuf> {
        self.diagnose.clone().or_else(|| {
            self.home.as_ref().map(|home| {
                home.join("bin")
                    .join(format!("diagnose{}", std::env::consts::EXE_SUFFIX))
            })
        })
    }

    /// Compile `model` and copy the executable to `output`.
    pub async fn build_executable(&self, model: &Path, output: &Path) -> Result<PathBuf> {
        let build_dir = tempfile::tempdir().map_err(StanError::io(std::env::temp_dir()))?;
        let exe = self.compile(model, build_dir.path()).await?;
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StanError::io(parent))?;
        }
        tokio::fs::copy(&exe, output)
            .await
            .map_err(StanError::io(output))?;
        Ok(output.to_path_buf())
    }

    /// Compile `model` into `build_dir`, reusing an earlier build of identical source.
    ///
    /// Builds land in `<build_dir>/<stem>-<digest>/<stem>` where `digest` is the
    /// leading 16 hex characters of the source's SHA-256.
    pub async fn compile(&self, model: &Path, build_dir: &Path) -> Result<PathBuf> {
        let home = self.home()?;
        let source = tokio::fs::read(model).await.map_err(StanError::io(model))?;

        let stem = model
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StanError::Compilation {
                model: model.to_path_buf(),
                stderr: "model file name has no usable stem".to_string(),
            })?;
        let digest = source_digest(&source);

        tokio::fs::create_dir_all(build_dir)
            .await
            .map_err(StanError::io(build_dir))?;
        let build_dir = tokio::fs::canonicalize(build_dir)
            .await
            .map_err(StanError::io(build_dir))?;
        let target_dir = build_dir.join(format!("{stem}-{}", &digest[..16]));
        let exe = target_dir.join(format!("{stem}{}", std::env::consts::EXE_SUFFIX));

        if exe.is_file() {
            debug!(model = %model.display(), exe = %exe.display(), "reusing compiled model");
            return Ok(exe);
        }

        tokio::fs::create_dir_all(&target_dir)
            .await
            .map_err(StanError::io(&target_dir))?;
        let staged = target_dir.join(format!("{stem}.stan"));
        tokio::fs::write(&staged, &source)
            .await
            .map_err(StanError::io(&staged))?;

        info!(model = %model.display(), home = %home.display(), "compiling model");
        let output = Command::new(&self.make)
            .arg(&exe)
            .current_dir(home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| StanError::Launch {
                program: self.make.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stderr = if stderr.is_empty() {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            } else {
                stderr
            };
            return Err(StanError::Compilation {
                model: model.to_path_buf(),
                stderr,
            });
        }
        if !exe.is_file() {
            return Err(StanError::Compilation {
                model: model.to_path_buf(),
                stderr: format!("make succeeded but {} was not produced", exe.display()),
            });
        }

        obs::emit_model_compiled(model, &exe);
        Ok(exe)
    }
}

/// Compile `model` with the CmdStan found through the environment and place
/// the executable at `output`.
pub async fn build_executable(model: &Path, output: &Path) -> Result<PathBuf> {
    CmdStan::from_env().build_executable(model, output).await
}

fn source_digest(source: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source);
    hex::encode(hasher.finalize())
}
