//! Worker runtime discovery and first-run bootstrap
//!
//! The backend is a Python program. Before it can be spawned we need an
//! interpreter that has the backend's dependencies installed. Lookup order:
//!
//! 1. `VOICETOTEX_PYTHON` (or `[provision] python` in config)
//! 2. Pre-bundled runtime shipped next to the backend
//! 3. User-scoped environment created by a previous bootstrap
//! 4. System `python3`/`python`
//!
//! When neither a bundled nor a bootstrapped runtime exists but the backend
//! ships a `requirements.txt`, [`Provisioner::prepare`] creates a virtual
//! environment and installs the manifest into it before spawning.

pub mod accel;
pub mod bootstrap;

use crate::config::{Config, PYTHON_ENV};
use crate::error::ProvisionError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Dependency manifest shipped in the backend directory
pub const MANIFEST_NAME: &str = "requirements.txt";

/// Written into the environment once the manifest installed cleanly
const BOOTSTRAP_MARKER: &str = ".voicetotex-bootstrapped";

/// Where the chosen interpreter came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpreterSource {
    Override,
    Bundled,
    Bootstrapped,
    System,
    /// Nothing found; bundled path returned so the spawn error names it
    Fallback,
}

impl InterpreterSource {
    pub fn display_name(&self) -> &'static str {
        match self {
            InterpreterSource::Override => "override",
            InterpreterSource::Bundled => "bundled",
            InterpreterSource::Bootstrapped => "bootstrapped",
            InterpreterSource::System => "system",
            InterpreterSource::Fallback => "fallback (not found)",
        }
    }
}

/// Resolved interpreter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    pub path: PathBuf,
    pub source: InterpreterSource,
}

/// Everything needed to launch the worker once
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
    /// Added on top of the inherited environment
    pub env: Vec<(OsString, OsString)>,
    /// Command-line fragment identifying our worker in a process listing
    pub signature: String,
}

impl SpawnSpec {
    /// Value this spec sets for an environment variable, if any
    pub fn env_value(&self, key: &str) -> Option<&OsString> {
        self.env.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// Progress callback used while the runtime is being bootstrapped
pub type ProgressFn = dyn Fn(String) + Send + Sync;

/// Locates or bootstraps the worker runtime
#[derive(Debug, Clone)]
pub struct Provisioner {
    backend_dir: PathBuf,
    script: String,
    args: Vec<String>,
    port: Option<u16>,
    python_override: Option<PathBuf>,
    bundled_dir: PathBuf,
    venv_dir: PathBuf,
    venv_timeout: Duration,
    install_timeout: Duration,
}

impl Provisioner {
    /// Build from config, reading the interpreter override from the process environment
    pub fn from_config(config: &Config) -> Self {
        Self::from_config_with_env(config, |key| std::env::var_os(key))
    }

    /// Build from config with an explicit environment lookup
    pub fn from_config_with_env<F>(config: &Config, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let backend_dir = config.resolve_backend_dir();
        let python_override = lookup(PYTHON_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| config.provision.python.clone());
        let bundled_dir = config
            .provision
            .bundled_dir
            .clone()
            .unwrap_or_else(|| default_bundled_dir(&backend_dir));

        Self {
            backend_dir,
            script: config.worker.script.clone(),
            args: config.worker.args.clone(),
            port: config.worker.port,
            python_override,
            bundled_dir,
            venv_dir: config.resolve_venv_dir(),
            venv_timeout: Duration::from_secs(config.provision.venv_timeout_secs),
            install_timeout: Duration::from_secs(config.provision.install_timeout_secs),
        }
    }

    /// Pin the interpreter, taking priority over the environment variable
    pub fn with_python_override(mut self, python: Option<PathBuf>) -> Self {
        if python.is_some() {
            self.python_override = python;
        }
        self
    }

    pub fn backend_dir(&self) -> &Path {
        &self.backend_dir
    }

    pub fn script_path(&self) -> PathBuf {
        self.backend_dir.join(&self.script)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.backend_dir.join(MANIFEST_NAME)
    }

    pub fn bundled_interpreter(&self) -> PathBuf {
        interpreter_in(&self.bundled_dir)
    }

    pub fn venv_interpreter(&self) -> PathBuf {
        interpreter_in(&self.venv_dir)
    }

    /// A bootstrapped environment counts only once its install finished
    pub fn venv_is_complete(&self) -> bool {
        self.venv_interpreter().is_file() && self.venv_dir.join(BOOTSTRAP_MARKER).is_file()
    }

    /// Find the interpreter to run the worker with
    ///
    /// Never fails: if nothing is installed the bundled path is returned so
    /// the spawn error carries a concrete path.
    pub fn locate_interpreter(&self) -> Interpreter {
        if let Some(ref path) = self.python_override {
            return Interpreter {
                path: path.clone(),
                source: InterpreterSource::Override,
            };
        }

        let bundled = self.bundled_interpreter();
        if bundled.is_file() {
            return Interpreter {
                path: bundled,
                source: InterpreterSource::Bundled,
            };
        }

        if self.venv_is_complete() {
            return Interpreter {
                path: self.venv_interpreter(),
                source: InterpreterSource::Bootstrapped,
            };
        }

        if let Some(system) = find_system_python() {
            return Interpreter {
                path: system,
                source: InterpreterSource::System,
            };
        }

        tracing::warn!("No Python interpreter found, falling back to {:?}", bundled);
        Interpreter {
            path: bundled,
            source: InterpreterSource::Fallback,
        }
    }

    /// True when a runtime has to be created before the first spawn
    pub fn needs_bootstrap(&self) -> bool {
        self.python_override.is_none()
            && !self.bundled_interpreter().is_file()
            && !self.venv_is_complete()
            && self.manifest_path().is_file()
    }

    /// Create the user-scoped runtime and install the backend manifest into it
    ///
    /// `progress` receives a human-readable line before each step. A failed
    /// install removes the half-built environment so the next run starts over.
    pub async fn bootstrap(&self, progress: &ProgressFn) -> Result<PathBuf, ProvisionError> {
        let base = find_system_python().ok_or(ProvisionError::NoBaseInterpreter)?;
        self.bootstrap_from(&base, progress).await
    }

    async fn bootstrap_from(
        &self,
        base: &Path,
        progress: &ProgressFn,
    ) -> Result<PathBuf, ProvisionError> {
        tracing::info!("Bootstrapping Python environment with {:?}", base);

        progress("Creating Python environment...".to_string());
        bootstrap::create_venv(base, &self.venv_dir, self.venv_timeout).await?;

        progress(
            "Installing backend dependencies (first run, this can take several minutes)..."
                .to_string(),
        );
        let python = self.venv_interpreter();
        let manifest = self.manifest_path();
        let installed = bootstrap::install_manifest(&python, &manifest, self.install_timeout).await;
        if let Err(e) = installed {
            self.discard_venv();
            return Err(e);
        }

        std::fs::write(self.venv_dir.join(BOOTSTRAP_MARKER), b"").map_err(|e| {
            ProvisionError::VenvFailed {
                path: self.venv_dir.clone(),
                reason: format!("cannot record completed install: {}", e),
            }
        })?;

        tracing::info!("Python environment ready at {:?}", self.venv_dir);
        Ok(python)
    }

    fn discard_venv(&self) {
        tracing::warn!("Removing incomplete Python environment at {:?}", self.venv_dir);
        if let Err(e) = std::fs::remove_dir_all(&self.venv_dir) {
            tracing::warn!("Failed to remove {:?}: {}", self.venv_dir, e);
        }
    }

    /// Resolve spawn parameters, bootstrapping the runtime if required
    pub async fn prepare(&self, progress: &ProgressFn) -> Result<SpawnSpec, ProvisionError> {
        if !self.backend_dir.is_dir() {
            return Err(ProvisionError::BackendMissing(self.backend_dir.clone()));
        }

        if self.needs_bootstrap() {
            self.bootstrap(progress).await?;
        }

        let interpreter = self.locate_interpreter();
        tracing::info!(
            "Using Python interpreter {:?} ({})",
            interpreter.path,
            interpreter.source.display_name()
        );

        let accel = accel::discover_accelerator_path(&interpreter.path);
        Ok(self.spawn_spec(&interpreter, &accel))
    }

    /// Build spawn parameters for a known interpreter and accelerator dirs
    pub fn spawn_spec(&self, interpreter: &Interpreter, accel_dirs: &[PathBuf]) -> SpawnSpec {
        let script = self.script_path();

        let mut args: Vec<OsString> = vec![script.clone().into_os_string()];
        if let Some(port) = self.port {
            args.push("--port".into());
            args.push(port.to_string().into());
        }
        args.extend(self.args.iter().map(OsString::from));

        let mut env: Vec<(OsString, OsString)> = vec![("PYTHONUNBUFFERED".into(), "1".into())];
        if let Some(search_path) =
            accel::prefixed_search_path(accel_dirs, std::env::var_os(accel::LIBRARY_PATH_VAR))
        {
            env.push((accel::LIBRARY_PATH_VAR.into(), search_path));
        }

        SpawnSpec {
            program: interpreter.path.clone(),
            args,
            cwd: self.backend_dir.clone(),
            env,
            signature: script.to_string_lossy().into_owned(),
        }
    }
}

/// Bundled runtime sits beside the backend directory: `<resources>/python`
fn default_bundled_dir(backend_dir: &Path) -> PathBuf {
    backend_dir
        .parent()
        .map(|p| p.join("python"))
        .unwrap_or_else(|| PathBuf::from("python"))
}

/// Interpreter path inside a runtime or virtual environment root
pub fn interpreter_in(root: &Path) -> PathBuf {
    if cfg!(windows) {
        root.join("Scripts").join("python.exe")
    } else {
        root.join("bin").join("python3")
    }
}

/// First system interpreter found
pub fn find_system_python() -> Option<PathBuf> {
    let candidates = [
        which::which("python3").ok(),
        which::which("python").ok(),
        Some(PathBuf::from("/usr/bin/python3")),
        Some(PathBuf::from("/usr/local/bin/python3")),
    ];

    candidates.into_iter().flatten().find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config_for(backend: &Path, venv: &Path) -> Config {
        let mut config = Config::default();
        config.worker.backend_dir = Some(backend.to_path_buf());
        config.provision.venv_dir = Some(venv.to_path_buf());
        config.provision.bundled_dir = Some(backend.join("no-bundle"));
        config
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    /// Stand-in for `python -m venv` whose environment runs `pip` as `pip_exe`
    #[cfg(target_os = "linux")]
    fn fake_base_python(dir: &Path, pip_exe: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("base-python");
        let script = format!(
            "#!/bin/sh\n# -m venv <dir>\nmkdir -p \"$3/bin\" && ln -sf {} \"$3/bin/python3\"\n",
            pip_exe
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path(), &dir.path().join("venv"));
        let provisioner = Provisioner::from_config_with_env(&config, |key| {
            (key == PYTHON_ENV).then(|| OsString::from("/opt/custom/python"))
        });

        let found = provisioner.locate_interpreter();
        assert_eq!(found.source, InterpreterSource::Override);
        assert_eq!(found.path, PathBuf::from("/opt/custom/python"));
        assert!(!provisioner.needs_bootstrap());
    }

    #[test]
    fn test_bundled_before_venv() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(dir.path(), &dir.path().join("venv"));
        config.provision.bundled_dir = Some(dir.path().join("python"));
        let provisioner = Provisioner::from_config_with_env(&config, |_| None);

        touch(&provisioner.bundled_interpreter());
        touch(&provisioner.venv_interpreter());
        touch(&dir.path().join("venv").join(BOOTSTRAP_MARKER));

        let found = provisioner.locate_interpreter();
        assert_eq!(found.source, InterpreterSource::Bundled);
    }

    #[test]
    fn test_bootstrapped_venv_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path(), &dir.path().join("venv"));
        let provisioner = Provisioner::from_config_with_env(&config, |_| None);
        touch(&provisioner.venv_interpreter());
        touch(&dir.path().join("venv").join(BOOTSTRAP_MARKER));

        let found = provisioner.locate_interpreter();
        assert_eq!(found.source, InterpreterSource::Bootstrapped);
        assert_eq!(found.path, provisioner.venv_interpreter());
    }

    #[test]
    fn test_needs_bootstrap_only_with_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path(), &dir.path().join("venv"));
        let provisioner = Provisioner::from_config_with_env(&config, |_| None);
        assert!(!provisioner.needs_bootstrap());

        touch(&provisioner.manifest_path());
        assert!(provisioner.needs_bootstrap());

        // An interpreter without the marker is a half-finished install
        touch(&provisioner.venv_interpreter());
        assert!(provisioner.needs_bootstrap());
        assert_ne!(provisioner.locate_interpreter().source, InterpreterSource::Bootstrapped);

        touch(&dir.path().join("venv").join(BOOTSTRAP_MARKER));
        assert!(!provisioner.needs_bootstrap());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_install_discards_environment() {
        let dir = tempfile::tempdir().unwrap();
        let venv = dir.path().join("venv");
        let config = config_for(dir.path(), &venv);
        fs::write(dir.path().join(MANIFEST_NAME), "no_such_wheel-0.0.whl\n").unwrap();
        let provisioner = Provisioner::from_config_with_env(&config, |_| None);
        let base = fake_base_python(dir.path(), "/bin/false");

        let err = provisioner.bootstrap_from(&base, &|_| {}).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InstallFailed { .. }), "{}", err);

        assert!(!venv.exists());
        assert!(provisioner.needs_bootstrap());
        assert_ne!(provisioner.locate_interpreter().source, InterpreterSource::Bootstrapped);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_completed_install_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let venv = dir.path().join("venv");
        let config = config_for(dir.path(), &venv);
        touch(&dir.path().join(MANIFEST_NAME));
        let provisioner = Provisioner::from_config_with_env(&config, |_| None);
        let base = fake_base_python(dir.path(), "/bin/true");

        let steps = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&steps);
        let python = provisioner
            .bootstrap_from(&base, &move |line| sink.lock().unwrap().push(line))
            .await
            .unwrap();
        assert_eq!(python, provisioner.venv_interpreter());
        assert_eq!(steps.lock().unwrap().len(), 2);

        assert!(venv.join(BOOTSTRAP_MARKER).is_file());
        assert!(!provisioner.needs_bootstrap());
        assert_eq!(provisioner.locate_interpreter().source, InterpreterSource::Bootstrapped);
    }

    #[test]
    fn test_spawn_spec_environment() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(dir.path(), &dir.path().join("venv"));
        config.worker.port = Some(8765);
        let provisioner = Provisioner::from_config_with_env(&config, |_| None);
        let interpreter = Interpreter {
            path: PathBuf::from("/usr/bin/python3"),
            source: InterpreterSource::System,
        };

        let spec = provisioner.spawn_spec(&interpreter, &[]);
        assert_eq!(spec.program, PathBuf::from("/usr/bin/python3"));
        assert_eq!(spec.args[0], dir.path().join("server.py").into_os_string());
        assert_eq!(spec.args[1], OsString::from("--port"));
        assert_eq!(spec.args[2], OsString::from("8765"));
        assert_eq!(spec.cwd, dir.path());
        assert_eq!(spec.env_value("PYTHONUNBUFFERED"), Some(&OsString::from("1")));
        assert!(spec.env_value(accel::LIBRARY_PATH_VAR).is_none());
        assert!(spec.signature.ends_with("server.py"));

        let with_gpu = provisioner.spawn_spec(&interpreter, &[PathBuf::from("/gpu/lib")]);
        let search = with_gpu.env_value(accel::LIBRARY_PATH_VAR).unwrap();
        assert!(search.to_string_lossy().starts_with("/gpu/lib"));
    }

    #[tokio::test]
    async fn test_prepare_rejects_missing_backend() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let config = config_for(&missing, &dir.path().join("venv"));
        let provisioner = Provisioner::from_config_with_env(&config, |_| None);

        let result = provisioner.prepare(&|_| {}).await;
        assert!(matches!(result, Err(ProvisionError::BackendMissing(_))));
    }

    #[tokio::test]
    async fn test_prepare_with_override_skips_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path(), &dir.path().join("venv"));
        touch(&dir.path().join(MANIFEST_NAME));
        let provisioner = Provisioner::from_config_with_env(&config, |key| {
            (key == PYTHON_ENV).then(|| OsString::from("/bin/sh"))
        });

        let spec = provisioner.prepare(&|_| panic!("no bootstrap expected")).await.unwrap();
        assert_eq!(spec.program, PathBuf::from("/bin/sh"));
    }
}
