use crate::error::ConfigError;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const RESOURCE_PREFIX: &str = "resources";
pub const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:5001";
pub const DEFAULT_ENGINE_JAR: &str = "/pdffigures2/pdffigures2.jar";
pub const DEFAULT_JAVA_OPTS: &str = "-XX:MaxRAMPercentage=75.0";

/// How the external figure engine is launched.
///
/// Per-invocation arguments (input file, figure prefix, data prefix, dpi) are
/// appended after `args`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub dpi: u32,
    pub timeout: Duration,
    /// How long to wait for the process to exit after it has been killed.
    pub kill_grace: Duration,
    pub zero_based_pages: bool,
}

impl EngineConfig {
    pub fn pdffigures2(jar_path: impl Into<String>, java_opts: &str) -> Self {
        let mut args: Vec<String> = java_opts.split_whitespace().map(str::to_string).collect();
        args.push("-Dsun.java2d.cmm=sun.java2d.cmm.kcms.KcmsServiceProvider".to_string());
        args.push("-jar".to_string());
        args.push(jar_path.into());

        Self {
            program: "java".to_string(),
            args,
            ..Self::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "java".to_string(),
            args: vec![
                DEFAULT_JAVA_OPTS.to_string(),
                "-Dsun.java2d.cmm=sun.java2d.cmm.kcms.KcmsServiceProvider".to_string(),
                "-jar".to_string(),
                DEFAULT_ENGINE_JAR.to_string(),
            ],
            working_dir: None,
            dpi: 300,
            timeout: Duration::from_secs(120),
            kill_grace: Duration::from_secs(5),
            zero_based_pages: true,
        }
    }
}

/// Process-wide settings, built once at startup and handed to each component.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub output_root: PathBuf,
    pub public_base_url: Url,
    pub download_timeout: Duration,
    pub max_concurrent_jobs: usize,
    /// Zero rejects immediately when every job slot is taken.
    pub admission_timeout: Duration,
    pub max_document_bytes: u64,
    pub engine: EngineConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("output"),
            public_base_url: Url::parse(DEFAULT_PUBLIC_BASE_URL)
                .unwrap_or_else(|_| unreachable!("default base url is valid")),
            download_timeout: Duration::from_secs(30),
            max_concurrent_jobs: 4,
            admission_timeout: Duration::ZERO,
            max_document_bytes: 50 * 1024 * 1024,
            engine: EngineConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn with_output_root(mut self, output_root: impl Into<PathBuf>) -> Self {
        self.output_root = output_root.into();
        self
    }

    pub fn with_public_base_url(mut self, base: &str) -> Result<Self, ConfigError> {
        self.public_base_url = Url::parse(base)?;
        Ok(self)
    }

    /// Durable directory that published artifacts are moved into.
    pub fn artifact_root(&self) -> PathBuf {
        self.output_root.join("artifacts")
    }

    /// Parent of every per-job workspace.
    pub fn work_root(&self) -> PathBuf {
        self.output_root.join("work")
    }

    /// `<public base>/resources/<file name>`
    pub fn resource_url(&self, file_name: &str) -> String {
        crate::normalize::resource_url(&self.public_base_url, file_name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.public_base_url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                field: "public_base_url",
                reason: format!("unsupported scheme '{}'", self.public_base_url.scheme()),
            });
        }

        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_jobs",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.download_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "download_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.engine.timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "engine.timeout",
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.engine.program.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "engine.program",
                reason: "must not be empty".to_string(),
            });
        }

        if self.max_document_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_document_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}
