use crate::{
    models::variant::OutputEncoding,
    services::planner::{DEFAULT_QUALITY, DerivationProfile},
    storage::b2::{B2Config, DEFAULT_API_URL, DEFAULT_SESSION_TTL},
};
use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use std::{env, fmt, path::PathBuf, str::FromStr};

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_FILES: usize = 10;
pub const DEFAULT_MAX_DERIVATIONS: usize = 4;

/// Per-request ceilings enforced before any processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntakeLimits {
    pub max_upload_bytes: u64,
    pub max_files: usize,
}

impl Default for IntakeLimits {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

impl IntakeLimits {
    /// Body limit for a whole multipart request, with room for part headers.
    pub fn body_limit(&self) -> usize {
        let files = self.max_files.max(1) as u64;
        let total = self
            .max_upload_bytes
            .saturating_mul(files)
            .saturating_add(64 * 1024);
        usize::try_from(total).unwrap_or(usize::MAX)
    }
}

#[derive(Debug, Clone)]
pub enum StorageBackend {
    B2(B2Config),
    Local { dir: PathBuf, public_url: String },
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub backend: StorageBackend,
    pub limits: IntakeLimits,
    pub profile: DerivationProfile,
    pub encoding: OutputEncoding,
    pub quality: u8,
    pub max_derivations: usize,
    pub jwt_secret: String,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("backend", &self.backend)
            .field("limits", &self.limits)
            .field("profile", &self.profile)
            .field("encoding", &self.encoding)
            .field("quality", &self.quality)
            .field("max_derivations", &self.max_derivations)
            .field("jwt_secret", &"***")
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Image intake and derivation service")]
pub struct Args {
    /// Host to bind to (overrides IMAGE_INTAKE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides IMAGE_INTAKE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides IMAGE_INTAKE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Storage backend, `b2` or `local` (overrides IMAGE_INTAKE_BACKEND)
    #[arg(long)]
    pub backend: Option<String>,

    /// Directory for the local backend (overrides IMAGE_INTAKE_LOCAL_DIR)
    #[arg(long)]
    pub local_dir: Option<String>,

    /// Derivation profile: fast, balanced, full (overrides IMAGE_INTAKE_PROFILE)
    #[arg(long)]
    pub profile: Option<String>,

    /// Output format: webp, jpeg, png (overrides IMAGE_INTAKE_FORMAT)
    #[arg(long)]
    pub format: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over values read through `lookup`.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let host = args
            .host
            .or_else(|| var("IMAGE_INTAKE_HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = match args.port {
            Some(port) => port,
            None => parse_var(&var, "IMAGE_INTAKE_PORT")?.unwrap_or(3000),
        };
        let database_url = args
            .database_url
            .or_else(|| var("IMAGE_INTAKE_DATABASE_URL"))
            .unwrap_or_else(|| "sqlite://./data/meta/image_intake.db".into());

        let backend_name = args
            .backend
            .or_else(|| var("IMAGE_INTAKE_BACKEND"))
            .unwrap_or_else(|| "local".into());
        let backend = match backend_name.trim().to_ascii_lowercase().as_str() {
            "b2" => StorageBackend::B2(b2_config(&var)?),
            "local" => StorageBackend::Local {
                dir: args
                    .local_dir
                    .or_else(|| var("IMAGE_INTAKE_LOCAL_DIR"))
                    .unwrap_or_else(|| "./data/objects".into())
                    .into(),
                public_url: var("IMAGE_INTAKE_PUBLIC_URL")
                    .unwrap_or_else(|| format!("http://127.0.0.1:{port}/files")),
            },
            other => bail!("unknown storage backend `{other}` (expected b2 or local)"),
        };

        let limits = IntakeLimits {
            max_upload_bytes: parse_var(&var, "IMAGE_INTAKE_MAX_UPLOAD_BYTES")?
                .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            max_files: parse_var(&var, "IMAGE_INTAKE_MAX_FILES")?.unwrap_or(DEFAULT_MAX_FILES),
        };
        if limits.max_upload_bytes == 0 || limits.max_files == 0 {
            bail!("upload limits must be positive");
        }

        let profile = match args.profile.or_else(|| var("IMAGE_INTAKE_PROFILE")) {
            Some(value) => DerivationProfile::from_str(&value).map_err(|e| anyhow!(e))?,
            None => DerivationProfile::default(),
        };
        let encoding = match args.format.or_else(|| var("IMAGE_INTAKE_FORMAT")) {
            Some(value) => OutputEncoding::from_str(&value).map_err(|e| anyhow!(e))?,
            None => OutputEncoding::Webp,
        };
        let quality: u8 = parse_var(&var, "IMAGE_INTAKE_QUALITY")?.unwrap_or(DEFAULT_QUALITY);
        if !(1..=100).contains(&quality) {
            bail!("IMAGE_INTAKE_QUALITY must be within 1..=100, got {quality}");
        }
        let max_derivations =
            parse_var(&var, "IMAGE_INTAKE_MAX_DERIVATIONS")?.unwrap_or(DEFAULT_MAX_DERIVATIONS);

        let jwt_secret = var("JWT_SECRET").context("JWT_SECRET must be set")?;

        Ok(Self {
            host,
            port,
            database_url,
            backend,
            limits,
            profile,
            encoding,
            quality,
            max_derivations: max_derivations.max(1),
            jwt_secret,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("parsing {name} value `{value}`"))
        })
        .transpose()
}

fn b2_config(var: &impl Fn(&str) -> Option<String>) -> Result<B2Config> {
    let required = |name: &str| {
        var(name).with_context(|| format!("{name} must be set when the b2 backend is selected"))
    };

    Ok(B2Config {
        key_id: required("B2_APPLICATION_KEY_ID")?,
        application_key: required("B2_APPLICATION_KEY")?,
        bucket_id: required("B2_BUCKET_ID")?,
        bucket_name: required("B2_BUCKET_NAME")?,
        api_url: var("B2_API_URL").unwrap_or_else(|| DEFAULT_API_URL.into()),
        public_base_url: var("B2_CDN_URL"),
        session_ttl: DEFAULT_SESSION_TTL,
    })
}
