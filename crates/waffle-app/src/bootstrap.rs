use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use waffle_api::ApiServer;
use waffle_config::{
    ConfigStore, FileStore, PgStore, SchemaRegistry, WaffleSettings, WaffleState,
    WaffleStateBuilder,
};
use waffle_telemetry::{DEFAULT_LOG_LEVEL, LogFormat, LoggingConfig, Metrics};

use crate::error::{AppError, AppResult};

const SCHEMA_ENV: &str = "WAFFLE_SCHEMA";
const DATABASE_URL_ENV: &str = "DATABASE_URL";
const STORE_FILE_ENV: &str = "WAFFLE_STORE_FILE";
const BIND_ADDR_ENV: &str = "WAFFLE_BIND_ADDR";
const LOG_FORMAT_ENV: &str = "WAFFLE_LOG_FORMAT";

const DEFAULT_STORE_FILE: &str = "waffle-store.json";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:7171";

/// Process environment relevant to the service, read before any IO happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AppEnv {
    schema_path: PathBuf,
    database_url: Option<String>,
    store_file: PathBuf,
    bind_addr: SocketAddr,
}

impl AppEnv {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let present = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let schema_path = present(SCHEMA_ENV)
            .map(PathBuf::from)
            .ok_or(AppError::MissingEnv { name: SCHEMA_ENV })?;
        let store_file = present(STORE_FILE_ENV)
            .map_or_else(|| PathBuf::from(DEFAULT_STORE_FILE), PathBuf::from);
        let raw_addr = present(BIND_ADDR_ENV).unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = raw_addr
            .parse::<SocketAddr>()
            .map_err(|_| AppError::InvalidConfig {
                field: BIND_ADDR_ENV,
                reason: "not a socket address",
                value: Some(raw_addr.clone()),
            })?;
        Ok(Self {
            schema_path,
            database_url: present(DATABASE_URL_ENV),
            store_file,
            bind_addr,
        })
    }
}

/// Backing store selected by the environment.
pub(crate) enum StoreChoice {
    Postgres(PgStore),
    File(FileStore),
}

/// Dependencies required to bootstrap the Waffle service.
pub(crate) struct BootstrapDependencies {
    schema: SchemaRegistry,
    store: StoreChoice,
    settings: WaffleSettings,
    bind_addr: SocketAddr,
    telemetry: Metrics,
}

impl BootstrapDependencies {
    /// Construct production dependencies from the environment for the binary entrypoint.
    pub(crate) async fn from_env() -> AppResult<Self> {
        let env = AppEnv::from_lookup(|name| std::env::var(name).ok())?;
        let settings =
            WaffleSettings::from_env().map_err(|err| AppError::config("settings.from_env", err))?;
        Self::from_parts(env, settings).await
    }

    async fn from_parts(env: AppEnv, settings: WaffleSettings) -> AppResult<Self> {
        let schema = load_schema(&env.schema_path).await?;
        let store = match env.database_url {
            Some(url) => StoreChoice::Postgres(
                PgStore::connect(&url)
                    .await
                    .map_err(|err| AppError::store("pg_store.connect", err))?,
            ),
            None => StoreChoice::File(FileStore::new(env.store_file)),
        };
        let telemetry =
            Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;
        Ok(Self {
            schema,
            store,
            settings,
            bind_addr: env.bind_addr,
            telemetry,
        })
    }
}

/// Entry point for the Waffle service boot sequence.
///
/// # Errors
///
/// Returns an error if dependency construction, startup or serving fails.
pub async fn run_app() -> AppResult<()> {
    let logging = LoggingConfig {
        level: DEFAULT_LOG_LEVEL,
        format: LogFormat::from_name(std::env::var(LOG_FORMAT_ENV).ok().as_deref()),
    };
    waffle_telemetry::init_logging(&logging)
        .map_err(|err| AppError::telemetry("telemetry.init", err))?;
    info!("Waffle service bootstrap starting");

    let dependencies = BootstrapDependencies::from_env().await?;
    Box::pin(run_app_with(dependencies)).await
}

/// Boot sequence that relies entirely on injected dependencies to simplify testing.
pub(crate) async fn run_app_with(dependencies: BootstrapDependencies) -> AppResult<()> {
    let BootstrapDependencies {
        schema,
        store,
        settings,
        bind_addr,
        telemetry,
    } = dependencies;

    let state = start_state(schema, store, &settings).await?;
    info!(
        keys = state.schema().len(),
        multiprocess = state.is_multiprocess(),
        strategy = settings.strategy.as_str(),
        "configuration overlay ready"
    );

    let api = ApiServer::new(state.clone(), telemetry);
    let serve_result = api.serve(bind_addr, shutdown_signal()).await;
    state.shutdown().await;

    serve_result.map_err(|err| AppError::api_server("api_server.serve", err))?;
    info!("API server shutdown complete");
    Ok(())
}

async fn start_state(
    schema: SchemaRegistry,
    store: StoreChoice,
    settings: &WaffleSettings,
) -> AppResult<WaffleState> {
    let (store, backend) = match store {
        StoreChoice::Postgres(store) => {
            let backend = settings
                .sync_backend(Some(store.pool()))
                .map_err(|err| AppError::config("settings.sync_backend", err))?;
            let store: Arc<dyn ConfigStore> = Arc::new(store);
            (store, backend)
        }
        StoreChoice::File(store) => {
            let backend = settings
                .sync_backend(None)
                .map_err(|err| AppError::config("settings.sync_backend", err))?;
            let store: Arc<dyn ConfigStore> = Arc::new(store);
            (store, backend)
        }
    };
    let mut builder = WaffleStateBuilder::new(schema, store).key_filter(settings.key_filter());
    if let Some(backend) = backend {
        builder = builder.sync(backend);
    }
    builder
        .start()
        .await
        .map_err(|err| AppError::config("waffle_state.start", err))
}

async fn load_schema(path: &Path) -> AppResult<SchemaRegistry> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| AppError::Io {
            operation: "schema.read",
            path: Some(path.to_path_buf()),
            source,
        })?;
    parse_schema(path, &text)
}

fn parse_schema(path: &Path, text: &str) -> AppResult<SchemaRegistry> {
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
    if !is_yaml {
        return SchemaRegistry::from_json_str(text)
            .map_err(|err| AppError::config("schema.parse", err));
    }
    let document: serde_json::Value =
        serde_yaml::from_str(text).map_err(|source| AppError::SchemaYaml {
            path: path.to_path_buf(),
            source,
        })?;
    SchemaRegistry::from_value(&document).map_err(|err| AppError::config("schema.parse", err))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use serde_json::json;
    use waffle_config::WatchStrategy;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: BTreeMap<String, String> = pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn app_env_requires_a_schema() {
        let err = AppEnv::from_lookup(lookup(&[])).expect_err("schema required");
        assert!(matches!(err, AppError::MissingEnv { name: SCHEMA_ENV }));

        let err = AppEnv::from_lookup(lookup(&[(SCHEMA_ENV, "  ")])).expect_err("blank schema");
        assert!(matches!(err, AppError::MissingEnv { .. }));
    }

    #[test]
    fn app_env_applies_defaults() -> anyhow::Result<()> {
        let env = AppEnv::from_lookup(lookup(&[(SCHEMA_ENV, "schema.yaml")]))?;
        assert_eq!(env.schema_path, PathBuf::from("schema.yaml"));
        assert_eq!(env.database_url, None);
        assert_eq!(env.store_file, PathBuf::from(DEFAULT_STORE_FILE));
        assert_eq!(env.bind_addr, DEFAULT_BIND_ADDR.parse::<SocketAddr>()?);
        Ok(())
    }

    #[test]
    fn app_env_reads_overrides_and_rejects_bad_addresses() -> anyhow::Result<()> {
        let env = AppEnv::from_lookup(lookup(&[
            (SCHEMA_ENV, "schema.json"),
            (DATABASE_URL_ENV, "postgres://waffle@localhost/waffle"),
            (STORE_FILE_ENV, "/var/lib/waffle/store.json"),
            (BIND_ADDR_ENV, "0.0.0.0:8080"),
        ]))?;
        assert_eq!(
            env.database_url.as_deref(),
            Some("postgres://waffle@localhost/waffle")
        );
        assert_eq!(env.store_file, PathBuf::from("/var/lib/waffle/store.json"));
        assert_eq!(env.bind_addr.port(), 8080);

        let err = AppEnv::from_lookup(lookup(&[(SCHEMA_ENV, "s.json"), (BIND_ADDR_ENV, "nowhere")]))
            .expect_err("bad address");
        assert!(matches!(
            err,
            AppError::InvalidConfig { field: BIND_ADDR_ENV, ref value, .. }
                if value.as_deref() == Some("nowhere")
        ));
        Ok(())
    }

    #[test]
    fn schemas_parse_from_json_and_yaml() -> anyhow::Result<()> {
        let json_schema = parse_schema(
            Path::new("schema.json"),
            r#"{"MAX_USERS": {"type": "int", "desc": "Max users", "default": 10}}"#,
        )?;
        let yaml_schema = parse_schema(
            Path::new("schema.YML"),
            "MAX_USERS:\n  type: int\n  desc: Max users\n  default: 10\n",
        )?;
        assert_eq!(json_schema, yaml_schema);

        let err = parse_schema(Path::new("schema.yaml"), "MAX_USERS: [unterminated")
            .expect_err("bad yaml");
        assert!(matches!(err, AppError::SchemaYaml { .. }));
        let err = parse_schema(Path::new("schema.json"), "{").expect_err("bad json");
        assert!(matches!(err, AppError::Config { operation: "schema.parse", .. }));
        Ok(())
    }

    #[tokio::test]
    async fn file_store_dependencies_start_the_overlay() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let schema_path = dir.path().join("schema.json");
        std::fs::write(
            &schema_path,
            json!({
                "MAX_USERS": {"type": "int", "desc": "Max users", "default": 10},
                "WAFFLE_MULTIPROC": {"type": "bool", "desc": "", "default": true}
            })
            .to_string(),
        )?;
        let store_file = dir.path().join("store.json");
        let env = AppEnv {
            schema_path,
            database_url: None,
            store_file: store_file.clone(),
            bind_addr: DEFAULT_BIND_ADDR.parse()?,
        };
        let dependencies = BootstrapDependencies::from_parts(env, WaffleSettings::default()).await?;
        assert!(matches!(dependencies.store, StoreChoice::File(_)));

        let state = start_state(
            dependencies.schema,
            dependencies.store,
            &dependencies.settings,
        )
        .await?;
        assert!(!state.is_multiprocess());
        assert_eq!(state.get("MAX_USERS").await, Some(json!(10)));
        let persisted = std::fs::read_to_string(&store_file)?;
        assert!(persisted.contains("MAX_USERS"));
        assert!(!persisted.contains("WAFFLE_MULTIPROC"));
        state.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn postgres_strategy_requires_a_database_store() -> anyhow::Result<()> {
        let schema = parse_schema(
            Path::new("schema.json"),
            r#"{"MAX_USERS": {"type": "int", "default": 10}}"#,
        )?;
        let dir = tempfile::tempdir()?;
        let settings = WaffleSettings {
            multiproc: true,
            strategy: WatchStrategy::Postgres,
            ..WaffleSettings::default()
        };
        let err = start_state(
            schema,
            StoreChoice::File(FileStore::new(dir.path().join("store.json"))),
            &settings,
        )
        .await
        .expect_err("postgres watcher without a pool");
        assert!(matches!(
            err,
            AppError::Config { operation: "settings.sync_backend", .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn missing_schema_files_surface_io_errors() {
        let err = load_schema(Path::new("/nonexistent/waffle/schema.json"))
            .await
            .expect_err("missing file");
        assert!(matches!(err, AppError::Io { operation: "schema.read", .. }));
    }
}
