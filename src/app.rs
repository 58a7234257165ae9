//! Composition root: picks the engine, wires collaborators and serves the
//! envelope stream until input ends.

use std::sync::Arc;
use std::time::Duration;

use agent_engine::ExecutionEngine;
use agent_engine_cli::{CliEngine, CliEngineConfig, CLI_ENGINE_ID, DEFAULT_AGENT_EXECUTABLE};
use agent_engine_mock::{ScriptedEngine, MOCK_ENGINE_ID};
use orchestrator::{
    DirectoryAssetCatalog, ProjectsHistory, ProviderProfile, SessionDefaults, SessionOrchestrator,
    StaticCredentialStore, Transport, WalkFileSearch,
};
use tracing::{info, warn};

use crate::config::EnvConfig;
use crate::error::BridgeError;
use crate::stdio_transport::StdioTransport;

pub const DEFAULT_ENGINE_ID: &str = MOCK_ENGINE_ID;
const AVAILABLE_ENGINES: &str = "cli, mock";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub fn engine_for_id(
    engine_id: &str,
    config: &EnvConfig,
) -> Result<Arc<dyn ExecutionEngine>, BridgeError> {
    match engine_id {
        CLI_ENGINE_ID => {
            let executable = config
                .agent_bin
                .as_deref()
                .unwrap_or(DEFAULT_AGENT_EXECUTABLE);
            Ok(Arc::new(CliEngine::new(CliEngineConfig::new(executable))))
        }
        MOCK_ENGINE_ID => {
            let delay = Duration::from_millis(config.mock_delay_ms()?);
            Ok(Arc::new(ScriptedEngine::default().with_step_delay(delay)))
        }
        unknown => Err(BridgeError::UnsupportedEngine(
            unknown.to_string(),
            AVAILABLE_ENGINES,
        )),
    }
}

/// Builds the orchestrator the binary serves, with every collaborator the
/// configuration allows.
pub fn build_orchestrator(
    config: &EnvConfig,
    transport: Arc<dyn Transport>,
) -> Result<SessionOrchestrator, BridgeError> {
    let engine_id = config.engine.as_deref().unwrap_or(DEFAULT_ENGINE_ID);
    let engine = engine_for_id(engine_id, config)?;

    let defaults = SessionDefaults::new(config.cwd()?)
        .with_permission_mode(config.permission_mode()?)
        .with_model(config.model.clone());
    let credentials = StaticCredentialStore::new(ProviderProfile::new(
        config.provider_name(),
        config.provider_env()?,
    ));

    let mut orchestrator = SessionOrchestrator::new(engine, transport, defaults)
        .with_credentials(Arc::new(credentials))
        .with_file_search(Arc::new(WalkFileSearch));
    match config.data_root() {
        Some(root) => {
            info!(root = %root.display(), "serving assets and history");
            orchestrator = orchestrator
                .with_assets(Arc::new(DirectoryAssetCatalog::new(&root)))
                .with_history(Arc::new(ProjectsHistory::new(root)));
        }
        None => warn!("no data root; assets and history are unavailable"),
    }
    Ok(orchestrator)
}

/// Serves envelopes on stdin/stdout until stdin closes, then closes every
/// live channel.
pub async fn run(config: EnvConfig) -> Result<(), BridgeError> {
    let (transport, tasks) = StdioTransport::stdio();
    let orchestrator = Arc::new(build_orchestrator(&config, Arc::new(transport))?);
    let dispatch = orchestrator.serve();
    let credentials = orchestrator.watch_credentials();
    info!(engine = config.engine.as_deref().unwrap_or(DEFAULT_ENGINE_ID), "ready");

    let input = tasks.reader.await;

    for session_id in orchestrator.live_sessions() {
        orchestrator.close_channel(&session_id);
    }
    dispatch.abort();
    if let Some(credentials) = credentials {
        credentials.abort();
    }
    drop(orchestrator);

    if tokio::time::timeout(SHUTDOWN_GRACE, tasks.writer).await.is_err() {
        warn!("output did not drain before shutdown");
    }

    match input {
        Ok(result) => result.map_err(BridgeError::Io),
        Err(error) => Err(BridgeError::Io(std::io::Error::other(error))),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use orchestrator::{AssetKind, Envelope, InMemoryTransport, ListAssetsParams, Request};

    use super::*;

    fn mock_config() -> EnvConfig {
        EnvConfig {
            engine: Some(MOCK_ENGINE_ID.to_string()),
            cwd: Some(PathBuf::from("/tmp")),
            ..EnvConfig::default()
        }
    }

    #[test]
    fn engine_for_id_supports_cli_and_mock() {
        let config = mock_config();
        let mock = engine_for_id(MOCK_ENGINE_ID, &config).expect("mock engine should resolve");
        assert_eq!(mock.profile().engine_id, MOCK_ENGINE_ID);

        let cli = engine_for_id(CLI_ENGINE_ID, &config).expect("cli engine should resolve");
        assert_eq!(cli.profile().engine_id, CLI_ENGINE_ID);
    }

    #[test]
    fn engine_for_id_rejects_unknown_engine() {
        let error = match engine_for_id("custom", &mock_config()) {
            Ok(_) => panic!("unknown engines should fail"),
            Err(error) => error,
        };

        assert!(error.to_string().contains("unsupported engine 'custom'"));
    }

    #[test]
    fn build_orchestrator_reports_invalid_settings() {
        let (_, server) = InMemoryTransport::pair();
        let config = EnvConfig {
            permission_mode: Some("sometimes".to_string()),
            ..mock_config()
        };

        let error = match build_orchestrator(&config, Arc::new(server)) {
            Ok(_) => panic!("invalid permission mode should fail"),
            Err(error) => error,
        };
        assert!(matches!(error, BridgeError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn built_orchestrator_serves_provider_and_assets() {
        let data_root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(data_root.path().join("agents")).expect("agents dir");
        std::fs::write(
            data_root.path().join("agents").join("reviewer.md"),
            "---\ndescription: Reviews diffs\n---\nBody\n",
        )
        .expect("agent file");

        let (ui, server) = InMemoryTransport::pair();
        let config = EnvConfig {
            data_root: Some(data_root.path().to_path_buf()),
            provider: Some("gateway".to_string()),
            provider_env: Some("API_KEY=secret".to_string()),
            ..mock_config()
        };
        let orchestrator =
            Arc::new(build_orchestrator(&config, Arc::new(server)).expect("orchestrator builds"));
        let _dispatch = orchestrator.serve();

        let (sender, mut inbox) = tokio::sync::mpsc::unbounded_channel();
        ui.on_message(Arc::new(move |envelope: Envelope| {
            let _ = sender.send(envelope);
        }));
        ui.send(Request::GetActiveProvider.to_envelope("p1").expect("encodes"))
            .expect("send");
        let list_agents = Request::ListAssets(ListAssetsParams {
            kind: AssetKind::Agents,
        });
        ui.send(list_agents.to_envelope("a1").expect("encodes"))
            .expect("send");

        let mut provider = None;
        let mut assets = None;
        while provider.is_none() || assets.is_none() {
            let envelope = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
                .await
                .expect("response in time")
                .expect("inbox open");
            match envelope.request_id.as_deref() {
                Some("p1") => provider = Some(envelope),
                Some("a1") => assets = Some(envelope),
                _ => {}
            }
        }

        let provider = provider.expect("provider response");
        assert_eq!(provider.payload["provider"], "gateway");
        assert_eq!(provider.payload["envKeys"], serde_json::json!(["API_KEY"]));
        let assets = assets.expect("assets response");
        assert!(assets.succeeded());
        assert_eq!(assets.payload["assets"][0]["name"], "reviewer");
    }
}
