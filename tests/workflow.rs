// Workflow tests for fuku
//
// Drive parsed commands through a workspace backed by a real store file in a
// temporary rc directory. Only modules that need no AWS access are exercised.

use clap::Parser;
use fuku::{build_client, dispatch, load_config, Cli, Workspace};
use fuku_config::FukuConfig;
use fuku_core::{RecordingRunner, Store};
use tempfile::TempDir;

fn config(dir: &TempDir) -> FukuConfig {
    let mut config = FukuConfig::default();
    config.paths.rc_dir = Some(dir.path().to_path_buf());
    config.aws.regions = vec!["ap-southeast-2".to_string(), "us-east-1".to_string()];
    config
}

fn workspace(config: &FukuConfig, app: Option<&str>) -> Workspace {
    let store = Store::open(config.paths.store_path()).unwrap();
    let client = build_client(config, store, app).unwrap();
    Workspace::new(client, config.clone(), Box::new(RecordingRunner::new()))
}

async fn fuku(ws: &mut Workspace, args: &[&str]) -> anyhow::Result<()> {
    let cli = Cli::try_parse_from(std::iter::once("fuku").chain(args.iter().copied()))?;
    dispatch(ws, cli.command).await
}

#[tokio::test]
async fn test_selection_survives_a_saved_store() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    let mut ws = workspace(&config, None);
    fuku(&mut ws, &["region", "sl", "us-east-1"]).await.unwrap();
    ws.save().unwrap();

    let ws = workspace(&config, None);
    assert_eq!(ws.selected("region"), Some("us-east-1"));
    assert!(config.paths.store_path().exists());
}

#[tokio::test]
async fn test_unknown_region_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let mut ws = workspace(&config, None);

    let err = fuku(&mut ws, &["region", "sl", "mars-1"]).await.unwrap_err();
    assert_eq!(err.to_string(), "no region \"mars-1\"");
    assert_eq!(ws.selected("region"), None);
}

#[tokio::test]
async fn test_region_change_clears_dependent_selections() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let mut ws = workspace(&config, None);

    fuku(&mut ws, &["region", "sl", "ap-southeast-2"]).await.unwrap();
    ws.client_mut().store_mut().set("cluster", "selected", "prod");
    ws.client_mut().store_mut().set("app", "selected", "api");

    fuku(&mut ws, &["region", "sl", "us-east-1"]).await.unwrap();
    assert_eq!(ws.selected("cluster"), None);
    assert_eq!(ws.selected("app"), None);
}

#[tokio::test]
async fn test_sessions_round_trip_through_commands() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let mut ws = workspace(&config, None);

    fuku(&mut ws, &["region", "sl", "ap-southeast-2"]).await.unwrap();
    fuku(&mut ws, &["session", "sv", "sydney"]).await.unwrap();
    fuku(&mut ws, &["region", "sl", "us-east-1"]).await.unwrap();
    fuku(&mut ws, &["session", "ld", "sydney"]).await.unwrap();
    assert_eq!(ws.selected("region"), Some("ap-southeast-2"));

    fuku(&mut ws, &["session", "rm", "sydney"]).await.unwrap();
    let err = fuku(&mut ws, &["session", "ld", "sydney"]).await.unwrap_err();
    assert_eq!(err.to_string(), "no session \"sydney\"");
}

#[tokio::test]
async fn test_dotted_session_name_is_removed() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let mut ws = workspace(&config, None);

    fuku(&mut ws, &["region", "sl", "us-east-1"]).await.unwrap();
    fuku(&mut ws, &["session", "sv", "v1.2"]).await.unwrap();
    fuku(&mut ws, &["session", "rm", "v1.2"]).await.unwrap();
    ws.save().unwrap();

    let mut ws = workspace(&config, None);
    let err = fuku(&mut ws, &["session", "ld", "v1.2"]).await.unwrap_err();
    assert_eq!(err.to_string(), "no session \"v1.2\"");
    let err = fuku(&mut ws, &["session", "rm", "v1.2"]).await.unwrap_err();
    assert_eq!(err.to_string(), "no session \"v1.2\"");
}

#[tokio::test]
async fn test_app_flag_overrides_selection() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let mut ws = workspace(&config, Some("shop"));
    ws.client_mut().store_mut().set("region", "selected", "ap-southeast-2");
    ws.client_mut().store_mut().set("cluster", "selected", "prod");
    ws.client_mut().store_mut().set("app", "selected", "api");

    let ctx = ws.context("redis").unwrap();
    assert_eq!(ctx.get("app"), Some("shop"));
    assert_eq!(ctx.get("cluster"), Some("prod"));
}

#[tokio::test]
async fn test_missing_selection_is_a_usage_error() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let mut ws = workspace(&config, None);

    let err = ws.context("task").unwrap_err();
    assert_eq!(err.to_string(), "no region currently selected");

    fuku(&mut ws, &["region", "sl", "us-east-1"]).await.unwrap();
    let err = ws.context("task").unwrap_err();
    assert_eq!(err.to_string(), "no cluster currently selected");
}

#[test]
fn test_log_level_flag_is_validated() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fuku.toml");
    std::fs::write(&path, "[log]\nlevel = \"info\"\n").unwrap();
    let path = path.to_str().unwrap();

    let cli = Cli::try_parse_from(["fuku", "region", "ls", "--config", path, "-v", "debug"]).unwrap();
    assert_eq!(load_config(&cli).unwrap().log.level, "debug");

    let cli = Cli::try_parse_from(["fuku", "region", "ls", "--config", path, "-v", "verbose"]).unwrap();
    let err = load_config(&cli).unwrap_err();
    assert!(err.to_string().contains("verbose"));
}
