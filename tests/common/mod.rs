use std::path::PathBuf;

use flintbase::config::Config;
use flintbase::DatabaseEngine;

/// Opens an isolated engine in its own temp directory so parallel test runs
/// never share a database file.
pub fn open_engine(name: &str) -> (DatabaseEngine, PathBuf) {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap();
    let dir = std::env::temp_dir().join(format!("flintbase-scenario-{}-{}", name, now.as_nanos()));
    std::fs::create_dir_all(&dir).expect("failed to create temp dir");

    let config = Config {
        database_file_path: dir.join("data.db").to_string_lossy().into_owned(),
        archivelog_directory: dir.join("archivelog").to_string_lossy().into_owned(),
        ..Config::default()
    };
    let engine = DatabaseEngine::open(config).expect("failed to open engine");
    (engine, dir)
}
