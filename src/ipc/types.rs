use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One JSON line from the host shell: `{id, method, params}`. `params`
/// defaults to null so parameterless methods like `health` need no body.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Daemon state carried across requests: the selected school workspace and
/// its open database. Both stay unset until `workspace.select` succeeds.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
