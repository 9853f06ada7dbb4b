use crate::backup;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::get_required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_export_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace = match get_required_str(&req.params, "workspacePath") {
        Ok(v) => PathBuf::from(v),
        Err(_) => match state.workspace.clone() {
            Some(p) => p,
            None => return err(&req.id, "no_workspace", "select a workspace first", None),
        },
    };
    let out_path = match get_required_str(&req.params, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e.response(&req.id),
    };

    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "bundleFormat": summary.bundle_format,
                "dbSha256": summary.db_sha256,
                "outPath": out_path.to_string_lossy()
            }),
        ),
        Err(e) => err(&req.id, "backup_failed", format!("{e:#}"), None),
    }
}

fn handle_import_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace = match get_required_str(&req.params, "workspacePath") {
        Ok(v) => PathBuf::from(v),
        Err(_) => match state.workspace.clone() {
            Some(p) => p,
            None => return err(&req.id, "no_workspace", "select a workspace first", None),
        },
    };
    let in_path = match get_required_str(&req.params, "inPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e.response(&req.id),
    };

    // The open connection points at the file being replaced; drop it and
    // reopen after the swap.
    state.db = None;

    match backup::import_workspace_bundle(&in_path, &workspace) {
        Ok(summary) => match crate::db::open_db(&workspace) {
            Ok(conn) => {
                state.workspace = Some(workspace.clone());
                state.db = Some(conn);
                ok(
                    &req.id,
                    json!({
                        "bundleFormatDetected": summary.bundle_format_detected,
                        "workspacePath": workspace.to_string_lossy()
                    }),
                )
            }
            Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
        },
        Err(e) => err(&req.id, "restore_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import_bundle(state, req)),
        _ => None,
    }
}
