mod activities;
mod audit;
mod config;
mod db;
mod exchange;
mod ipc;
mod model;
mod normalize;
mod stats;
mod store;
mod students;
mod workbook;

use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

fn write_line(stdout: &mut io::Stdout, value: &serde_json::Value) {
    let _ = writeln!(
        stdout,
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{\"ok\":false}".to_string())
    );
    let _ = stdout.flush();
}

fn main() {
    let config = config::Config::from_env();
    // stdout carries the protocol; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();
    for warning in &config.warnings {
        tracing::warn!("{}", warning);
    }

    let mut state = ipc::AppState::new(config);
    if let Some(path) = state.config.workspace.clone() {
        match ipc::open_workspace(&mut state, &path, &serde_json::Value::Null) {
            Ok(_) => tracing::info!(path = %path.display(), "opened workspace from environment"),
            Err(e) => tracing::warn!(path = %path.display(), code = e.code, "could not open workspace: {}", e.message),
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to echo back.
                tracing::warn!("unparseable request: {e}");
                write_line(
                    &mut stdout,
                    &serde_json::json!({
                        "ok": false,
                        "error": { "code": "bad_json", "message": e.to_string() }
                    }),
                );
                continue;
            }
        };

        tracing::debug!(id = %req.id, method = %req.method, "request");
        let resp = ipc::handle_request(&mut state, req);
        write_line(&mut stdout, &resp);
        for event in ipc::pending_events(&mut state) {
            write_line(&mut stdout, &event);
        }
    }
}
