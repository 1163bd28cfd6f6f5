use std::path::PathBuf;

use tracing::{debug, trace, warn};

/// Files looked up, in order, before the CLI parses its arguments. Later files
/// do not override variables already set by earlier ones.
const ENV_FILES: [&str; 2] = [".env", ".env.secrets"];

fn traverse_up_for_env_file(file_name: &str) -> Option<PathBuf> {
    let relative_workspace_root = PathBuf::from("./../../").join(file_name);

    if PathBuf::from(file_name).exists() {
        trace!("Loading environment variables from: {file_name}");
        Some(PathBuf::from(file_name))
    } else if relative_workspace_root.exists() {
        trace!(
            "Loading environment variables from: {}",
            relative_workspace_root.display()
        );
        Some(relative_workspace_root)
    } else {
        trace!("No {file_name} found in current directory or workspace root");
        None
    }
}

fn load_optional_env_file(path: Option<PathBuf>) {
    let Some(path) = path else {
        return;
    };

    match dotenv::from_filename(&path) {
        Ok(_) => debug!("Loaded environment variables from: {}", path.display()),
        Err(e) => warn!(
            "Failed to load environment variables from {}: {e}",
            path.display()
        ),
    }
}

pub fn load_optional_env_files() {
    for file_name in ENV_FILES {
        load_optional_env_file(traverse_up_for_env_file(file_name));
    }
}

pub fn configure_env() -> Result<(), anyhow::Error> {
    load_optional_env_files();
    Ok(())
}
