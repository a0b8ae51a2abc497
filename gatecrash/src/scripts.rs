// gatecrash/src/scripts.rs
//
// Target lifecycle scripts. In full mode every replay round starts from a
// known application state: the reset script rolls the target back, the auth
// script refreshes both users' sessions (writing fresh tokens into the run
// configuration for the replay engine to pick up). The scripts are
// deployment-specific executables; gatecrash only spawns them.

use std::path::Path;

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::Result;

pub async fn reset_application(reset_script: &str) -> Result<()> {
    info!("resetting application with {reset_script}");
    let status = Command::new(reset_script).status().await?;
    if !status.success() {
        warn!("reset script {reset_script} exited with {status}");
    }
    Ok(())
}

/// Re-authenticate one or both users of a pair. The script receives
/// `<user> <password> <configfile>`; the public user is skipped.
pub async fn authenticate_users(
    auth_script: &str,
    first_user: &str,
    first_password: Option<&str>,
    second_user: &str,
    second_password: Option<&str>,
    configfile: &Path,
) -> Result<()> {
    info!("authenticating with {auth_script}");
    if let Some(password) = first_password {
        run_auth(auth_script, first_user, password, configfile).await?;
    }
    if let Some(password) = second_password {
        run_auth(auth_script, second_user, password, configfile).await?;
    }
    Ok(())
}

async fn run_auth(auth_script: &str, user: &str, password: &str, configfile: &Path) -> Result<()> {
    let status = Command::new(auth_script)
        .arg(user)
        .arg(password)
        .arg(configfile)
        .status()
        .await?;
    if !status.success() {
        warn!("auth script {auth_script} exited with {status} for user {user}");
    }
    Ok(())
}
