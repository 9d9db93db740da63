use std::path::Path;

/// Detaches the process. Must run before the tokio runtime is created:
/// forking an async runtime leaves its worker threads behind in the
/// parent. Privileges are not touched here; the drop happens after the
/// listening sockets are bound.
#[cfg(unix)]
pub fn daemonize(pid_file: &Path) -> anyhow::Result<()> {
    use daemonize::Daemonize;

    Daemonize::new()
        .pid_file(pid_file)
        .chown_pid_file(true)
        .working_directory(".")
        .start()
        .map_err(|e| anyhow::anyhow!("could not daemonize: {}", e))?;
    tracing::info!(pid = std::process::id(), "running as daemon");
    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize(_pid_file: &Path) -> anyhow::Result<()> {
    anyhow::bail!("daemon mode is only supported on unix");
}
