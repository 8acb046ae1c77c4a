/// Sample driver for the correlation monitor.
///
/// Builds a monitor over the live host, then periodically logs the current
/// process-to-container bindings until interrupted. Configuration comes from
/// the environment: `PROCLINK_ROOTFS` and `PROCLINK_DOCKER_ENDPOINT`.
///
/// Exits with status 1 on fatal init errors (typically missing
/// `CAP_NET_ADMIN`); 0 otherwise.
#[tokio::main]
async fn main() {
    env_logger::init();

    let config = proclink::monitor::Config::from_env();
    let monitor = match proclink::monitor::Monitor::new(config).await {
        Ok(monitor) => monitor,
        Err(err) => {
            log::error!("failed to create monitor: {err}");
            std::process::exit(1);
        }
    };

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = interval.tick() => {
                for binding in monitor.containers() {
                    log::info!(
                        "pid {} ({}) -> container {} ({})",
                        binding.process.pid,
                        binding.process.command,
                        binding.id,
                        binding.data.as_ref().map_or("<no metadata>", |data| data.name.as_str()),
                    );
                }
            }
        }
    }

    monitor.stop().await;
}
